use anyhow::Result;
use clap::ArgMatches;
use floe_gateway::run_gateway;

use crate::config::{gateway_config, Settings};
use crate::fatal;

pub fn exec(matches: &ArgMatches, settings: Settings) -> Result<()> {
    match matches.subcommand() {
        Some(("run", _)) => run(settings),
        _ => unreachable!(),
    }
}

fn run(settings: Settings) -> Result<()> {
    let config = match gateway_config(settings) {
        Ok(config) => config,
        Err(error) => fatal!("Invalid gateway configuration: {error}"),
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime")
        .block_on(run_gateway(config))
}
