use clap::{Arg, Command};

/// Arguments shared by every subcommand.
pub fn common_args() -> Vec<Arg> {
    vec![
        Arg::new("config")
            .long("config")
            .value_name("FILE")
            .help("Path to the settings file (default: settings.toml)")
            .global(true),
        Arg::new("log_level")
            .long("log-level")
            .value_name("LEVEL")
            .help("Log level: TRACE, DEBUG, INFO, WARN, ERROR")
            .global(true),
    ]
}

/// The `gateway` subcommand tree.
pub fn gateway_command() -> Command {
    Command::new("gateway")
        .about("Run the upload/read gateway")
        .subcommand_required(true)
        .subcommand(Command::new("run").about("Start the gateway HTTP server"))
}
