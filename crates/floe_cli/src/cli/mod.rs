pub mod args;
pub mod gateway;

use clap::Command;

/// Built-in subcommands.
pub fn builtin() -> Vec<Command> {
    vec![args::gateway_command()]
}
