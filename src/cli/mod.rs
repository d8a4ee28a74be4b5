#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

mod action;
mod args;
mod commands;
mod parser;

pub use action::CliAction;
pub use args::suggest_commands;
pub use commands::CliCommand;
pub use parser::{parse_cli_args, CliError};

pub const HELP_TEXT: &str = "\
broker - operation processing engine for managed-cluster lifecycle operations

USAGE:
    broker <COMMAND> [FLAGS]

COMMANDS:
    init-db          Create the operations schema [--url <DATABASE_URL>]
    show             Print one operation --operation-id <ID>
    history          Print all operations of an instance --instance-id <ID>
    campaign-status  Campaign statistics and listing --campaign-id <ID>
                     [--state <STATE>[,<STATE>...]] [--page <N>] [--page-size <N>]
    recover          Unfinished operations a restart would re-enqueue [--type <TYPE>]
    help             Show this message

FLAGS:
    -h, --help       Show this message
    -v, --version    Show version

Configuration is read from BROKER_* environment variables, .env and .broker/config.toml.
";
