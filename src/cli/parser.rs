use super::action::CliAction;
use super::args::ensure_no_unknown_flags;
use super::commands::CliCommand;
use broker::types::{OperationState, OperationType};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CliError {
    #[error("Missing required argument: {}", arg)]
    MissingRequiredArg { arg: String },
    #[error("Unknown command: {}", cmd)]
    UnknownCommand { cmd: String },
    #[error("Unknown flag: {}", flag)]
    UnknownFlag { flag: String },
    #[error("Invalid type for {}", arg)]
    InvalidArgType { arg: String },
    #[error("Invalid argument value for {}: {}", arg, error)]
    InvalidArgValue { arg: String, error: String },
}

/// Parses the arguments after the program name.
///
/// # Errors
/// Returns a `CliError` for unknown commands, unknown flags and bad values.
pub fn parse_cli_args(args: &[String]) -> Result<CliAction, CliError> {
    if args
        .get(1)
        .is_some_and(|arg| matches!(arg.as_str(), "-h" | "--help"))
    {
        return Ok(CliAction::ShowHelp);
    }

    match args.first().map(String::as_str) {
        None | Some("-h" | "--help") => Ok(CliAction::ShowHelp),
        Some("-v" | "--version") => Ok(CliAction::ShowVersion),
        Some("?" | "help") => Ok(CliAction::Command(CliCommand::Help)),
        Some("init-db") => {
            ensure_no_unknown_flags(args, &["--url"])?;
            let url = parse_optional_arg(args, "url")?;
            Ok(CliAction::Command(CliCommand::InitDb { url }))
        }
        Some("show") => {
            ensure_no_unknown_flags(args, &["--operation-id"])?;
            let operation_id = parse_required_arg(args, "operation_id")?;
            Ok(CliAction::Command(CliCommand::Show { operation_id }))
        }
        Some("history") => {
            ensure_no_unknown_flags(args, &["--instance-id"])?;
            let instance_id = parse_required_arg(args, "instance_id")?;
            Ok(CliAction::Command(CliCommand::History { instance_id }))
        }
        Some("campaign-status") => {
            ensure_no_unknown_flags(
                args,
                &["--campaign-id", "--state", "--page", "--page-size"],
            )?;
            let campaign_id = parse_required_arg(args, "campaign_id")?;
            let states = parse_optional_arg::<String>(args, "state")?
                .map(|raw| parse_states(&raw))
                .transpose()?
                .unwrap_or_default();
            let page = parse_optional_arg(args, "page")?;
            let page_size = parse_optional_arg(args, "page_size")?;
            Ok(CliAction::Command(CliCommand::CampaignStatus {
                campaign_id,
                states,
                page,
                page_size,
            }))
        }
        Some("recover") => {
            ensure_no_unknown_flags(args, &["--type"])?;
            let operation_type = parse_optional_arg::<String>(args, "type")?
                .map(|raw| {
                    OperationType::try_from(raw.as_str()).map_err(|error| {
                        CliError::InvalidArgValue {
                            arg: "type".to_string(),
                            error,
                        }
                    })
                })
                .transpose()?;
            Ok(CliAction::Command(CliCommand::Recover { operation_type }))
        }
        Some(cmd) => Err(CliError::UnknownCommand {
            cmd: cmd.to_string(),
        }),
    }
}

fn parse_states(raw: &str) -> Result<Vec<OperationState>, CliError> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            OperationState::try_from(name).map_err(|error| CliError::InvalidArgValue {
                arg: "state".to_string(),
                error,
            })
        })
        .collect()
}

fn parse_required_arg<T>(args: &[String], name: &str) -> Result<T, CliError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let flag = format!("--{}", name.replace('_', "-"));
    let Some(position) = args.iter().position(|a| a.as_str() == flag) else {
        return Err(CliError::MissingRequiredArg {
            arg: name.to_string(),
        });
    };

    let Some(raw_value) = args.get(position + 1) else {
        return Err(CliError::MissingRequiredArg {
            arg: name.to_string(),
        });
    };

    if raw_value.starts_with("--") {
        return Err(CliError::MissingRequiredArg {
            arg: name.to_string(),
        });
    }

    raw_value
        .parse::<T>()
        .map_err(|_| CliError::InvalidArgType {
            arg: name.to_string(),
        })
}

fn parse_optional_arg<T>(args: &[String], name: &str) -> Result<Option<T>, CliError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let flag = format!("--{}", name.replace('_', "-"));
    let Some(position) = args.iter().position(|a| a.as_str() == flag) else {
        return Ok(None);
    };

    match args.get(position + 1) {
        None => Err(CliError::MissingRequiredArg {
            arg: name.to_string(),
        }),
        Some(value) if value.starts_with("--") => Err(CliError::MissingRequiredArg {
            arg: name.to_string(),
        }),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|e| CliError::InvalidArgValue {
                arg: name.to_string(),
                error: format!("{e}"),
            }),
    }
}
