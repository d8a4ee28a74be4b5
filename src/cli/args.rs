use super::parser::CliError;

pub const VALID_COMMANDS: &[&str] = &[
    "help",
    "init-db",
    "show",
    "history",
    "campaign-status",
    "recover",
];

/// # Errors
/// Returns `CliError::UnknownFlag` if a flag outside `allowed_flags` is found.
pub fn ensure_no_unknown_flags(args: &[String], allowed_flags: &[&str]) -> Result<(), CliError> {
    let invalid = args
        .iter()
        .skip(1)
        .find(|arg| {
            arg.starts_with("--")
                && !matches!(arg.as_str(), "--help" | "-h")
                && !allowed_flags.iter().any(|allowed| allowed == &arg.as_str())
        })
        .cloned();

    invalid.map_or(Ok(()), |flag| Err(CliError::UnknownFlag { flag }))
}

#[must_use]
pub fn suggest_commands(typo: &str) -> Vec<String> {
    VALID_COMMANDS
        .iter()
        .map(|cmd| (cmd, strsim::levenshtein(typo, cmd)))
        .filter(|(_, dist)| *dist <= 3)
        .min_by_key(|(_, dist)| *dist)
        .map(|(cmd, _)| vec![(*cmd).to_string()])
        .unwrap_or_default()
}
