use super::CliCommand;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliAction {
    ShowHelp,
    ShowVersion,
    Command(CliCommand),
}
