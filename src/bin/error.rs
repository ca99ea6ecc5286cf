//! CLI error types.

use std::fmt;
use warden::WardenError;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub enum CliError {
    ParseError { field: String, message: String },
    UnknownCommand(String),
    NoCommand,
    Warden(WardenError),
    IoError(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::ParseError { field, message } => {
                write!(f, "Parse error ({}): {}", field, message)
            }
            CliError::UnknownCommand(cmd) => {
                write!(f, "Unknown command '{}'. Use --help to see available commands", cmd)
            }
            CliError::NoCommand => {
                write!(f, "No command provided. Use --help to see available commands")
            }
            CliError::Warden(err) => write!(f, "{}", err),
            CliError::IoError(msg) => write!(f, "IO error: {}", msg),
        }
    }
}

impl std::error::Error for CliError {}

impl From<WardenError> for CliError {
    fn from(err: WardenError) -> Self {
        CliError::Warden(err)
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::Warden(err.into())
    }
}
