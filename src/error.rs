#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use thiserror::Error;

/// Error code constants for type-safe error handling
pub mod code {
    pub const CLI_ERROR: &str = "CLI_ERROR";
    pub const EXISTS: &str = "EXISTS";
    pub const NOTFOUND: &str = "NOTFOUND";
    pub const INVALID: &str = "INVALID";
    pub const CONFLICT: &str = "CONFLICT";
    pub const DEPENDENCY: &str = "DEPENDENCY";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INTERNAL: &str = "INTERNAL";
}

/// Failures surfaced by an operation storage driver.
///
/// Only `Transient` is retried by the storage retry wrapper. `Conflict` and
/// `NotFound` always reach the caller on the first occurrence.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("version conflict: {0}")]
    Conflict(String),

    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

impl StorageError {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => code::NOTFOUND,
            Self::AlreadyExists(_) => code::EXISTS,
            Self::Conflict(_) => code::CONFLICT,
            Self::Transient(_) => code::DEPENDENCY,
            Self::InvalidData(_) => code::INVALID,
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => Self::NotFound(error.to_string()),
            sqlx::Error::Database(ref db_error) => {
                let sqlstate = db_error.code().map(|c| c.to_string()).unwrap_or_default();
                classify_sqlstate(&sqlstate, error.to_string())
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Transient(error.to_string()),
            _ => Self::InvalidData(error.to_string()),
        }
    }
}

fn classify_sqlstate(sqlstate: &str, message: String) -> StorageError {
    match sqlstate {
        "23505" => StorageError::AlreadyExists(message),
        // connection exception, transaction rollback, insufficient resources,
        // operator intervention
        s if ["08", "40", "53", "57"].iter().any(|class| s.starts_with(class)) => {
            StorageError::Transient(message)
        }
        _ => StorageError::InvalidData(message),
    }
}

/// Business failure reported by a step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("terminal step failure: {0}")]
    Terminal(String),

    #[error("transient step failure: {0}")]
    Transient(String),
}

impl StepError {
    #[must_use]
    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Terminal(message.into())
    }

    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Terminal(m) | Self::Transient(m) => m,
        }
    }
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Step error: {0}")]
    Step(#[from] StepError),

    #[error("SQLx error: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Pipeline error: {0}")]
    PipelineError(String),

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Returns the protocol error code for this error
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Storage(inner) => inner.code(),
            Self::Step(_) | Self::PipelineError(_) | Self::ConfigError(_) => code::INVALID,
            Self::SqlxError(_) | Self::QueueError(_) | Self::Internal(_) => code::INTERNAL,
            Self::IoError(_) => code::DEPENDENCY,
            Self::SerializationError(_) => code::INVALID,
        }
    }

    /// Returns the exit code for this error
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigError(_) => 2,
            Self::Storage(_) | Self::SqlxError(_) => 3,
            Self::Step(_) => 4,
            Self::PipelineError(_) => 5,
            Self::QueueError(_) => 6,
            Self::IoError(_) => 7,
            Self::SerializationError(_) => 8,
            Self::Internal(_) => 9,
        }
    }
}

/// Protocol error codes as documented in the CLI
pub const ERROR_CODES: &[(&str, &str, &str)] = &[
    (
        code::CLI_ERROR,
        "Invalid CLI usage",
        "Run 'broker --help' for valid options",
    ),
    (
        code::EXISTS,
        "Operation already exists",
        "Use a fresh operation identifier",
    ),
    (
        code::NOTFOUND,
        "Operation was not found",
        "List operations and verify identifier",
    ),
    (
        code::INVALID,
        "Invalid request or stored data",
        "Validate input and stored payloads",
    ),
    (
        code::CONFLICT,
        "Operation was modified concurrently",
        "Re-read the operation and retry the command",
    ),
    (
        code::DEPENDENCY,
        "Storage or downstream system unavailable",
        "Check database connectivity and retry",
    ),
    (
        code::TIMEOUT,
        "Operation timed out",
        "Increase timeout and retry",
    ),
    (
        code::INTERNAL,
        "Unexpected internal failure",
        "Inspect logs and retry command",
    ),
];

/// Get error code details (description and fix) for a given error code
#[must_use]
pub fn get_error_info(error_code: &str) -> Option<(&'static str, &'static str)> {
    ERROR_CODES
        .iter()
        .find(|(code, _, _)| *code == error_code)
        .map(|(_, desc, fix)| (*desc, *fix))
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::{classify_sqlstate, code, get_error_info, BrokerError, StepError, StorageError};

    #[test]
    fn only_transient_storage_errors_are_retryable() {
        assert!(StorageError::Transient("io".to_string()).is_retryable());
        assert!(!StorageError::Conflict("v".to_string()).is_retryable());
        assert!(!StorageError::NotFound("id".to_string()).is_retryable());
        assert!(!StorageError::AlreadyExists("id".to_string()).is_retryable());
    }

    #[test]
    fn sqlstate_classes_map_to_storage_taxonomy() {
        assert!(matches!(
            classify_sqlstate("23505", String::new()),
            StorageError::AlreadyExists(_)
        ));
        assert!(classify_sqlstate("08006", String::new()).is_retryable());
        assert!(classify_sqlstate("40001", String::new()).is_retryable());
        assert!(classify_sqlstate("57P01", String::new()).is_retryable());
        assert!(matches!(
            classify_sqlstate("42601", String::new()),
            StorageError::InvalidData(_)
        ));
    }

    #[test]
    fn broker_error_codes_follow_storage_codes() {
        let err = BrokerError::from(StorageError::Conflict("op-1".to_string()));
        assert_eq!(err.code(), code::CONFLICT);
        assert_eq!(err.exit_code(), 3);
        assert!(get_error_info(err.code()).is_some());
    }

    #[test]
    fn step_error_helpers_expose_message_and_kind() {
        let terminal = StepError::terminal("quota exceeded");
        assert!(terminal.is_terminal());
        assert_eq!(terminal.message(), "quota exceeded");
        assert!(!StepError::transient("timeout").is_terminal());
    }
}
