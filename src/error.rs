use thiserror::Error;

/// Load logger error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoggerError {
    #[error("Failed to open port {port}: {reason}")]
    PortOpen { port: String, reason: String },

    #[error("I/O error on port {port}: {reason}")]
    PortIo { port: String, reason: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid reader transition: {0}")]
    InvalidTransition(String),

    #[error("Unknown port: {0}")]
    UnknownPort(String),

    #[error("Sequence {got} does not follow {last} in series")]
    SequenceOrder { last: u64, got: u64 },

    #[error("Invalid weight cell: {0}")]
    InvalidCell(usize),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LoggerError {
    pub(crate) fn poisoned(what: &str) -> Self {
        LoggerError::Internal(format!("Failed to acquire {} lock", what))
    }
}

impl From<std::io::Error> for LoggerError {
    fn from(err: std::io::Error) -> Self {
        LoggerError::Persistence(err.to_string())
    }
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, LoggerError>;
