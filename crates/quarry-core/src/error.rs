//! Error types for quarry.

use thiserror::Error;

/// Result type alias using quarry's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for quarry operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Invalid input (empty job name, unserializable payload)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Construction-time misconfiguration (bad table identifier etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Job queue error
    #[error("Job error: {0}")]
    Job(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
