//! Error types for the backup engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Missing or invalid path / backend configuration. Fatal at construction.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Checksum or structural validation mismatch.
    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Storage backend '{backend}' error: {message}")]
    Storage { backend: String, message: String },

    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Task error: {0}")]
    Task(String),
}

impl EngineError {
    pub fn storage(backend: impl Into<String>, message: impl ToString) -> Self {
        EngineError::Storage {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            EngineError::NotFound(_) => true,
            EngineError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::Task(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
