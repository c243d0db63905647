//! Error types for the Chunkyard server outside the upload hot path

use thiserror::Error;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt session record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}
