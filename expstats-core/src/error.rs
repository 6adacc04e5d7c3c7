//! Error types for expstats-core

use thiserror::Error;

/// Main error type for the expstats-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Event rejected at ingestion
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Strict lookup of a missing entity (exploration, version, job)
    #[error("not found: {0}")]
    NotFound(String),

    /// Interaction or calculation missing from the registry
    #[error("registry error: {0}")]
    Registry(String),

    /// A calculation failed on its input
    #[error("calculation {calculation_id} failed: {message}")]
    Calculation {
        calculation_id: String,
        message: String,
    },
}

/// Result type alias for expstats-core
pub type Result<T> = std::result::Result<T, Error>;
