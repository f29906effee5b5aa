//! Error types for store operations

/// Errors from credential and log storage.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate credential: {0}")]
    Duplicate(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
