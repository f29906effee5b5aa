//! Error types for upstream forwarding setup

/// Errors from building or preparing upstream requests.
///
/// Upstream failures themselves are not errors: they are classified into an
/// `Outcome` and returned to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no upstream endpoints configured")]
    NoEndpoints,

    #[error("invalid upstream endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("credential cannot be used as a header value")]
    InvalidCredentialHeader,
}

/// Result alias for upstream operations.
pub type Result<T> = std::result::Result<T, Error>;
