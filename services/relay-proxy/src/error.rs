//! Relay error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Per-request failures of the relay pipeline.
///
/// Every variant renders as `{"success": false, "error": "..."}`. Messages
/// are fixed or built from request fields only: upstream payloads and
/// credential material never appear in them.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("{0}")]
    Validation(String),

    #[error("method {0} not allowed")]
    MethodNotAllowed(String),

    #[error("no active tokens available")]
    PoolExhausted,

    #[error("upstream rejected the token (invalid or expired)")]
    InvalidCredential,

    #[error("token has no credits left")]
    CreditsExhausted,

    #[error("upstream project or route not found")]
    NotFound,

    #[error("upstream error after trying all endpoints")]
    Upstream,

    #[error("internal server error")]
    Internal,
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            RelayError::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::InvalidCredential => StatusCode::UNAUTHORIZED,
            RelayError::CreditsExhausted => StatusCode::PAYMENT_REQUIRED,
            RelayError::NotFound => StatusCode::NOT_FOUND,
            RelayError::Upstream => StatusCode::BAD_GATEWAY,
            RelayError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "error": self.to_string(),
        });
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
