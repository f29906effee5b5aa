//! Transaction log entries and secret masking

use common::Secret;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Maximum number of leading secret characters kept in a log entry.
pub const TOKEN_PREFIX_LEN: usize = 10;

/// Marker appended to every masked secret.
pub const MASK_MARKER: &str = "...";

/// Mask a secret down to a short prefix plus `MASK_MARKER`.
///
/// Keeps `TOKEN_PREFIX_LEN` characters for any secret of at least twice that
/// length (every real bearer token). Shorter secrets keep half their
/// characters, so the output never contains the whole secret.
pub fn mask_secret(secret: &str) -> String {
    let len = secret.chars().count();
    let keep = TOKEN_PREFIX_LEN.min(len / 2);
    let prefix: String = secret.chars().take(keep).collect();
    format!("{prefix}{MASK_MARKER}")
}

/// One relayed transaction. Append-only.
///
/// Field names on the wire match the `logs` table columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    #[serde(rename = "token_used")]
    pub token_prefix: String,
    #[serde(rename = "request_method")]
    pub method: String,
    #[serde(rename = "request_path")]
    pub path: String,
    #[serde(rename = "response_status")]
    pub status_code: u16,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl LogEntry {
    /// Build an entry for a transaction made with `secret`. Only the masked
    /// prefix of the secret is retained.
    pub fn new(
        secret: &Secret<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        status_code: u16,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            token_prefix: mask_secret(secret.expose()),
            method: method.into(),
            path: path.into(),
            status_code,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}
