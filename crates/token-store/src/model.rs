//! Credential data model

use std::fmt;
use std::str::FromStr;

use common::Secret;
use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;

use crate::log::mask_secret;

/// Credits assigned to a newly inserted credential when none are given.
pub const DEFAULT_CREDITS: u32 = 100;

/// Lifecycle status of a credential.
///
/// Transitions performed by the relay:
/// - Active → OutOfCredits (upstream reported exhausted credits)
/// - Active → Inactive (upstream rejected the credential, when configured)
///
/// Any move back to Active is an operator action through the admin API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Inactive,
    OutOfCredits,
}

impl CredentialStatus {
    /// Wire label, identical to the persisted column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Inactive => "inactive",
            CredentialStatus::OutOfCredits => "out_of_credits",
        }
    }

    /// Only active credentials may be handed out by the pool.
    pub fn is_selectable(&self) -> bool {
        matches!(self, CredentialStatus::Active)
    }
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(CredentialStatus::Active),
            "inactive" => Ok(CredentialStatus::Inactive),
            "out_of_credits" => Ok(CredentialStatus::OutOfCredits),
            other => Err(format!("unknown credential status: {other}")),
        }
    }
}

/// A bearer credential for the upstream chat API.
///
/// The secret is persisted in the `token` column. `credits` is informational:
/// the relay does not decrement it per call, it only zeroes it when the
/// upstream reports exhaustion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    #[serde(rename = "token")]
    pub secret: Secret<String>,
    pub status: CredentialStatus,
    /// The column is nullable; NULL reads as 0.
    #[serde(default, deserialize_with = "null_as_zero")]
    pub credits: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

fn null_as_zero<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    Ok(Option::<u32>::deserialize(deserializer)?.unwrap_or(0))
}

impl Credential {
    /// Build a fresh active credential with a random id.
    pub fn new(secret: Secret<String>, credits: Option<u32>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            secret,
            status: CredentialStatus::Active,
            credits: credits.unwrap_or(DEFAULT_CREDITS),
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status change, stamping `updated_at`.
    pub fn apply_status(&mut self, status: CredentialStatus) {
        self.status = status;
        if status == CredentialStatus::OutOfCredits {
            self.credits = 0;
        }
        self.updated_at = OffsetDateTime::now_utc();
    }

    /// Masked form of the secret, safe for logs and listings.
    pub fn masked_secret(&self) -> String {
        mask_secret(self.secret.expose())
    }
}
