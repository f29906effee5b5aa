//! Upstream response classification
//!
//! Pure mapping from what the upstream returned to an `Outcome`. Which status
//! codes count as "credential rejected" and "credits exhausted" is policy, not
//! code: the defaults are 401 and 402/403, and deployments can override both.

use serde::Deserialize;

/// Content returned on a 2xx reply that carries no usable text.
pub const DEFAULT_SUCCESS_FALLBACK: &str = "Processed successfully";

/// Body fields searched, in order, for the assistant's reply text.
const CONTENT_FIELDS: &[&str] = &["content", "reply", "response"];

/// Raw result of one upstream call.
#[derive(Debug, Clone)]
pub enum UpstreamReply {
    /// The upstream answered with a status and body.
    Response { status: u16, body: Vec<u8> },
    /// No response: connect failure, reset, or timeout.
    Transport { timeout: bool, message: String },
}

/// Typed interpretation of an upstream reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// 2xx with the extracted reply text.
    Success { content: String },
    /// Credential invalid or expired (auth-fatal).
    InvalidCredential,
    /// Credential has no credits left (auth-fatal, deactivates the credential).
    CreditsExhausted,
    /// Referenced project or route not found.
    NotFound,
    /// Any other 4xx.
    UpstreamRejected { status: u16 },
    /// 5xx or transport failure (`status` is None when nothing came back).
    UpstreamUnavailable { status: Option<u16> },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// Outcomes no other endpoint can fix: the credential itself is the problem.
    pub fn is_auth_fatal(&self) -> bool {
        matches!(self, Outcome::InvalidCredential | Outcome::CreditsExhausted)
    }

    /// Failures worth retrying on the next endpoint.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Outcome::NotFound
                | Outcome::UpstreamRejected { .. }
                | Outcome::UpstreamUnavailable { .. }
        )
    }

    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::InvalidCredential => "invalid_credential",
            Outcome::CreditsExhausted => "credits_exhausted",
            Outcome::NotFound => "not_found",
            Outcome::UpstreamRejected { .. } => "upstream_rejected",
            Outcome::UpstreamUnavailable { .. } => "upstream_unavailable",
        }
    }

    /// Status code returned to the relay's caller.
    pub fn http_status(&self) -> u16 {
        match self {
            Outcome::Success { .. } => 200,
            Outcome::InvalidCredential => 401,
            Outcome::CreditsExhausted => 402,
            Outcome::NotFound => 404,
            Outcome::UpstreamRejected { .. } | Outcome::UpstreamUnavailable { .. } => 502,
        }
    }
}

/// Status-code policy for auth-fatal outcomes.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierPolicy {
    #[serde(default = "default_invalid_credential")]
    pub invalid_credential: Vec<u16>,
    #[serde(default = "default_credits_exhausted")]
    pub credits_exhausted: Vec<u16>,
    #[serde(default = "default_success_fallback")]
    pub success_fallback: String,
}

fn default_invalid_credential() -> Vec<u16> {
    vec![401]
}

fn default_credits_exhausted() -> Vec<u16> {
    vec![402, 403]
}

fn default_success_fallback() -> String {
    DEFAULT_SUCCESS_FALLBACK.to_string()
}

impl Default for ClassifierPolicy {
    fn default() -> Self {
        Self {
            invalid_credential: default_invalid_credential(),
            credits_exhausted: default_credits_exhausted(),
            success_fallback: default_success_fallback(),
        }
    }
}

/// Response classifier bound to a policy.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    policy: ClassifierPolicy,
}

impl Classifier {
    pub fn new(policy: ClassifierPolicy) -> Self {
        Self { policy }
    }

    /// Classify one upstream reply.
    ///
    /// Policy sets are checked before the generic 4xx rules, so a deployment
    /// may e.g. treat 403 as an invalid credential instead of exhausted credits.
    pub fn classify(&self, reply: &UpstreamReply) -> Outcome {
        let (status, body) = match reply {
            UpstreamReply::Transport { .. } => {
                return Outcome::UpstreamUnavailable { status: None };
            }
            UpstreamReply::Response { status, body } => (*status, body),
        };

        if (200..300).contains(&status) {
            return Outcome::Success {
                content: extract_content(body)
                    .unwrap_or_else(|| self.policy.success_fallback.clone()),
            };
        }
        if self.policy.invalid_credential.contains(&status) {
            return Outcome::InvalidCredential;
        }
        if self.policy.credits_exhausted.contains(&status) {
            return Outcome::CreditsExhausted;
        }
        match status {
            404 => Outcome::NotFound,
            400..=499 => Outcome::UpstreamRejected { status },
            _ => Outcome::UpstreamUnavailable {
                status: Some(status),
            },
        }
    }
}

/// Pull the reply text out of a 2xx JSON body.
///
/// Takes the first of `content`, `reply`, `response` that is present, not
/// null and not an empty string. Non-string values are returned as their JSON
/// text. Returns None for non-JSON or non-object bodies.
pub fn extract_content(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let object = value.as_object()?;
    CONTENT_FIELDS.iter().find_map(|field| match object.get(*field)? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    })
}
