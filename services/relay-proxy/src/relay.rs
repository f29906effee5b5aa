//! Relay pipeline
//!
//! One inbound chat request goes through: method check, body validation,
//! credential lease, multi-endpoint forward, then (off the response path)
//! credential deactivation and the transaction log write.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use common::Secret;
use serde::Deserialize;
use token_pool::{TokenPool, TransactionLog};
use token_store::{CredentialStatus, LogEntry};
use tracing::{debug, info, instrument, warn};
use upstream::{ForwardRequest, Forwarder, Outcome};

use crate::error::RelayError;
use crate::metrics;

/// Inbound headers never passed upstream, on top of what the forwarder strips.
///
/// The upstream client does not decode compressed bodies, and relay cookies
/// mean nothing to the upstream.
const DROPPED_HEADERS: &[header::HeaderName] = &[header::ACCEPT_ENCODING, header::COOKIE];

/// Where the credential for a request comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialMode {
    /// Rotate through the stored pool; a `token` in the body is ignored.
    Pool,
    /// Use the `token` from the request body; nothing is ever deactivated.
    Explicit,
}

/// Shared state for the relay handler.
#[derive(Clone)]
pub struct RelayState {
    pub pool: Arc<TokenPool>,
    pub forwarder: Forwarder,
    pub ledger: TransactionLog,
    pub mode: CredentialMode,
    pub allowed_methods: Arc<Vec<Method>>,
    pub deactivate_invalid: bool,
    pub requests_total: Arc<AtomicU64>,
}

/// Chat request body. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(rename = "projectId")]
    project_id: Option<String>,
    token: Option<String>,
    message: Option<String>,
    files: Option<serde_json::Value>,
}

/// Validated request, ready to forward.
#[derive(Debug)]
struct ChatCall {
    project_id: String,
    message: String,
    files: serde_json::Value,
    token: Option<Secret<String>>,
}

/// Credential used for one request. `id` is None for explicit tokens.
struct Lease {
    id: Option<String>,
    secret: Secret<String>,
}

fn parse_body(body: &[u8], mode: CredentialMode) -> Result<ChatCall, RelayError> {
    let request: ChatRequest = serde_json::from_slice(body)
        .map_err(|_| RelayError::Validation("invalid JSON body".into()))?;

    let project_id = request
        .project_id
        .map(|p| p.trim().to_owned())
        .filter(|p| !p.is_empty());
    let message = request.message.filter(|m| !m.trim().is_empty());
    let (Some(project_id), Some(message)) = (project_id, message) else {
        return Err(RelayError::Validation(
            "missing required fields: projectId, message".into(),
        ));
    };

    let token = match mode {
        CredentialMode::Pool => None,
        CredentialMode::Explicit => {
            let token = request
                .token
                .map(|t| t.trim().to_owned())
                .filter(|t| !t.is_empty())
                .ok_or_else(|| RelayError::Validation("missing required field: token".into()))?;
            Some(Secret::new(token))
        }
    };

    Ok(ChatCall {
        project_id,
        message,
        files: match request.files {
            None | Some(serde_json::Value::Null) => serde_json::json!([]),
            Some(files) => files,
        },
        token,
    })
}

/// Outbound body and headers for the upstream chat API.
fn build_forward(
    call: &ChatCall,
    method: &Method,
    query: Option<&str>,
    inbound: &HeaderMap,
) -> Result<ForwardRequest, RelayError> {
    let body = serde_json::json!({
        "projectId": call.project_id,
        "project_id": call.project_id,
        "message": call.message,
        "files": call.files,
    });

    let mut headers = inbound.clone();
    for name in DROPPED_HEADERS {
        headers.remove(name);
    }
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let project_header = HeaderValue::from_str(&call.project_id)
        .map_err(|_| RelayError::Validation("projectId contains invalid characters".into()))?;
    headers.insert("x-project-id", project_header);

    Ok(ForwardRequest {
        method: method.clone(),
        query: query.map(str::to_owned),
        headers,
        body: Bytes::from(body.to_string()),
    })
}

/// Handle one relay request end to end.
#[instrument(skip_all, fields(request_id = %request_id, method = %method, path = %path))]
pub async fn relay_request(
    state: &RelayState,
    method: Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
    request_id: String,
) -> Response {
    let started = Instant::now();
    state.requests_total.fetch_add(1, Ordering::Relaxed);

    let response = match relay(state, &method, path, query, headers, &body).await {
        Ok(content) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            serde_json::json!({ "success": true, "content": content }).to_string(),
        )
            .into_response(),
        Err(e) => {
            debug!(error = %e, "relay request failed");
            e.into_response()
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn relay(
    state: &RelayState,
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<String, RelayError> {
    if !state.allowed_methods.contains(method) {
        return Err(RelayError::MethodNotAllowed(method.to_string()));
    }

    let mut call = parse_body(body, state.mode)?;
    let forward = build_forward(&call, method, query, headers)?;

    let lease = match call.token.take() {
        Some(secret) => Lease { id: None, secret },
        None => {
            let credential = state.pool.select().await.map_err(|e| {
                warn!(error = %e, "no credential available");
                RelayError::PoolExhausted
            })?;
            Lease {
                id: Some(credential.id),
                secret: credential.secret,
            }
        }
    };

    let forwarded = state
        .forwarder
        .forward(&forward, &lease.secret)
        .await
        .map_err(|e| {
            warn!(credential_id = lease.id.as_deref(), error = %e, "could not build upstream request");
            match state.mode {
                CredentialMode::Explicit => {
                    RelayError::Validation("token is not a valid bearer credential".into())
                }
                CredentialMode::Pool => RelayError::Internal,
            }
        })?;

    for attempt in &forwarded.attempts {
        metrics::record_upstream_attempt(attempt.outcome);
    }

    let outcome = forwarded.outcome;
    let status = outcome.http_status();
    info!(
        credential_id = lease.id.as_deref(),
        outcome = outcome.label(),
        status,
        attempts = forwarded.attempts.len(),
        "relay finished"
    );

    let entry = LogEntry::new(&lease.secret, method.as_str(), path, status);
    spawn_followup(state, lease.id.as_deref(), &outcome, entry);

    match outcome {
        Outcome::Success { content } => Ok(content),
        Outcome::InvalidCredential => Err(RelayError::InvalidCredential),
        Outcome::CreditsExhausted => Err(RelayError::CreditsExhausted),
        Outcome::NotFound => Err(RelayError::NotFound),
        Outcome::UpstreamRejected { .. } | Outcome::UpstreamUnavailable { .. } => {
            Err(RelayError::Upstream)
        }
    }
}

/// Status a pooled credential moves to after `outcome`, if any.
fn deactivation_status(state: &RelayState, outcome: &Outcome) -> Option<CredentialStatus> {
    match outcome {
        Outcome::CreditsExhausted => Some(CredentialStatus::OutOfCredits),
        Outcome::InvalidCredential if state.deactivate_invalid => Some(CredentialStatus::Inactive),
        _ => None,
    }
}

/// Off the response path: deactivate the credential when the outcome calls
/// for it, then write the transaction log entry.
///
/// Both run in one task so the store write is always issued before the log
/// write, whatever the scheduler does with spawned tasks.
fn spawn_followup(state: &RelayState, id: Option<&str>, outcome: &Outcome, entry: LogEntry) {
    let deactivation = id
        .zip(deactivation_status(state, outcome))
        .map(|(id, status)| (id.to_owned(), status));

    let Some((id, status)) = deactivation else {
        state.ledger.record(entry);
        return;
    };

    let pool = state.pool.clone();
    let ledger = state.ledger.clone();
    tokio::spawn(async move {
        // Failures are logged by the pool.
        let _ = pool.deactivate(&id, status).await;
        ledger.write(entry).await;
    });
}
