//! Admin API for credential management
//!
//! Runs on a separate listener (default 127.0.0.1:9090). Operator
//! authentication is handled in front of this listener, not here.
//!
//! Endpoints:
//! - GET    /admin/tokens         list credentials (secrets masked)
//! - POST   /admin/tokens         add a credential
//! - DELETE /admin/tokens/{id}    remove a credential
//! - PATCH  /admin/tokens/{id}    set a credential's status
//! - GET    /admin/logs?limit=N   recent transactions, newest first
//! - GET    /admin/pool           pool snapshot summary

use std::sync::Arc;

use axum::Router;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use common::Secret;
use serde::Deserialize;
use token_pool::{TokenPool, TransactionLog};
use token_store::{Credential, CredentialStatus};
use tracing::{info, warn};

/// Default and maximum page sizes for the log view.
const DEFAULT_LOG_LIMIT: usize = 50;
const MAX_LOG_LIMIT: usize = 500;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<TokenPool>,
    ledger: TransactionLog,
}

impl AdminState {
    pub fn new(pool: Arc<TokenPool>, ledger: TransactionLog) -> Self {
        Self { pool, ledger }
    }
}

/// Build the admin axum router with all credential management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/tokens", get(list_tokens).post(add_token))
        .route(
            "/admin/tokens/{id}",
            delete(delete_token).patch(update_token),
        )
        .route("/admin/logs", get(recent_logs))
        .route("/admin/pool", get(pool_status))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    json_response(status, serde_json::json!({ "error": message.into() }))
}

/// Map a pool/store error to an admin response without leaking backend detail.
fn store_error(e: token_pool::Error) -> Response {
    match e {
        token_pool::Error::Store(token_store::Error::Duplicate(_)) => {
            error_response(StatusCode::CONFLICT, "token already exists")
        }
        token_pool::Error::Store(token_store::Error::NotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, "token not found")
        }
        other => {
            warn!(error = %other, "admin store operation failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "credential store error")
        }
    }
}

/// Credential as shown to operators: every column, secret masked.
fn credential_view(credential: &Credential) -> serde_json::Value {
    let mut view = serde_json::to_value(credential).unwrap_or_else(|_| serde_json::json!({}));
    view["token"] = serde_json::json!(credential.masked_secret());
    view
}

/// GET /admin/tokens: every credential regardless of status.
async fn list_tokens(State(state): State<AdminState>) -> Response {
    match state.pool.list_all().await {
        Ok(credentials) => {
            let tokens: Vec<_> = credentials.iter().map(credential_view).collect();
            json_response(StatusCode::OK, serde_json::json!({ "tokens": tokens }))
        }
        Err(e) => store_error(e),
    }
}

/// Request body for adding a credential.
#[derive(Deserialize)]
struct AddTokenRequest {
    token: String,
    #[serde(default)]
    credits: Option<u32>,
}

/// POST /admin/tokens: insert an active credential.
async fn add_token(
    State(state): State<AdminState>,
    body: Result<axum::Json<AddTokenRequest>, JsonRejection>,
) -> Response {
    let axum::Json(body) = match body {
        Ok(b) => b,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.body_text()),
    };
    let token = body.token.trim();
    if token.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "token must not be empty");
    }

    match state
        .pool
        .add(Secret::new(token.to_owned()), body.credits)
        .await
    {
        Ok(credential) => {
            info!(credential_id = %credential.id, "token added via admin API");
            json_response(StatusCode::CREATED, credential_view(&credential))
        }
        Err(e) => store_error(e),
    }
}

/// DELETE /admin/tokens/{id}
async fn delete_token(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.pool.remove(&id).await {
        Ok(true) => json_response(
            StatusCode::OK,
            serde_json::json!({ "id": id, "status": "removed" }),
        ),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "token not found"),
        Err(e) => store_error(e),
    }
}

/// Request body for a status change.
#[derive(Deserialize)]
struct UpdateTokenRequest {
    status: CredentialStatus,
}

/// PATCH /admin/tokens/{id}: operator status change, including re-activation.
async fn update_token(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    body: Result<axum::Json<UpdateTokenRequest>, JsonRejection>,
) -> Response {
    let axum::Json(body) = match body {
        Ok(b) => b,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.body_text()),
    };

    match state.pool.set_status(&id, body.status).await {
        Ok(credential) => json_response(StatusCode::OK, credential_view(&credential)),
        Err(e) => store_error(e),
    }
}

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

/// GET /admin/logs: newest first, `limit` defaults to 50 and is capped at 500.
async fn recent_logs(
    State(state): State<AdminState>,
    query: Result<Query<LogsQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.body_text()),
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LOG_LIMIT)
        .clamp(1, MAX_LOG_LIMIT);

    match state.ledger.recent(limit).await {
        Ok(logs) => json_response(StatusCode::OK, serde_json::json!({ "logs": logs })),
        Err(e) => {
            warn!(error = %e, "reading transaction log failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "transaction log unavailable")
        }
    }
}

/// GET /admin/pool: pool snapshot summary.
async fn pool_status(State(state): State<AdminState>) -> Response {
    json_response(StatusCode::OK, state.pool.health().await)
}
