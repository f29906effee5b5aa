//! Hosted relational store reached through a PostgREST-style query API
//!
//! Tables (provisioned externally):
//! - `tokens(id, token, status, credits, created_at, updated_at)`
//! - `logs(id, token_used, request_method, request_path, response_status, created_at)`
//!
//! Every request carries the service key both as `apikey` and as a Bearer
//! token. Row filters use the `column=eq.value` syntax; compare-and-set is a
//! PATCH filtered on both id and the expected status, returning the updated
//! rows so an empty array means the write lost.

use std::time::Duration;

use common::Secret;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::log::LogEntry;
use crate::model::{Credential, CredentialStatus};
use crate::store::{CredentialStore, LogSink, StoreFuture};

const TOKENS_TABLE: &str = "tokens";
const LOGS_TABLE: &str = "logs";

/// Longest backend error body carried into an error message.
const MAX_ERROR_BODY: usize = 200;

/// Partial row update for status changes.
#[derive(Serialize)]
struct StatusPatch {
    status: CredentialStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    credits: Option<u32>,
    #[serde(with = "time::serde::rfc3339")]
    updated_at: OffsetDateTime,
}

impl StatusPatch {
    fn new(status: CredentialStatus) -> Self {
        Self {
            status,
            credits: (status == CredentialStatus::OutOfCredits).then_some(0),
            updated_at: OffsetDateTime::now_utc(),
        }
    }
}

/// REST query client for the `tokens` and `logs` tables.
pub struct PostgrestStore {
    client: reqwest::Client,
    base_url: String,
    service_key: Secret<String>,
    timeout: Duration,
}

impl PostgrestStore {
    /// `base_url` is the project root (e.g. `https://xyz.example.co`); the
    /// `/rest/v1` prefix is added per request.
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        service_key: Secret<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key,
            timeout,
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        let key = self.service_key.expose();
        self.client
            .request(method, self.table_url(table))
            .header("apikey", key)
            .bearer_auth(key)
            .timeout(self.timeout)
    }

    /// Send a request and decode the returned rows.
    async fn rows<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Vec<T>> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::Http(format!("store request failed: {e}")))?;
        let response = check_status(response).await?;
        response
            .json::<Vec<T>>()
            .await
            .map_err(|e| Error::Parse(format!("invalid store response: {e}")))
    }
}

/// Decode credential rows one at a time. A row that does not parse is
/// skipped with a warning so one bad row cannot empty the pool.
fn decode_credentials(rows: Vec<serde_json::Value>) -> Vec<Credential> {
    rows.into_iter()
        .filter_map(|row| {
            let id = row
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("<missing>")
                .to_owned();
            match serde_json::from_value(row) {
                Ok(credential) => Some(credential),
                Err(e) => {
                    warn!(credential_id = %id, error = %e, "skipping undecodable credential row");
                    None
                }
            }
        })
        .collect()
}

/// Map non-success statuses to store errors. 409 is a unique-constraint hit.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    let body: String = body.chars().take(MAX_ERROR_BODY).collect();
    if status == StatusCode::CONFLICT {
        return Err(Error::Duplicate(format!("store returned {status}: {body}")));
    }
    Err(Error::Backend(format!("store returned {status}: {body}")))
}

impl CredentialStore for PostgrestStore {
    fn kind(&self) -> &'static str {
        "postgrest"
    }

    fn list_all(&self) -> StoreFuture<'_, Vec<Credential>> {
        Box::pin(async move {
            let request = self
                .request(Method::GET, TOKENS_TABLE)
                .query(&[("select", "*"), ("order", "created_at.asc")]);
            Ok(decode_credentials(self.rows(request).await?))
        })
    }

    fn list_active(&self) -> StoreFuture<'_, Vec<Credential>> {
        Box::pin(async move {
            let request = self.request(Method::GET, TOKENS_TABLE).query(&[
                ("select", "*"),
                ("status", "eq.active"),
                ("order", "created_at.asc"),
            ]);
            let rows = decode_credentials(self.rows(request).await?);
            debug!(active = rows.len(), "fetched active credentials");
            Ok(rows)
        })
    }

    fn insert(
        &self,
        secret: Secret<String>,
        credits: Option<u32>,
    ) -> StoreFuture<'_, Credential> {
        Box::pin(async move {
            let credential = Credential::new(secret, credits);
            let request = self
                .request(Method::POST, TOKENS_TABLE)
                .header("Prefer", "return=representation")
                .json(&[&credential]);
            let mut rows: Vec<Credential> = self.rows(request).await?;
            rows.pop()
                .ok_or_else(|| Error::Backend("insert returned no rows".into()))
        })
    }

    fn delete<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let request = self
                .request(Method::DELETE, TOKENS_TABLE)
                .header("Prefer", "return=representation")
                .query(&[("id", format!("eq.{id}"))]);
            let rows: Vec<serde_json::Value> = self.rows(request).await?;
            Ok(!rows.is_empty())
        })
    }

    fn set_status<'a>(
        &'a self,
        id: &'a str,
        status: CredentialStatus,
    ) -> StoreFuture<'a, Credential> {
        Box::pin(async move {
            let request = self
                .request(Method::PATCH, TOKENS_TABLE)
                .header("Prefer", "return=representation")
                .query(&[("id", format!("eq.{id}"))])
                .json(&StatusPatch::new(status));
            let mut rows: Vec<Credential> = self.rows(request).await?;
            rows.pop()
                .ok_or_else(|| Error::NotFound(format!("credential {id}")))
        })
    }

    fn compare_and_set_status<'a>(
        &'a self,
        id: &'a str,
        expected: CredentialStatus,
        status: CredentialStatus,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let request = self
                .request(Method::PATCH, TOKENS_TABLE)
                .header("Prefer", "return=representation")
                .query(&[
                    ("id", format!("eq.{id}")),
                    ("status", format!("eq.{}", expected.as_str())),
                ])
                .json(&StatusPatch::new(status));
            let rows: Vec<serde_json::Value> = self.rows(request).await?;
            Ok(!rows.is_empty())
        })
    }
}

impl LogSink for PostgrestStore {
    fn append(&self, entry: LogEntry) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let request = self
                .request(Method::POST, LOGS_TABLE)
                .header("Prefer", "return=minimal")
                .json(&[&entry]);
            let response = request
                .send()
                .await
                .map_err(|e| Error::Http(format!("log insert failed: {e}")))?;
            check_status(response).await?;
            Ok(())
        })
    }

    fn recent(&self, limit: usize) -> StoreFuture<'_, Vec<LogEntry>> {
        Box::pin(async move {
            let request = self.request(Method::GET, LOGS_TABLE).query(&[
                ("select", "*".to_string()),
                ("order", "created_at.desc".to_string()),
                ("limit", limit.to_string()),
            ]);
            self.rows(request).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::extract::{Query, State};
    use axum::http::HeaderMap;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    /// In-memory stand-in for the REST API. Understands just enough of the
    /// filter syntax (`id=eq.X`, `status=eq.Y`) for the calls this store makes.
    #[derive(Clone, Default)]
    struct MockBackend {
        tokens: Arc<Mutex<Vec<serde_json::Value>>>,
        logs: Arc<Mutex<Vec<serde_json::Value>>>,
        seen_keys: Arc<Mutex<Vec<(String, String)>>>,
    }

    fn row_matches(row: &serde_json::Value, params: &HashMap<String, String>) -> bool {
        for column in ["id", "status"] {
            if let Some(filter) = params.get(column) {
                let want = filter.strip_prefix("eq.").unwrap_or(filter);
                if row[column].as_str() != Some(want) {
                    return false;
                }
            }
        }
        true
    }

    async fn record_keys(backend: &MockBackend, headers: &HeaderMap) {
        let apikey = headers
            .get("apikey")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        backend.seen_keys.lock().await.push((apikey, auth));
    }

    async fn start_backend() -> (String, MockBackend) {
        let backend = MockBackend::default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let app = axum::Router::new()
            .route(
                "/rest/v1/tokens",
                axum::routing::get(
                    |State(b): State<MockBackend>,
                     headers: HeaderMap,
                     Query(p): Query<HashMap<String, String>>| async move {
                        record_keys(&b, &headers).await;
                        let rows: Vec<_> = b
                            .tokens
                            .lock()
                            .await
                            .iter()
                            .filter(|r| row_matches(r, &p))
                            .cloned()
                            .collect();
                        Json(rows)
                    },
                )
                .post(
                    |State(b): State<MockBackend>, Json(rows): Json<Vec<serde_json::Value>>| async move {
                        let mut tokens = b.tokens.lock().await;
                        for row in &rows {
                            if tokens.iter().any(|t| t["token"] == row["token"]) {
                                return (
                                    axum::http::StatusCode::CONFLICT,
                                    Json(serde_json::json!({"code": "23505"})),
                                );
                            }
                        }
                        tokens.extend(rows.iter().cloned());
                        (axum::http::StatusCode::CREATED, Json(serde_json::json!(rows)))
                    },
                )
                .patch(
                    |State(b): State<MockBackend>,
                     Query(p): Query<HashMap<String, String>>,
                     Json(patch): Json<serde_json::Value>| async move {
                        let mut tokens = b.tokens.lock().await;
                        let mut updated = Vec::new();
                        for row in tokens.iter_mut().filter(|r| row_matches(r, &p)) {
                            for (k, v) in patch.as_object().unwrap() {
                                row[k] = v.clone();
                            }
                            updated.push(row.clone());
                        }
                        Json(updated)
                    },
                )
                .delete(
                    |State(b): State<MockBackend>, Query(p): Query<HashMap<String, String>>| async move {
                        let mut tokens = b.tokens.lock().await;
                        let (removed, kept): (Vec<_>, Vec<_>) =
                            tokens.drain(..).partition(|r| row_matches(r, &p));
                        *tokens = kept;
                        Json(removed)
                    },
                ),
            )
            .route(
                "/rest/v1/logs",
                axum::routing::get(
                    |State(b): State<MockBackend>, Query(p): Query<HashMap<String, String>>| async move {
                        let limit: usize = p.get("limit").and_then(|l| l.parse().ok()).unwrap_or(50);
                        let rows: Vec<_> =
                            b.logs.lock().await.iter().rev().take(limit).cloned().collect();
                        Json(rows)
                    },
                )
                .post(
                    |State(b): State<MockBackend>, Json(rows): Json<Vec<serde_json::Value>>| async move {
                        b.logs.lock().await.extend(rows);
                        axum::http::StatusCode::CREATED
                    },
                ),
            )
            .with_state(backend.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}/"), backend)
    }

    fn test_store(url: &str) -> PostgrestStore {
        PostgrestStore::new(
            reqwest::Client::new(),
            url,
            Secret::from("service-role-key"),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn sends_service_key_as_apikey_and_bearer() {
        let (url, backend) = start_backend().await;
        let store = test_store(&url);

        store.list_all().await.unwrap();

        let keys = backend.seen_keys.lock().await;
        assert_eq!(
            keys[0],
            (
                "service-role-key".to_string(),
                "Bearer service-role-key".to_string()
            )
        );
    }

    #[tokio::test]
    async fn nullable_credits_and_bad_rows_do_not_empty_the_pool() {
        let (url, backend) = start_backend().await;
        let store = test_store(&url);
        let good = store.insert(Secret::from("tok-good"), None).await.unwrap();
        {
            let mut tokens = backend.tokens.lock().await;
            tokens.push(serde_json::json!({
                "id": "null-credits",
                "token": "tok-null-credits",
                "status": "active",
                "credits": null,
                "created_at": "2024-05-01T12:00:00+00:00",
                "updated_at": "2024-05-01T12:00:00+00:00"
            }));
            tokens.push(serde_json::json!({
                "id": "broken",
                "token": "tok-broken",
                "status": "active",
                "created_at": "not a timestamp",
                "updated_at": "2024-05-01T12:00:00+00:00"
            }));
        }

        let active = store.list_active().await.unwrap();
        let ids: Vec<_> = active.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&good.id.as_str()));
        assert!(ids.contains(&"null-credits"));
        let null_row = active.iter().find(|c| c.id == "null-credits").unwrap();
        assert_eq!(null_row.credits, 0);

        assert_eq!(store.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn insert_then_list_active() {
        let (url, _backend) = start_backend().await;
        let store = test_store(&url);

        let a = store.insert(Secret::from("tok-a"), None).await.unwrap();
        let b = store.insert(Secret::from("tok-b"), Some(7)).await.unwrap();
        assert_eq!(b.credits, 7);

        store
            .set_status(&a.id, CredentialStatus::Inactive)
            .await
            .unwrap();

        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, b.id);
        assert_eq!(active[0].secret.expose(), "tok-b");
    }

    #[tokio::test]
    async fn duplicate_insert_maps_conflict() {
        let (url, _backend) = start_backend().await;
        let store = test_store(&url);

        store.insert(Secret::from("tok-a"), None).await.unwrap();
        let err = store.insert(Secret::from("tok-a"), None).await.unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)), "got: {err}");
    }

    #[tokio::test]
    async fn compare_and_set_filters_on_expected_status() {
        let (url, _backend) = start_backend().await;
        let store = test_store(&url);
        let a = store.insert(Secret::from("tok-a"), None).await.unwrap();

        assert!(
            store
                .compare_and_set_status(
                    &a.id,
                    CredentialStatus::Active,
                    CredentialStatus::OutOfCredits
                )
                .await
                .unwrap()
        );
        assert!(
            !store
                .compare_and_set_status(
                    &a.id,
                    CredentialStatus::Active,
                    CredentialStatus::Inactive
                )
                .await
                .unwrap()
        );

        let all = store.list_all().await.unwrap();
        assert_eq!(all[0].status, CredentialStatus::OutOfCredits);
        assert_eq!(all[0].credits, 0);
    }

    #[tokio::test]
    async fn set_status_missing_is_not_found() {
        let (url, _backend) = start_backend().await;
        let store = test_store(&url);
        let err = store
            .set_status("ghost", CredentialStatus::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let (url, _backend) = start_backend().await;
        let store = test_store(&url);
        let a = store.insert(Secret::from("tok-a"), None).await.unwrap();

        assert!(store.delete(&a.id).await.unwrap());
        assert!(!store.delete(&a.id).await.unwrap());
    }

    #[tokio::test]
    async fn logs_append_and_read_back_newest_first() {
        let (url, backend) = start_backend().await;
        let store = test_store(&url);
        let secret = Secret::from("eyJhbGciOiJSUzI1NiJ9.payload");

        store
            .append(LogEntry::new(&secret, "POST", "/api/lovable-proxy", 200))
            .await
            .unwrap();
        store
            .append(LogEntry::new(&secret, "POST", "/api/lovable-proxy", 402))
            .await
            .unwrap();

        let raw = backend.logs.lock().await.clone();
        assert_eq!(raw[0]["token_used"], "eyJhbGciOi...");

        let recent = store.recent(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status_code, 402);
    }

    #[tokio::test]
    async fn backend_error_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = axum::Router::new().fallback(|| async {
                (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "db down")
            });
            axum::serve(listener, app).await.unwrap();
        });

        let store = test_store(&format!("http://{addr}"));
        let err = store.list_active().await.unwrap_err();
        assert!(matches!(err, Error::Backend(_)), "got: {err}");
        assert!(err.to_string().contains("db down"));
    }

    #[tokio::test]
    async fn unreachable_store_is_http_error() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let store = test_store(&format!("http://{addr}"));
        let err = store.list_active().await.unwrap_err();
        assert!(matches!(err, Error::Http(_)), "got: {err}");
    }
}
