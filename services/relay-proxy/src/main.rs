//! Token Relay Proxy
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of upstream bearer credentials from a credential store
//! 2. Accepts chat requests on one configured path
//! 3. Forwards each request with the next credential in rotation, falling back
//!    across upstream endpoints
//! 4. Retires credentials the upstream reports as out of credits
//! 5. Serves an admin API for credential management on a separate listener

mod admin;
mod config;
mod error;
mod metrics;
mod relay;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use bytes::Bytes;
use metrics_exporter_prometheus::PrometheusHandle;
use token_pool::{TokenPool, TransactionLog};
use token_store::{CredentialStore, FileStore, LogSink, PostgrestStore};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::{Classifier, Forwarder};

use crate::admin::{AdminState, build_admin_router};
use crate::config::{Config, StoreConfig};
use crate::relay::{CredentialMode, RelayState};

/// Time allowed for in-flight requests to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    relay: RelayState,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the relay router.
///
/// Applies a concurrency limit layer based on `max_connections`, and a
/// permissive CORS layer when `cors` is set so browser clients can call the
/// relay directly.
fn build_router(state: AppState, path: &str, max_connections: usize, cors: bool) -> Router {
    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route(path, any(relay_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state);

    if cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Open the configured credential store. Both handles point at the same backend.
async fn build_store(
    config: &Config,
    client: reqwest::Client,
) -> Result<(Arc<dyn CredentialStore>, Arc<dyn LogSink>)> {
    match &config.store {
        StoreConfig::File { path, log_path } => {
            let log_path = log_path
                .clone()
                .unwrap_or_else(|| default_log_path(path));
            let store = Arc::new(
                FileStore::load(path.clone(), log_path)
                    .await
                    .with_context(|| format!("failed to load credential file {}", path.display()))?,
            );
            let credentials: Arc<dyn CredentialStore> = store.clone();
            let sink: Arc<dyn LogSink> = store;
            Ok((credentials, sink))
        }
        StoreConfig::Postgrest {
            url, timeout_secs, ..
        } => {
            let key = config
                .store_key
                .clone()
                .context("postgrest store requires a service key")?;
            let store = Arc::new(PostgrestStore::new(
                client,
                url.clone(),
                key,
                Duration::from_secs(*timeout_secs),
            ));
            let credentials: Arc<dyn CredentialStore> = store.clone();
            let sink: Arc<dyn LogSink> = store;
            Ok((credentials, sink))
        }
    }
}

/// `tokens.json` logs to `tokens.log.jsonl` in the same directory.
fn default_log_path(path: &Path) -> std::path::PathBuf {
    path.with_extension("log.jsonl")
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting token-relay-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let allowed_methods = config.allowed_methods()?;

    info!(
        listen_addr = %config.server.listen_addr,
        path = %config.server.path,
        endpoints = config.upstream.endpoints.len(),
        pool_enabled = config.pool.enabled,
        headers = config.headers.len(),
        "configuration loaded"
    );

    let client = reqwest::Client::new();
    let (store, sink) = build_store(&config, client.clone()).await?;
    let pool = Arc::new(TokenPool::new(store, config.pool_settings()));
    let ledger = TransactionLog::new(sink, Duration::from_secs(config.pool.log_timeout_secs));

    let forwarder = Forwarder::new(
        client,
        &config.upstream.endpoints,
        Duration::from_secs(config.upstream.timeout_secs),
        Classifier::new(config.classifier_policy()),
        &config.headers,
    )
    .context("invalid upstream configuration")?;
    for (priority, endpoint) in forwarder.endpoints().iter().enumerate() {
        info!(priority, endpoint = %endpoint, "upstream endpoint");
    }

    let mode = if config.pool.enabled {
        CredentialMode::Pool
    } else {
        CredentialMode::Explicit
    };

    let relay_state = RelayState {
        pool: pool.clone(),
        forwarder,
        ledger: ledger.clone(),
        mode,
        allowed_methods: Arc::new(allowed_methods),
        deactivate_invalid: config.upstream.policy.deactivate_invalid,
        requests_total: Arc::new(AtomicU64::new(0)),
    };

    let app_state = AppState {
        relay: relay_state,
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };

    let app = build_router(
        app_state,
        &config.server.path,
        config.server.max_connections,
        config.server.cors,
    );

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    // Admin API on its own listener, never on the relay port
    let (admin_shutdown_tx, admin_handle) = if config.admin.enabled {
        let admin_addr = config.admin.listen_addr;
        let admin_listener = TcpListener::bind(admin_addr)
            .await
            .with_context(|| format!("failed to bind admin listener to {admin_addr}"))?;
        let admin_app = build_admin_router(AdminState::new(pool, ledger));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            axum::serve(admin_listener, admin_app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await
        });
        info!(addr = %admin_addr, "admin API listening");
        (Some(tx), Some(handle))
    } else {
        (None, None)
    };

    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    let _ = shutdown_tx.send(());
    if let Some(tx) = admin_shutdown_tx {
        let _ = tx.send(());
    }

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }
    if let Some(handle) = admin_handle {
        handle.abort();
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: JSON with status, active credential count, cache age,
/// uptime and requests served. 200 when a credential is available, 503 when
/// the pool is empty. In explicit-token mode the relay is always ready.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let requests = state.relay.requests_total.load(Ordering::Relaxed);

    let (status_code, body) = match state.relay.mode {
        CredentialMode::Pool => {
            let active = state.relay.pool.active_count().await;
            let pool = state.relay.pool.health().await;
            let (code, status) = if active > 0 {
                (StatusCode::OK, "healthy")
            } else {
                (StatusCode::SERVICE_UNAVAILABLE, "degraded")
            };
            (
                code,
                serde_json::json!({
                    "status": status,
                    "mode": "pool",
                    "active_credentials": active,
                    "cache_age_seconds": pool["cache_age_secs"],
                    "uptime_seconds": uptime,
                    "requests_served": requests,
                }),
            )
        }
        CredentialMode::Explicit => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "mode": "explicit",
                "uptime_seconds": uptime,
                "requests_served": requests,
            }),
        ),
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Relay path handler. Dropping this future (client disconnect) cancels the
/// in-flight upstream call.
async fn relay_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    relay::relay_request(
        &state.relay,
        method,
        uri.path(),
        uri.query(),
        &headers,
        body,
        request_id,
    )
    .await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
