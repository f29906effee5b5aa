//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The store service key is loaded from STORE_SERVICE_KEY or key_file,
//! never stored in the TOML directly to avoid leaking secrets.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::http::Method;
use common::Secret;
use serde::Deserialize;
use token_pool::PoolSettings;
use upstream::{ClassifierPolicy, DEFAULT_SUCCESS_FALLBACK, HeaderInjection};

/// Routes served by the relay itself; the relay path may not shadow them.
const RESERVED_PATHS: &[&str] = &["/health", "/metrics"];

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub headers: Vec<HeaderInjection>,
    /// Resolved PostgREST service key (STORE_SERVICE_KEY or key_file)
    #[serde(skip)]
    pub store_key: Option<Secret<String>>,
}

/// Relay listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_allowed_methods")]
    pub allowed_methods: Vec<String>,
    /// Answer browser preflight and attach permissive CORS headers
    #[serde(default)]
    pub cors: bool,
}

/// Upstream chat API settings
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub endpoints: Vec<String>,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_success_fallback")]
    pub success_fallback: String,
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// Which upstream statuses are treated as credential failures
#[derive(Debug, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_invalid_credential")]
    pub invalid_credential: Vec<u16>,
    #[serde(default = "default_credits_exhausted")]
    pub credits_exhausted: Vec<u16>,
    /// Mark credentials `inactive` when the upstream rejects them
    #[serde(default)]
    pub deactivate_invalid: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            invalid_credential: default_invalid_credential(),
            credits_exhausted: default_credits_exhausted(),
            deactivate_invalid: false,
        }
    }
}

/// Credential pool settings
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    /// When false, every request must carry its own `token`
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_grace")]
    pub grace_secs: u64,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_log_timeout")]
    pub log_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_ttl(),
            grace_secs: default_grace(),
            fetch_timeout_secs: default_fetch_timeout(),
            log_timeout_secs: default_log_timeout(),
        }
    }
}

/// Credential store backend
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    File {
        path: PathBuf,
        /// Defaults to `path` with its extension replaced by `log.jsonl`
        #[serde(default)]
        log_path: Option<PathBuf>,
    },
    Postgrest {
        url: String,
        /// Path to a file containing the service key (alternative to STORE_SERVICE_KEY env var)
        #[serde(default)]
        key_file: Option<PathBuf>,
        #[serde(default = "default_store_timeout")]
        timeout_secs: u64,
    },
}

/// Admin API listener settings
#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_admin_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: default_admin_addr(),
        }
    }
}

fn default_path() -> String {
    "/api/lovable-proxy".into()
}

fn default_max_connections() -> usize {
    1000
}

fn default_allowed_methods() -> Vec<String> {
    vec!["POST".into()]
}

fn default_upstream_timeout() -> u64 {
    30
}

fn default_success_fallback() -> String {
    DEFAULT_SUCCESS_FALLBACK.into()
}

fn default_invalid_credential() -> Vec<u16> {
    vec![401]
}

fn default_credits_exhausted() -> Vec<u16> {
    vec![402, 403]
}

fn default_true() -> bool {
    true
}

fn default_ttl() -> u64 {
    60
}

fn default_grace() -> u64 {
    300
}

fn default_fetch_timeout() -> u64 {
    5
}

fn default_log_timeout() -> u64 {
    5
}

fn default_store_timeout() -> u64 {
    5
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Service key resolution order:
    /// 1. STORE_SERVICE_KEY env var
    /// 2. key_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| common::Error::Read {
            what: "config file",
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config =
            toml::from_str(&contents).map_err(|source| common::Error::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if let Ok(port) = std::env::var("PORT") {
            let port: u16 = port.trim().parse().map_err(|_| {
                common::Error::Config(format!("PORT must be a valid port number, got: {port}"))
            })?;
            config.server.listen_addr.set_port(port);
        }

        config.validate()?;

        if let StoreConfig::Postgrest { key_file, .. } = &config.store {
            if let Ok(key) = std::env::var("STORE_SERVICE_KEY") {
                config.store_key = Some(Secret::new(key));
            } else if let Some(key_file) = key_file {
                let key =
                    std::fs::read_to_string(key_file).map_err(|source| common::Error::Read {
                        what: "key_file",
                        path: key_file.clone(),
                        source,
                    })?;
                let key = key.trim().to_owned();
                if !key.is_empty() {
                    config.store_key = Some(Secret::new(key));
                }
            }
            if config.store_key.is_none() {
                return Err(common::Error::Config(
                    "postgrest store requires STORE_SERVICE_KEY or key_file".into(),
                ));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.upstream.endpoints.is_empty() {
            return Err(common::Error::Config(
                "upstream.endpoints must list at least one endpoint".into(),
            ));
        }
        for endpoint in &self.upstream.endpoints {
            if !is_http_url(endpoint) {
                return Err(common::Error::Config(format!(
                    "upstream endpoint must start with http:// or https://, got: {endpoint}"
                )));
            }
        }

        if self.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "upstream.timeout_secs must be greater than 0".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if !self.server.path.starts_with('/') {
            return Err(common::Error::Config(format!(
                "server.path must start with '/', got: {}",
                self.server.path
            )));
        }
        if RESERVED_PATHS.contains(&self.server.path.as_str()) {
            return Err(common::Error::Config(format!(
                "server.path {} collides with a built-in route",
                self.server.path
            )));
        }
        self.allowed_methods()?;

        if self.pool.ttl_secs == 0
            || self.pool.fetch_timeout_secs == 0
            || self.pool.log_timeout_secs == 0
        {
            return Err(common::Error::Config(
                "pool ttl_secs, fetch_timeout_secs and log_timeout_secs must be greater than 0"
                    .into(),
            ));
        }

        if let StoreConfig::Postgrest {
            url, timeout_secs, ..
        } = &self.store
        {
            if !is_http_url(url) {
                return Err(common::Error::Config(format!(
                    "store url must start with http:// or https://, got: {url}"
                )));
            }
            if *timeout_secs == 0 {
                return Err(common::Error::Config(
                    "store timeout_secs must be greater than 0".into(),
                ));
            }
        }

        Ok(())
    }

    /// Parsed `server.allowed_methods`.
    pub fn allowed_methods(&self) -> common::Result<Vec<Method>> {
        if self.server.allowed_methods.is_empty() {
            return Err(common::Error::Config(
                "server.allowed_methods must not be empty".into(),
            ));
        }
        self.server
            .allowed_methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes()).map_err(|_| {
                    common::Error::Config(format!("invalid HTTP method in allowed_methods: {m}"))
                })
            })
            .collect()
    }

    /// Classifier policy assembled from `[upstream]` and `[upstream.policy]`.
    pub fn classifier_policy(&self) -> ClassifierPolicy {
        ClassifierPolicy {
            invalid_credential: self.upstream.policy.invalid_credential.clone(),
            credits_exhausted: self.upstream.policy.credits_exhausted.clone(),
            success_fallback: self.upstream.success_fallback.clone(),
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            ttl: Duration::from_secs(self.pool.ttl_secs),
            grace: Duration::from_secs(self.pool.grace_secs),
            fetch_timeout: Duration::from_secs(self.pool.fetch_timeout_secs),
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("token-relay.toml")
    }
}

fn is_http_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}
