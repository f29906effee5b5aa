//! TTL-bounded read-through cache over the active credentials
//!
//! The cache holds the last successful `list_active` result and the instant it
//! was fetched. Reads within the TTL are served from memory. Refresh is
//! single-flight: one async mutex guards the store read, and callers that
//! queued behind an in-flight refresh reuse its result instead of reading the
//! store again.
//!
//! Invalidation bumps an epoch. A snapshot is only fresh if it was fetched at
//! the current epoch, so a fetch that started before an invalidation is served
//! to the caller that started it but never trusted by later readers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use token_store::{Credential, CredentialStore};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Timing knobs for the pool cache.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    /// How long a non-empty snapshot is served without touching the store.
    pub ttl: Duration,
    /// Extra time a stale snapshot may be served while the store is failing.
    pub grace: Duration,
    /// Upper bound on a single store read.
    pub fetch_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            grace: Duration::from_secs(300),
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct CacheState {
    /// Last successful fetch, minus anything retired since.
    good: Arc<Vec<Credential>>,
    fetched_at: Option<Instant>,
    /// Epoch observed when `good` was fetched.
    good_epoch: u64,
    /// Bumped after every refresh attempt, successful or not.
    generation: u64,
    /// What the most recent refresh handed out, and the epoch it started at.
    last_served: Arc<Vec<Credential>>,
    served_epoch: u64,
    /// Retired credential ids mapped to the epoch of their retirement. A fetch
    /// that started before that epoch may still list them.
    retired: HashMap<String, u64>,
}

/// Read-through snapshot cache of active credentials.
pub struct PoolCache {
    store: Arc<dyn CredentialStore>,
    settings: PoolSettings,
    state: RwLock<CacheState>,
    refresh_lock: Mutex<()>,
    epoch: AtomicU64,
}

impl PoolCache {
    pub fn new(store: Arc<dyn CredentialStore>, settings: PoolSettings) -> Self {
        Self {
            store,
            settings,
            state: RwLock::new(CacheState::default()),
            refresh_lock: Mutex::new(()),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Current active snapshot, refreshing from the store when stale.
    ///
    /// Never fails: a store error yields the last good snapshot while it is
    /// within TTL + grace, otherwise an empty pool.
    pub async fn get(&self) -> Arc<Vec<Credential>> {
        let seen_generation = {
            let state = self.state.read().await;
            if self.is_fresh(&state) {
                return state.good.clone();
            }
            state.generation
        };

        let _guard = self.refresh_lock.lock().await;

        {
            let state = self.state.read().await;
            if self.is_fresh(&state) {
                return state.good.clone();
            }
            // Someone refreshed while we queued. Reuse their answer unless an
            // invalidation landed since it started.
            if state.generation != seen_generation
                && state.served_epoch == self.epoch.load(Ordering::Acquire)
            {
                return state.last_served.clone();
            }
        }

        self.refresh().await
    }

    /// Force the next `get` to read the store.
    pub fn invalidate(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(epoch, "pool cache invalidated");
    }

    /// Drop one credential from the held snapshot and invalidate.
    ///
    /// The credential is also withheld from any fetch that started before this
    /// call, so it cannot reappear through a racing refresh or the grace
    /// fallback.
    pub async fn retire(&self, id: &str) {
        let mut state = self.state.write().await;
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        state.retired.insert(id.to_string(), epoch);
        state.good = Arc::new(without(&state.good, id));
        state.last_served = Arc::new(without(&state.last_served, id));
        debug!(credential_id = id, epoch, "credential retired from pool cache");
    }

    /// Age of the held snapshot, if any fetch ever succeeded.
    pub async fn age(&self) -> Option<Duration> {
        self.state.read().await.fetched_at.map(|t| t.elapsed())
    }

    /// Held snapshot without triggering a refresh.
    pub async fn peek(&self) -> Arc<Vec<Credential>> {
        self.state.read().await.good.clone()
    }

    fn is_fresh(&self, state: &CacheState) -> bool {
        !state.good.is_empty()
            && state.good_epoch == self.epoch.load(Ordering::Acquire)
            && state
                .fetched_at
                .is_some_and(|t| t.elapsed() < self.settings.ttl)
    }

    /// Read the store once. Caller holds `refresh_lock`.
    async fn refresh(&self) -> Arc<Vec<Credential>> {
        let started_epoch = self.epoch.load(Ordering::Acquire);
        let fetched =
            tokio::time::timeout(self.settings.fetch_timeout, self.store.list_active()).await;

        let mut state = self.state.write().await;
        state.generation += 1;
        state.served_epoch = started_epoch;

        let served = match fetched {
            Ok(Ok(list)) => {
                state.retired.retain(|_, retired_at| *retired_at > started_epoch);
                let active: Vec<Credential> = list
                    .into_iter()
                    .filter(|c| c.status.is_selectable() && !state.retired.contains_key(&c.id))
                    .collect();
                let snapshot = Arc::new(active);
                info!(
                    backend = self.store.kind(),
                    active = snapshot.len(),
                    "pool snapshot refreshed"
                );
                metrics::counter!("relay_pool_refresh_total", "result" => "ok").increment(1);
                state.good = snapshot.clone();
                state.fetched_at = Some(Instant::now());
                state.good_epoch = started_epoch;
                snapshot
            }
            Ok(Err(e)) => {
                warn!(backend = self.store.kind(), error = %e, "pool refresh failed");
                metrics::counter!("relay_pool_refresh_total", "result" => "error").increment(1);
                self.fallback(&state)
            }
            Err(_) => {
                warn!(
                    backend = self.store.kind(),
                    timeout_ms = self.settings.fetch_timeout.as_millis() as u64,
                    "pool refresh timed out"
                );
                metrics::counter!("relay_pool_refresh_total", "result" => "timeout").increment(1);
                self.fallback(&state)
            }
        };

        state.last_served = served.clone();
        served
    }

    /// Snapshot to serve while the store is failing.
    fn fallback(&self, state: &CacheState) -> Arc<Vec<Credential>> {
        let limit = self.settings.ttl + self.settings.grace;
        match state.fetched_at {
            Some(t) if t.elapsed() < limit && !state.good.is_empty() => {
                debug!(
                    age_secs = t.elapsed().as_secs(),
                    "serving stale pool snapshot within grace"
                );
                state.good.clone()
            }
            _ => Arc::new(Vec::new()),
        }
    }
}

fn without(list: &[Credential], id: &str) -> Vec<Credential> {
    list.iter().filter(|c| c.id != id).cloned().collect()
}
