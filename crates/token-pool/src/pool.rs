//! Pool manager: cache, cursor and store behind one handle
//!
//! The relay holds a single `TokenPool` in its axum state. Selection reads the
//! cached snapshot; every mutation goes to the store first and then
//! invalidates the snapshot so the next selection sees it.

use std::sync::Arc;

use common::Secret;
use token_store::{Credential, CredentialStatus, CredentialStore};
use tracing::{info, warn};

use crate::cache::{PoolCache, PoolSettings};
use crate::error::Result;
use crate::selector::Selector;

/// Credential pool with round-robin selection.
pub struct TokenPool {
    store: Arc<dyn CredentialStore>,
    cache: PoolCache,
    selector: Selector,
}

impl TokenPool {
    pub fn new(store: Arc<dyn CredentialStore>, settings: PoolSettings) -> Self {
        info!(
            backend = store.kind(),
            ttl_secs = settings.ttl.as_secs(),
            grace_secs = settings.grace.as_secs(),
            "token pool initialized"
        );
        Self {
            cache: PoolCache::new(store.clone(), settings),
            store,
            selector: Selector::new(),
        }
    }

    /// Select the next active credential.
    ///
    /// Returns `PoolExhausted` when the snapshot is empty, which includes a
    /// store that is down past its grace window.
    pub async fn select(&self) -> Result<Credential> {
        let snapshot = self.cache.get().await;
        self.selector.next(&snapshot).cloned()
    }

    /// Move a credential out of `active` and stop serving it.
    ///
    /// The store write is a compare-and-set from `active`, so an operator
    /// change that landed first is never overwritten. The credential is
    /// retired from the snapshot either way. Returns whether this call
    /// performed the transition.
    pub async fn deactivate(&self, id: &str, status: CredentialStatus) -> Result<bool> {
        let swapped = self
            .store
            .compare_and_set_status(id, CredentialStatus::Active, status)
            .await;
        self.cache.retire(id).await;

        match swapped {
            Ok(true) => {
                info!(credential_id = id, status = %status, "credential deactivated");
                metrics::counter!("relay_credential_deactivations_total", "status" => status.as_str())
                    .increment(1);
                Ok(true)
            }
            Ok(false) => {
                info!(credential_id = id, status = %status, "credential already left active state");
                Ok(false)
            }
            Err(e) => {
                warn!(credential_id = id, error = %e, "failed to persist credential deactivation");
                Err(e.into())
            }
        }
    }

    /// Insert a new active credential.
    pub async fn add(&self, secret: Secret<String>, credits: Option<u32>) -> Result<Credential> {
        let credential = self.store.insert(secret, credits).await?;
        self.cache.invalidate();
        info!(credential_id = %credential.id, "credential added");
        Ok(credential)
    }

    /// Delete a credential. Returns whether it existed.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let removed = self.store.delete(id).await?;
        if removed {
            self.cache.retire(id).await;
            info!(credential_id = id, "credential removed");
        }
        Ok(removed)
    }

    /// Operator status change, including re-activation.
    pub async fn set_status(&self, id: &str, status: CredentialStatus) -> Result<Credential> {
        let credential = self.store.set_status(id, status).await?;
        if status.is_selectable() {
            self.cache.invalidate();
        } else {
            self.cache.retire(id).await;
        }
        info!(credential_id = id, status = %status, "credential status set");
        Ok(credential)
    }

    /// Every stored credential regardless of status.
    pub async fn list_all(&self) -> Result<Vec<Credential>> {
        Ok(self.store.list_all().await?)
    }

    /// Force the next selection to re-read the store.
    pub fn invalidate(&self) {
        self.cache.invalidate();
    }

    /// Number of credentials in the current snapshot, refreshing if stale.
    pub async fn active_count(&self) -> usize {
        self.cache.get().await.len()
    }

    /// Pool summary for the health and admin endpoints.
    ///
    /// Reads the held snapshot only; never triggers a store read.
    pub async fn health(&self) -> serde_json::Value {
        let snapshot = self.cache.peek().await;
        let age = self.cache.age().await;
        let credentials: Vec<_> = snapshot
            .iter()
            .map(|c| {
                serde_json::json!({
                    "id": c.id,
                    "token": c.masked_secret(),
                    "credits": c.credits,
                })
            })
            .collect();

        serde_json::json!({
            "status": if snapshot.is_empty() { "empty" } else { "ready" },
            "backend": self.store.kind(),
            "active": snapshot.len(),
            "cache_age_secs": age.map(|a| a.as_secs()),
            "ttl_secs": self.cache.settings().ttl.as_secs(),
            "cursor": self.selector.position(),
            "credentials": credentials,
        })
    }

    /// Shared store handle (for the admin API's log view and listings).
    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }
}
