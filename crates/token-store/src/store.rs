//! Storage contracts consumed by the pool and the admin API

use std::future::Future;
use std::pin::Pin;

use common::Secret;

use crate::error::Result;
use crate::log::LogEntry;
use crate::model::{Credential, CredentialStatus};

/// Boxed future returned by store operations.
///
/// Uses `Pin<Box<dyn Future>>` so stores stay dyn-compatible (`Arc<dyn CredentialStore>`).
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable record of credentials and their status.
///
/// Implementations must be safe for concurrent calls on different ids. Writes
/// for the same id serialize; the relay itself only ever writes through
/// `compare_and_set_status`, so a lost race never overwrites an operator's
/// later decision.
pub trait CredentialStore: Send + Sync {
    /// Backend identifier for logging (e.g. "file", "postgrest").
    fn kind(&self) -> &'static str;

    /// Every credential regardless of status, oldest first.
    fn list_all(&self) -> StoreFuture<'_, Vec<Credential>>;

    /// Credentials with status `active`, oldest first.
    fn list_active(&self) -> StoreFuture<'_, Vec<Credential>>;

    /// Insert a new active credential. Fails with `Error::Duplicate` if the
    /// secret is already stored.
    fn insert(&self, secret: Secret<String>, credits: Option<u32>)
    -> StoreFuture<'_, Credential>;

    /// Delete a credential. Returns whether a row was removed.
    fn delete<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool>;

    /// Unconditionally set a credential's status (operator path, last writer wins).
    fn set_status<'a>(
        &'a self,
        id: &'a str,
        status: CredentialStatus,
    ) -> StoreFuture<'a, Credential>;

    /// Set `status` only if the current status equals `expected`.
    ///
    /// Returns `false` when the credential is missing or its status already
    /// moved on.
    fn compare_and_set_status<'a>(
        &'a self,
        id: &'a str,
        expected: CredentialStatus,
        status: CredentialStatus,
    ) -> StoreFuture<'a, bool>;
}

/// Append-only transaction log.
pub trait LogSink: Send + Sync {
    /// Append one entry.
    fn append(&self, entry: LogEntry) -> StoreFuture<'_, ()>;

    /// Most recent entries first, at most `limit`.
    fn recent(&self, limit: usize) -> StoreFuture<'_, Vec<LogEntry>>;
}
