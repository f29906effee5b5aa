//! Credential pool for the token relay
//!
//! Sits between the credential store and the request pipeline:
//! - `PoolCache` keeps a TTL-bounded snapshot of the active credentials and
//!   refreshes it single-flight
//! - `Selector` rotates through the snapshot round-robin
//! - `TokenPool` bundles both with the store and owns deactivation
//! - `TransactionLog` records relayed transactions without blocking responses
//!
//! Request flow:
//! 1. `TokenPool::select` reads the cached snapshot (refreshing when stale)
//! 2. The selector picks the next credential by rotating cursor
//! 3. On exhausted credits the caller invokes `TokenPool::deactivate`, which
//!    compare-and-sets the store and retires the credential from the snapshot
//! 4. `TransactionLog::record` writes the masked transaction in the background

pub mod cache;
pub mod error;
pub mod ledger;
pub mod pool;
pub mod selector;

pub use cache::{PoolCache, PoolSettings};
pub use error::{Error, Result};
pub use ledger::TransactionLog;
pub use pool::TokenPool;
pub use selector::Selector;
