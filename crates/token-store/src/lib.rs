//! Credential and transaction-log storage for the token relay
//!
//! Defines the credential data model, the `CredentialStore` and `LogSink`
//! contracts the pool consumes, and two backends:
//!
//! - `FileStore`: local JSON credential file plus a JSON-lines transaction log.
//!   Suited to single-node deployments and tests.
//! - `PostgrestStore`: a hosted relational store reached through its REST
//!   query interface (`/rest/v1/tokens`, `/rest/v1/logs`).
//!
//! Credential lifecycle from the store's point of view:
//! 1. Admin inserts a secret → `active`, 100 credits
//! 2. Relay observes credit exhaustion → compare-and-set `active → out_of_credits`
//! 3. Admin re-activates or deletes; the relay never re-activates on its own

pub mod error;
pub mod file;
pub mod log;
pub mod model;
pub mod postgrest;
pub mod store;

pub use error::{Error, Result};
pub use file::FileStore;
pub use log::{LogEntry, MASK_MARKER, TOKEN_PREFIX_LEN, mask_secret};
pub use model::{Credential, CredentialStatus, DEFAULT_CREDITS};
pub use postgrest::PostgrestStore;
pub use store::{CredentialStore, LogSink, StoreFuture};
