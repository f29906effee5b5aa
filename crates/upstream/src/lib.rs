//! Upstream chat API forwarding
//!
//! Decouples the relay pipeline from the upstream's wire behavior:
//! - `classify` maps a raw upstream reply (status + body, or transport
//!   failure) to a typed `Outcome`
//! - `forward` sends one request across an ordered list of endpoints,
//!   stopping early on auth-fatal outcomes and falling back on retryable ones
//!
//! Neither module touches credential state. Deactivation on exhausted credits
//! is the caller's decision, driven by the returned `Outcome`.

pub mod classify;
pub mod error;
pub mod forward;

pub use classify::{Classifier, ClassifierPolicy, DEFAULT_SUCCESS_FALLBACK, Outcome, UpstreamReply};
pub use error::{Error, Result};
pub use forward::{Attempt, ForwardRequest, Forwarded, Forwarder, HeaderInjection, is_hop_by_hop};
