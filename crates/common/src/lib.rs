//! Common types shared by the token relay crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
