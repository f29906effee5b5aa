//! Round-robin selection over a pool snapshot

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};

/// Process-wide rotating cursor.
///
/// The cursor is never reset. The modulo is taken against the slice being
/// indexed, so a snapshot that shrank between calls can never be indexed out
/// of range. Fairness holds while the pool is stable; across resizes it is
/// best-effort.
#[derive(Debug, Default)]
pub struct Selector {
    cursor: AtomicUsize,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the next member of `pool`.
    pub fn next<'a, T>(&self, pool: &'a [T]) -> Result<&'a T> {
        if pool.is_empty() {
            return Err(Error::PoolExhausted);
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % pool.len();
        Ok(&pool[idx])
    }

    /// Current cursor value (for health output).
    pub fn position(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }
}
