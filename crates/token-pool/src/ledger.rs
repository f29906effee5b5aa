//! Fire-and-forget transaction log

use std::sync::Arc;
use std::time::Duration;

use token_store::{LogEntry, LogSink};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Writes transaction entries in the background.
///
/// `record` returns as soon as the write is spawned. Failures and timeouts
/// are logged at `warn` and dropped; they never reach the request path.
#[derive(Clone)]
pub struct TransactionLog {
    sink: Arc<dyn LogSink>,
    write_timeout: Duration,
}

impl TransactionLog {
    pub fn new(sink: Arc<dyn LogSink>, write_timeout: Duration) -> Self {
        Self {
            sink,
            write_timeout,
        }
    }

    /// Spawn the write for `entry`. The handle is only useful to tests.
    pub fn record(&self, entry: LogEntry) -> JoinHandle<()> {
        let log = self.clone();
        tokio::spawn(async move { log.write(entry).await })
    }

    /// Write `entry` in the current task, bounded by the write timeout.
    ///
    /// For callers that already run off the request path and need the write
    /// ordered after other work. Never fails.
    pub async fn write(&self, entry: LogEntry) {
        let id = entry.id.clone();
        match tokio::time::timeout(self.write_timeout, self.sink.append(entry)).await {
            Ok(Ok(())) => debug!(log_id = %id, "transaction logged"),
            Ok(Err(e)) => warn!(log_id = %id, error = %e, "failed to write transaction log"),
            Err(_) => warn!(
                log_id = %id,
                timeout_ms = self.write_timeout.as_millis() as u64,
                "transaction log write timed out"
            ),
        }
    }

    /// Most recent entries first.
    pub async fn recent(&self, limit: usize) -> token_store::Result<Vec<LogEntry>> {
        self.sink.recent(limit).await
    }
}
