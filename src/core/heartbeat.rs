//! Liveness reporting from inside the worker loop.

use crate::store::TaskStore;
use crate::task::WorkerHeartbeat;
use chrono::Utc;
use std::time::Duration;
use tokio::time::Instant;

/// Emits a heartbeat when the interval has elapsed.
///
/// The worker loop calls [`maybe_emit`](HeartbeatReporter::maybe_emit) at the
/// top of each iteration; the reporter never runs on its own timer, so one
/// worker is never two concurrent writers.
#[derive(Debug, Clone)]
pub struct HeartbeatReporter {
    worker_id: String,
    interval: Duration,
    last_emitted: Option<Instant>,
    failures: u64,
}

impl HeartbeatReporter {
    /// Create a reporter; the first check is always due.
    pub fn new(worker_id: impl Into<String>, interval: Duration) -> Self {
        Self {
            worker_id: worker_id.into(),
            interval,
            last_emitted: None,
            failures: 0,
        }
    }

    /// Whether the interval has elapsed since the last successful emission
    pub fn is_due(&self) -> bool {
        self.last_emitted
            .is_none_or(|last| last.elapsed() >= self.interval)
    }

    /// Upsert a heartbeat if one is due.
    ///
    /// Returns whether a heartbeat was written. Write failures are logged and
    /// retried on the next iteration.
    pub async fn maybe_emit(
        &mut self,
        store: &dyn TaskStore,
        tasks_processed: u64,
        tasks_failed: u64,
    ) -> bool {
        if !self.is_due() {
            return false;
        }

        let heartbeat = WorkerHeartbeat {
            worker_id: self.worker_id.clone(),
            last_heartbeat: Utc::now(),
            tasks_processed,
            tasks_failed,
        };

        match store.upsert_heartbeat(&heartbeat).await {
            Ok(()) => {
                self.last_emitted = Some(Instant::now());
                tracing::trace!(
                    worker_id = %self.worker_id,
                    tasks_processed,
                    tasks_failed,
                    "Heartbeat emitted"
                );
                true
            }
            Err(e) => {
                self.failures += 1;
                tracing::warn!(
                    worker_id = %self.worker_id,
                    failures = self.failures,
                    "Failed to write heartbeat: {}",
                    e
                );
                false
            }
        }
    }

    /// Number of failed heartbeat writes so far
    pub fn failures(&self) -> u64 {
        self.failures
    }
}
