//! Backing stores for claimq.
//!
//! A store is the only state shared between workers. It must offer exclusive
//! transactions for the claim protocol, atomic single-row updates for reports
//! and heartbeats, and a bounded lock wait.
//!
//! - **In-Memory**: one process, many workers; ideal for tests and embedding
//! - **PostgreSQL**: many processes against one database
//!
//! # Examples
//!
//! ```rust
//! use claimq::store::{InMemoryStore, TaskStore};
//! use claimq::task::NewTask;
//!
//! # async fn example() -> claimq::ClaimqResult<()> {
//! let store = InMemoryStore::new();
//! let task = store.enqueue(NewTask::new("transcode", serde_json::json!({"id": 1}))).await?;
//! assert_eq!(task.id, 1);
//! # Ok(())
//! # }
//! ```

use crate::config::{RetryConfig, StoreBackendConfig, StoreConfig};
use crate::error::{ClaimqError, ClaimqResult};
use crate::strategy::{ClaimStrategy, PriorityOrder};
use crate::task::{
    NewTask, ReportDisposition, Task, TaskEvent, TaskEventKind, TaskId, TaskOutcome, TaskStatus,
    WorkerHeartbeat,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

pub mod memory;
pub use memory::InMemoryStore;

#[cfg(feature = "postgres-store")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres-store")))]
pub mod postgres;

#[cfg(feature = "postgres-store")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres-store")))]
pub use postgres::PostgresStore;

#[cfg(test)]
pub(crate) mod testing;

/// Per-status task counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Tasks waiting to be claimed
    pub queued: u64,
    /// Tasks claimed but not started
    pub claimed: u64,
    /// Tasks being processed
    pub running: u64,
    /// Tasks finished successfully
    pub completed: u64,
    /// Tasks failed permanently
    pub failed: u64,
    /// Tasks cancelled
    pub cancelled: u64,
}

impl QueueStats {
    /// Count one task with the given status.
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Queued => self.queued += 1,
            TaskStatus::Claimed => self.claimed += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }

    /// Total number of tasks
    pub fn total(&self) -> u64 {
        self.queued + self.claimed + self.running + self.completed + self.failed + self.cancelled
    }
}

/// An open exclusive transaction.
///
/// While it is open no other writer can touch the task table. Dropping it
/// without calling [`commit`](ClaimTransaction::commit) discards staged writes.
#[async_trait]
pub trait ClaimTransaction: Send {
    /// Queued tasks claimable at `now`.
    ///
    /// Backends may pre-order and truncate the list for deterministic
    /// strategies; the first element must then be the strategy's best pick.
    async fn candidates(
        &mut self,
        strategy: &ClaimStrategy,
        order: PriorityOrder,
        now: DateTime<Utc>,
    ) -> ClaimqResult<Vec<Task>>;

    /// Stage `queued -> claimed` for one task and return the updated row.
    async fn mark_claimed(
        &mut self,
        task_id: TaskId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> ClaimqResult<Task>;

    /// Apply staged writes and release the lock.
    async fn commit(self: Box<Self>) -> ClaimqResult<()>;

    /// Discard staged writes and release the lock.
    async fn rollback(self: Box<Self>) -> ClaimqResult<()>;
}

/// Trait that all store backends must implement
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task in `queued` status.
    async fn enqueue(&self, task: NewTask) -> ClaimqResult<Task>;

    /// Open an exclusive transaction for the claim protocol.
    ///
    /// Fails with [`ClaimqError::StoreBusy`] when the lock is not granted
    /// within the configured timeout.
    async fn begin_exclusive(&self) -> ClaimqResult<Box<dyn ClaimTransaction>>;

    /// Move a task claimed by `worker_id` to `running`.
    async fn mark_running(&self, task_id: TaskId, worker_id: &str) -> ClaimqResult<Task>;

    /// Record the outcome of processing.
    ///
    /// Reports for tasks the worker no longer holds (already terminal,
    /// cancelled, reclaimed) leave the task untouched and only append an event.
    async fn report(
        &self,
        task_id: TaskId,
        worker_id: &str,
        outcome: &TaskOutcome,
        retry_delay: Duration,
    ) -> ClaimqResult<ReportDisposition>;

    /// Cancel a queued or claimed task.
    async fn cancel(&self, task_id: TaskId) -> ClaimqResult<Task>;

    /// Get a task by ID.
    async fn get_task(&self, task_id: TaskId) -> ClaimqResult<Option<Task>>;

    /// Tasks with the given status, oldest first.
    async fn tasks_by_status(
        &self,
        status: TaskStatus,
        limit: Option<usize>,
    ) -> ClaimqResult<Vec<Task>>;

    /// Audit events for a task, oldest first.
    async fn events(&self, task_id: TaskId) -> ClaimqResult<Vec<TaskEvent>>;

    /// Insert or replace a worker heartbeat.
    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> ClaimqResult<()>;

    /// All recorded heartbeats.
    async fn heartbeats(&self) -> ClaimqResult<Vec<WorkerHeartbeat>>;

    /// Requeue claims whose worker has been silent since before `stale_before`.
    ///
    /// A reclaim counts as a failed attempt: tasks out of retries fail
    /// permanently instead. Returns the affected task ids.
    async fn reclaim_orphaned(&self, stale_before: DateTime<Utc>) -> ClaimqResult<Vec<TaskId>>;

    /// Get per-status counts.
    async fn stats(&self) -> ClaimqResult<QueueStats>;

    /// Health check for the store backend.
    async fn health_check(&self) -> ClaimqResult<()>;
}

/// Shared handle to a store
pub type SharedStore = Arc<dyn TaskStore>;

/// Factory methods for creating store backends
pub struct StoreFactory;

impl StoreFactory {
    /// Create an in-memory store
    pub fn in_memory(config: &StoreConfig, retry: &RetryConfig) -> SharedStore {
        Arc::new(InMemoryStore::with_config(config.lock_timeout(), retry.default_max_retries))
    }

    /// Create the store described by `config`
    pub async fn from_config(config: &StoreConfig, retry: &RetryConfig) -> ClaimqResult<SharedStore> {
        match &config.backend {
            StoreBackendConfig::InMemory => Ok(Self::in_memory(config, retry)),
            #[cfg(feature = "postgres-store")]
            StoreBackendConfig::Postgres(pg) => {
                let store = PostgresStore::connect(pg, config.lock_timeout(), retry.default_max_retries)
                    .await?;
                store.ensure_schema().await?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "postgres-store"))]
            StoreBackendConfig::Postgres(_) => Err(ClaimqError::config(
                "PostgreSQL store requested but the `postgres-store` feature is disabled",
            )),
        }
    }
}

/// Apply a processor outcome to a task the reporter holds.
///
/// Shared by backends that mutate rows in application code. Returns the
/// disposition and the events to append.
pub(crate) fn apply_outcome(
    task: &mut Task,
    worker_id: &str,
    outcome: &TaskOutcome,
    retry_delay: Duration,
    now: DateTime<Utc>,
) -> ClaimqResult<(ReportDisposition, Vec<TaskEvent>)> {
    if !task.is_claimed_by(worker_id) {
        let detail = format!("task is {} (claimed by {:?})", task.status, task.claimed_by);
        let ignored = event(task.id, Some(worker_id), TaskEventKind::IgnoredReport, now, Some(detail));
        return Ok((ReportDisposition::Unchanged { status: task.status }, vec![ignored]));
    }

    match outcome {
        TaskOutcome::Completed(data) => {
            ensure_transition(task, TaskStatus::Completed)?;
            task.status = TaskStatus::Completed;
            task.completed_at = Some(now);
            task.result_data = data.clone();
            task.claimed_by = None;
            let completed = event(task.id, Some(worker_id), TaskEventKind::Completed, now, None);
            Ok((ReportDisposition::Completed, vec![completed]))
        }
        TaskOutcome::Failed(message) => {
            let failed = event(
                task.id,
                Some(worker_id),
                TaskEventKind::Failed,
                now,
                Some(message.clone()),
            );
            let disposition = fail_or_requeue(task, message, retry_delay, now)?;
            let mut events = vec![failed];
            if let ReportDisposition::Requeued { retry_count } = disposition {
                events.push(event(
                    task.id,
                    Some(worker_id),
                    TaskEventKind::Requeued,
                    now,
                    Some(format!("retry {}/{}", retry_count, task.max_retries)),
                ));
            }
            Ok((disposition, events))
        }
    }
}

/// Record a failure on a claimed task: requeue while retries remain, otherwise
/// fail it permanently.
pub(crate) fn fail_or_requeue(
    task: &mut Task,
    message: &str,
    retry_delay: Duration,
    now: DateTime<Utc>,
) -> ClaimqResult<ReportDisposition> {
    ensure_transition(task, TaskStatus::Failed)?;
    task.error_message = Some(message.to_string());
    task.claimed_by = None;

    if task.can_retry() {
        task.retry_count += 1;
        task.status = TaskStatus::Queued;
        task.claimed_at = None;
        task.run_after = if retry_delay.is_zero() {
            None
        } else {
            chrono::Duration::from_std(retry_delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
        };
        Ok(ReportDisposition::Requeued {
            retry_count: task.retry_count,
        })
    } else {
        task.status = TaskStatus::Failed;
        task.completed_at = Some(now);
        Ok(ReportDisposition::Failed)
    }
}

pub(crate) fn ensure_transition(task: &Task, next: TaskStatus) -> ClaimqResult<()> {
    if task.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(ClaimqError::InvalidTransition {
            task_id: task.id,
            from: task.status,
            to: next,
        })
    }
}

pub(crate) fn event(
    task_id: TaskId,
    worker_id: Option<&str>,
    kind: TaskEventKind,
    at: DateTime<Utc>,
    detail: Option<String>,
) -> TaskEvent {
    TaskEvent {
        task_id,
        worker_id: worker_id.map(str::to_string),
        kind,
        at,
        detail,
    }
}
