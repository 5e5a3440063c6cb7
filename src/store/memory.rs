//! In-memory store implementation for claimq.
//!
//! All state lives behind a single async mutex. Holding that mutex is the
//! exclusive transaction: a claimer keeps it from candidate read to commit, so
//! no other worker can observe or claim the same row in between. Lock waits are
//! bounded by the configured timeout and surface as [`ClaimqError::StoreBusy`].
//!
//! Clones share the same state, so one store can serve every worker of a pool.

use super::{
    ClaimTransaction, QueueStats, TaskStore, apply_outcome, ensure_transition, event,
    fail_or_requeue,
};
use crate::error::{ClaimqError, ClaimqResult};
use crate::strategy::{ClaimStrategy, PriorityOrder};
use crate::task::{
    NewTask, ReportDisposition, Task, TaskEvent, TaskEventKind, TaskId, TaskOutcome, TaskStatus,
    WorkerHeartbeat, WorkerId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;

#[derive(Debug)]
struct MemoryState {
    /// Tasks by id; id order is enqueue order
    tasks: BTreeMap<TaskId, Task>,
    /// Next id to hand out
    next_id: TaskId,
    /// Latest heartbeat per worker
    heartbeats: HashMap<WorkerId, WorkerHeartbeat>,
    /// Append-only audit log
    events: Vec<TaskEvent>,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            tasks: BTreeMap::new(),
            next_id: 1,
            heartbeats: HashMap::new(),
            events: Vec::new(),
        }
    }
}

/// In-memory store backend implementation
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
    lock_timeout: Duration,
    default_max_retries: u32,
}

impl InMemoryStore {
    /// Create a new in-memory store with a 5s lock timeout and 3 retries per task
    pub fn new() -> Self {
        Self::with_config(Duration::from_secs(5), 3)
    }

    /// Create a new in-memory store with custom limits
    pub fn with_config(lock_timeout: Duration, default_max_retries: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            lock_timeout,
            default_max_retries,
        }
    }

    async fn lock(&self) -> ClaimqResult<OwnedMutexGuard<MemoryState>> {
        timeout(self.lock_timeout, Arc::clone(&self.state).lock_owned())
            .await
            .map_err(|_| ClaimqError::StoreBusy {
                waited_ms: self.lock_timeout.as_millis() as u64,
            })
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive transaction over the in-memory state
struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    staged: BTreeMap<TaskId, Task>,
}

impl MemoryTransaction {
    fn current(&self, task_id: TaskId) -> Option<&Task> {
        self.staged
            .get(&task_id)
            .or_else(|| self.guard.tasks.get(&task_id))
    }
}

#[async_trait]
impl ClaimTransaction for MemoryTransaction {
    async fn candidates(
        &mut self,
        _strategy: &ClaimStrategy,
        _order: PriorityOrder,
        now: DateTime<Utc>,
    ) -> ClaimqResult<Vec<Task>> {
        Ok(self
            .guard
            .tasks
            .keys()
            .filter_map(|id| self.current(*id))
            .filter(|task| task.is_claimable_at(now))
            .cloned()
            .collect())
    }

    async fn mark_claimed(
        &mut self,
        task_id: TaskId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> ClaimqResult<Task> {
        let mut task = self
            .current(task_id)
            .cloned()
            .ok_or(ClaimqError::TaskNotFound { task_id })?;

        ensure_transition(&task, TaskStatus::Claimed)?;
        task.status = TaskStatus::Claimed;
        task.claimed_by = Some(worker_id.to_string());
        task.claimed_at = Some(now);

        self.staged.insert(task_id, task.clone());
        Ok(task)
    }

    async fn commit(self: Box<Self>) -> ClaimqResult<()> {
        let MemoryTransaction { mut guard, staged } = *self;
        for (task_id, task) in staged {
            guard.tasks.insert(task_id, task);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> ClaimqResult<()> {
        Ok(())
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn enqueue(&self, task: NewTask) -> ClaimqResult<Task> {
        let mut state = self.lock().await?;

        let task_id = state.next_id;
        state.next_id += 1;

        let task = Task::from_new(task_id, task, self.default_max_retries, Utc::now());
        state.tasks.insert(task_id, task.clone());

        tracing::debug!(task_id, task_type = %task.task_type, "Enqueued task");
        Ok(task)
    }

    async fn begin_exclusive(&self) -> ClaimqResult<Box<dyn ClaimTransaction>> {
        let guard = self.lock().await?;
        Ok(Box::new(MemoryTransaction {
            guard,
            staged: BTreeMap::new(),
        }))
    }

    async fn mark_running(&self, task_id: TaskId, worker_id: &str) -> ClaimqResult<Task> {
        let mut state = self.lock().await?;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(ClaimqError::TaskNotFound { task_id })?;

        if !task.is_claimed_by(worker_id) {
            return Err(ClaimqError::InvalidTransition {
                task_id,
                from: task.status,
                to: TaskStatus::Running,
            });
        }

        ensure_transition(task, TaskStatus::Running)?;
        task.status = TaskStatus::Running;
        Ok(task.clone())
    }

    async fn report(
        &self,
        task_id: TaskId,
        worker_id: &str,
        outcome: &TaskOutcome,
        retry_delay: Duration,
    ) -> ClaimqResult<ReportDisposition> {
        let mut guard = self.lock().await?;
        let state = &mut *guard;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(ClaimqError::TaskNotFound { task_id })?;

        let (disposition, events) = apply_outcome(task, worker_id, outcome, retry_delay, Utc::now())?;
        state.events.extend(events);

        Ok(disposition)
    }

    async fn cancel(&self, task_id: TaskId) -> ClaimqResult<Task> {
        let mut guard = self.lock().await?;
        let state = &mut *guard;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(ClaimqError::TaskNotFound { task_id })?;

        ensure_transition(task, TaskStatus::Cancelled)?;
        let now = Utc::now();
        let previous_holder = task.claimed_by.take();
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(now);

        state.events.push(event(
            task_id,
            previous_holder.as_deref(),
            TaskEventKind::Cancelled,
            now,
            None,
        ));

        tracing::info!(task_id, "Cancelled task");
        Ok(task.clone())
    }

    async fn get_task(&self, task_id: TaskId) -> ClaimqResult<Option<Task>> {
        let state = self.lock().await?;
        Ok(state.tasks.get(&task_id).cloned())
    }

    async fn tasks_by_status(
        &self,
        status: TaskStatus,
        limit: Option<usize>,
    ) -> ClaimqResult<Vec<Task>> {
        let state = self.lock().await?;
        let mut result: Vec<Task> = state
            .tasks
            .values()
            .filter(|task| task.status == status)
            .cloned()
            .collect();

        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        if let Some(limit) = limit {
            result.truncate(limit);
        }

        Ok(result)
    }

    async fn events(&self, task_id: TaskId) -> ClaimqResult<Vec<TaskEvent>> {
        let state = self.lock().await?;
        Ok(state
            .events
            .iter()
            .filter(|event| event.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> ClaimqResult<()> {
        let mut state = self.lock().await?;
        state
            .heartbeats
            .insert(heartbeat.worker_id.clone(), heartbeat.clone());
        Ok(())
    }

    async fn heartbeats(&self) -> ClaimqResult<Vec<WorkerHeartbeat>> {
        let state = self.lock().await?;
        let mut heartbeats: Vec<WorkerHeartbeat> = state.heartbeats.values().cloned().collect();
        heartbeats.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(heartbeats)
    }

    async fn reclaim_orphaned(&self, stale_before: DateTime<Utc>) -> ClaimqResult<Vec<TaskId>> {
        let mut guard = self.lock().await?;
        let MemoryState {
            tasks,
            heartbeats,
            events,
            ..
        } = &mut *guard;
        let now = Utc::now();
        let mut reclaimed = Vec::new();

        for task in tasks.values_mut().filter(|task| task.status.is_claimed()) {
            let Some(claimant) = task.claimed_by.clone() else {
                continue;
            };

            let last_seen = heartbeats
                .get(&claimant)
                .map(|heartbeat| heartbeat.last_heartbeat)
                .or(task.claimed_at);

            if last_seen.is_some_and(|seen| seen >= stale_before) {
                continue;
            }

            let message = format!("claim reclaimed: worker {} stopped sending heartbeats", claimant);
            let disposition = fail_or_requeue(task, &message, Duration::ZERO, now)?;
            events.push(event(
                task.id,
                Some(&claimant),
                TaskEventKind::Reclaimed,
                now,
                Some(message),
            ));

            tracing::warn!(
                task_id = task.id,
                worker_id = %claimant,
                ?disposition,
                "Reclaimed orphaned task"
            );
            reclaimed.push(task.id);
        }

        Ok(reclaimed)
    }

    async fn stats(&self) -> ClaimqResult<QueueStats> {
        let state = self.lock().await?;
        let mut stats = QueueStats::default();
        for task in state.tasks.values() {
            stats.record(task.status);
        }
        Ok(stats)
    }

    async fn health_check(&self) -> ClaimqResult<()> {
        let state = self.lock().await?;

        tracing::debug!(
            "Store health check: {} tasks, {} heartbeats, {} events",
            state.tasks.len(),
            state.heartbeats.len(),
            state.events.len()
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn claim_next(store: &InMemoryStore, worker_id: &str) -> Option<Task> {
        let mut tx = store.begin_exclusive().await.unwrap();
        let candidates = tx
            .candidates(&ClaimStrategy::Fifo, PriorityOrder::HigherFirst, Utc::now())
            .await
            .unwrap();
        let Some(first) = candidates.first() else {
            tx.rollback().await.unwrap();
            return None;
        };
        let task = tx.mark_claimed(first.id, worker_id, Utc::now()).await.unwrap();
        tx.commit().await.unwrap();
        Some(task)
    }

    #[tokio::test]
    async fn test_enqueue_assigns_monotonic_ids() {
        let store = InMemoryStore::new();
        let first = store.enqueue(NewTask::new("test_task", json!({}))).await.unwrap();
        let second = store.enqueue(NewTask::new("test_task", json!({}))).await.unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(first.status, TaskStatus::Queued);
        assert_eq!(first.max_retries, 3);
    }

    #[tokio::test]
    async fn test_commit_persists_claim() {
        let store = InMemoryStore::new();
        store.enqueue(NewTask::new("test_task", json!({}))).await.unwrap();

        let claimed = claim_next(&store, "w1").await.unwrap();
        assert_eq!(claimed.status, TaskStatus::Claimed);

        let stored = store.get_task(claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.claimed_by.as_deref(), Some("w1"));
        assert!(stored.claimed_at.is_some());

        assert!(claim_next(&store, "w2").await.is_none());
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_claim() {
        let store = InMemoryStore::new();
        let task = store.enqueue(NewTask::new("test_task", json!({}))).await.unwrap();

        let mut tx = store.begin_exclusive().await.unwrap();
        tx.mark_claimed(task.id, "w1", Utc::now()).await.unwrap();
        let again = tx
            .candidates(&ClaimStrategy::Fifo, PriorityOrder::HigherFirst, Utc::now())
            .await
            .unwrap();
        assert!(again.is_empty(), "staged claim must be visible inside the transaction");
        tx.rollback().await.unwrap();

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
        assert!(stored.claimed_by.is_none());
    }

    #[tokio::test]
    async fn test_lock_timeout_reports_busy() {
        let store = InMemoryStore::with_config(Duration::from_millis(20), 3);
        let contender = store.clone();

        let held = store.begin_exclusive().await.unwrap();
        let result = contender.begin_exclusive().await;
        assert!(matches!(result, Err(ClaimqError::StoreBusy { waited_ms: 20 })));

        drop(held);
        assert!(contender.begin_exclusive().await.is_ok());
    }

    #[tokio::test]
    async fn test_delayed_task_not_claimable_yet() {
        let store = InMemoryStore::new();
        let later = Utc::now() + chrono::Duration::minutes(5);
        store
            .enqueue(NewTask::new("test_task", json!({})).with_run_after(later))
            .await
            .unwrap();

        assert!(claim_next(&store, "w1").await.is_none());
    }

    #[tokio::test]
    async fn test_mark_running_requires_holder() {
        let store = InMemoryStore::new();
        store.enqueue(NewTask::new("test_task", json!({}))).await.unwrap();
        let task = claim_next(&store, "w1").await.unwrap();

        assert!(matches!(
            store.mark_running(task.id, "w2").await,
            Err(ClaimqError::InvalidTransition { .. })
        ));

        let running = store.mark_running(task.id, "w1").await.unwrap();
        assert_eq!(running.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_fail_and_retry() {
        let store = InMemoryStore::with_config(Duration::from_secs(1), 1);
        store.enqueue(NewTask::new("test_task", json!({}))).await.unwrap();

        let task = claim_next(&store, "w1").await.unwrap();
        let failure = TaskOutcome::Failed("test error".into());
        let disposition = store.report(task.id, "w1", &failure, Duration::ZERO).await.unwrap();
        assert_eq!(disposition, ReportDisposition::Requeued { retry_count: 1 });

        let retried = claim_next(&store, "w2").await.unwrap();
        assert_eq!(retried.id, task.id);
        assert_eq!(retried.retry_count, 1);

        let disposition = store.report(task.id, "w2", &failure, Duration::ZERO).await.unwrap();
        assert_eq!(disposition, ReportDisposition::Failed);

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.retry_count, 1);
        assert!(claim_next(&store, "w3").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_terminal_report_only_grows_event_log() {
        let store = InMemoryStore::new();
        store.enqueue(NewTask::new("test_task", json!({}))).await.unwrap();
        let task = claim_next(&store, "w1").await.unwrap();

        let outcome = TaskOutcome::Completed(Some(json!({"ok": true})));
        store.report(task.id, "w1", &outcome, Duration::ZERO).await.unwrap();
        let after_first = store.get_task(task.id).await.unwrap().unwrap();
        let events_first = store.events(task.id).await.unwrap().len();

        let disposition = store.report(task.id, "w1", &outcome, Duration::ZERO).await.unwrap();
        assert_eq!(
            disposition,
            ReportDisposition::Unchanged {
                status: TaskStatus::Completed
            }
        );

        let after_second = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(after_first, after_second);
        assert_eq!(store.events(task.id).await.unwrap().len(), events_first + 1);
    }

    #[tokio::test]
    async fn test_cancel_rules() {
        let store = InMemoryStore::new();
        let queued = store.enqueue(NewTask::new("test_task", json!({}))).await.unwrap();
        let cancelled = store.cancel(queued.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        store.enqueue(NewTask::new("test_task", json!({}))).await.unwrap();
        let claimed = claim_next(&store, "w1").await.unwrap();
        store.mark_running(claimed.id, "w1").await.unwrap();
        assert!(matches!(
            store.cancel(claimed.id).await,
            Err(ClaimqError::InvalidTransition { .. })
        ));

        assert!(matches!(
            store.cancel(999).await,
            Err(ClaimqError::TaskNotFound { task_id: 999 })
        ));
    }

    #[tokio::test]
    async fn test_reclaim_requeues_silent_claims_only() {
        let store = InMemoryStore::new();
        store.enqueue(NewTask::new("test_task", json!({}))).await.unwrap();
        store.enqueue(NewTask::new("test_task", json!({}))).await.unwrap();

        let orphan = claim_next(&store, "dead").await.unwrap();
        let healthy = claim_next(&store, "alive").await.unwrap();

        let now = Utc::now();
        store
            .upsert_heartbeat(&WorkerHeartbeat {
                worker_id: "dead".into(),
                last_heartbeat: now - chrono::Duration::minutes(10),
                tasks_processed: 0,
                tasks_failed: 0,
            })
            .await
            .unwrap();
        store
            .upsert_heartbeat(&WorkerHeartbeat {
                worker_id: "alive".into(),
                last_heartbeat: now,
                tasks_processed: 0,
                tasks_failed: 0,
            })
            .await
            .unwrap();

        let reclaimed = store
            .reclaim_orphaned(now - chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(reclaimed, vec![orphan.id]);

        let orphan = store.get_task(orphan.id).await.unwrap().unwrap();
        assert_eq!(orphan.status, TaskStatus::Queued);
        assert_eq!(orphan.retry_count, 1);
        assert!(orphan.claimed_by.is_none());

        let healthy = store.get_task(healthy.id).await.unwrap().unwrap();
        assert_eq!(healthy.status, TaskStatus::Claimed);

        let kinds: Vec<TaskEventKind> = store
            .events(orphan.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![TaskEventKind::Reclaimed]);
    }

    #[tokio::test]
    async fn test_heartbeat_upsert_replaces() {
        let store = InMemoryStore::new();
        let mut heartbeat = WorkerHeartbeat {
            worker_id: "w1".into(),
            last_heartbeat: Utc::now(),
            tasks_processed: 1,
            tasks_failed: 0,
        };
        store.upsert_heartbeat(&heartbeat).await.unwrap();
        heartbeat.tasks_processed = 5;
        store.upsert_heartbeat(&heartbeat).await.unwrap();

        let heartbeats = store.heartbeats().await.unwrap();
        assert_eq!(heartbeats.len(), 1);
        assert_eq!(heartbeats[0].tasks_processed, 5);
    }

    #[tokio::test]
    async fn test_stats_and_status_queries() {
        let store = InMemoryStore::new();
        for i in 0..3 {
            store
                .enqueue(NewTask::new("test_task", json!({ "n": i })))
                .await
                .unwrap();
        }
        claim_next(&store, "w1").await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.total(), 3);

        let queued = store.tasks_by_status(TaskStatus::Queued, Some(1)).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, 2);

        assert!(store.health_check().await.is_ok());
    }
}
