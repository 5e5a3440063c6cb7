//! Worker loop implementation for claimq.
//!
//! A worker repeatedly claims one task, hands it to the processor, and
//! reports the outcome. Idle polls are spaced by the backoff controller and
//! heartbeats are emitted opportunistically between iterations.

use crate::config::ClaimqConfig;
use crate::core::backoff::BackoffController;
use crate::core::claim::ClaimEngine;
use crate::core::heartbeat::HeartbeatReporter;
use crate::core::processor::SharedProcessor;
use crate::error::{ClaimqError, ClaimqResult};
use crate::metrics;
use crate::store::SharedStore;
use crate::task::{ReportDisposition, Task, TaskId, TaskOutcome};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::sleep;

/// Attempts made to persist an outcome before giving up on a busy store
const REPORT_ATTEMPTS: u32 = 3;

/// What the worker is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Created but not yet looping
    Starting,
    /// Waiting for work
    Idle,
    /// Processing a task
    Processing,
    /// Loop has exited
    Stopped,
}

/// Why [`Worker::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// A stop signal was received
    Stopped,
    /// `max_iterations` was reached
    IterationLimit,
}

/// Statistics about one worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStats {
    /// Worker identifier
    pub worker_id: String,
    /// Current state
    pub state: WorkerState,
    /// Tasks whose processing succeeded
    pub tasks_processed: u64,
    /// Tasks whose processing failed
    pub tasks_failed: u64,
    /// Claim attempts that found nothing
    pub empty_polls: u64,
    /// Loop iterations run
    pub iterations: u64,
    /// Duration of the most recent claim attempt
    pub last_claim_latency: Option<Duration>,
    /// Task being processed, if any
    pub current_task: Option<TaskId>,
    /// Heartbeat writes that failed
    pub heartbeat_failures: u64,
    /// When the worker was created
    pub started_at: DateTime<Utc>,
}

impl WorkerStats {
    fn new(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            state: WorkerState::Starting,
            tasks_processed: 0,
            tasks_failed: 0,
            empty_polls: 0,
            iterations: 0,
            last_claim_latency: None,
            current_task: None,
            heartbeat_failures: 0,
            started_at: Utc::now(),
        }
    }
}

/// One claim → process → report loop
pub struct Worker {
    worker_id: String,
    store: SharedStore,
    processor: SharedProcessor,
    claim: ClaimEngine,
    backoff: BackoffController,
    heartbeat: HeartbeatReporter,
    mark_running: bool,
    retry_delay: Duration,
    reclaim_after: Option<Duration>,
    pending_report: Option<(Task, TaskOutcome, Duration)>,
    stats: WorkerStats,
    stats_tx: watch::Sender<WorkerStats>,
    shutdown_rx: Option<watch::Receiver<bool>>,
}

impl Worker {
    /// Create a worker over a shared store and processor
    pub fn new(
        worker_id: impl Into<String>,
        store: SharedStore,
        processor: SharedProcessor,
        config: &ClaimqConfig,
    ) -> Self {
        let worker_id = worker_id.into();
        let stats = WorkerStats::new(&worker_id);
        let (stats_tx, _) = watch::channel(stats.clone());

        Self {
            claim: ClaimEngine::from_config(Arc::clone(&store), &config.claim),
            backoff: BackoffController::from_config(&config.workers),
            heartbeat: HeartbeatReporter::new(worker_id.clone(), config.workers.heartbeat_interval()),
            mark_running: config.workers.mark_running,
            retry_delay: config.retry.retry_delay(),
            reclaim_after: config.workers.reclaim_stale_after(),
            pending_report: None,
            worker_id,
            store,
            processor,
            stats,
            stats_tx,
            shutdown_rx: None,
        }
    }

    /// Stop the loop when `true` is sent on this channel.
    ///
    /// Dropping the sender also stops the loop.
    pub fn with_shutdown(mut self, shutdown_rx: watch::Receiver<bool>) -> Self {
        self.shutdown_rx = Some(shutdown_rx);
        self
    }

    /// Worker identifier
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Snapshot of the worker's counters
    pub fn stats(&self) -> WorkerStats {
        self.stats.clone()
    }

    /// Receive every stats update the worker publishes
    pub fn subscribe(&self) -> watch::Receiver<WorkerStats> {
        self.stats_tx.subscribe()
    }

    /// Run one iteration.
    ///
    /// Returns `Ok(true)` when a task was claimed and `Ok(false)` when there was
    /// nothing to do. An outcome that could not be persisted earlier is
    /// reported before anything new is claimed. Errors mean the store is
    /// unusable.
    pub async fn run_once(&mut self) -> ClaimqResult<bool> {
        self.stats.iterations += 1;

        let emitted = self
            .heartbeat
            .maybe_emit(
                self.store.as_ref(),
                self.stats.tasks_processed,
                self.stats.tasks_failed,
            )
            .await;
        self.stats.heartbeat_failures = self.heartbeat.failures();
        if emitted {
            self.reclaim_orphans().await;
        }

        if !self.flush_pending_report().await? {
            self.stats.state = WorkerState::Idle;
            self.publish();
            return Ok(false);
        }

        let claimed = self.claim.claim(&self.worker_id).await;
        self.stats.last_claim_latency = self.claim.last_claim_latency();

        let Some(task) = claimed? else {
            self.stats.empty_polls += 1;
            self.stats.state = WorkerState::Idle;
            metrics::record_empty_poll(&self.worker_id);
            self.publish();
            return Ok(false);
        };

        self.stats.state = WorkerState::Processing;
        self.stats.current_task = Some(task.id);
        self.publish();

        let result = self.handle(task).await;

        self.stats.current_task = None;
        self.stats.state = WorkerState::Idle;
        self.publish();

        result.map(|()| true)
    }

    /// Loop until `max_iterations` or a stop signal.
    ///
    /// A stop signal interrupts idle waits but never the task in flight.
    pub async fn run(&mut self, max_iterations: Option<u64>) -> ClaimqResult<WorkerExit> {
        tracing::info!(
            worker_id = %self.worker_id,
            strategy = self.claim.strategy().name(),
            "Worker starting"
        );

        let limit_reached = |iterations: u64| max_iterations.is_some_and(|max| iterations >= max);
        let mut iterations = 0u64;
        let exit = loop {
            if self.stop_requested() {
                break WorkerExit::Stopped;
            }
            if limit_reached(iterations) {
                break WorkerExit::IterationLimit;
            }

            let processed = match self.run_once().await {
                Ok(processed) => processed,
                Err(e) if e.is_fatal() => {
                    tracing::error!(worker_id = %self.worker_id, "Worker stopping on fatal error: {}", e);
                    self.stats.state = WorkerState::Stopped;
                    self.publish();
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(worker_id = %self.worker_id, "Iteration failed, continuing: {}", e);
                    false
                }
            };

            iterations += 1;
            if processed {
                self.backoff.on_claim_success();
            } else if !limit_reached(iterations) {
                let wait = self.backoff.on_empty_queue();
                tracing::debug!(
                    worker_id = %self.worker_id,
                    "No tasks available, backing off {:?}",
                    wait
                );
                if self.wait(wait).await {
                    break WorkerExit::Stopped;
                }
            }
        };

        if let Err(e) = self.flush_pending_report().await {
            tracing::error!(worker_id = %self.worker_id, "Final report failed: {}", e);
        }
        if let Some((task, ..)) = &self.pending_report {
            tracing::error!(
                worker_id = %self.worker_id,
                task_id = task.id,
                "Exiting with an unreported outcome, task stays claimed"
            );
        }

        self.stats.state = WorkerState::Stopped;
        self.publish();

        tracing::info!(
            worker_id = %self.worker_id,
            tasks_processed = self.stats.tasks_processed,
            tasks_failed = self.stats.tasks_failed,
            "Worker finished: {:?}",
            exit
        );

        Ok(exit)
    }

    /// Process a claimed task and report the outcome
    async fn handle(&mut self, task: Task) -> ClaimqResult<()> {
        let task = if self.mark_running {
            match self.store.mark_running(task.id, &self.worker_id).await {
                Ok(running) => running,
                Err(e) if e.is_fatal() => return Err(e),
                Err(ClaimqError::InvalidTransition { .. } | ClaimqError::TaskNotFound { .. }) => {
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        task_id = task.id,
                        "Task no longer held after claim, skipping"
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        task_id = task.id,
                        "Could not mark task running, processing anyway: {}",
                        e
                    );
                    task
                }
            }
        } else {
            task
        };

        tracing::info!(
            worker_id = %self.worker_id,
            task_id = task.id,
            task_type = %task.task_type,
            "Processing task"
        );

        let start_time = Instant::now();
        let outcome = self.execute(&task).await;
        let duration = start_time.elapsed();

        let success = outcome.is_success();
        if success {
            self.stats.tasks_processed += 1;
        } else {
            self.stats.tasks_failed += 1;
        }
        metrics::record_task_outcome(&self.worker_id, success);

        let disposition = match self.report(&task, &outcome).await {
            Ok(disposition) => disposition,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(
                    worker_id = %self.worker_id,
                    task_id = task.id,
                    "Outcome not persisted, will retry before the next claim: {}",
                    e
                );
                self.pending_report = Some((task, outcome, duration));
                return Ok(());
            }
        };

        self.log_disposition(&task, &outcome, disposition, duration);
        Ok(())
    }

    fn log_disposition(
        &self,
        task: &Task,
        outcome: &TaskOutcome,
        disposition: ReportDisposition,
        duration: Duration,
    ) {
        match (&outcome, disposition) {
            (_, ReportDisposition::Completed) => {
                tracing::info!(
                    worker_id = %self.worker_id,
                    task_id = task.id,
                    "Completed task in {:?}",
                    duration
                );
            }
            (TaskOutcome::Failed(error), ReportDisposition::Requeued { retry_count }) => {
                tracing::warn!(
                    worker_id = %self.worker_id,
                    task_id = task.id,
                    retry_count,
                    max_retries = task.max_retries,
                    "Task failed, requeued: {}",
                    error
                );
            }
            (TaskOutcome::Failed(error), ReportDisposition::Failed) => {
                tracing::error!(
                    worker_id = %self.worker_id,
                    task_id = task.id,
                    retry_count = task.retry_count,
                    "Task failed permanently: {}",
                    error
                );
            }
            (_, ReportDisposition::Unchanged { status }) => {
                tracing::warn!(
                    worker_id = %self.worker_id,
                    task_id = task.id,
                    %status,
                    "Outcome ignored, task no longer held"
                );
            }
            (_, disposition) => {
                tracing::debug!(worker_id = %self.worker_id, task_id = task.id, ?disposition, "Reported");
            }
        }
    }

    /// Retry a deferred report; `Ok(false)` while the store is still busy
    async fn flush_pending_report(&mut self) -> ClaimqResult<bool> {
        let Some((task, outcome, duration)) = self.pending_report.take() else {
            return Ok(true);
        };

        match self.report(&task, &outcome).await {
            Ok(disposition) => {
                self.log_disposition(&task, &outcome, disposition, duration);
                Ok(true)
            }
            Err(e) if e.is_fatal() => {
                self.pending_report = Some((task, outcome, duration));
                Err(e)
            }
            Err(e) => {
                tracing::warn!(
                    worker_id = %self.worker_id,
                    task_id = task.id,
                    "Deferred report still failing: {}",
                    e
                );
                self.pending_report = Some((task, outcome, duration));
                Ok(false)
            }
        }
    }

    /// Run the processor on its own task so a panic becomes a failure
    async fn execute(&self, task: &Task) -> TaskOutcome {
        let processor = Arc::clone(&self.processor);
        let owned = task.clone();

        let handle = tokio::spawn(async move { processor.process(&owned).await });

        match handle.await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                tracing::error!(
                    worker_id = %self.worker_id,
                    task_id = task.id,
                    "Processor panicked: {}",
                    join_error
                );
                TaskOutcome::Failed(format!("Task panicked: {}", join_error))
            }
        }
    }

    /// Persist the outcome, retrying briefly on contention
    async fn report(&self, task: &Task, outcome: &TaskOutcome) -> ClaimqResult<ReportDisposition> {
        let mut attempt = 1;
        loop {
            match self
                .store
                .report(task.id, &self.worker_id, outcome, self.retry_delay)
                .await
            {
                Ok(disposition) => return Ok(disposition),
                Err(e) if e.is_transient() && attempt < REPORT_ATTEMPTS => {
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        task_id = task.id,
                        attempt,
                        "Report deferred: {}",
                        e
                    );
                    sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Requeue claims whose worker went silent, if the sweep is enabled
    async fn reclaim_orphans(&self) {
        let Some(after) = self.reclaim_after else {
            return;
        };
        let Some(stale_before) = chrono::Duration::from_std(after)
            .ok()
            .and_then(|after| Utc::now().checked_sub_signed(after))
        else {
            return;
        };

        match self.store.reclaim_orphaned(stale_before).await {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                tracing::info!(
                    worker_id = %self.worker_id,
                    count = reclaimed.len(),
                    "Reclaimed orphaned tasks: {:?}",
                    reclaimed
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(worker_id = %self.worker_id, "Reclaim sweep failed: {}", e);
            }
        }
    }

    fn stop_requested(&self) -> bool {
        self.shutdown_rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Sleep for `duration`; returns `true` if a stop arrived meanwhile
    async fn wait(&mut self, duration: Duration) -> bool {
        let Some(shutdown_rx) = self.shutdown_rx.as_mut() else {
            sleep(duration).await;
            return false;
        };

        tokio::select! {
            _ = sleep(duration) => false,
            _ = shutdown_rx.changed() => {
                tracing::debug!(worker_id = %self.worker_id, "Shutdown signal received during wait");
                true
            }
        }
    }

    fn publish(&self) {
        self.stats_tx.send_replace(self.stats.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::processor::FnProcessor;
    use crate::store::testing::UnreachableStore;
    use crate::store::{InMemoryStore, TaskStore};
    use crate::task::{NewTask, TaskEventKind, TaskStatus, WorkerHeartbeat};
    use serde_json::json;

    fn succeed() -> SharedProcessor {
        Arc::new(FnProcessor::new(|task: Task| async move {
            TaskOutcome::Completed(Some(json!({ "echo": task.parameters })))
        }))
    }

    fn fail() -> SharedProcessor {
        Arc::new(FnProcessor::new(|_| async {
            TaskOutcome::Failed("processor error".to_string())
        }))
    }

    #[tokio::test]
    async fn test_run_once_processes_and_reports() {
        let store = Arc::new(InMemoryStore::new());
        let task = store
            .enqueue(NewTask::new("echo", json!({"n": 1})))
            .await
            .unwrap();
        let mut worker = Worker::new("w1", store.clone(), succeed(), &ClaimqConfig::testing());

        assert!(worker.run_once().await.unwrap());
        assert!(!worker.run_once().await.unwrap());

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result_data, Some(json!({"echo": {"n": 1}})));
        assert!(stored.claimed_by.is_none());

        let stats = worker.stats();
        assert_eq!(stats.tasks_processed, 1);
        assert_eq!(stats.tasks_failed, 0);
        assert_eq!(stats.empty_polls, 1);
        assert_eq!(stats.iterations, 2);
        assert!(stats.last_claim_latency.is_some());
        assert_eq!(stats.current_task, None);
    }

    #[tokio::test]
    async fn test_first_iteration_emits_heartbeat() {
        let store = Arc::new(InMemoryStore::new());
        let mut worker = Worker::new("w1", store.clone(), succeed(), &ClaimqConfig::testing());
        worker.run_once().await.unwrap();

        let heartbeats = store.heartbeats().await.unwrap();
        assert_eq!(heartbeats.len(), 1);
        assert_eq!(heartbeats[0].worker_id, "w1");
    }

    #[tokio::test]
    async fn test_processor_sees_running_status() {
        let store = Arc::new(InMemoryStore::new());
        let status_echo: SharedProcessor = Arc::new(FnProcessor::new(|task: Task| async move {
            TaskOutcome::Completed(Some(json!(task.status.as_str())))
        }));

        let mut config = ClaimqConfig::testing();
        let first = store.enqueue(NewTask::new("check", json!({}))).await.unwrap();
        let mut worker = Worker::new("w1", store.clone(), status_echo.clone(), &config);
        worker.run_once().await.unwrap();

        config.workers.mark_running = false;
        let second = store.enqueue(NewTask::new("check", json!({}))).await.unwrap();
        let mut worker = Worker::new("w2", store.clone(), status_echo, &config);
        worker.run_once().await.unwrap();

        let first = store.get_task(first.id).await.unwrap().unwrap();
        let second = store.get_task(second.id).await.unwrap().unwrap();
        assert_eq!(first.result_data, Some(json!("running")));
        assert_eq!(second.result_data, Some(json!("claimed")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound() {
        let store = Arc::new(InMemoryStore::new());
        let task = store
            .enqueue(NewTask::new("flaky", json!({})).with_max_retries(2))
            .await
            .unwrap();
        let mut worker = Worker::new("w1", store.clone(), fail(), &ClaimqConfig::testing());

        let exit = worker.run(Some(10)).await.unwrap();
        assert_eq!(exit, WorkerExit::IterationLimit);

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.error_message.as_deref(), Some("processor error"));
        assert_eq!(worker.stats().tasks_failed, 3);

        let kinds: Vec<TaskEventKind> = store
            .events(task.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds.iter().filter(|k| **k == TaskEventKind::Failed).count(),
            3
        );
        assert_eq!(
            kinds.iter().filter(|k| **k == TaskEventKind::Requeued).count(),
            2
        );
    }

    #[tokio::test]
    async fn test_zero_iteration_limit_runs_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let task = store.enqueue(NewTask::new("echo", json!({}))).await.unwrap();
        let mut worker = Worker::new("w1", store.clone(), succeed(), &ClaimqConfig::testing());

        let exit = worker.run(Some(0)).await.unwrap();
        assert_eq!(exit, WorkerExit::IterationLimit);
        assert_eq!(worker.stats().iterations, 0);

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
        assert!(store.heartbeats().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_store_during_report_defers_outcome() {
        let store = Arc::new(InMemoryStore::with_config(Duration::from_millis(20), 3));
        let task = store.enqueue(NewTask::new("hog", json!({}))).await.unwrap();

        // Holds the exclusive lock for a second after the processor returns.
        let lock_store = Arc::clone(&store);
        let hog: SharedProcessor = Arc::new(FnProcessor::new(move |_| {
            let store = Arc::clone(&lock_store);
            async move {
                let tx = store.begin_exclusive().await.unwrap();
                tokio::spawn(async move {
                    sleep(Duration::from_secs(1)).await;
                    tx.rollback().await.unwrap();
                });
                TaskOutcome::Completed(None)
            }
        }));
        let mut worker = Worker::new("w1", store.clone(), hog, &ClaimqConfig::testing());

        let exit = worker.run(Some(40)).await.unwrap();
        assert_eq!(exit, WorkerExit::IterationLimit);
        assert_eq!(worker.stats().tasks_processed, 1);
        assert!(worker.pending_report.is_none());

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.claimed_by.is_none());
    }

    #[tokio::test]
    async fn test_panicking_processor_counts_as_failure() {
        let store = Arc::new(InMemoryStore::new());
        let task = store
            .enqueue(NewTask::new("boom", json!({})).with_max_retries(0))
            .await
            .unwrap();
        let panics: SharedProcessor = Arc::new(FnProcessor::new(|task: Task| async move {
            assert_ne!(task.task_type, "boom", "processor blew up");
            TaskOutcome::Completed(None)
        }));
        let mut worker = Worker::new("w1", store.clone(), panics, &ClaimqConfig::testing());

        assert!(worker.run_once().await.unwrap());

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.error_message.unwrap().starts_with("Task panicked"));
        assert_eq!(worker.stats().tasks_failed, 1);
    }

    #[tokio::test]
    async fn test_unreachable_store_terminates_run() {
        let mut worker = Worker::new(
            "w1",
            Arc::new(UnreachableStore),
            succeed(),
            &ClaimqConfig::testing(),
        );
        let stats_rx = worker.subscribe();

        let result = worker.run(None).await;
        assert!(matches!(result, Err(ClaimqError::StoreUnavailable { .. })));
        assert_eq!(stats_rx.borrow().state, WorkerState::Stopped);
        assert_eq!(worker.stats().heartbeat_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_interrupts_idle_wait() {
        let store = Arc::new(InMemoryStore::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut worker = Worker::new("w1", store, succeed(), &ClaimqConfig::testing())
            .with_shutdown(shutdown_rx);
        let mut stats_rx = worker.subscribe();

        let handle = tokio::spawn(async move { worker.run(None).await });

        stats_rx
            .wait_for(|stats| stats.empty_polls >= 3)
            .await
            .unwrap();
        shutdown_tx.send(true).unwrap();

        let exit = handle.await.unwrap().unwrap();
        assert_eq!(exit, WorkerExit::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_lets_in_flight_task_finish() {
        let store = Arc::new(InMemoryStore::new());
        let task = store.enqueue(NewTask::new("slow", json!({}))).await.unwrap();

        let slow: SharedProcessor = Arc::new(FnProcessor::new(|_| async {
            sleep(Duration::from_secs(5)).await;
            TaskOutcome::Completed(None)
        }));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut worker = Worker::new("w1", store.clone(), slow, &ClaimqConfig::testing())
            .with_shutdown(shutdown_rx);
        let mut stats_rx = worker.subscribe();

        let handle = tokio::spawn(async move {
            let exit = worker.run(None).await;
            (exit, worker.stats())
        });

        stats_rx
            .wait_for(|stats| stats.current_task == Some(task.id))
            .await
            .unwrap();
        shutdown_tx.send(true).unwrap();

        let (exit, stats) = handle.await.unwrap();
        assert_eq!(exit.unwrap(), WorkerExit::Stopped);
        assert_eq!(stats.tasks_processed, 1);

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_reclaim_sweep_recovers_orphaned_task() {
        let store = Arc::new(InMemoryStore::new());
        let task = store.enqueue(NewTask::new("echo", json!({}))).await.unwrap();

        let mut tx = store.begin_exclusive().await.unwrap();
        tx.mark_claimed(task.id, "ghost", Utc::now()).await.unwrap();
        tx.commit().await.unwrap();
        store
            .upsert_heartbeat(&WorkerHeartbeat {
                worker_id: "ghost".to_string(),
                last_heartbeat: Utc::now() - chrono::Duration::hours(1),
                tasks_processed: 0,
                tasks_failed: 0,
            })
            .await
            .unwrap();

        let mut config = ClaimqConfig::testing();
        config.workers.reclaim_stale_after_secs = Some(60);
        let mut worker = Worker::new("w1", store.clone(), succeed(), &config);

        assert!(worker.run_once().await.unwrap());

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.retry_count, 1);

        let kinds: Vec<TaskEventKind> = store
            .events(task.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![TaskEventKind::Reclaimed, TaskEventKind::Completed]);
    }

    #[tokio::test]
    async fn test_report_after_cancel_is_ignored() {
        let store = Arc::new(InMemoryStore::new());
        let task = store.enqueue(NewTask::new("echo", json!({}))).await.unwrap();
        let mut worker = Worker::new("w1", store.clone(), succeed(), &ClaimqConfig::testing());

        let mut tx = store.begin_exclusive().await.unwrap();
        let claimed = tx.mark_claimed(task.id, "w1", Utc::now()).await.unwrap();
        tx.commit().await.unwrap();
        store.cancel(task.id).await.unwrap();

        let disposition = worker
            .report(&claimed, &TaskOutcome::Completed(None))
            .await
            .unwrap();
        assert_eq!(
            disposition,
            ReportDisposition::Unchanged {
                status: TaskStatus::Cancelled
            }
        );
        assert!(!worker.run_once().await.unwrap());
    }
}
