//! The claimq scheduler and its worker machinery.
//!
//! [`Scheduler`] is the primary interface: it owns the configuration, the
//! shared store and a [`ProcessorRegistry`], enqueues tasks, and starts or
//! stops an in-process [`WorkerPool`]. The pieces it is built from are public
//! for applications that run their own loops.

use crate::config::ClaimqConfig;
use crate::error::{ClaimqError, ClaimqResult};
use crate::fairness::FairnessReport;
use crate::store::{QueueStats, SharedStore, StoreFactory};
use crate::task::{NewTask, Task, TaskId, TaskStatus};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod backoff;
pub mod claim;
pub mod heartbeat;
pub mod pool;
pub mod processor;
pub mod worker;

pub use backoff::BackoffController;
pub use claim::ClaimEngine;
pub use heartbeat::HeartbeatReporter;
pub use pool::{PoolStats, ShutdownReport, WorkerPool};
pub use processor::{
    FnProcessor, ProcessorRegistry, SharedProcessor, TaskProcessor, TypedProcessor,
};
pub use worker::{Worker, WorkerExit, WorkerState, WorkerStats};

/// Enqueue tasks and run workers against one store.
///
/// # Examples
///
/// ```rust
/// use claimq::prelude::*;
///
/// # async fn example() -> ClaimqResult<()> {
/// let scheduler = Scheduler::new(ClaimqConfig::testing()).await?;
/// scheduler
///     .register("ping", FnProcessor::new(|_task| async { TaskOutcome::Completed(None) }))
///     .await;
///
/// let task = scheduler.enqueue(NewTask::new("ping", serde_json::json!({}))).await?;
/// scheduler.start().await?;
/// # scheduler.stop().await?;
/// # let _ = task;
/// # Ok(())
/// # }
/// ```
pub struct Scheduler {
    config: ClaimqConfig,
    store: SharedStore,
    registry: Arc<ProcessorRegistry>,
    pool: RwLock<Option<WorkerPool>>,
}

impl Scheduler {
    /// Create a scheduler over the store described by the configuration.
    pub async fn new(config: ClaimqConfig) -> ClaimqResult<Self> {
        if let Err(errors) = config.validate() {
            return Err(ClaimqError::config(errors.join("; ")));
        }

        let store = StoreFactory::from_config(&config.store, &config.retry).await?;
        Ok(Self::with_store(config, store))
    }

    /// Create a scheduler over an existing store.
    pub fn with_store(config: ClaimqConfig, store: SharedStore) -> Self {
        Self {
            config,
            store,
            registry: Arc::new(ProcessorRegistry::new()),
            pool: RwLock::new(None),
        }
    }

    /// Register the processor for a task type.
    pub async fn register<P>(&self, task_type: impl Into<String>, processor: P)
    where
        P: TaskProcessor + 'static,
    {
        self.registry.register(task_type, processor).await;
    }

    /// Enqueue a task.
    ///
    /// Tasks without an explicit `max_retries` get the per-type default from
    /// the retry configuration.
    pub async fn enqueue(&self, mut task: NewTask) -> ClaimqResult<Task> {
        if task.max_retries.is_none() {
            task.max_retries = Some(self.config.retry.max_retries_for(&task.task_type));
        }

        let task = self.store.enqueue(task).await?;
        tracing::debug!(
            task_id = task.id,
            task_type = %task.task_type,
            priority = task.priority,
            "Task enqueued"
        );
        Ok(task)
    }

    /// Serialize `payload` and enqueue it as a task of `task_type`.
    pub async fn submit<T: Serialize>(
        &self,
        task_type: impl Into<String>,
        payload: &T,
        priority: i64,
    ) -> ClaimqResult<Task> {
        let parameters = serde_json::to_value(payload)?;
        self.enqueue(NewTask::new(task_type, parameters).with_priority(priority))
            .await
    }

    /// Cancel a queued or claimed task.
    pub async fn cancel(&self, task_id: TaskId) -> ClaimqResult<Task> {
        self.store.cancel(task_id).await
    }

    /// Get a task by ID.
    pub async fn task(&self, task_id: TaskId) -> ClaimqResult<Option<Task>> {
        self.store.get_task(task_id).await
    }

    /// Get per-status counts.
    pub async fn queue_stats(&self) -> ClaimqResult<QueueStats> {
        self.store.stats().await
    }

    /// Fairness metrics over finished tasks.
    ///
    /// `limit` bounds how many completed and how many failed tasks are read.
    pub async fn fairness_report(&self, limit: Option<usize>) -> ClaimqResult<FairnessReport> {
        let (mut finished, failed) = futures::try_join!(
            self.store.tasks_by_status(TaskStatus::Completed, limit),
            self.store.tasks_by_status(TaskStatus::Failed, limit),
        )?;
        finished.extend(failed);

        Ok(FairnessReport::from_tasks(&finished))
    }

    /// Start the worker pool; returns once the workers are spawned.
    pub async fn start(&self) -> ClaimqResult<()> {
        let mut pool_guard = self.pool.write().await;
        if pool_guard.is_some() {
            return Err(ClaimqError::AlreadyRunning);
        }

        let processor: SharedProcessor = self.registry.clone();
        let mut pool = WorkerPool::new(self.config.clone(), Arc::clone(&self.store), processor);
        pool.start()?;
        *pool_guard = Some(pool);

        tracing::info!(
            num_workers = self.config.workers.num_workers,
            "Scheduler started"
        );
        Ok(())
    }

    /// Stop the worker pool and wait for in-flight tasks.
    pub async fn stop(&self) -> ClaimqResult<ShutdownReport> {
        let pool = self.pool.write().await.take();
        let Some(mut pool) = pool else {
            return Err(ClaimqError::NotRunning);
        };

        let report = pool.shutdown().await?;
        tracing::info!("Scheduler stopped: {}", report);
        Ok(report)
    }

    /// Block until Ctrl+C, then stop the workers.
    pub async fn wait_for_shutdown(&self) -> ClaimqResult<ShutdownReport> {
        if !self.is_running().await {
            return Err(ClaimqError::NotRunning);
        }

        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
        } else {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }

        self.stop().await
    }

    /// Aggregated worker counters, if running.
    pub async fn worker_stats(&self) -> Option<PoolStats> {
        self.pool.read().await.as_ref().map(WorkerPool::stats)
    }

    /// Whether the worker pool is running.
    pub async fn is_running(&self) -> bool {
        self.pool.read().await.is_some()
    }

    /// Check the store and, if running, the workers.
    pub async fn health_check(&self) -> ClaimqResult<()> {
        self.store.health_check().await?;

        if let Some(pool) = self.pool.read().await.as_ref() {
            pool.health_check()?;
        }

        Ok(())
    }

    /// The configuration used by this scheduler.
    pub fn config(&self) -> &ClaimqConfig {
        &self.config
    }

    /// The shared store.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// The processor registry workers dispatch through.
    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }
}
