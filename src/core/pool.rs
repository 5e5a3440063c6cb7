//! In-process worker pool.
//!
//! The pool spawns `num_workers` [`Worker`] loops as tokio tasks over one
//! shared store and processor. Workers do not talk to each other; the pool
//! only broadcasts the stop signal and collects their stats.

use crate::config::ClaimqConfig;
use crate::core::processor::SharedProcessor;
use crate::core::worker::{Worker, WorkerExit, WorkerState, WorkerStats};
use crate::error::{ClaimqError, ClaimqResult};
use crate::store::SharedStore;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Aggregated counters over every worker in the pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Workers spawned
    pub total_workers: usize,
    /// Workers whose loop has not exited
    pub active_workers: usize,
    /// Workers currently processing a task
    pub busy_workers: usize,
    /// Successful tasks across workers
    pub tasks_processed: u64,
    /// Failed tasks across workers
    pub tasks_failed: u64,
    /// Empty polls across workers
    pub empty_polls: u64,
}

/// How the workers ended when the pool was shut down
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that exited on the stop signal
    pub clean: usize,
    /// Workers that exited with an error or panicked
    pub errors: usize,
    /// Workers still busy when the timeout elapsed
    pub timeouts: usize,
}

impl fmt::Display for ShutdownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} clean, {} errors, {} timeouts",
            self.clean, self.errors, self.timeouts
        )
    }
}

struct WorkerHandle {
    worker_id: String,
    stats_rx: watch::Receiver<WorkerStats>,
    join: JoinHandle<ClaimqResult<WorkerExit>>,
}

/// A set of worker loops sharing one store
pub struct WorkerPool {
    config: ClaimqConfig,
    store: SharedStore,
    processor: SharedProcessor,
    shutdown_tx: Option<watch::Sender<bool>>,
    workers: Vec<WorkerHandle>,
    start_time: Option<Instant>,
}

impl WorkerPool {
    /// Create a pool; no worker runs until [`start`](WorkerPool::start)
    pub fn new(config: ClaimqConfig, store: SharedStore, processor: SharedProcessor) -> Self {
        Self {
            config,
            store,
            processor,
            shutdown_tx: None,
            workers: Vec::new(),
            start_time: None,
        }
    }

    /// Spawn the configured number of workers
    pub fn start(&mut self) -> ClaimqResult<()> {
        if self.is_running() {
            return Err(ClaimqError::AlreadyRunning);
        }

        let num_workers = self.config.workers.num_workers;
        tracing::info!(
            num_workers,
            strategy = %self.config.claim.strategy,
            "Starting worker pool"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let prefix = &self.config.workers.worker_id_prefix;
        let run_id = uuid::Uuid::new_v4().simple().to_string();

        for index in 0..num_workers {
            let worker_id = format!("{}-{}-{}", prefix, &run_id[..8], index);
            let mut worker = Worker::new(
                worker_id.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.processor),
                &self.config,
            )
            .with_shutdown(shutdown_rx.clone());
            let stats_rx = worker.subscribe();

            let join = tokio::spawn(async move { worker.run(None).await });

            tracing::debug!(worker_id = %worker_id, "Spawned worker");
            self.workers.push(WorkerHandle {
                worker_id,
                stats_rx,
                join,
            });
        }

        self.shutdown_tx = Some(shutdown_tx);
        self.start_time = Some(Instant::now());

        tracing::info!("Worker pool started");
        Ok(())
    }

    /// Signal every worker to stop and wait for in-flight tasks.
    ///
    /// Each worker gets `shutdown_timeout` to finish. A worker still busy after
    /// that is detached rather than cancelled: it completes and reports its
    /// current task, then exits on the stop signal.
    pub async fn shutdown(&mut self) -> ClaimqResult<ShutdownReport> {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return Err(ClaimqError::NotRunning);
        };

        let timeout_duration = self.config.workers.shutdown_timeout();
        tracing::info!(
            "Shutting down {} workers with timeout {:?}",
            self.workers.len(),
            timeout_duration
        );

        // Receivers already gone means every worker has exited.
        let _ = shutdown_tx.send(true);

        let mut report = ShutdownReport::default();
        for handle in self.workers.drain(..) {
            match timeout(timeout_duration, handle.join).await {
                Ok(Ok(Ok(_))) => {
                    report.clean += 1;
                    tracing::debug!(worker_id = %handle.worker_id, "Worker shut down cleanly");
                }
                Ok(Ok(Err(e))) => {
                    report.errors += 1;
                    tracing::error!(worker_id = %handle.worker_id, "Worker exited with error: {}", e);
                }
                Ok(Err(e)) => {
                    report.errors += 1;
                    tracing::error!(worker_id = %handle.worker_id, "Worker task failed: {}", e);
                }
                Err(_) => {
                    report.timeouts += 1;
                    tracing::warn!(
                        worker_id = %handle.worker_id,
                        task_id = ?handle.stats_rx.borrow().current_task,
                        "Worker still busy after timeout, detached to finish its task"
                    );
                }
            }
        }

        self.start_time = None;
        tracing::info!("Worker pool shutdown complete: {}", report);
        Ok(report)
    }

    /// Run until Ctrl+C, then shut down gracefully
    pub async fn wait_for_shutdown(&mut self) -> ClaimqResult<ShutdownReport> {
        if !self.is_running() {
            return Err(ClaimqError::NotRunning);
        }

        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
        } else {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }

        self.shutdown().await
    }

    /// Latest stats of each worker
    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.workers
            .iter()
            .map(|handle| handle.stats_rx.borrow().clone())
            .collect()
    }

    /// Counters summed over all workers
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            total_workers: self.workers.len(),
            ..Default::default()
        };

        for (handle, worker) in self.workers.iter().zip(self.worker_stats()) {
            if !handle.join.is_finished() && worker.state != WorkerState::Stopped {
                stats.active_workers += 1;
            }
            if worker.current_task.is_some() {
                stats.busy_workers += 1;
            }
            stats.tasks_processed += worker.tasks_processed;
            stats.tasks_failed += worker.tasks_failed;
            stats.empty_polls += worker.empty_polls;
        }

        stats
    }

    /// Ids of the spawned workers
    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.iter().map(|h| h.worker_id.clone()).collect()
    }

    /// Fails when the pool is stopped or every worker has exited
    pub fn health_check(&self) -> ClaimqResult<()> {
        if !self.is_running() {
            return Err(ClaimqError::NotRunning);
        }

        let stats = self.stats();
        if stats.active_workers == 0 {
            return Err(ClaimqError::config("No active workers"));
        }

        if stats.active_workers < stats.total_workers {
            tracing::warn!(
                "Some workers have exited: {}/{} active",
                stats.active_workers,
                stats.total_workers
            );
        }

        Ok(())
    }

    /// Time since the pool was started
    pub fn uptime(&self) -> Option<Duration> {
        self.start_time.map(|start| start.elapsed())
    }

    /// Whether workers have been started and not shut down
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }
}
