//! Task processors and the per-type processor registry.
//!
//! The worker loop is generic over a single [`TaskProcessor`]. Applications
//! that handle several task types register one processor per type in a
//! [`ProcessorRegistry`], which is itself a processor that dispatches on
//! `task.task_type` and keeps per-type execution statistics.
//!
//! # Examples
//!
//! ```rust
//! use claimq::core::processor::{FnProcessor, ProcessorRegistry, TypedProcessor};
//! use claimq::task::TaskOutcome;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Resize {
//!     width: u32,
//! }
//!
//! # async fn example() {
//! let registry = ProcessorRegistry::new();
//! registry
//!     .register("ping", FnProcessor::new(|_task| async { TaskOutcome::Completed(None) }))
//!     .await;
//! registry
//!     .register(
//!         "resize",
//!         TypedProcessor::new(|job: Resize| async move {
//!             Ok::<_, String>(serde_json::json!({ "width": job.width }))
//!         }),
//!     )
//!     .await;
//! assert_eq!(registry.registered_types().await, vec!["ping", "resize"]);
//! # }
//! ```

use crate::task::{Task, TaskOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Processes one claimed task.
///
/// Implementations report failure through [`TaskOutcome::Failed`]; a panic is
/// caught by the worker and reported as a failure too.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Process a task and describe the outcome.
    async fn process(&self, task: &Task) -> TaskOutcome;
}

/// Shared handle to a processor
pub type SharedProcessor = Arc<dyn TaskProcessor>;

/// Adapter turning an async closure into a [`TaskProcessor`].
pub struct FnProcessor<F> {
    handler: F,
}

impl<F, Fut> FnProcessor<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = TaskOutcome> + Send,
{
    /// Wrap a closure receiving an owned copy of the task
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F, Fut> TaskProcessor for FnProcessor<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = TaskOutcome> + Send,
{
    async fn process(&self, task: &Task) -> TaskOutcome {
        (self.handler)(task.clone()).await
    }
}

/// Adapter that deserializes `task.parameters` into `T` before calling the
/// handler.
///
/// A payload that does not match `T` fails the task with the decode error.
/// `Ok` values are serialized into the task's result data.
pub struct TypedProcessor<T, F> {
    handler: F,
    _payload: PhantomData<fn() -> T>,
}

impl<T, F> TypedProcessor<T, F> {
    /// Wrap a typed handler
    pub fn new<Fut>(handler: F) -> Self
    where
        F: Fn(T) -> Fut,
    {
        Self {
            handler,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<T, O, E, F, Fut> TaskProcessor for TypedProcessor<T, F>
where
    T: DeserializeOwned + Send + 'static,
    O: Serialize + Send,
    E: fmt::Display + Send,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, E>> + Send,
{
    async fn process(&self, task: &Task) -> TaskOutcome {
        let payload: T = match serde_json::from_value(task.parameters.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                return TaskOutcome::Failed(format!(
                    "Invalid parameters for task type {}: {}",
                    task.task_type, e
                ));
            }
        };

        match (self.handler)(payload).await {
            Ok(output) => match serde_json::to_value(output) {
                Ok(serde_json::Value::Null) => TaskOutcome::Completed(None),
                Ok(value) => TaskOutcome::Completed(Some(value)),
                Err(e) => TaskOutcome::Failed(format!("Failed to serialize result: {}", e)),
            },
            Err(e) => TaskOutcome::Failed(e.to_string()),
        }
    }
}

/// Statistics for a registered task type.
#[derive(Debug, Clone, Default)]
pub struct TaskTypeStats {
    /// Total number of tasks executed
    pub total_executed: u64,
    /// Number of successful executions
    pub successful: u64,
    /// Number of failed executions
    pub failed: u64,
    /// Average execution time
    pub avg_duration: Option<Duration>,
    /// Last execution time
    pub last_executed: Option<DateTime<Utc>>,
}

/// Summary of the registry state.
#[derive(Debug, Clone)]
pub struct RegistrySummary {
    /// Number of registered processors
    pub processor_count: usize,
    /// List of all registered task types
    pub registered_types: Vec<String>,
    /// Total number of tasks executed
    pub total_executed: u64,
    /// Total number of successful executions
    pub total_successful: u64,
    /// Total number of failed executions
    pub total_failed: u64,
}

/// Dispatches tasks to the processor registered for their type.
///
/// Tasks of an unregistered type fail with a descriptive error instead of
/// blocking the worker.
#[derive(Default)]
pub struct ProcessorRegistry {
    /// Registered processors by task type
    processors: RwLock<HashMap<String, SharedProcessor>>,
    /// Task type statistics
    stats: RwLock<HashMap<String, TaskTypeStats>>,
}

impl ProcessorRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor for a task type, replacing any previous one.
    pub async fn register<P>(&self, task_type: impl Into<String>, processor: P)
    where
        P: TaskProcessor + 'static,
    {
        self.register_shared(task_type, Arc::new(processor)).await;
    }

    /// Register an already shared processor.
    pub async fn register_shared(&self, task_type: impl Into<String>, processor: SharedProcessor) {
        let task_type = task_type.into();
        tracing::info!("Registering processor for task type: {}", task_type);

        self.processors
            .write()
            .await
            .insert(task_type.clone(), processor);

        self.stats
            .write()
            .await
            .entry(task_type)
            .or_default();
    }

    /// Check if a task type is registered.
    pub async fn is_registered(&self, task_type: &str) -> bool {
        self.processors.read().await.contains_key(task_type)
    }

    /// Get all registered task types, sorted.
    pub async fn registered_types(&self) -> Vec<String> {
        let processors = self.processors.read().await;
        let mut types: Vec<String> = processors.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get statistics for a task type.
    pub async fn stats_for(&self, task_type: &str) -> Option<TaskTypeStats> {
        self.stats.read().await.get(task_type).cloned()
    }

    /// Get statistics for all task types seen so far.
    pub async fn all_stats(&self) -> HashMap<String, TaskTypeStats> {
        self.stats.read().await.clone()
    }

    /// Reset statistics for all task types.
    pub async fn reset_stats(&self) {
        let mut stats = self.stats.write().await;
        for task_stats in stats.values_mut() {
            *task_stats = TaskTypeStats::default();
        }
        tracing::info!("Processor registry statistics reset");
    }

    /// Get a summary of the registry state.
    pub async fn summary(&self) -> RegistrySummary {
        let registered_types = self.registered_types().await;
        let all_stats = self.all_stats().await;

        RegistrySummary {
            processor_count: registered_types.len(),
            registered_types,
            total_executed: all_stats.values().map(|s| s.total_executed).sum(),
            total_successful: all_stats.values().map(|s| s.successful).sum(),
            total_failed: all_stats.values().map(|s| s.failed).sum(),
        }
    }

    async fn update_stats(&self, task_type: &str, outcome: &TaskOutcome, duration: Duration) {
        let mut stats = self.stats.write().await;
        let task_stats = stats.entry(task_type.to_string()).or_default();

        task_stats.total_executed += 1;
        task_stats.last_executed = Some(Utc::now());

        if outcome.is_success() {
            task_stats.successful += 1;
        } else {
            task_stats.failed += 1;
        }

        // Exponential moving average, alpha = 0.1
        task_stats.avg_duration = Some(match task_stats.avg_duration {
            Some(avg) => {
                let alpha = 0.1;
                let nanos = alpha * duration.as_nanos() as f64 + (1.0 - alpha) * avg.as_nanos() as f64;
                Duration::from_nanos(nanos as u64)
            }
            None => duration,
        });
    }
}

#[async_trait]
impl TaskProcessor for ProcessorRegistry {
    async fn process(&self, task: &Task) -> TaskOutcome {
        let processor = self.processors.read().await.get(&task.task_type).cloned();

        let Some(processor) = processor else {
            let error = format!("No processor registered for task type: {}", task.task_type);
            tracing::error!(task_id = task.id, "{}", error);
            let outcome = TaskOutcome::Failed(error);
            self.update_stats(&task.task_type, &outcome, Duration::ZERO).await;
            return outcome;
        };

        tracing::debug!("Processing task {} of type {}", task.id, task.task_type);

        let start_time = Instant::now();
        let outcome = processor.process(task).await;
        let duration = start_time.elapsed();

        self.update_stats(&task.task_type, &outcome, duration).await;

        match &outcome {
            TaskOutcome::Completed(_) => {
                tracing::debug!("Task {} completed in {:?}", task.id, duration);
            }
            TaskOutcome::Failed(e) => {
                tracing::debug!("Task {} failed after {:?}: {}", task.id, duration, e);
            }
        }

        outcome
    }
}
