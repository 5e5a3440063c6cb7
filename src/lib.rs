//! # claimq
//!
//! A durable multi-worker task queue. Workers pull tasks from a shared store,
//! process them and report the outcome, while the store guarantees that no
//! task is ever held by two workers at once.
//!
//! ## Features
//!
//! - **Atomic claiming**: select-then-mark inside one exclusive transaction
//! - **Ordering strategies**: FIFO, LIFO, priority and urgency-weighted random
//! - **Idle backoff**: exponential poll spacing that resets on the next claim
//! - **Heartbeats**: per-worker liveness records with an opt-in orphan sweep
//! - **Fairness analysis**: Gini, Jain's index and max-wait per priority
//! - **Backends**: in-memory, and PostgreSQL behind `postgres-store`
//!
//! ## Quick Start
//!
//! ```rust
//! use claimq::prelude::*;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Email {
//!     to: String,
//! }
//!
//! # async fn example() -> ClaimqResult<()> {
//! let scheduler = Scheduler::new(ClaimqConfig::default()).await?;
//! scheduler
//!     .register(
//!         "email",
//!         TypedProcessor::new(|email: Email| async move {
//!             Ok::<_, String>(format!("sent to {}", email.to))
//!         }),
//!     )
//!     .await;
//!
//! scheduler
//!     .enqueue(NewTask::new("email", serde_json::json!({"to": "ops@example.com"})).with_priority(5))
//!     .await?;
//!
//! scheduler.start().await?;
//! scheduler.wait_for_shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod fairness;
pub mod logging;
pub mod metrics;
pub mod store;
pub mod strategy;
pub mod task;

pub mod prelude {
    pub use crate::config::*;
    pub use crate::core::{
        FnProcessor, ProcessorRegistry, Scheduler, SharedProcessor, TaskProcessor, TypedProcessor,
        Worker, WorkerPool, WorkerStats,
    };
    pub use crate::error::{ClaimqError, ClaimqResult};
    pub use crate::fairness::FairnessReport;
    pub use crate::store::{InMemoryStore, QueueStats, SharedStore, TaskStore};
    pub use crate::strategy::{ClaimStrategy, PriorityOrder};
    pub use crate::task::{NewTask, Task, TaskId, TaskOutcome, TaskStatus};
    pub use async_trait::async_trait;
}

pub use crate::core::Scheduler;
pub use crate::error::{ClaimqError, ClaimqResult};
pub use crate::store::{SharedStore, TaskStore};
pub use crate::strategy::{ClaimStrategy, PriorityOrder};
pub use crate::task::{NewTask, Task, TaskId, TaskOutcome, TaskStatus};
