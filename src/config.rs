//! Configuration types for claimq.
//!
//! This module contains all configuration structures used throughout claimq:
//! worker loop timings, claim strategy selection, store backend settings,
//! retry defaults and logging.

use crate::error::{ClaimqError, ClaimqResult};
use crate::strategy::PriorityOrder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main configuration for claimq.
///
/// # Examples
///
/// ```rust
/// use claimq::config::{ClaimqConfig, WorkerConfig};
///
/// let config = ClaimqConfig {
///     workers: WorkerConfig::with_workers(4).with_poll_interval(500),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimqConfig {
    /// Worker loop configuration
    pub workers: WorkerConfig,

    /// Claim strategy configuration
    pub claim: ClaimConfig,

    /// Store backend configuration
    pub store: StoreConfig,

    /// Retry defaults
    pub retry: RetryConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for ClaimqConfig {
    fn default() -> Self {
        Self {
            workers: WorkerConfig::default(),
            claim: ClaimConfig::default(),
            store: StoreConfig::default(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Worker loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of workers a pool spawns
    pub num_workers: usize,

    /// Prefix for generated worker ids
    pub worker_id_prefix: String,

    /// First idle wait after an empty poll, and the wait after any claim (in milliseconds)
    pub poll_interval_ms: u64,

    /// Upper bound for the idle wait (in milliseconds)
    pub max_backoff_ms: u64,

    /// Growth factor applied to the idle wait after each empty poll
    pub backoff_multiplier: f64,

    /// Interval between heartbeat upserts (in seconds)
    pub heartbeat_interval_secs: u64,

    /// Move claimed tasks to `running` before processing
    pub mark_running: bool,

    /// Requeue tasks whose claimant has been silent this long (in seconds).
    /// Must exceed the longest task duration; `None` disables the sweep.
    pub reclaim_stale_after_secs: Option<u64>,

    /// Time to wait for workers to finish in-flight tasks on shutdown (in seconds).
    /// Workers still busy after this are detached, not cancelled.
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get().max(1),
            worker_id_prefix: "worker".to_string(),
            poll_interval_ms: 5_000, // 5 seconds
            max_backoff_ms: 60_000,  // 1 minute
            backoff_multiplier: 1.5,
            heartbeat_interval_secs: 30,
            mark_running: true,
            reclaim_stale_after_secs: None,
            shutdown_timeout_secs: 30,
        }
    }
}

impl WorkerConfig {
    /// Create a new worker configuration with a specific number of workers.
    pub fn with_workers(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    /// Set the backoff cap and multiplier.
    pub fn with_backoff(mut self, max_backoff_ms: u64, multiplier: f64) -> Self {
        self.max_backoff_ms = max_backoff_ms;
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, secs: u64) -> Self {
        self.heartbeat_interval_secs = secs;
        self
    }

    /// Enable the orphaned-claim sweep.
    pub fn with_reclaim_after(mut self, secs: u64) -> Self {
        self.reclaim_stale_after_secs = Some(secs);
        self
    }

    /// Idle wait after a claim.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Idle wait cap.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Heartbeat period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Silence threshold for the reclaim sweep.
    pub fn reclaim_stale_after(&self) -> Option<Duration> {
        self.reclaim_stale_after_secs.map(Duration::from_secs)
    }

    /// Graceful shutdown budget.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Claim strategy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimConfig {
    /// Strategy name: `fifo`, `lifo`, `priority` or `weighted_random`.
    /// Unknown names fall back to `lifo` with a warning.
    pub strategy: String,

    /// Which end of the priority scale is most urgent
    pub priority_order: PriorityOrder,

    /// Seed for weighted-random selection (random when `None`)
    pub rng_seed: Option<u64>,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            strategy: "lifo".to_string(),
            priority_order: PriorityOrder::HigherFirst,
            rng_seed: None,
        }
    }
}

impl ClaimConfig {
    /// Create a claim configuration for the given strategy name.
    pub fn with_strategy(strategy: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
            ..Default::default()
        }
    }

    /// Set the priority direction.
    pub fn with_priority_order(mut self, order: PriorityOrder) -> Self {
        self.priority_order = order;
        self
    }
}

/// Store backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Maximum wait for an exclusive transaction (in milliseconds)
    pub lock_timeout_ms: u64,

    /// Backend-specific settings
    pub backend: StoreBackendConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            backend: StoreBackendConfig::InMemory,
        }
    }
}

impl StoreConfig {
    /// Configuration for the in-memory store.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Configuration for the PostgreSQL store.
    pub fn postgres(connection_string: impl Into<String>) -> Self {
        Self {
            backend: StoreBackendConfig::Postgres(PostgresConfig {
                connection_string: connection_string.into(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Set the lock timeout.
    pub fn with_lock_timeout(mut self, lock_timeout_ms: u64) -> Self {
        self.lock_timeout_ms = lock_timeout_ms;
        self
    }

    /// Exclusive-transaction wait bound.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Store backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreBackendConfig {
    /// Process-local store (default)
    InMemory,

    /// PostgreSQL store; requires the `postgres-store` feature at runtime
    Postgres(PostgresConfig),
}

/// PostgreSQL store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// PostgreSQL connection string
    pub connection_string: String,

    /// Connection pool size
    pub pool_size: u32,

    /// Prefix for the task, event and heartbeat tables
    pub table_prefix: String,

    /// Timeout for acquiring a pooled connection (in seconds)
    pub connect_timeout_secs: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            pool_size: 10,
            table_prefix: "claimq".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

/// Retry defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retry limit for task types without an override
    pub default_max_retries: u32,

    /// Per task type retry limits
    pub max_retries_by_type: HashMap<String, u32>,

    /// Delay before a requeued task becomes claimable again (in milliseconds)
    pub retry_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            max_retries_by_type: HashMap::new(),
            retry_delay_ms: 0,
        }
    }
}

impl RetryConfig {
    /// Set a per-type retry limit.
    pub fn with_type_limit(mut self, task_type: impl Into<String>, max_retries: u32) -> Self {
        self.max_retries_by_type.insert(task_type.into(), max_retries);
        self
    }

    /// Retry limit for a task type.
    pub fn max_retries_for(&self, task_type: &str) -> u32 {
        self.max_retries_by_type
            .get(task_type)
            .copied()
            .unwrap_or(self.default_max_retries)
    }

    /// Requeue delay.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Enable colored output (ignored if json_format is true)
    pub colored: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            colored: true,
            include_targets: false,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl ClaimqConfig {
    /// Create a new configuration optimized for development.
    pub fn development() -> Self {
        Self {
            workers: WorkerConfig {
                num_workers: 2,
                poll_interval_ms: 1_000,
                max_backoff_ms: 10_000,
                heartbeat_interval_secs: 10,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a new configuration optimized for production.
    pub fn production() -> Self {
        Self {
            workers: WorkerConfig {
                num_workers: num_cpus::get() * 2,
                shutdown_timeout_secs: 120,
                ..Default::default()
            },
            claim: ClaimConfig::with_strategy("priority"),
            retry: RetryConfig {
                default_max_retries: 5,
                retry_delay_ms: 10_000,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Info,
                json_format: true,
                colored: false,
                include_targets: false,
            },
            ..Default::default()
        }
    }

    /// Create a configuration for testing.
    pub fn testing() -> Self {
        Self {
            workers: WorkerConfig {
                num_workers: 1,
                poll_interval_ms: 10,
                max_backoff_ms: 100,
                heartbeat_interval_secs: 1,
                shutdown_timeout_secs: 5,
                ..Default::default()
            },
            claim: ClaimConfig {
                rng_seed: Some(7),
                ..Default::default()
            },
            store: StoreConfig::in_memory().with_lock_timeout(500),
            retry: RetryConfig {
                default_max_retries: 1,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: false,
                include_targets: true,
                ..Default::default()
            },
        }
    }

    /// Load the default configuration with `CLAIMQ_*` environment overrides.
    pub fn from_env() -> ClaimqResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup on top of the defaults.
    pub fn from_lookup<F>(lookup: F) -> ClaimqResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(strategy) = lookup("CLAIMQ_STRATEGY") {
            config.claim.strategy = strategy;
        }
        if let Some(value) = lookup("CLAIMQ_POLL_INTERVAL_MS") {
            config.workers.poll_interval_ms = parse_var("CLAIMQ_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = lookup("CLAIMQ_MAX_BACKOFF_MS") {
            config.workers.max_backoff_ms = parse_var("CLAIMQ_MAX_BACKOFF_MS", &value)?;
        }
        if let Some(value) = lookup("CLAIMQ_BACKOFF_MULTIPLIER") {
            config.workers.backoff_multiplier = parse_var("CLAIMQ_BACKOFF_MULTIPLIER", &value)?;
        }
        if let Some(value) = lookup("CLAIMQ_HEARTBEAT_INTERVAL_SECS") {
            config.workers.heartbeat_interval_secs =
                parse_var("CLAIMQ_HEARTBEAT_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = lookup("CLAIMQ_NUM_WORKERS") {
            config.workers.num_workers = parse_var("CLAIMQ_NUM_WORKERS", &value)?;
        }
        if let Some(url) = lookup("CLAIMQ_DATABASE_URL") {
            config.store = StoreConfig::postgres(url);
        }

        Ok(config)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.workers.num_workers == 0 {
            errors.push("Number of workers must be greater than 0".to_string());
        }

        if self.workers.num_workers > 1000 {
            errors.push("Number of workers should not exceed 1000".to_string());
        }

        if self.workers.poll_interval_ms == 0 {
            errors.push("Poll interval must be greater than 0".to_string());
        }

        if self.workers.max_backoff_ms < self.workers.poll_interval_ms {
            errors.push("Max backoff must be greater than or equal to poll interval".to_string());
        }

        if !self.workers.backoff_multiplier.is_finite() || self.workers.backoff_multiplier < 1.0 {
            errors.push("Backoff multiplier must be a finite number >= 1.0".to_string());
        }

        if self.workers.heartbeat_interval_secs == 0 {
            errors.push("Heartbeat interval must be greater than 0".to_string());
        }

        if let Some(stale_after) = self.workers.reclaim_stale_after_secs {
            if stale_after <= self.workers.heartbeat_interval_secs {
                errors.push("Reclaim threshold must exceed the heartbeat interval".to_string());
            }
        }

        if self.store.lock_timeout_ms == 0 {
            errors.push("Lock timeout must be greater than 0".to_string());
        }

        if let StoreBackendConfig::Postgres(pg) = &self.store.backend {
            if pg.connection_string.is_empty() {
                errors.push("PostgreSQL connection string must not be empty".to_string());
            }
            if pg.pool_size == 0 {
                errors.push("PostgreSQL pool size must be greater than 0".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> ClaimqResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ClaimqError::config(format!("{} has an invalid value '{}'", key, value)))
}
