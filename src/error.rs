//! Error types for claimq operations.

use crate::task::{TaskId, TaskStatus};
use thiserror::Error;

/// Result type used throughout claimq.
pub type ClaimqResult<T> = Result<T, ClaimqError>;

/// Main error type for claimq operations.
#[derive(Error, Debug)]
pub enum ClaimqError {
    /// The store could not grant an exclusive transaction within the lock timeout
    #[error("Store busy: exclusive lock not acquired within {waited_ms}ms")]
    StoreBusy {
        /// How long the caller waited before giving up
        waited_ms: u64,
    },

    /// The store cannot be reached at all
    #[error("Store unavailable: {message}")]
    StoreUnavailable {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Task not found in the store
    #[error("Task {task_id} not found")]
    TaskNotFound {
        /// The task that wasn't found
        task_id: TaskId,
    },

    /// A status change that the task state machine forbids
    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Task being mutated
        task_id: TaskId,
        /// Current status
        from: TaskStatus,
        /// Requested status
        to: TaskStatus,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message
        message: String,
    },

    /// Worker pool is already running
    #[error("Worker pool is already running")]
    AlreadyRunning,

    /// Worker pool is not running
    #[error("Worker pool is not running")]
    NotRunning,

    /// Database error
    #[cfg(feature = "postgres-store")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres-store")))]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ClaimqError {
    /// Create a store-unavailable error wrapping its cause
    pub fn unavailable<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::StoreUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Contention that clears up on its own; callers back off instead of failing.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreBusy { .. })
    }

    /// Errors that must stop a worker loop.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::StoreUnavailable { .. } => true,
            #[cfg(feature = "postgres-store")]
            Self::Database(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let busy = ClaimqError::StoreBusy { waited_ms: 250 };
        assert!(busy.is_transient());
        assert!(!busy.is_fatal());

        let down = ClaimqError::unavailable(
            "connection refused",
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert!(down.is_fatal());
        assert!(!down.is_transient());

        let missing = ClaimqError::TaskNotFound { task_id: 7 };
        assert!(!missing.is_fatal());
        assert!(!missing.is_transient());
    }

    #[test]
    fn test_error_messages() {
        let err = ClaimqError::InvalidTransition {
            task_id: 3,
            from: TaskStatus::Completed,
            to: TaskStatus::Running,
        };
        assert_eq!(
            err.to_string(),
            "Task 3 cannot move from completed to running"
        );
        assert_eq!(
            ClaimqError::config("bad multiplier").to_string(),
            "Configuration error: bad multiplier"
        );
    }
}
