//! Task records, status state machine and worker liveness records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique, monotonically assigned task identifier
pub type TaskId = i64;

/// Identifier a worker claims tasks under
pub type WorkerId = String;

/// Status of a task in the store
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting to be claimed
    Queued,
    /// Claimed by exactly one worker, not started yet
    Claimed,
    /// Being processed by its claimant
    Running,
    /// Finished successfully
    Completed,
    /// Failed with no retries left
    Failed,
    /// Withdrawn before it ran
    Cancelled,
}

impl TaskStatus {
    /// All statuses, in lifecycle order
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Queued,
        TaskStatus::Claimed,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Storage representation of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether no further transition can leave this status.
    ///
    /// A retryable failure is requeued in the same write that records it, so
    /// a stored `failed` task has always exhausted its retries.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether a worker currently holds the task
    pub fn is_claimed(&self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::Running)
    }

    /// Forward-only transition table.
    ///
    /// `claimed -> completed|failed` covers workers that skip the running step.
    /// `failed -> queued` is the retry requeue.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Claimed)
                | (Queued, Cancelled)
                | (Claimed, Running)
                | (Claimed, Completed)
                | (Claimed, Failed)
                | (Claimed, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Queued)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown task status '{}'", s))
    }
}

/// A unit of work as persisted by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,
    /// Work kind, used to pick a processor
    pub task_type: String,
    /// Opaque payload handed to the processor
    pub parameters: serde_json::Value,
    /// Urgency; its direction depends on the configured priority order
    pub priority: i64,
    /// Current status
    pub status: TaskStatus,
    /// Number of requeues so far
    pub retry_count: u32,
    /// Maximum number of requeues allowed
    pub max_retries: u32,
    /// When the task was enqueued
    pub created_at: DateTime<Utc>,
    /// When the current claim was taken
    pub claimed_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time the task may be claimed
    pub run_after: Option<DateTime<Utc>>,
    /// Claimant, set only while claimed or running
    pub claimed_by: Option<WorkerId>,
    /// Processor output on success
    pub result_data: Option<serde_json::Value>,
    /// Last processor error
    pub error_message: Option<String>,
}

impl Task {
    /// Build the stored record for a freshly enqueued task.
    pub fn from_new(id: TaskId, new: NewTask, default_max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            task_type: new.task_type,
            parameters: new.parameters,
            priority: new.priority,
            status: TaskStatus::Queued,
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(default_max_retries),
            created_at: now,
            claimed_at: None,
            completed_at: None,
            run_after: new.run_after,
            claimed_by: None,
            result_data: None,
            error_message: None,
        }
    }

    /// Queued and past its `run_after`
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Queued && self.run_after.is_none_or(|at| at <= now)
    }

    /// Whether one more failure may be requeued
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Time between enqueue and the current claim
    pub fn wait_time(&self) -> Option<chrono::Duration> {
        self.claimed_at.map(|claimed| claimed - self.created_at)
    }

    /// Whether `worker_id` holds the current claim
    pub fn is_claimed_by(&self, worker_id: &str) -> bool {
        self.status.is_claimed() && self.claimed_by.as_deref() == Some(worker_id)
    }
}

/// Enqueue request for a new task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    /// Work kind
    pub task_type: String,
    /// Payload for the processor
    pub parameters: serde_json::Value,
    /// Urgency
    pub priority: i64,
    /// Per-task retry limit; the store default applies when `None`
    pub max_retries: Option<u32>,
    /// Delay the first claim until this time
    pub run_after: Option<DateTime<Utc>>,
}

impl NewTask {
    /// Create an enqueue request with priority 0
    pub fn new(task_type: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            parameters,
            priority: 0,
            max_retries: None,
            run_after: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry limit.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Delay the first claim.
    pub fn with_run_after(mut self, run_after: DateTime<Utc>) -> Self {
        self.run_after = Some(run_after);
        self
    }
}

/// What a processor produced for a claimed task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskOutcome {
    /// Processing succeeded, with optional result data
    Completed(Option<serde_json::Value>),
    /// Processing failed with an error message
    Failed(String),
}

impl TaskOutcome {
    /// Whether the outcome is a success
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed(_))
    }
}

/// What a report did to the task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportDisposition {
    /// Task moved to `completed`
    Completed,
    /// Task failed and went back to `queued`
    Requeued {
        /// Retry count after the requeue
        retry_count: u32,
    },
    /// Task failed with no retries left
    Failed,
    /// Report did not apply; the task kept this status
    Unchanged {
        /// Status the task kept
        status: TaskStatus,
    },
}

/// Kind of an audit event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    /// Processor succeeded
    Completed,
    /// Processor failed
    Failed,
    /// Failure was requeued
    Requeued,
    /// Claim was taken back from a silent worker
    Reclaimed,
    /// Task was cancelled
    Cancelled,
    /// A report arrived for a task that had already moved on
    IgnoredReport,
}

impl TaskEventKind {
    /// Storage representation of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskEventKind::Completed => "completed",
            TaskEventKind::Failed => "failed",
            TaskEventKind::Requeued => "requeued",
            TaskEventKind::Reclaimed => "reclaimed",
            TaskEventKind::Cancelled => "cancelled",
            TaskEventKind::IgnoredReport => "ignored_report",
        }
    }
}

impl FromStr for TaskEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(TaskEventKind::Completed),
            "failed" => Ok(TaskEventKind::Failed),
            "requeued" => Ok(TaskEventKind::Requeued),
            "reclaimed" => Ok(TaskEventKind::Reclaimed),
            "cancelled" => Ok(TaskEventKind::Cancelled),
            "ignored_report" => Ok(TaskEventKind::IgnoredReport),
            other => Err(format!("unknown task event kind '{}'", other)),
        }
    }
}

/// Append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Task the event belongs to
    pub task_id: TaskId,
    /// Worker that caused it, if any
    pub worker_id: Option<WorkerId>,
    /// What happened
    pub kind: TaskEventKind,
    /// When it happened
    pub at: DateTime<Utc>,
    /// Error message or other context
    pub detail: Option<String>,
}

/// Liveness record, upserted by each worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    /// Worker the record belongs to
    pub worker_id: WorkerId,
    /// Last time the worker reported in
    pub last_heartbeat: DateTime<Utc>,
    /// Tasks the worker completed
    pub tasks_processed: u64,
    /// Tasks whose processing failed on this worker
    pub tasks_failed: u64,
}
