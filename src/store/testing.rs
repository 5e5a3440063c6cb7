//! Store doubles for unit tests.

use super::{ClaimTransaction, QueueStats, TaskStore};
use crate::error::{ClaimqError, ClaimqResult};
use crate::task::{
    NewTask, ReportDisposition, Task, TaskEvent, TaskId, TaskOutcome, TaskStatus, WorkerHeartbeat,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::time::Duration;

/// A store whose every call fails as if the database were down.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct UnreachableStore;

fn down<T>() -> ClaimqResult<T> {
    Err(ClaimqError::unavailable(
        "connection refused",
        io::Error::new(io::ErrorKind::ConnectionRefused, "store is down"),
    ))
}

#[async_trait]
impl TaskStore for UnreachableStore {
    async fn enqueue(&self, _task: NewTask) -> ClaimqResult<Task> {
        down()
    }

    async fn begin_exclusive(&self) -> ClaimqResult<Box<dyn ClaimTransaction>> {
        down()
    }

    async fn mark_running(&self, _task_id: TaskId, _worker_id: &str) -> ClaimqResult<Task> {
        down()
    }

    async fn report(
        &self,
        _task_id: TaskId,
        _worker_id: &str,
        _outcome: &TaskOutcome,
        _retry_delay: Duration,
    ) -> ClaimqResult<ReportDisposition> {
        down()
    }

    async fn cancel(&self, _task_id: TaskId) -> ClaimqResult<Task> {
        down()
    }

    async fn get_task(&self, _task_id: TaskId) -> ClaimqResult<Option<Task>> {
        down()
    }

    async fn tasks_by_status(
        &self,
        _status: TaskStatus,
        _limit: Option<usize>,
    ) -> ClaimqResult<Vec<Task>> {
        down()
    }

    async fn events(&self, _task_id: TaskId) -> ClaimqResult<Vec<TaskEvent>> {
        down()
    }

    async fn upsert_heartbeat(&self, _heartbeat: &WorkerHeartbeat) -> ClaimqResult<()> {
        down()
    }

    async fn heartbeats(&self) -> ClaimqResult<Vec<WorkerHeartbeat>> {
        down()
    }

    async fn reclaim_orphaned(&self, _stale_before: DateTime<Utc>) -> ClaimqResult<Vec<TaskId>> {
        down()
    }

    async fn stats(&self) -> ClaimqResult<QueueStats> {
        down()
    }

    async fn health_check(&self) -> ClaimqResult<()> {
        down()
    }
}
