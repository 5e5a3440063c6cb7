//! PostgreSQL store implementation for claimq.
//!
//! The exclusive transaction is a real table lock: every claim opens a
//! transaction, sets a local `lock_timeout`, and takes
//! `SHARE ROW EXCLUSIVE` on the task table. That mode conflicts with itself
//! and with row updates, so claimers and reporters serialize while plain reads
//! proceed. A lock wait that runs out (`55P03`) is reported as
//! [`ClaimqError::StoreBusy`].

use super::{
    ClaimTransaction, QueueStats, TaskStore, apply_outcome, ensure_transition, event,
    fail_or_requeue,
};
use crate::config::PostgresConfig;
use crate::error::{ClaimqError, ClaimqResult};
use crate::strategy::{ClaimStrategy, PriorityOrder};
use crate::task::{
    NewTask, ReportDisposition, Task, TaskEvent, TaskEventKind, TaskId, TaskOutcome, TaskStatus,
    WorkerHeartbeat,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

const LOCK_NOT_AVAILABLE: &str = "55P03";

const TASK_COLUMNS: &str = "id, task_type, parameters, priority, status, retry_count, max_retries, \
     created_at, claimed_at, completed_at, run_after, claimed_by, result_data, error_message";

#[derive(Debug, Clone)]
struct Tables {
    tasks: String,
    events: String,
    heartbeats: String,
}

impl Tables {
    fn new(prefix: &str) -> ClaimqResult<Self> {
        let valid = !prefix.is_empty()
            && prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(ClaimqError::config(format!(
                "table prefix '{}' must be non-empty ASCII alphanumerics or underscores",
                prefix
            )));
        }

        Ok(Self {
            tasks: format!("{}_tasks", prefix),
            events: format!("{}_events", prefix),
            heartbeats: format!("{}_heartbeats", prefix),
        })
    }
}

/// PostgreSQL store backend implementation
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    tables: Tables,
    lock_timeout: Duration,
    default_max_retries: u32,
}

impl PostgresStore {
    /// Connect a pool and build the store.
    pub async fn connect(
        config: &PostgresConfig,
        lock_timeout: Duration,
        default_max_retries: u32,
    ) -> ClaimqResult<Self> {
        let tables = Tables::new(&config.table_prefix)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.connection_string)
            .await
            .map_err(|e| {
                error!("Failed to connect to PostgreSQL: {}", e);
                ClaimqError::unavailable("failed to connect to PostgreSQL", e)
            })?;

        Ok(Self::from_pool(pool, tables, lock_timeout, default_max_retries))
    }

    fn from_pool(
        pool: PgPool,
        tables: Tables,
        lock_timeout: Duration,
        default_max_retries: u32,
    ) -> Self {
        Self {
            pool,
            tables,
            lock_timeout,
            default_max_retries,
        }
    }

    /// Access the underlying connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> ClaimqResult<()> {
        let Tables {
            tasks,
            events,
            heartbeats,
        } = &self.tables;

        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {tasks} (
                    id BIGSERIAL PRIMARY KEY,
                    task_type TEXT NOT NULL,
                    parameters JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                    priority BIGINT NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'queued',
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    max_retries INTEGER NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    claimed_at TIMESTAMPTZ,
                    completed_at TIMESTAMPTZ,
                    run_after TIMESTAMPTZ,
                    claimed_by TEXT,
                    result_data JSONB,
                    error_message TEXT
                )
                "#
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {tasks}_claimable_idx ON {tasks} (status, priority, created_at)"
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {events} (
                    id BIGSERIAL PRIMARY KEY,
                    task_id BIGINT NOT NULL,
                    worker_id TEXT,
                    kind TEXT NOT NULL,
                    at TIMESTAMPTZ NOT NULL,
                    detail TEXT
                )
                "#
            ),
            format!("CREATE INDEX IF NOT EXISTS {events}_task_idx ON {events} (task_id, id)"),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {heartbeats} (
                    worker_id TEXT PRIMARY KEY,
                    last_heartbeat TIMESTAMPTZ NOT NULL,
                    tasks_processed BIGINT NOT NULL DEFAULT 0,
                    tasks_failed BIGINT NOT NULL DEFAULT 0
                )
                "#
            ),
        ];

        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| classify(e, self.lock_timeout))?;
        }

        debug!(table = %tasks, "Schema ready");
        Ok(())
    }

    /// Open a transaction holding the task-table lock.
    async fn begin_locked(&self) -> ClaimqResult<Transaction<'static, Postgres>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify(e, self.lock_timeout))?;

        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| classify(e, self.lock_timeout))?;

        sqlx::query(&format!(
            "LOCK TABLE {} IN SHARE ROW EXCLUSIVE MODE",
            self.tables.tasks
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| classify(e, self.lock_timeout))?;

        Ok(tx)
    }

    async fn fetch_for_update(
        &self,
        conn: &mut PgConnection,
        task_id: TaskId,
    ) -> ClaimqResult<Task> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE id = $1 FOR UPDATE",
            TASK_COLUMNS, self.tables.tasks
        ))
        .bind(task_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| classify(e, self.lock_timeout))?
        .ok_or(ClaimqError::TaskNotFound { task_id })?;

        task_from_row(&row)
    }

    async fn write_task(&self, conn: &mut PgConnection, task: &Task) -> ClaimqResult<()> {
        write_task(conn, &self.tables, task, self.lock_timeout).await
    }

    async fn append_events(
        &self,
        conn: &mut PgConnection,
        events: &[TaskEvent],
    ) -> ClaimqResult<()> {
        for event in events {
            sqlx::query(&format!(
                "INSERT INTO {} (task_id, worker_id, kind, at, detail) VALUES ($1, $2, $3, $4, $5)",
                self.tables.events
            ))
            .bind(event.task_id)
            .bind(event.worker_id.as_deref())
            .bind(event.kind.as_str())
            .bind(event.at)
            .bind(event.detail.as_deref())
            .execute(&mut *conn)
            .await
            .map_err(|e| classify(e, self.lock_timeout))?;
        }
        Ok(())
    }
}

/// Exclusive claim transaction over the locked task table
struct PgClaimTransaction {
    tx: Transaction<'static, Postgres>,
    tables: Tables,
    lock_timeout: Duration,
}

#[async_trait]
impl ClaimTransaction for PgClaimTransaction {
    async fn candidates(
        &mut self,
        strategy: &ClaimStrategy,
        order: PriorityOrder,
        now: DateTime<Utc>,
    ) -> ClaimqResult<Vec<Task>> {
        let (order_by, limit) = order_clause(strategy, order);
        let rows = sqlx::query(&format!(
            "SELECT {} FROM {} \
             WHERE status = 'queued' AND (run_after IS NULL OR run_after <= $1) \
             ORDER BY {}{}",
            TASK_COLUMNS, self.tables.tasks, order_by, limit
        ))
        .bind(now)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| classify(e, self.lock_timeout))?;

        rows.iter().map(task_from_row).collect()
    }

    async fn mark_claimed(
        &mut self,
        task_id: TaskId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> ClaimqResult<Task> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE id = $1",
            TASK_COLUMNS, self.tables.tasks
        ))
        .bind(task_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| classify(e, self.lock_timeout))?
        .ok_or(ClaimqError::TaskNotFound { task_id })?;

        let mut task = task_from_row(&row)?;
        ensure_transition(&task, TaskStatus::Claimed)?;
        task.status = TaskStatus::Claimed;
        task.claimed_by = Some(worker_id.to_string());
        task.claimed_at = Some(now);

        write_task(&mut self.tx, &self.tables, &task, self.lock_timeout).await?;
        Ok(task)
    }

    async fn commit(self: Box<Self>) -> ClaimqResult<()> {
        let lock_timeout = self.lock_timeout;
        self.tx
            .commit()
            .await
            .map_err(|e| classify(e, lock_timeout))
    }

    async fn rollback(self: Box<Self>) -> ClaimqResult<()> {
        let lock_timeout = self.lock_timeout;
        self.tx
            .rollback()
            .await
            .map_err(|e| classify(e, lock_timeout))
    }
}

#[async_trait]
impl TaskStore for PostgresStore {
    #[instrument(skip(self, task), fields(task_type = %task.task_type))]
    async fn enqueue(&self, task: NewTask) -> ClaimqResult<Task> {
        let max_retries = task.max_retries.unwrap_or(self.default_max_retries);
        let row = sqlx::query(&format!(
            "INSERT INTO {} (task_type, parameters, priority, status, max_retries, run_after) \
             VALUES ($1, $2, $3, 'queued', $4, $5) RETURNING {}",
            self.tables.tasks, TASK_COLUMNS
        ))
        .bind(&task.task_type)
        .bind(&task.parameters)
        .bind(task.priority)
        .bind(i32::try_from(max_retries).unwrap_or(i32::MAX))
        .bind(task.run_after)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enqueue task: {}", e);
            classify(e, self.lock_timeout)
        })?;

        let task = task_from_row(&row)?;
        debug!(task_id = task.id, "Enqueued task");
        Ok(task)
    }

    async fn begin_exclusive(&self) -> ClaimqResult<Box<dyn ClaimTransaction>> {
        let tx = self.begin_locked().await?;
        Ok(Box::new(PgClaimTransaction {
            tx,
            tables: self.tables.clone(),
            lock_timeout: self.lock_timeout,
        }))
    }

    async fn mark_running(&self, task_id: TaskId, worker_id: &str) -> ClaimqResult<Task> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify(e, self.lock_timeout))?;

        let mut task = self.fetch_for_update(&mut tx, task_id).await?;
        if !task.is_claimed_by(worker_id) {
            return Err(ClaimqError::InvalidTransition {
                task_id,
                from: task.status,
                to: TaskStatus::Running,
            });
        }

        ensure_transition(&task, TaskStatus::Running)?;
        task.status = TaskStatus::Running;
        self.write_task(&mut tx, &task).await?;

        tx.commit()
            .await
            .map_err(|e| classify(e, self.lock_timeout))?;
        Ok(task)
    }

    #[instrument(skip(self, outcome))]
    async fn report(
        &self,
        task_id: TaskId,
        worker_id: &str,
        outcome: &TaskOutcome,
        retry_delay: Duration,
    ) -> ClaimqResult<ReportDisposition> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify(e, self.lock_timeout))?;

        let mut task = self.fetch_for_update(&mut tx, task_id).await?;
        let (disposition, events) =
            apply_outcome(&mut task, worker_id, outcome, retry_delay, Utc::now())?;

        if !matches!(disposition, ReportDisposition::Unchanged { .. }) {
            self.write_task(&mut tx, &task).await?;
        }
        self.append_events(&mut tx, &events).await?;

        tx.commit()
            .await
            .map_err(|e| classify(e, self.lock_timeout))?;
        Ok(disposition)
    }

    async fn cancel(&self, task_id: TaskId) -> ClaimqResult<Task> {
        let mut tx = self.begin_locked().await?;

        let mut task = self.fetch_for_update(&mut tx, task_id).await?;
        ensure_transition(&task, TaskStatus::Cancelled)?;

        let now = Utc::now();
        let previous_holder = task.claimed_by.take();
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(now);

        self.write_task(&mut tx, &task).await?;
        self.append_events(
            &mut tx,
            &[event(
                task_id,
                previous_holder.as_deref(),
                TaskEventKind::Cancelled,
                now,
                None,
            )],
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| classify(e, self.lock_timeout))?;
        Ok(task)
    }

    async fn get_task(&self, task_id: TaskId) -> ClaimqResult<Option<Task>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE id = $1",
            TASK_COLUMNS, self.tables.tasks
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify(e, self.lock_timeout))?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn tasks_by_status(
        &self,
        status: TaskStatus,
        limit: Option<usize>,
    ) -> ClaimqResult<Vec<Task>> {
        let limit = limit
            .map(|n| i64::try_from(n).unwrap_or(i64::MAX))
            .unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE status = $1 ORDER BY created_at ASC, id ASC LIMIT $2",
            TASK_COLUMNS, self.tables.tasks
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify(e, self.lock_timeout))?;

        rows.iter().map(task_from_row).collect()
    }

    async fn events(&self, task_id: TaskId) -> ClaimqResult<Vec<TaskEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT task_id, worker_id, kind, at, detail FROM {} WHERE task_id = $1 ORDER BY id",
            self.tables.events
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify(e, self.lock_timeout))?;

        rows.iter()
            .map(|row| -> ClaimqResult<TaskEvent> {
                let kind: String = row.try_get("kind")?;
                Ok(TaskEvent {
                    task_id: row.try_get("task_id")?,
                    worker_id: row.try_get("worker_id")?,
                    kind: kind.parse().map_err(decode_error)?,
                    at: row.try_get("at")?,
                    detail: row.try_get("detail")?,
                })
            })
            .collect()
    }

    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> ClaimqResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (worker_id, last_heartbeat, tasks_processed, tasks_failed)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (worker_id) DO UPDATE SET
                last_heartbeat = EXCLUDED.last_heartbeat,
                tasks_processed = EXCLUDED.tasks_processed,
                tasks_failed = EXCLUDED.tasks_failed
            "#,
            self.tables.heartbeats
        ))
        .bind(&heartbeat.worker_id)
        .bind(heartbeat.last_heartbeat)
        .bind(i64::try_from(heartbeat.tasks_processed).unwrap_or(i64::MAX))
        .bind(i64::try_from(heartbeat.tasks_failed).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, self.lock_timeout))?;

        Ok(())
    }

    async fn heartbeats(&self) -> ClaimqResult<Vec<WorkerHeartbeat>> {
        let rows = sqlx::query(&format!(
            "SELECT worker_id, last_heartbeat, tasks_processed, tasks_failed FROM {} ORDER BY worker_id",
            self.tables.heartbeats
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify(e, self.lock_timeout))?;

        rows.iter()
            .map(|row| -> ClaimqResult<WorkerHeartbeat> {
                Ok(WorkerHeartbeat {
                    worker_id: row.try_get("worker_id")?,
                    last_heartbeat: row.try_get("last_heartbeat")?,
                    tasks_processed: row.try_get::<i64, _>("tasks_processed")?.max(0) as u64,
                    tasks_failed: row.try_get::<i64, _>("tasks_failed")?.max(0) as u64,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn reclaim_orphaned(&self, stale_before: DateTime<Utc>) -> ClaimqResult<Vec<TaskId>> {
        let mut tx = self.begin_locked().await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {columns} FROM {tasks} t
            LEFT JOIN {heartbeats} h ON h.worker_id = t.claimed_by
            WHERE t.status IN ('claimed', 'running')
              AND COALESCE(h.last_heartbeat, t.claimed_at) < $1
            ORDER BY t.id
            "#,
            columns = TASK_COLUMNS
                .split(", ")
                .map(|column| format!("t.{}", column.trim()))
                .collect::<Vec<_>>()
                .join(", "),
            tasks = self.tables.tasks,
            heartbeats = self.tables.heartbeats,
        ))
        .bind(stale_before)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| classify(e, self.lock_timeout))?;

        let now = Utc::now();
        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut task = task_from_row(row)?;
            let claimant = task.claimed_by.clone().unwrap_or_default();
            let message = format!("claim reclaimed: worker {} stopped sending heartbeats", claimant);

            let disposition = fail_or_requeue(&mut task, &message, Duration::ZERO, now)?;
            self.write_task(&mut tx, &task).await?;
            self.append_events(
                &mut tx,
                &[event(
                    task.id,
                    Some(&claimant),
                    TaskEventKind::Reclaimed,
                    now,
                    Some(message),
                )],
            )
            .await?;

            warn!(task_id = task.id, worker_id = %claimant, ?disposition, "Reclaimed orphaned task");
            reclaimed.push(task.id);
        }

        tx.commit()
            .await
            .map_err(|e| classify(e, self.lock_timeout))?;
        Ok(reclaimed)
    }

    async fn stats(&self) -> ClaimqResult<QueueStats> {
        let rows = sqlx::query(&format!(
            "SELECT status, COUNT(*) AS count FROM {} GROUP BY status",
            self.tables.tasks
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify(e, self.lock_timeout))?;

        let mut stats = QueueStats::default();
        for row in &rows {
            let status: TaskStatus = row
                .try_get::<String, _>("status")?
                .parse()
                .map_err(decode_error)?;
            let count = row.try_get::<i64, _>("count")?.max(0) as u64;
            match status {
                TaskStatus::Queued => stats.queued = count,
                TaskStatus::Claimed => stats.claimed = count,
                TaskStatus::Running => stats.running = count,
                TaskStatus::Completed => stats.completed = count,
                TaskStatus::Failed => stats.failed = count,
                TaskStatus::Cancelled => stats.cancelled = count,
            }
        }

        Ok(stats)
    }

    async fn health_check(&self) -> ClaimqResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, self.lock_timeout))?;
        Ok(())
    }
}

/// ORDER BY body and LIMIT suffix for a strategy.
///
/// Deterministic strategies let the database pick the single winner; weighted
/// selection needs the whole candidate set.
fn order_clause(strategy: &ClaimStrategy, order: PriorityOrder) -> (&'static str, &'static str) {
    match (strategy, order) {
        (ClaimStrategy::Fifo, _) => ("created_at ASC, id ASC", " LIMIT 1"),
        (ClaimStrategy::Lifo, _) => ("created_at DESC, id DESC", " LIMIT 1"),
        (ClaimStrategy::Priority, PriorityOrder::HigherFirst) => {
            ("priority DESC, created_at ASC, id ASC", " LIMIT 1")
        }
        (ClaimStrategy::Priority, PriorityOrder::LowerFirst) => {
            ("priority ASC, created_at ASC, id ASC", " LIMIT 1")
        }
        (ClaimStrategy::WeightedRandom, _) => ("created_at ASC, id ASC", ""),
    }
}

async fn write_task(
    conn: &mut PgConnection,
    tables: &Tables,
    task: &Task,
    lock_timeout: Duration,
) -> ClaimqResult<()> {
    sqlx::query(&format!(
        r#"
        UPDATE {} SET
            status = $2,
            retry_count = $3,
            claimed_at = $4,
            completed_at = $5,
            run_after = $6,
            claimed_by = $7,
            result_data = $8,
            error_message = $9
        WHERE id = $1
        "#,
        tables.tasks
    ))
    .bind(task.id)
    .bind(task.status.as_str())
    .bind(i32::try_from(task.retry_count).unwrap_or(i32::MAX))
    .bind(task.claimed_at)
    .bind(task.completed_at)
    .bind(task.run_after)
    .bind(task.claimed_by.as_deref())
    .bind(task.result_data.as_ref())
    .bind(task.error_message.as_deref())
    .execute(&mut *conn)
    .await
    .map_err(|e| classify(e, lock_timeout))?;

    Ok(())
}

fn task_from_row(row: &PgRow) -> ClaimqResult<Task> {
    let status: String = row.try_get("status")?;
    Ok(Task {
        id: row.try_get("id")?,
        task_type: row.try_get("task_type")?,
        parameters: row.try_get("parameters")?,
        priority: row.try_get("priority")?,
        status: status.parse().map_err(decode_error)?,
        retry_count: row.try_get::<i32, _>("retry_count")?.max(0) as u32,
        max_retries: row.try_get::<i32, _>("max_retries")?.max(0) as u32,
        created_at: row.try_get("created_at")?,
        claimed_at: row.try_get("claimed_at")?,
        completed_at: row.try_get("completed_at")?,
        run_after: row.try_get("run_after")?,
        claimed_by: row.try_get("claimed_by")?,
        result_data: row.try_get("result_data")?,
        error_message: row.try_get("error_message")?,
    })
}

fn decode_error(message: String) -> ClaimqError {
    ClaimqError::Database(sqlx::Error::Decode(message.into()))
}

/// Map driver errors onto the claim protocol's error classes.
fn classify(err: sqlx::Error, lock_timeout: Duration) -> ClaimqError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) {
            return ClaimqError::StoreBusy {
                waited_ms: lock_timeout.as_millis() as u64,
            };
        }
    }

    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => ClaimqError::unavailable("PostgreSQL unreachable", err),
        other => ClaimqError::Database(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_prefix_validation() {
        let tables = Tables::new("jobs_v2").unwrap();
        assert_eq!(tables.tasks, "jobs_v2_tasks");
        assert_eq!(tables.events, "jobs_v2_events");
        assert_eq!(tables.heartbeats, "jobs_v2_heartbeats");

        assert!(Tables::new("").is_err());
        assert!(Tables::new("tasks; DROP TABLE x").is_err());
    }

    #[test]
    fn test_order_clause() {
        assert_eq!(
            order_clause(&ClaimStrategy::Lifo, PriorityOrder::HigherFirst),
            ("created_at DESC, id DESC", " LIMIT 1")
        );
        assert_eq!(
            order_clause(&ClaimStrategy::Priority, PriorityOrder::LowerFirst).0,
            "priority ASC, created_at ASC, id ASC"
        );
        assert_eq!(
            order_clause(&ClaimStrategy::WeightedRandom, PriorityOrder::HigherFirst).1,
            ""
        );
    }

    #[test]
    fn test_pool_errors_are_fatal() {
        let err = classify(sqlx::Error::PoolTimedOut, Duration::from_secs(1));
        assert!(err.is_fatal());
        assert!(!err.is_transient());
    }

    // The tests below need a live server and are skipped unless
    // CLAIMQ_DATABASE_URL is set. Each one works on its own table prefix.

    async fn live_store(lock_timeout: Duration) -> Option<PostgresStore> {
        let url = std::env::var("CLAIMQ_DATABASE_URL").ok()?;
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let config = PostgresConfig {
            connection_string: url,
            pool_size: 4,
            table_prefix: format!("claimq_test_{}", &run_id[..12]),
            ..Default::default()
        };

        let store = PostgresStore::connect(&config, lock_timeout, 3)
            .await
            .unwrap();
        store.ensure_schema().await.unwrap();
        Some(store)
    }

    async fn drop_tables(store: &PostgresStore) {
        let Tables {
            tasks,
            events,
            heartbeats,
        } = &store.tables;
        sqlx::query(&format!("DROP TABLE IF EXISTS {tasks}, {events}, {heartbeats}"))
            .execute(store.pool())
            .await
            .unwrap();
    }

    async fn claim_next(store: &PostgresStore, strategy: ClaimStrategy, worker_id: &str) -> Task {
        let mut tx = store.begin_exclusive().await.unwrap();
        let candidates = tx
            .candidates(&strategy, PriorityOrder::HigherFirst, Utc::now())
            .await
            .unwrap();
        let claimed = tx
            .mark_claimed(candidates[0].id, worker_id, Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        claimed
    }

    #[tokio::test]
    async fn test_priority_claim_and_completion() {
        let Some(store) = live_store(Duration::from_secs(1)).await else {
            return;
        };

        for priority in [1, 5, 3] {
            store
                .enqueue(NewTask::new("email", serde_json::json!({ "p": priority })).with_priority(priority))
                .await
                .unwrap();
        }

        let claimed = claim_next(&store, ClaimStrategy::Priority, "w1").await;
        assert_eq!(claimed.priority, 5);
        assert_eq!(claimed.status, TaskStatus::Claimed);
        assert_eq!(claimed.claimed_by.as_deref(), Some("w1"));

        let running = store.mark_running(claimed.id, "w1").await.unwrap();
        assert_eq!(running.status, TaskStatus::Running);

        let disposition = store
            .report(
                claimed.id,
                "w1",
                &TaskOutcome::Completed(Some(serde_json::json!("sent"))),
                Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(disposition, ReportDisposition::Completed);

        let stored = store.get_task(claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result_data, Some(serde_json::json!("sent")));
        assert!(stored.claimed_by.is_none());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.queued, 2);

        drop_tables(&store).await;
    }

    #[tokio::test]
    async fn test_held_lock_reports_busy() {
        let Some(store) = live_store(Duration::from_millis(100)).await else {
            return;
        };

        let held = store.begin_exclusive().await.unwrap();
        let err = store.begin_exclusive().await.err().unwrap();
        assert!(matches!(err, ClaimqError::StoreBusy { .. }));
        assert!(err.is_transient());

        held.rollback().await.unwrap();
        let retry = store.begin_exclusive().await.unwrap();
        retry.rollback().await.unwrap();

        drop_tables(&store).await;
    }

    #[tokio::test]
    async fn test_failed_reports_requeue_until_retries_run_out() {
        let Some(store) = live_store(Duration::from_secs(1)).await else {
            return;
        };

        let task = store
            .enqueue(NewTask::new("flaky", serde_json::json!({})).with_max_retries(1))
            .await
            .unwrap();
        let failure = TaskOutcome::Failed("upstream 503".to_string());

        claim_next(&store, ClaimStrategy::Fifo, "w1").await;
        let first = store
            .report(task.id, "w1", &failure, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(first, ReportDisposition::Requeued { retry_count: 1 });

        claim_next(&store, ClaimStrategy::Fifo, "w2").await;
        let second = store
            .report(task.id, "w2", &failure, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(second, ReportDisposition::Failed);

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("upstream 503"));

        let kinds: Vec<TaskEventKind> = store
            .events(task.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&TaskEventKind::Requeued));
        assert_eq!(kinds.last(), Some(&TaskEventKind::Failed));

        drop_tables(&store).await;
    }

    #[tokio::test]
    async fn test_reclaim_requeues_silent_claims() {
        let Some(store) = live_store(Duration::from_secs(1)).await else {
            return;
        };

        let task = store
            .enqueue(NewTask::new("report", serde_json::json!({})))
            .await
            .unwrap();
        claim_next(&store, ClaimStrategy::Lifo, "ghost").await;
        store
            .upsert_heartbeat(&WorkerHeartbeat {
                worker_id: "ghost".to_string(),
                last_heartbeat: Utc::now() - chrono::Duration::hours(1),
                tasks_processed: 0,
                tasks_failed: 0,
            })
            .await
            .unwrap();

        let reclaimed = store
            .reclaim_orphaned(Utc::now() - chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(reclaimed, vec![task.id]);

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.claimed_by.is_none());

        let late = store
            .report(task.id, "ghost", &TaskOutcome::Completed(None), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(
            late,
            ReportDisposition::Unchanged {
                status: TaskStatus::Queued
            }
        );

        drop_tables(&store).await;
    }
}
