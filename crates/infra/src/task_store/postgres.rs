//! Postgres-backed task store.
//!
//! One `tasks` row per task. Claims use `FOR UPDATE SKIP LOCKED` so that any
//! number of worker processes can poll the same table without blocking each
//! other or double-claiming. Every other state change loads the row under
//! `FOR UPDATE`, applies the same pure transition methods the in-memory
//! store uses, and writes the row back in the same transaction.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (insert) / `Storage` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed | N/A | `Storage` |
//! | Other | N/A | `Storage` |
//!
//! ## Runtime
//!
//! [`TaskStore`] is synchronous. The store keeps a handle to the tokio runtime
//! that owns the pool and blocks on it, so methods must be called from worker
//! threads or `spawn_blocking`, never directly from an async task.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{debug, instrument, warn};

use taskforge_core::{OwnerId, TaskId, WorkerId};
use taskforge_tasks::{
    Lane, LaneDepths, Lease, PolicyTable, Task, TaskStatus, Transition, TransitionError,
};

use super::in_memory::expired_lease;
use super::r#trait::{LeaseState, StoreError, TaskStats, TaskStore};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id                UUID PRIMARY KEY,
        task_type         TEXT NOT NULL,
        lane              TEXT NOT NULL,
        status            TEXT NOT NULL,
        owner_id          TEXT NOT NULL,
        input_payload     JSONB NOT NULL,
        result_payload    JSONB,
        error_detail      TEXT,
        attempt_count     INTEGER NOT NULL DEFAULT 0,
        created_at        TIMESTAMPTZ NOT NULL,
        updated_at        TIMESTAMPTZ NOT NULL,
        completed_at      TIMESTAMPTZ,
        available_at      TIMESTAMPTZ NOT NULL,
        started_at        TIMESTAMPTZ,
        lease_worker_id   UUID,
        lease_attempt     INTEGER,
        lease_expires_at  TIMESTAMPTZ,
        history           JSONB NOT NULL DEFAULT '[]'::jsonb
    )
    "#,
    "CREATE INDEX IF NOT EXISTS tasks_claim_idx ON tasks (status, lane, available_at, created_at)",
    "CREATE INDEX IF NOT EXISTS tasks_owner_idx ON tasks (owner_id, created_at)",
    "CREATE INDEX IF NOT EXISTS tasks_lease_idx ON tasks (status, lease_expires_at)",
];

const COLUMNS: &str = "id, task_type, status, owner_id, input_payload, result_payload, \
    error_detail, attempt_count, created_at, updated_at, completed_at, available_at, \
    started_at, lease_worker_id, lease_attempt, lease_expires_at, history";

/// Postgres-backed task store.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
    handle: Handle,
}

impl PostgresTaskStore {
    /// `handle` must belong to the runtime the pool was created on.
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    /// Create the `tasks` table and its indexes if missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.handle.block_on(fut)
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, task_type = %task.task_type), err)]
    async fn insert_task(&self, task: Task) -> Result<TaskId, StoreError> {
        let id = task.id;
        let row = TaskRow::from_task(&task)?;
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (
                id, task_type, lane, status, owner_id, input_payload, result_payload,
                error_detail, attempt_count, created_at, updated_at, completed_at,
                available_at, started_at, lease_worker_id, lease_attempt,
                lease_expires_at, history
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(row.id)
        .bind(task.task_type.as_str())
        .bind(task.lane().as_str())
        .bind(task.status.as_str())
        .bind(task.owner_id.as_str())
        .bind(&task.input_payload)
        .bind(&task.result_payload)
        .bind(&task.error_detail)
        .bind(row.attempt_count)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.completed_at)
        .bind(task.available_at)
        .bind(task.started_at)
        .bind(row.lease_worker_id)
        .bind(row.lease_attempt)
        .bind(row.lease_expires_at)
        .bind(&row.history)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(id),
            Err(e) if is_unique_violation(&e) => Err(StoreError::AlreadyExists(id)),
            Err(e) => Err(map_sqlx_error("insert", e)),
        }
    }

    async fn fetch_one(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM tasks WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(|r| task_from_row(&r)).transpose()
    }

    async fn fetch_where(
        &self,
        operation: &str,
        filter: &str,
        arg: &str,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM tasks WHERE {filter} = $1 ORDER BY created_at, id LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(arg)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(task_from_row).collect()
    }

    async fn fetch_depths(&self, now: DateTime<Utc>) -> Result<LaneDepths, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT lane, COUNT(*) AS depth
            FROM tasks
            WHERE status = 'pending' AND available_at <= $1
            GROUP BY lane
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("ready_depths", e))?;

        let mut depths = LaneDepths::default();
        for row in rows {
            let lane: String = row.try_get("lane").map_err(|e| map_sqlx_error("ready_depths", e))?;
            let depth: i64 = row.try_get("depth").map_err(|e| map_sqlx_error("ready_depths", e))?;
            let lane: Lane = lane
                .parse()
                .map_err(|e| StoreError::Storage(format!("bad lane in tasks table: {e}")))?;
            let depth = usize::try_from(depth).unwrap_or(0);
            match lane {
                Lane::High => depths.high += depth,
                Lane::Medium => depths.medium += depth,
                Lane::Low => depths.low += depth,
            }
        }
        Ok(depths)
    }

    #[instrument(skip(self), fields(lane = %lane, worker_id = %worker_id), err)]
    async fn claim(
        &self,
        lane: Lane,
        worker_id: WorkerId,
        now: DateTime<Utc>,
        lease_for: Duration,
    ) -> Result<Option<(Task, Lease)>, StoreError> {
        let mut tx = self.begin().await?;
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM tasks
            WHERE status = 'pending' AND lane = $1 AND available_at <= $2
            ORDER BY created_at, id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        );
        let row = sqlx::query(&sql)
            .bind(lane.as_str())
            .bind(now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        let Some(row) = row else {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(None);
        };
        let mut task = task_from_row(&row)?;
        let lease = task
            .claim(worker_id, now, lease_for)
            .map_err(|e| StoreError::Storage(format!("claim of {} failed: {e}", task.id)))?;
        write_task(&mut tx, &task).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        debug!(task_id = %task.id, attempt = lease.attempt, "task claimed");
        Ok(Some((task, lease)))
    }

    /// Load one row under `FOR UPDATE`, run `f`, write back on success.
    ///
    /// Returns `None` if the row does not exist.
    async fn with_locked<R>(
        &self,
        operation: &str,
        id: TaskId,
        f: impl FnOnce(&mut Task) -> Result<R, TransitionError>,
    ) -> Result<Option<(Result<R, TransitionError>, TaskStatus)>, StoreError> {
        let mut tx = self.begin().await?;
        let sql = format!("SELECT {COLUMNS} FROM tasks WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        let Some(row) = row else {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(None);
        };

        let mut task = task_from_row(&row)?;
        let out = f(&mut task);
        if out.is_ok() {
            write_task(&mut tx, &task).await?;
            tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        } else {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
        }
        Ok(Some((out, task.status)))
    }

    async fn reclaim(
        &self,
        now: DateTime<Utc>,
        policies: &PolicyTable,
    ) -> Result<Vec<Task>, StoreError> {
        let mut tx = self.begin().await?;
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM tasks
            WHERE status = 'processing' AND (lease_expires_at IS NULL OR lease_expires_at <= $1)
            FOR UPDATE SKIP LOCKED
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("reclaim_expired", e))?;

        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut task = task_from_row(row)?;
            let Some(transition) = policies
                .get(task.task_type)
                .decide(task.attempt_count, expired_lease())
            else {
                continue;
            };
            if let Err(e) = task.reclaim(transition, now) {
                warn!(task_id = %task.id, error = %e, "expired lease could not be reclaimed");
                continue;
            }
            write_task(&mut tx, &task).await?;
            reclaimed.push(task);
        }
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(reclaimed)
    }

    async fn fetch_stats(&self) -> Result<TaskStats, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;
        let mut stats = TaskStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let status: TaskStatus = status
                .parse()
                .map_err(|e| StoreError::Storage(format!("bad status in tasks table: {e}")))?;
            stats.add(status, usize::try_from(n).unwrap_or(0));
        }
        Ok(stats)
    }
}

impl TaskStore for PostgresTaskStore {
    fn insert(&self, task: Task) -> Result<TaskId, StoreError> {
        self.block_on(self.insert_task(task))
    }

    fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.block_on(self.fetch_one(id))
    }

    fn list_by_owner(&self, owner: &OwnerId, limit: usize) -> Result<Vec<Task>, StoreError> {
        self.block_on(self.fetch_where("list_by_owner", "owner_id", owner.as_str(), limit))
    }

    fn list_by_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>, StoreError> {
        self.block_on(self.fetch_where("list_by_status", "status", status.as_str(), limit))
    }

    fn ready_depths(&self, now: DateTime<Utc>) -> Result<LaneDepths, StoreError> {
        self.block_on(self.fetch_depths(now))
    }

    fn claim_next(
        &self,
        lane: Lane,
        worker_id: WorkerId,
        now: DateTime<Utc>,
        lease_for: Duration,
    ) -> Result<Option<(Task, Lease)>, StoreError> {
        self.block_on(self.claim(lane, worker_id, now, lease_for))
    }

    fn heartbeat(
        &self,
        lease: &Lease,
        now: DateTime<Utc>,
        extend: Duration,
    ) -> Result<LeaseState, StoreError> {
        let out = self.block_on(self.with_locked("heartbeat", lease.task_id, |t| {
            t.extend_lease(lease, now, extend)
        }))?;
        Ok(match out {
            Some((Ok(refreshed), _)) => LeaseState::Held(refreshed),
            Some((Err(_), status)) => LeaseState::Lost {
                status: Some(status),
            },
            None => LeaseState::Lost { status: None },
        })
    }

    fn finish(
        &self,
        lease: &Lease,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let out = self.block_on(self.with_locked("finish", lease.task_id, |t| {
            t.apply(lease, transition, now).map(|()| t.clone())
        }))?;
        match out {
            Some((Ok(task), _)) => Ok(Some(task)),
            Some((Err(_), _)) => Ok(None),
            None => Err(StoreError::NotFound(lease.task_id)),
        }
    }

    fn cancel(&self, id: TaskId, now: DateTime<Utc>) -> Result<Task, StoreError> {
        let out = self.block_on(self.with_locked("cancel", id, |t| t.cancel(now).map(|()| t.clone())))?;
        match out {
            Some((Ok(task), _)) => Ok(task),
            Some((Err(TransitionError::AlreadyTerminal { status }), _)) => {
                Err(StoreError::AlreadyTerminal { id, status })
            }
            Some((Err(e), _)) => Err(StoreError::Storage(format!("cancel of {id} failed: {e}"))),
            None => Err(StoreError::NotFound(id)),
        }
    }

    fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
        policies: &PolicyTable,
    ) -> Result<Vec<Task>, StoreError> {
        self.block_on(self.reclaim(now, policies))
    }

    fn stats(&self) -> Result<TaskStats, StoreError> {
        self.block_on(self.fetch_stats())
    }
}

async fn write_task(tx: &mut Transaction<'_, Postgres>, task: &Task) -> Result<(), StoreError> {
    let row = TaskRow::from_task(task)?;
    sqlx::query(
        r#"
        UPDATE tasks SET
            status = $2,
            result_payload = $3,
            error_detail = $4,
            attempt_count = $5,
            updated_at = $6,
            completed_at = $7,
            available_at = $8,
            started_at = $9,
            lease_worker_id = $10,
            lease_attempt = $11,
            lease_expires_at = $12,
            history = $13
        WHERE id = $1
        "#,
    )
    .bind(row.id)
    .bind(task.status.as_str())
    .bind(&task.result_payload)
    .bind(&task.error_detail)
    .bind(row.attempt_count)
    .bind(task.updated_at)
    .bind(task.completed_at)
    .bind(task.available_at)
    .bind(task.started_at)
    .bind(row.lease_worker_id)
    .bind(row.lease_attempt)
    .bind(row.lease_expires_at)
    .bind(&row.history)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("write_task", e))?;
    Ok(())
}

/// Column values that need conversion from the domain type.
struct TaskRow {
    id: uuid::Uuid,
    attempt_count: i32,
    lease_worker_id: Option<uuid::Uuid>,
    lease_attempt: Option<i32>,
    lease_expires_at: Option<DateTime<Utc>>,
    history: serde_json::Value,
}

impl TaskRow {
    fn from_task(task: &Task) -> Result<Self, StoreError> {
        let history = serde_json::to_value(&task.history)
            .map_err(|e| StoreError::Storage(format!("failed to serialize history: {e}")))?;
        Ok(Self {
            id: *task.id.as_uuid(),
            attempt_count: to_i32(task.attempt_count),
            lease_worker_id: task.lease.as_ref().map(|l| *l.worker_id.as_uuid()),
            lease_attempt: task.lease.as_ref().map(|l| to_i32(l.attempt)),
            lease_expires_at: task.lease.as_ref().map(|l| l.expires_at),
            history,
        })
    }
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    let get_err = |e: sqlx::Error| StoreError::Storage(format!("failed to decode task row: {e}"));
    let bad = |what: &str, e: taskforge_core::DomainError| {
        StoreError::Storage(format!("bad {what} in tasks table: {e}"))
    };

    let id = TaskId::from_uuid(row.try_get("id").map_err(get_err)?);
    let task_type: String = row.try_get("task_type").map_err(get_err)?;
    let status: String = row.try_get("status").map_err(get_err)?;
    let owner_id: String = row.try_get("owner_id").map_err(get_err)?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(get_err)?;
    let lease_worker_id: Option<uuid::Uuid> = row.try_get("lease_worker_id").map_err(get_err)?;
    let lease_attempt: Option<i32> = row.try_get("lease_attempt").map_err(get_err)?;
    let lease_expires_at: Option<DateTime<Utc>> = row.try_get("lease_expires_at").map_err(get_err)?;
    let history: serde_json::Value = row.try_get("history").map_err(get_err)?;

    let lease = match (lease_worker_id, lease_attempt, lease_expires_at) {
        (Some(worker), Some(attempt), Some(expires_at)) => Some(Lease {
            task_id: id,
            worker_id: WorkerId::from_uuid(worker),
            attempt: u32::try_from(attempt).unwrap_or(0),
            expires_at,
        }),
        _ => None,
    };

    Ok(Task {
        id,
        task_type: task_type.parse().map_err(|e| bad("task_type", e))?,
        status: status.parse().map_err(|e| bad("status", e))?,
        owner_id: owner_id.parse().map_err(|e| bad("owner_id", e))?,
        input_payload: row.try_get("input_payload").map_err(get_err)?,
        result_payload: row.try_get("result_payload").map_err(get_err)?,
        error_detail: row.try_get("error_detail").map_err(get_err)?,
        attempt_count: u32::try_from(attempt_count).unwrap_or(0),
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
        completed_at: row.try_get("completed_at").map_err(get_err)?,
        available_at: row.try_get("available_at").map_err(get_err)?,
        started_at: row.try_get("started_at").map_err(get_err)?,
        lease,
        history: serde_json::from_value(history)
            .map_err(|e| StoreError::Storage(format!("failed to decode history: {e}")))?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}
