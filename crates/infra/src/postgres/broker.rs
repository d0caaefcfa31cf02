use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{instrument, warn};

use super::{execute, fetch_all, fetch_optional, millis};
use crate::jobs::{
    BrokerError, BrokerStats, EnqueueOptions, LEASE_EXPIRED, StaleRecovery, Task, TaskBroker, TaskId,
    TaskInfo,
    TaskKind, TaskMessage, TaskState,
};

const COLUMNS: &str = "id, kind, payload, queue, state, max_retry, retried, timeout_ms, \
    retention_ms, process_at, last_error, last_failed_at, created_at, updated_at, completed_at";

/// Durable [`TaskBroker`] on the `job_tasks` table.
///
/// Workers claim rows with `FOR UPDATE SKIP LOCKED`, so any number of
/// worker processes can share one database. `enqueue` joins the ambient
/// transaction, letting producers enqueue atomically with their own writes.
#[derive(Debug, Clone)]
pub struct PgTaskBroker {
    pool: PgPool,
}

impl PgTaskBroker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Work out why a transition matched no row.
    async fn transition_error(&self, id: TaskId, expected: &'static str) -> BrokerError {
        match self.get(id).await {
            Ok(Some(msg)) => BrokerError::InvalidState {
                id,
                state: msg.state,
                expected,
            },
            Ok(None) => BrokerError::NotFound(id),
            Err(e) => e,
        }
    }

    async fn expect_one(
        &self,
        id: TaskId,
        expected: &'static str,
        affected: u64,
    ) -> Result<(), BrokerError> {
        if affected == 0 {
            return Err(self.transition_error(id, expected).await);
        }
        Ok(())
    }

    /// Archive a row this build cannot decode, so it stops being claimed.
    async fn quarantine(&self, id: TaskId, error: &str) -> Result<(), BrokerError> {
        let now = Utc::now();
        execute::<BrokerError>(
            &self.pool,
            sqlx::query(
                "UPDATE job_tasks SET state = 'archived', last_error = $2, last_failed_at = $3, updated_at = $3 \
                 WHERE id = $1",
            )
            .bind(id.0)
            .bind(error)
            .bind(now),
        )
        .await?;
        Ok(())
    }
}

/// A stored row that could not be turned into a [`TaskMessage`].
#[derive(Debug)]
enum RowError {
    Sql(sqlx::Error),
    UnknownKind { id: TaskId, kind: String },
    Corrupt(String),
}

impl From<sqlx::Error> for RowError {
    fn from(e: sqlx::Error) -> Self {
        Self::Sql(e)
    }
}

impl From<RowError> for BrokerError {
    fn from(e: RowError) -> Self {
        match e {
            RowError::Sql(e) => BrokerError::Database(e),
            RowError::UnknownKind { id, kind } => {
                BrokerError::Storage(format!("task {id} has unknown kind {kind}"))
            }
            RowError::Corrupt(msg) => BrokerError::Storage(msg),
        }
    }
}

fn non_negative(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn message_from_row(row: &PgRow) -> Result<TaskMessage, RowError> {
    let id = TaskId::from_uuid(row.try_get("id")?);
    let kind: String = row.try_get("kind")?;
    let kind: TaskKind = kind
        .parse()
        .map_err(|_| RowError::UnknownKind { id, kind: kind.clone() })?;
    let state: String = row.try_get("state")?;
    let state: TaskState = state.parse().map_err(RowError::Corrupt)?;
    let max_retry: i32 = row.try_get("max_retry")?;
    let retried: i32 = row.try_get("retried")?;

    Ok(TaskMessage {
        id,
        kind,
        payload: row.try_get("payload")?,
        queue: row.try_get("queue")?,
        state,
        max_retry: u32::try_from(max_retry).unwrap_or(0),
        retried: u32::try_from(retried).unwrap_or(0),
        timeout: Duration::from_millis(non_negative(row.try_get("timeout_ms")?)),
        retention: Duration::from_millis(non_negative(row.try_get("retention_ms")?)),
        process_at: row.try_get("process_at")?,
        last_error: row.try_get("last_error")?,
        last_failed_at: row.try_get("last_failed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[async_trait]
impl TaskBroker for PgTaskBroker {
    #[instrument(skip(self, task, opts), fields(kind = %task.kind, queue = %opts.queue), err)]
    async fn enqueue(&self, task: Task, opts: EnqueueOptions) -> Result<TaskInfo, BrokerError> {
        let msg = TaskMessage::new(task, opts, Utc::now());
        execute::<BrokerError>(
            &self.pool,
            sqlx::query(
                "INSERT INTO job_tasks (id, kind, payload, queue, state, max_retry, retried, timeout_ms, \
                 retention_ms, process_at, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $8, $9, $10, $10)",
            )
            .bind(msg.id.0)
            .bind(msg.kind.as_str())
            .bind(&msg.payload)
            .bind(&msg.queue)
            .bind(msg.state.as_str())
            .bind(i32::try_from(msg.max_retry).unwrap_or(i32::MAX))
            .bind(millis(msg.timeout))
            .bind(millis(msg.retention))
            .bind(msg.process_at)
            .bind(msg.created_at),
        )
        .await?;
        Ok(TaskInfo::from(&msg))
    }

    async fn dequeue(&self, queues: &[String]) -> Result<Option<TaskMessage>, BrokerError> {
        let sql = format!(
            "UPDATE job_tasks SET state = 'active', updated_at = $2 \
             WHERE id = ( \
                 SELECT id FROM job_tasks \
                 WHERE queue = $1 AND state IN ('pending', 'scheduled', 'retry') AND process_at <= $2 \
                 ORDER BY process_at, created_at, id \
                 FOR UPDATE SKIP LOCKED \
                 LIMIT 1 \
             ) \
             RETURNING {COLUMNS}"
        );

        for queue in queues {
            loop {
                let row = fetch_optional::<BrokerError>(
                    &self.pool,
                    sqlx::query(&sql).bind(queue).bind(Utc::now()),
                )
                .await?;
                let Some(row) = row else { break };

                match message_from_row(&row) {
                    Ok(msg) => return Ok(Some(msg)),
                    Err(RowError::UnknownKind { id, kind }) => {
                        warn!(task_id = %id, %kind, "archiving task of unknown kind");
                        self.quarantine(id, &format!("unknown task kind: {kind}")).await?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(None)
    }

    async fn complete(&self, msg: &TaskMessage) -> Result<(), BrokerError> {
        let result = if msg.retention.is_zero() {
            execute::<BrokerError>(
                &self.pool,
                sqlx::query("DELETE FROM job_tasks WHERE id = $1 AND state = 'active'").bind(msg.id.0),
            )
            .await?
        } else {
            execute::<BrokerError>(
                &self.pool,
                sqlx::query(
                    "UPDATE job_tasks SET state = 'completed', completed_at = $2, updated_at = $2 \
                     WHERE id = $1 AND state = 'active'",
                )
                .bind(msg.id.0)
                .bind(Utc::now()),
            )
            .await?
        };
        self.expect_one(msg.id, "active", result.rows_affected()).await
    }

    async fn retry(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), BrokerError> {
        let result = execute::<BrokerError>(
            &self.pool,
            sqlx::query(
                "UPDATE job_tasks SET state = 'retry', retried = retried + 1, process_at = $2, \
                 last_error = $3, last_failed_at = $4, updated_at = $4 \
                 WHERE id = $1 AND state = 'active'",
            )
            .bind(msg.id.0)
            .bind(process_at)
            .bind(error)
            .bind(Utc::now()),
        )
        .await?;
        self.expect_one(msg.id, "active", result.rows_affected()).await
    }

    async fn archive(&self, msg: &TaskMessage, error: &str) -> Result<(), BrokerError> {
        let result = execute::<BrokerError>(
            &self.pool,
            sqlx::query(
                "UPDATE job_tasks SET state = 'archived', last_error = $2, last_failed_at = $3, updated_at = $3 \
                 WHERE id = $1 AND state = 'active'",
            )
            .bind(msg.id.0)
            .bind(error)
            .bind(Utc::now()),
        )
        .await?;
        self.expect_one(msg.id, "active", result.rows_affected()).await
    }

    async fn recover_stale(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<StaleRecovery, BrokerError> {
        let sql = format!(
            "UPDATE job_tasks SET \
                 state = CASE WHEN retried >= max_retry THEN 'archived' ELSE 'retry' END, \
                 retried = CASE WHEN retried >= max_retry THEN retried ELSE retried + 1 END, \
                 process_at = CASE WHEN retried >= max_retry THEN process_at ELSE $1 END, \
                 last_error = $3, last_failed_at = $1, updated_at = $1 \
             WHERE state = 'active' \
               AND updated_at + make_interval(secs => (timeout_ms + $2)::double precision / 1000.0) <= $1 \
             RETURNING {COLUMNS}"
        );
        let rows = fetch_all::<BrokerError>(
            &self.pool,
            sqlx::query(&sql)
                .bind(now)
                .bind(millis(grace))
                .bind(LEASE_EXPIRED),
        )
        .await?;

        let mut recovery = StaleRecovery::default();
        for row in &rows {
            match message_from_row(row) {
                Ok(msg) if msg.state == TaskState::Archived => recovery.archived.push(msg),
                Ok(_) => recovery.retried += 1,
                Err(RowError::UnknownKind { id, kind }) => {
                    warn!(task_id = %id, %kind, "recovered task of unknown kind");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(recovery)
    }

    async fn purge_completed(&self, now: DateTime<Utc>) -> Result<usize, BrokerError> {
        let result = execute::<BrokerError>(
            &self.pool,
            sqlx::query(
                "DELETE FROM job_tasks WHERE state = 'completed' \
                 AND completed_at + make_interval(secs => retention_ms::double precision / 1000.0) <= $1",
            )
            .bind(now),
        )
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskMessage>, BrokerError> {
        let sql = format!("SELECT {COLUMNS} FROM job_tasks WHERE id = $1");
        let row = fetch_optional::<BrokerError>(&self.pool, sqlx::query(&sql).bind(id.0)).await?;
        row.map(|r| message_from_row(&r))
            .transpose()
            .map_err(BrokerError::from)
    }

    async fn list_archived(
        &self,
        queue: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TaskMessage>, BrokerError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM job_tasks \
             WHERE state = 'archived' AND ($1::text IS NULL OR queue = $1) \
             ORDER BY last_failed_at DESC NULLS LAST \
             LIMIT $2"
        );
        let rows = fetch_all::<BrokerError>(
            &self.pool,
            sqlx::query(&sql)
                .bind(queue)
                .bind(i64::try_from(limit).unwrap_or(i64::MAX)),
        )
        .await?;

        let mut archived = Vec::with_capacity(rows.len());
        for row in &rows {
            match message_from_row(row) {
                Ok(msg) => archived.push(msg),
                Err(RowError::UnknownKind { id, kind }) => {
                    warn!(task_id = %id, %kind, "skipping archived task of unknown kind");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(archived)
    }

    async fn requeue_archived(&self, id: TaskId) -> Result<TaskInfo, BrokerError> {
        let sql = format!(
            "UPDATE job_tasks SET state = 'pending', retried = 0, process_at = $2, updated_at = $2 \
             WHERE id = $1 AND state = 'archived' \
             RETURNING {COLUMNS}"
        );
        let row =
            fetch_optional::<BrokerError>(&self.pool, sqlx::query(&sql).bind(id.0).bind(Utc::now()))
                .await?;
        match row {
            Some(row) => Ok(TaskInfo::from(&message_from_row(&row)?)),
            None => Err(self.transition_error(id, "archived").await),
        }
    }

    async fn delete_archived(&self, id: TaskId) -> Result<(), BrokerError> {
        let result = execute::<BrokerError>(
            &self.pool,
            sqlx::query("DELETE FROM job_tasks WHERE id = $1 AND state = 'archived'").bind(id.0),
        )
        .await?;
        self.expect_one(id, "archived", result.rows_affected()).await
    }

    async fn stats(&self) -> Result<BrokerStats, BrokerError> {
        let rows = fetch_all::<BrokerError>(
            &self.pool,
            sqlx::query("SELECT state, COUNT(*) AS n FROM job_tasks GROUP BY state"),
        )
        .await?;

        let mut stats = BrokerStats::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            let state: TaskState = state.parse().map_err(BrokerError::Storage)?;
            stats.add(state, non_negative(n) as usize);
        }
        Ok(stats)
    }

    async fn pending_queues(&self) -> Result<Vec<String>, BrokerError> {
        let rows = fetch_all::<BrokerError>(
            &self.pool,
            sqlx::query(
                "SELECT DISTINCT queue FROM job_tasks \
                 WHERE state IN ('pending', 'scheduled', 'retry') ORDER BY queue",
            ),
        )
        .await?;
        rows.iter()
            .map(|r| r.try_get("queue").map_err(BrokerError::from))
            .collect()
    }
}
