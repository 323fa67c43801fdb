//! Postgres-backed job store.
//!
//! Every state change is a single `UPDATE ... WHERE <guard> RETURNING`, so a
//! write either applies atomically or reports zero rows. Concurrent claims of the
//! same row serialize on the row lock; the loser's guard (`status = 'pending'`)
//! no longer matches and it gets `None`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Database `23505` on insert | `AlreadyExists` |
//! | Row decode failure, unknown status/level | `Serialization` |
//! | Anything else (pool closed, network, other database errors) | `Unavailable` |
//!
//! Schema: `migrations/0001_jobs.sql`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{FromRow, PgPool, Postgres, Row};
use tracing::instrument;
use uuid::Uuid;

use tidecrm_core::{JobId, JobLogId, WorkspaceId};

use super::store::{
    CountQuery, EligibleQuery, JobFilter, JobPage, JobSort, JobStore, JobStoreError, Pagination,
};
use super::types::{FailureRecord, Job, JobAction, JobLog, JobStatus};

const JOB_COLUMNS: &str = "id, workspace_id, job_type, job_queue, priority, scheduled_for, created_at, \
    updated_at, status, attempts, max_attempts, worker_id, worker_heartbeat_at, started_at, \
    completed_at, failed_at, next_retry_at, retry_delay_seconds, payload, progress, result, \
    error_message, error_stack";

/// Postgres job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Create the job tables and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(include_str!("../../migrations/0001_jobs.sql"))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn fetch_job(
        &self,
        operation: &str,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<Option<Job>, JobStoreError> {
        let row = query
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        row.map(|r| decode_job(&r)).transpose()
    }

    async fn fetch_jobs(
        &self,
        operation: &str,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(decode_job).collect()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type), err)]
    async fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        let sql = format!(
            r#"
            INSERT INTO jobs (
                id, workspace_id, job_type, job_queue, priority, scheduled_for, created_at,
                updated_at, status, attempts, max_attempts, payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7, $8, $9, $10, $11)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job.id.as_uuid())
            .bind(job.workspace_id.as_uuid())
            .bind(&job.job_type)
            .bind(&job.job_queue)
            .bind(job.priority)
            .bind(job.scheduled_for)
            .bind(job.created_at)
            .bind(job.status.as_str())
            .bind(to_i32(job.attempts))
            .bind(to_i32(job.max_attempts))
            .bind(&job.payload)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    JobStoreError::AlreadyExists(job.id)
                } else {
                    map_sqlx_error("insert", e)
                }
            })?;
        decode_job(&row)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        self.fetch_job("get", sqlx::query(&sql).bind(job_id.as_uuid()))
            .await
    }

    #[instrument(skip(self, filter), fields(workspace_id = %workspace_id), err)]
    async fn list(
        &self,
        workspace_id: WorkspaceId,
        filter: &JobFilter,
        pagination: Pagination,
    ) -> Result<JobPage, JobStoreError> {
        const WHERE: &str = r#"
            WHERE workspace_id = $1
                AND ($2::text IS NULL OR status = $2)
                AND ($3::text IS NULL OR job_type = $3)
                AND ($4::timestamptz IS NULL OR created_at >= $4)
                AND ($5::timestamptz IS NULL OR created_at <= $5)
        "#;
        let status = filter.status.map(|s| s.as_str());

        let total: i64 = sqlx::query(&format!("SELECT COUNT(*) AS total FROM jobs {WHERE}"))
            .bind(workspace_id.as_uuid())
            .bind(status)
            .bind(filter.job_type.as_deref())
            .bind(filter.created_after)
            .bind(filter.created_before)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?
            .try_get("total")
            .map_err(|e| map_sqlx_error("list", e))?;

        let order = match filter.sort {
            JobSort::CreatedAtDesc => "created_at DESC, id DESC",
            JobSort::CreatedAtAsc => "created_at ASC, id ASC",
            JobSort::PriorityDesc => "priority DESC, created_at ASC, id ASC",
        };
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs {WHERE} ORDER BY {order} LIMIT $6 OFFSET $7");
        let jobs = self
            .fetch_jobs(
                "list",
                sqlx::query(&sql)
                    .bind(workspace_id.as_uuid())
                    .bind(status)
                    .bind(filter.job_type.as_deref())
                    .bind(filter.created_after)
                    .bind(filter.created_before)
                    .bind(i64::from(pagination.limit))
                    .bind(i64::try_from(pagination.offset()).unwrap_or(i64::MAX)),
            )
            .await?;

        let total = u64::try_from(total).unwrap_or(0);
        let has_more = total > pagination.offset() + jobs.len() as u64;
        Ok(JobPage {
            jobs,
            total,
            pagination,
            has_more,
        })
    }

    #[instrument(skip(self, query), fields(queue = %query.queue, limit = query.limit), err)]
    async fn fetch_eligible(&self, query: &EligibleQuery<'_>) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'pending'
                AND job_queue = $1
                AND job_type = ANY($2)
                AND (scheduled_for IS NULL OR scheduled_for <= $3)
                AND (next_retry_at IS NULL OR next_retry_at <= $3)
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT $4
            "#
        );
        self.fetch_jobs(
            "fetch_eligible",
            sqlx::query(&sql)
                .bind(query.queue)
                .bind(query.job_types)
                .bind(query.now)
                .bind(i64::try_from(query.limit).unwrap_or(i64::MAX)),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn claim(
        &self,
        job_id: JobId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'processing',
                attempts = attempts + 1,
                worker_id = $2,
                worker_heartbeat_at = $3,
                started_at = $3,
                updated_at = $3
            WHERE id = $1 AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        );
        self.fetch_job(
            "claim",
            sqlx::query(&sql).bind(job_id.as_uuid()).bind(worker_id).bind(now),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn heartbeat(
        &self,
        job_id: JobId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET worker_heartbeat_at = $3, updated_at = $3
            WHERE id = $1 AND status = 'processing' AND worker_id = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(worker_id)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, progress), err)]
    async fn update_progress(
        &self,
        job_id: JobId,
        worker_id: &str,
        progress: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET progress = $3, worker_heartbeat_at = $4, updated_at = $4
            WHERE id = $1 AND status = 'processing' AND worker_id = $2
            RETURNING {JOB_COLUMNS}
            "#
        );
        self.fetch_job(
            "update_progress",
            sqlx::query(&sql)
                .bind(job_id.as_uuid())
                .bind(worker_id)
                .bind(progress)
                .bind(now),
        )
        .await
    }

    #[instrument(skip(self, result), err)]
    async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'completed',
                completed_at = $3,
                result = $4,
                progress = '{{"percentage": 100}}'::jsonb,
                next_retry_at = NULL,
                updated_at = $3
            WHERE id = $1 AND status = 'processing' AND worker_id = $2
            RETURNING {JOB_COLUMNS}
            "#
        );
        self.fetch_job(
            "complete",
            sqlx::query(&sql)
                .bind(job_id.as_uuid())
                .bind(worker_id)
                .bind(now)
                .bind(result),
        )
        .await
    }

    #[instrument(skip(self, failure), err)]
    async fn reschedule(
        &self,
        job_id: JobId,
        worker_id: &str,
        failure: &FailureRecord,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let delay_secs = i32::try_from(delay.as_secs()).unwrap_or(i32::MAX);
        let next_retry_at = now + chrono::Duration::seconds(i64::from(delay_secs));
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'pending',
                worker_id = NULL,
                retry_delay_seconds = $4,
                next_retry_at = $5,
                error_message = $6,
                error_stack = $7,
                updated_at = $3
            WHERE id = $1 AND status = 'processing' AND worker_id = $2
            RETURNING {JOB_COLUMNS}
            "#
        );
        self.fetch_job(
            "reschedule",
            sqlx::query(&sql)
                .bind(job_id.as_uuid())
                .bind(worker_id)
                .bind(now)
                .bind(delay_secs)
                .bind(next_retry_at)
                .bind(&failure.message)
                .bind(failure.stack.as_deref()),
        )
        .await
    }

    #[instrument(skip(self, failure), err)]
    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        failure: &FailureRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'failed',
                failed_at = $3,
                completed_at = $3,
                next_retry_at = NULL,
                error_message = $4,
                error_stack = $5,
                updated_at = $3
            WHERE id = $1 AND status = 'processing' AND worker_id = $2
            RETURNING {JOB_COLUMNS}
            "#
        );
        self.fetch_job(
            "fail",
            sqlx::query(&sql)
                .bind(job_id.as_uuid())
                .bind(worker_id)
                .bind(now)
                .bind(&failure.message)
                .bind(failure.stack.as_deref()),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn transition(
        &self,
        job_id: JobId,
        action: JobAction,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let set = match action {
            JobAction::Cancel | JobAction::DeadLetter => "status = $3, updated_at = $2",
            JobAction::Retry => {
                "status = $3, updated_at = $2, attempts = 0, worker_id = NULL, \
                 worker_heartbeat_at = NULL, started_at = NULL, completed_at = NULL, \
                 failed_at = NULL, next_retry_at = NULL, retry_delay_seconds = NULL, \
                 progress = NULL, result = NULL, error_message = NULL, error_stack = NULL"
            }
        };
        let allowed: Vec<&str> = action.allowed_from().iter().map(|s| s.as_str()).collect();
        let sql = format!(
            "UPDATE jobs SET {set} WHERE id = $1 AND status = ANY($4) RETURNING {JOB_COLUMNS}"
        );

        let updated = self
            .fetch_job(
                "transition",
                sqlx::query(&sql)
                    .bind(job_id.as_uuid())
                    .bind(now)
                    .bind(action.target().as_str())
                    .bind(allowed),
            )
            .await?;
        if updated.is_some() {
            return Ok(updated);
        }

        let exists: bool = sqlx::query("SELECT EXISTS (SELECT 1 FROM jobs WHERE id = $1) AS found")
            .bind(job_id.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("transition", e))?
            .try_get("found")
            .map_err(|e| map_sqlx_error("transition", e))?;
        if exists {
            Ok(None)
        } else {
            Err(JobStoreError::NotFound(job_id))
        }
    }

    #[instrument(skip(self, failure), err)]
    async fn requeue_stale(
        &self,
        cutoff: DateTime<Utc>,
        failure: &FailureRecord,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        const STALE: &str = "status = 'processing' AND (worker_heartbeat_at IS NULL OR worker_heartbeat_at < $1)";

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("requeue_stale", e))?;

        let requeue = format!(
            r#"
            UPDATE jobs
            SET status = 'pending', worker_id = NULL, worker_heartbeat_at = NULL, updated_at = $2
            WHERE {STALE} AND attempts < max_attempts
            RETURNING {JOB_COLUMNS}
            "#
        );
        let mut rows = sqlx::query(&requeue)
            .bind(cutoff)
            .bind(now)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("requeue_stale", e))?;

        let exhaust = format!(
            r#"
            UPDATE jobs
            SET status = 'failed', failed_at = $2, completed_at = $2, next_retry_at = NULL,
                error_message = $3, error_stack = $4, updated_at = $2
            WHERE {STALE} AND attempts >= max_attempts
            RETURNING {JOB_COLUMNS}
            "#
        );
        rows.extend(
            sqlx::query(&exhaust)
                .bind(cutoff)
                .bind(now)
                .bind(&failure.message)
                .bind(failure.stack.as_deref())
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("requeue_stale", e))?,
        );

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("requeue_stale", e))?;

        let mut reaped = rows.iter().map(decode_job).collect::<Result<Vec<_>, _>>()?;
        reaped.sort_by(super::store::queue_order);
        Ok(reaped)
    }

    #[instrument(skip(self, log), fields(job_id = %log.job_id), err)]
    async fn append_log(&self, log: JobLog) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_logs (id, job_id, log_level, message, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(log.id.as_uuid())
        .bind(log.job_id.as_uuid())
        .bind(log.log_level.as_str())
        .bind(&log.message)
        .bind(&log.metadata)
        .bind(log.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_log", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn logs(&self, job_id: JobId) -> Result<Vec<JobLog>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, log_level, message, metadata, created_at
            FROM job_logs
            WHERE job_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("logs", e))?;

        rows.iter()
            .map(|row| {
                JobLogRow::from_row(row)
                    .map_err(|e| JobStoreError::Serialization(format!("failed to decode job log row: {e}")))?
                    .try_into()
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn count(&self, workspace_id: WorkspaceId, query: &CountQuery) -> Result<u64, JobStoreError> {
        let total: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM jobs
            WHERE workspace_id = $1
                AND status = $2
                AND ($3::text IS NULL OR job_queue = $3)
                AND ($4::timestamptz IS NULL OR
                    (CASE status
                        WHEN 'completed' THEN completed_at
                        WHEN 'failed' THEN failed_at
                        ELSE updated_at
                    END) >= $4)
            "#,
        )
        .bind(workspace_id.as_uuid())
        .bind(query.status.as_str())
        .bind(query.queue.as_deref())
        .bind(query.since)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count", e))?
        .try_get("total")
        .map_err(|e| map_sqlx_error("count", e))?;

        Ok(u64::try_from(total).unwrap_or(0))
    }

    #[instrument(skip(self), err)]
    async fn average_duration_ms(
        &self,
        workspace_id: WorkspaceId,
        since: DateTime<Utc>,
    ) -> Result<Option<f64>, JobStoreError> {
        sqlx::query(
            r#"
            SELECT (AVG(EXTRACT(EPOCH FROM (completed_at - started_at))) * 1000)::float8 AS avg_ms
            FROM jobs
            WHERE workspace_id = $1
                AND status = 'completed'
                AND completed_at >= $2
                AND started_at IS NOT NULL
            "#,
        )
        .bind(workspace_id.as_uuid())
        .bind(since)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("average_duration_ms", e))?
        .try_get("avg_ms")
        .map_err(|e| map_sqlx_error("average_duration_ms", e))
    }
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn to_u32(column: &str, n: i32) -> Result<u32, JobStoreError> {
    u32::try_from(n).map_err(|_| JobStoreError::Serialization(format!("negative {column}: {n}")))
}

fn decode_job(row: &PgRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row)
        .map_err(|e| JobStoreError::Serialization(format!("failed to decode job row: {e}")))?
        .try_into()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Unavailable(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) | sqlx::Error::Decode(_) => {
            JobStoreError::Serialization(format!("decode error in {operation}: {err}"))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        _ => JobStoreError::Unavailable(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

/// Database row representation for `jobs`.
#[derive(Debug)]
struct JobRow {
    id: Uuid,
    workspace_id: Uuid,
    job_type: String,
    job_queue: String,
    priority: i32,
    scheduled_for: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    status: String,
    attempts: i32,
    max_attempts: i32,
    worker_id: Option<String>,
    worker_heartbeat_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    retry_delay_seconds: Option<i32>,
    payload: JsonValue,
    progress: Option<JsonValue>,
    result: Option<JsonValue>,
    error_message: Option<String>,
    error_stack: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            workspace_id: row.try_get("workspace_id")?,
            job_type: row.try_get("job_type")?,
            job_queue: row.try_get("job_queue")?,
            priority: row.try_get("priority")?,
            scheduled_for: row.try_get("scheduled_for")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            worker_id: row.try_get("worker_id")?,
            worker_heartbeat_at: row.try_get("worker_heartbeat_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            failed_at: row.try_get("failed_at")?,
            next_retry_at: row.try_get("next_retry_at")?,
            retry_delay_seconds: row.try_get("retry_delay_seconds")?,
            payload: row.try_get("payload")?,
            progress: row.try_get("progress")?,
            result: row.try_get("result")?,
            error_message: row.try_get("error_message")?,
            error_stack: row.try_get("error_stack")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status: JobStatus = row
            .status
            .parse()
            .map_err(|e| JobStoreError::Serialization(format!("job {}: {e}", row.id)))?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            workspace_id: WorkspaceId::from_uuid(row.workspace_id),
            job_type: row.job_type,
            job_queue: row.job_queue,
            priority: row.priority,
            scheduled_for: row.scheduled_for,
            created_at: row.created_at,
            updated_at: row.updated_at,
            status,
            attempts: to_u32("attempts", row.attempts)?,
            max_attempts: to_u32("max_attempts", row.max_attempts)?,
            worker_id: row.worker_id,
            worker_heartbeat_at: row.worker_heartbeat_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            failed_at: row.failed_at,
            next_retry_at: row.next_retry_at,
            retry_delay_seconds: row
                .retry_delay_seconds
                .map(|s| to_u32("retry_delay_seconds", s))
                .transpose()?,
            payload: row.payload,
            progress: row.progress,
            result: row.result,
            error_message: row.error_message,
            error_stack: row.error_stack,
        })
    }
}

/// Database row representation for `job_logs`.
#[derive(Debug)]
struct JobLogRow {
    id: Uuid,
    job_id: Uuid,
    log_level: String,
    message: String,
    metadata: JsonValue,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobLogRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobLogRow {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            log_level: row.try_get("log_level")?,
            message: row.try_get("message")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<JobLogRow> for JobLog {
    type Error = JobStoreError;

    fn try_from(row: JobLogRow) -> Result<Self, Self::Error> {
        Ok(JobLog {
            id: JobLogId::from_uuid(row.id),
            job_id: JobId::from_uuid(row.job_id),
            log_level: row
                .log_level
                .parse()
                .map_err(|e| JobStoreError::Serialization(format!("job log {}: {e}", row.id)))?,
            message: row.message,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}
