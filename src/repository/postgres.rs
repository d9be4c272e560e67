//! PostgreSQL job repository.
//!
//! Jobs are stored one row per job in `stevedore_jobs`; structured fields (options,
//! payload, progress, logs, return value, stack trace) are JSONB. The claim in
//! [`acquire_lock`](JobRepository::acquire_lock) is a single conditional `UPDATE`, so
//! PostgreSQL's row locking makes it a compare-and-swap: of two concurrent claims on
//! one row, the second re-evaluates the `WHERE` clause after the first commits and
//! matches nothing. [`update_if`](JobRepository::update_if) works the same way, with
//! the expected status and owner in the `WHERE` clause.
//!
//! Time comparisons bind the repository clock's "now" instead of using SQL `NOW()`,
//! keeping the database and the queue service on the same clock.

use super::{JobRepository, StatusCounts, clean_statuses, empty_counts};
use crate::{
    Result, StevedoreError,
    clock::SharedClock,
    config::DatabaseConfig,
    job::{Job, JobId, JobLogEntry, JobParts, JobProgress, JobStatus},
    options::JobOptions,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    FromRow, PgPool, Postgres, Row,
    postgres::{PgArguments, PgPoolOptions},
};
use std::{str::FromStr, time::Duration};
use tracing::debug;

const JOB_COLUMNS: &str = "id, queue_name, name, payload, options, status, \
    created_at, updated_at, processed_on, finished_on, delay_until, lock_until, worker_id, \
    attempts_made, stalled_count, progress, logs, return_value, failed_reason, stacktrace";

#[derive(FromRow, Clone)]
pub(crate) struct JobRow {
    pub id: String,
    pub queue_name: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub options: serde_json::Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
    pub delay_until: Option<DateTime<Utc>>,
    pub lock_until: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub attempts_made: i64,
    pub stalled_count: i64,
    pub progress: serde_json::Value,
    pub logs: serde_json::Value,
    pub return_value: Option<serde_json::Value>,
    pub failed_reason: Option<String>,
    pub stacktrace: serde_json::Value,
}

impl JobRow {
    pub fn into_job(self) -> Result<Job> {
        let options: JobOptions = serde_json::from_value(self.options)?;
        let progress: JobProgress = serde_json::from_value(self.progress)?;
        let logs: Vec<JobLogEntry> = serde_json::from_value(self.logs)?;
        let stacktrace: Vec<String> = serde_json::from_value(self.stacktrace)?;

        Job::from_parts(JobParts {
            id: JobId::parse(self.id)?,
            queue_name: self.queue_name,
            name: self.name,
            payload: self.payload,
            options,
            status: JobStatus::from_str(&self.status)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            processed_on: self.processed_on,
            finished_on: self.finished_on,
            delay_until: self.delay_until,
            lock_until: self.lock_until,
            worker_id: self.worker_id,
            attempts_made: to_u32("attempts_made", self.attempts_made)?,
            stalled_count: to_u32("stalled_count", self.stalled_count)?,
            progress,
            logs,
            return_value: self.return_value,
            failed_reason: self.failed_reason,
            stacktrace,
        })
    }
}

fn to_u32(column: &str, value: i64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| StevedoreError::validation(format!("{} out of range: {}", column, value)))
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn status_names(statuses: &[JobStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

/// Column values of a job, serialized once for INSERT and UPDATE.
struct JobValues {
    id: String,
    queue_name: String,
    name: String,
    payload: serde_json::Value,
    options: serde_json::Value,
    status: &'static str,
    priority: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    processed_on: Option<DateTime<Utc>>,
    finished_on: Option<DateTime<Utc>>,
    delay_until: Option<DateTime<Utc>>,
    lock_until: Option<DateTime<Utc>>,
    worker_id: Option<String>,
    attempts_made: i64,
    stalled_count: i64,
    progress: serde_json::Value,
    logs: serde_json::Value,
    return_value: Option<serde_json::Value>,
    failed_reason: Option<String>,
    stacktrace: serde_json::Value,
}

impl JobValues {
    fn from_job(job: &Job) -> Result<Self> {
        Ok(Self {
            id: job.id().to_string(),
            queue_name: job.queue_name().to_string(),
            name: job.name().to_string(),
            payload: job.payload().clone(),
            options: serde_json::to_value(job.options())?,
            status: job.status().as_str(),
            priority: job.options().priority,
            created_at: job.created_at(),
            updated_at: job.updated_at(),
            processed_on: job.processed_on(),
            finished_on: job.finished_on(),
            delay_until: job.delay_until(),
            lock_until: job.lock_until(),
            worker_id: job.worker_id().map(str::to_string),
            attempts_made: i64::from(job.attempts_made()),
            stalled_count: i64::from(job.stalled_count()),
            progress: serde_json::to_value(job.progress())?,
            logs: serde_json::to_value(job.logs())?,
            return_value: job.return_value().cloned(),
            failed_reason: job.failed_reason().map(str::to_string),
            stacktrace: serde_json::to_value(job.stacktrace())?,
        })
    }
}

type JobQuery<'q> = sqlx::query::QueryAs<'q, Postgres, JobRow, PgArguments>;

pub struct PostgresJobRepository {
    pool: PgPool,
    clock: SharedClock,
}

impl PostgresJobRepository {
    pub fn new(pool: PgPool, clock: SharedClock) -> Self {
        Self { pool, clock }
    }

    /// Open a connection pool sized by `config`.
    pub async fn connect(config: &DatabaseConfig, clock: SharedClock) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_secs))
            .connect(&config.url)
            .await?;
        Ok(Self::new(pool, clock))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_jobs(&self, query: JobQuery<'_>) -> Result<Vec<Job>> {
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    /// Overwrite every column of a stored job, optionally guarded by its current
    /// status and owner. Returns the number of rows written.
    async fn write_job(
        &self,
        job: &Job,
        expected: Option<(JobStatus, Option<&str>)>,
    ) -> Result<u64> {
        let v = JobValues::from_job(job)?;
        let guard = if expected.is_some() {
            " AND status = $22 AND worker_id IS NOT DISTINCT FROM $23"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE stevedore_jobs \
             SET queue_name = $2, name = $3, payload = $4, options = $5, status = $6, \
                 priority = $7, created_at = $8, updated_at = $9, processed_on = $10, \
                 finished_on = $11, delay_until = $12, lock_until = $13, worker_id = $14, \
                 attempts_made = $15, stalled_count = $16, progress = $17, logs = $18, \
                 return_value = $19, failed_reason = $20, stacktrace = $21 \
             WHERE id = $1{}",
            guard
        );

        let mut query = sqlx::query(&sql)
            .bind(v.id)
            .bind(v.queue_name)
            .bind(v.name)
            .bind(v.payload)
            .bind(v.options)
            .bind(v.status)
            .bind(v.priority)
            .bind(v.created_at)
            .bind(v.updated_at)
            .bind(v.processed_on)
            .bind(v.finished_on)
            .bind(v.delay_until)
            .bind(v.lock_until)
            .bind(v.worker_id)
            .bind(v.attempts_made)
            .bind(v.stalled_count)
            .bind(v.progress)
            .bind(v.logs)
            .bind(v.return_value)
            .bind(v.failed_reason)
            .bind(v.stacktrace);
        if let Some((status, worker_id)) = expected {
            query = query.bind(status.as_str()).bind(worker_id);
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobRepository for PostgresJobRepository {
    async fn save(&self, job: &Job) -> Result<()> {
        let v = JobValues::from_job(job)?;
        sqlx::query(
            r#"
            INSERT INTO stevedore_jobs (
                id, queue_name, name, payload, options, status, priority,
                created_at, updated_at, processed_on, finished_on, delay_until, lock_until,
                worker_id, attempts_made, stalled_count, progress, logs, return_value,
                failed_reason, stacktrace
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21)
            "#,
        )
        .bind(v.id)
        .bind(v.queue_name)
        .bind(v.name)
        .bind(v.payload)
        .bind(v.options)
        .bind(v.status)
        .bind(v.priority)
        .bind(v.created_at)
        .bind(v.updated_at)
        .bind(v.processed_on)
        .bind(v.finished_on)
        .bind(v.delay_until)
        .bind(v.lock_until)
        .bind(v.worker_id)
        .bind(v.attempts_made)
        .bind(v.stalled_count)
        .bind(v.progress)
        .bind(v.logs)
        .bind(v.return_value)
        .bind(v.failed_reason)
        .bind(v.stacktrace)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, job: &Job) -> Result<()> {
        if self.write_job(job, None).await? == 0 {
            return Err(StevedoreError::JobNotFound {
                id: job.id().to_string(),
            });
        }
        Ok(())
    }

    async fn update_if(
        &self,
        job: &Job,
        expected_status: JobStatus,
        expected_worker_id: Option<&str>,
    ) -> Result<bool> {
        let written = self
            .write_job(job, Some((expected_status, expected_worker_id)))
            .await?;
        Ok(written == 1)
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM stevedore_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRow::into_job).transpose()
    }

    async fn remove(&self, id: &JobId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM stevedore_jobs WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_next_jobs_to_process(&self, queue_name: &str, limit: usize) -> Result<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM stevedore_jobs
            WHERE queue_name = $1
              AND (status = 'waiting'
                   OR (status = 'delayed' AND (delay_until IS NULL OR delay_until <= $2)))
            ORDER BY priority ASC, created_at ASC
            LIMIT $3
            "#,
            JOB_COLUMNS
        );
        let query = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue_name)
            .bind(self.clock.now())
            .bind(to_limit(limit));
        self.fetch_jobs(query).await
    }

    async fn acquire_lock(
        &self,
        id: &JobId,
        worker_id: &str,
        lock_until: DateTime<Utc>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let result = sqlx::query(
            r#"
            UPDATE stevedore_jobs
            SET status = 'active',
                worker_id = $2,
                lock_until = $3,
                processed_on = $4,
                delay_until = NULL,
                attempts_made = attempts_made + 1,
                updated_at = GREATEST(updated_at, $4)
            WHERE id = $1
              AND (
                    status = 'waiting'
                 OR (status = 'delayed' AND (delay_until IS NULL OR delay_until <= $4))
                 OR (status = 'active' AND lock_until < $4)
              )
            "#,
        )
        .bind(id.as_str())
        .bind(worker_id)
        .bind(lock_until)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let claimed = result.rows_affected() == 1;
        if claimed {
            debug!(job_id = %id, worker_id, "Lock acquired");
        }
        Ok(claimed)
    }

    async fn extend_lock(
        &self,
        id: &JobId,
        worker_id: &str,
        lock_until: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE stevedore_jobs
            SET lock_until = $3, updated_at = GREATEST(updated_at, $4)
            WHERE id = $1 AND worker_id = $2 AND status = 'active'
            "#,
        )
        .bind(id.as_str())
        .bind(worker_id)
        .bind(lock_until)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_stalled_jobs(
        &self,
        queue_name: &str,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM stevedore_jobs
            WHERE queue_name = $1 AND status = 'active' AND lock_until < $2
            ORDER BY lock_until ASC
            LIMIT $3
            "#,
            JOB_COLUMNS
        );
        let query = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue_name)
            .bind(older_than)
            .bind(to_limit(limit));
        self.fetch_jobs(query).await
    }

    async fn get_jobs_by_status(
        &self,
        queue_name: &str,
        statuses: &[JobStatus],
        offset: usize,
        limit: usize,
        ascending: bool,
    ) -> Result<Vec<Job>> {
        let direction = if ascending { "ASC" } else { "DESC" };
        let sql = format!(
            r#"
            SELECT {}
            FROM stevedore_jobs
            WHERE queue_name = $1 AND status = ANY($2)
            ORDER BY created_at {dir}, id {dir}
            OFFSET $3
            LIMIT $4
            "#,
            JOB_COLUMNS,
            dir = direction
        );
        let query = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue_name)
            .bind(status_names(statuses))
            .bind(to_limit(offset))
            .bind(to_limit(limit));
        self.fetch_jobs(query).await
    }

    async fn count_jobs_by_status(
        &self,
        queue_name: &str,
        statuses: Option<&[JobStatus]>,
    ) -> Result<StatusCounts> {
        let mut counts = empty_counts(statuses);
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM stevedore_jobs
            WHERE queue_name = $1
            GROUP BY status
            "#,
        )
        .bind(queue_name)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            let status = JobStatus::from_str(&status)?;
            if let Some(entry) = counts.get_mut(&status) {
                *entry = u64::try_from(count).unwrap_or(0);
            }
        }
        Ok(counts)
    }

    async fn clean(
        &self,
        queue_name: &str,
        grace_period: Duration,
        limit: usize,
        status: Option<JobStatus>,
    ) -> Result<u64> {
        let grace = chrono::Duration::from_std(grace_period).unwrap_or(chrono::Duration::MAX);
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(grace)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let result = sqlx::query(
            r#"
            DELETE FROM stevedore_jobs
            WHERE id IN (
                SELECT id FROM stevedore_jobs
                WHERE queue_name = $1
                  AND status = ANY($2)
                  AND COALESCE(finished_on, created_at) < $3
                ORDER BY COALESCE(finished_on, created_at) ASC
                LIMIT $4
            )
            "#,
        )
        .bind(queue_name)
        .bind(status_names(&clean_statuses(status)))
        .bind(cutoff)
        .bind(to_limit(limit))
        .execute(&self.pool)
        .await?;

        let removed = result.rows_affected();
        debug!(queue_name, removed, "Cleaned jobs");
        Ok(removed)
    }
}
