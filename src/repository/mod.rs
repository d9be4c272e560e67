//! Persistence boundary for jobs.
//!
//! The queue service talks to storage only through [`JobRepository`]. Two backends
//! ship with the crate:
//!
//! - [`InMemoryJobRepository`](memory::InMemoryJobRepository), always available,
//!   used by the test suite and for development
//! - `PostgresJobRepository` behind the `postgres` feature
//!
//! Every repository reads the current time from the [`Clock`](crate::clock::Clock) it
//! was built with, so a service and its repository agree on what "now" means.
//!
//! Two operations must be atomic under concurrent callers:
//! [`acquire_lock`](JobRepository::acquire_lock) and
//! [`update_if`](JobRepository::update_if). Writes that depend on who owns a job go
//! through `update_if`, so a worker and the stall sweep can never overwrite each
//! other's result.

use crate::{
    Result,
    job::{Job, JobId, JobStatus},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, time::Duration};

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryJobRepository;

#[cfg(feature = "postgres")]
pub use postgres::PostgresJobRepository;

/// Job counts keyed by status. Statuses with no jobs are present with a count of 0.
pub type StatusCounts = HashMap<JobStatus, u64>;

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new job.
    async fn save(&self, job: &Job) -> Result<()>;

    /// Overwrite an existing job. Fails with `JobNotFound` if it was removed.
    async fn update(&self, job: &Job) -> Result<()>;

    /// Overwrite a job only if the stored row is still in `expected_status` and owned
    /// by `expected_worker_id`. Returns `false` without writing when either changed,
    /// or when the job was removed.
    async fn update_if(
        &self,
        job: &Job,
        expected_status: JobStatus,
        expected_worker_id: Option<&str>,
    ) -> Result<bool>;

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>>;

    /// Delete a job. Returns whether it existed.
    async fn remove(&self, id: &JobId) -> Result<bool>;

    /// `WAITING` jobs and `DELAYED` jobs whose delay elapsed, lowest priority value
    /// first, then oldest first.
    async fn find_next_jobs_to_process(&self, queue_name: &str, limit: usize) -> Result<Vec<Job>>;

    /// Claim a job for `worker_id` in one atomic step.
    ///
    /// Succeeds only if the job is eligible and unlocked, or `ACTIVE` with an expired
    /// lock. On success the stored job is `ACTIVE`, owned by `worker_id` until
    /// `lock_until`, with its attempt counted.
    async fn acquire_lock(
        &self,
        id: &JobId,
        worker_id: &str,
        lock_until: DateTime<Utc>,
    ) -> Result<bool>;

    /// Move the lock expiry forward if `worker_id` still owns the job.
    async fn extend_lock(
        &self,
        id: &JobId,
        worker_id: &str,
        lock_until: DateTime<Utc>,
    ) -> Result<bool>;

    /// `ACTIVE` jobs whose lock expired before `older_than`.
    async fn find_stalled_jobs(
        &self,
        queue_name: &str,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>>;

    /// Jobs in any of `statuses`, ordered by creation time.
    async fn get_jobs_by_status(
        &self,
        queue_name: &str,
        statuses: &[JobStatus],
        offset: usize,
        limit: usize,
        ascending: bool,
    ) -> Result<Vec<Job>>;

    /// Count jobs per status. `None` counts every status.
    async fn count_jobs_by_status(
        &self,
        queue_name: &str,
        statuses: Option<&[JobStatus]>,
    ) -> Result<StatusCounts>;

    /// Delete up to `limit` of the oldest jobs finished more than `grace_period` ago.
    ///
    /// Without `status` only `COMPLETED` and `FAILED` jobs are considered. With a
    /// non-terminal `status`, jobs are aged by their creation time instead.
    async fn clean(
        &self,
        queue_name: &str,
        grace_period: Duration,
        limit: usize,
        status: Option<JobStatus>,
    ) -> Result<u64>;
}

/// Instant a job is aged by when cleaning.
pub(crate) fn clean_timestamp(job: &Job) -> DateTime<Utc> {
    job.finished_on().unwrap_or_else(|| job.created_at())
}

pub(crate) fn clean_statuses(status: Option<JobStatus>) -> Vec<JobStatus> {
    match status {
        Some(status) => vec![status],
        None => vec![JobStatus::Completed, JobStatus::Failed],
    }
}

pub(crate) fn empty_counts(statuses: Option<&[JobStatus]>) -> StatusCounts {
    statuses
        .unwrap_or(&JobStatus::ALL)
        .iter()
        .map(|status| (*status, 0))
        .collect()
}
