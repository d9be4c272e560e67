//! In-memory job repository.
//!
//! Jobs live in a `HashMap` behind a tokio `RwLock`. The claim in
//! [`acquire_lock`](JobRepository::acquire_lock) and the conditional write in
//! [`update_if`](JobRepository::update_if) check and mutate the job while holding the
//! write lock, so concurrent claims on one job serialize and at most one succeeds.
//!
//! ```rust
//! use stevedore::clock::MockClock;
//! use stevedore::job::Job;
//! use stevedore::options::JobOptions;
//! use stevedore::repository::{InMemoryJobRepository, JobRepository};
//! use stevedore::clock::Clock;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> stevedore::Result<()> {
//! let clock = MockClock::new();
//! let repo = InMemoryJobRepository::with_clock(Arc::new(clock.clone()));
//!
//! let job = Job::new("emails", "send", serde_json::json!({}), JobOptions::default(), clock.now());
//! repo.save(&job).await?;
//!
//! let lock_until = clock.now() + chrono::Duration::seconds(30);
//! assert!(repo.acquire_lock(job.id(), "w1", lock_until).await?);
//! assert!(!repo.acquire_lock(job.id(), "w2", lock_until).await?);
//! # Ok(())
//! # }
//! ```

use super::{JobRepository, StatusCounts, clean_statuses, clean_timestamp, empty_counts};
use crate::{
    Result, StevedoreError,
    clock::{SharedClock, system_clock},
    job::{Job, JobId, JobStatus, add_duration},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{cmp::Reverse, collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct InMemoryJobRepository {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
    clock: SharedClock,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Number of stored jobs across all queues.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

impl Default for InMemoryJobRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn save(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(job.id()) {
            return Err(StevedoreError::validation(format!(
                "job {} already exists",
                job.id()
            )));
        }
        jobs.insert(job.id().clone(), job.clone());
        Ok(())
    }

    async fn update(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(job.id()) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(StevedoreError::JobNotFound {
                id: job.id().to_string(),
            }),
        }
    }

    async fn update_if(
        &self,
        job: &Job,
        expected_status: JobStatus,
        expected_worker_id: Option<&str>,
    ) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(job.id()) {
            Some(stored)
                if stored.status() == expected_status
                    && stored.worker_id() == expected_worker_id =>
            {
                *stored = job.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn remove(&self, id: &JobId) -> Result<bool> {
        Ok(self.jobs.write().await.remove(id).is_some())
    }

    async fn find_next_jobs_to_process(&self, queue_name: &str, limit: usize) -> Result<Vec<Job>> {
        let now = self.clock.now();
        let jobs = self.jobs.read().await;

        let mut eligible: Vec<&Job> = jobs
            .values()
            .filter(|job| job.queue_name() == queue_name && job.is_eligible(now))
            .collect();
        eligible.sort_by_key(|job| (job.options().priority, job.created_at()));

        Ok(eligible.into_iter().take(limit).cloned().collect())
    }

    async fn acquire_lock(
        &self,
        id: &JobId,
        worker_id: &str,
        lock_until: DateTime<Utc>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(id) else {
            return Ok(false);
        };

        let claimed = match job.status() {
            JobStatus::Waiting | JobStatus::Delayed if job.is_eligible(now) => {
                job.move_to_active(worker_id, lock_until, now).is_ok()
            }
            JobStatus::Active if job.is_lock_expired(now) => job
                .take_over_expired_lock(worker_id, lock_until, now)
                .is_ok(),
            _ => false,
        };

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
        let now = self.clock.now();
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(id) {
            Some(job) => Ok(job.extend_lock(lock_until, worker_id, now).is_ok()),
            None => Ok(false),
        }
    }

    async fn find_stalled_jobs(
        &self,
        queue_name: &str,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;

        let mut stalled: Vec<&Job> = jobs
            .values()
            .filter(|job| {
                job.queue_name() == queue_name
                    && job.status() == JobStatus::Active
                    && job.lock_until().is_some_and(|until| until < older_than)
            })
            .collect();
        stalled.sort_by_key(|job| job.lock_until());

        Ok(stalled.into_iter().take(limit).cloned().collect())
    }

    async fn get_jobs_by_status(
        &self,
        queue_name: &str,
        statuses: &[JobStatus],
        offset: usize,
        limit: usize,
        ascending: bool,
    ) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;

        let mut matching: Vec<&Job> = jobs
            .values()
            .filter(|job| job.queue_name() == queue_name && statuses.contains(&job.status()))
            .collect();
        if ascending {
            matching.sort_by_key(|job| (job.created_at(), job.id().clone()));
        } else {
            matching.sort_by_key(|job| Reverse((job.created_at(), job.id().clone())));
        }

        Ok(matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_jobs_by_status(
        &self,
        queue_name: &str,
        statuses: Option<&[JobStatus]>,
    ) -> Result<StatusCounts> {
        let mut counts = empty_counts(statuses);
        let jobs = self.jobs.read().await;

        for job in jobs.values().filter(|job| job.queue_name() == queue_name) {
            if let Some(count) = counts.get_mut(&job.status()) {
                *count += 1;
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
        let now = self.clock.now();
        let statuses = clean_statuses(status);
        let mut jobs = self.jobs.write().await;

        let mut candidates: Vec<(DateTime<Utc>, JobId)> = jobs
            .values()
            .filter(|job| job.queue_name() == queue_name && statuses.contains(&job.status()))
            .map(|job| (clean_timestamp(job), job.id().clone()))
            .filter(|(at, _)| add_duration(*at, grace_period) < now)
            .collect();
        candidates.sort();

        let mut removed = 0;
        for (_, id) in candidates.into_iter().take(limit) {
            if jobs.remove(&id).is_some() {
                removed += 1;
            }
        }

        debug!(queue_name, removed, "Cleaned jobs");
        Ok(removed)
    }
}
