//! The queue service: job lifecycle orchestration on top of a [`JobRepository`].
//!
//! [`QueueService`] owns everything that decides what happens to a job:
//!
//! - creating jobs from resolved options
//! - the atomic fetch-and-lock used by workers
//! - completion and failure, including the retry and backoff decision
//! - lock extension, progress and log updates, all ownership-checked
//! - a background maintenance loop recovering jobs whose worker disappeared
//!
//! Operations that target a job the caller no longer owns return `Ok(false)` and log
//! a warning instead of failing; losing a job to stall recovery is an expected race.
//!
//! # Examples
//!
//! ```rust
//! use stevedore::{
//!     QueueService, JobStatus,
//!     config::QueueConfig,
//!     options::JobOptionsPatch,
//!     repository::InMemoryJobRepository,
//! };
//! use serde_json::json;
//! use std::{sync::Arc, time::Duration};
//!
//! # #[tokio::main]
//! # async fn main() -> stevedore::Result<()> {
//! let repo = Arc::new(InMemoryJobRepository::new());
//! let queue = QueueService::new("emails", repo, QueueConfig::default());
//!
//! let job = queue
//!     .add("send-email", json!({"to": "a@b.com"}), JobOptionsPatch::new())
//!     .await?;
//!
//! let claimed = queue
//!     .fetch_next_job_and_lock("w1", Duration::from_secs(10))
//!     .await?
//!     .expect("job is waiting");
//! assert_eq!(claimed.id(), job.id());
//! assert_eq!(claimed.status(), JobStatus::Active);
//!
//! queue
//!     .mark_job_as_completed(job.id(), "w1", json!({"status": "sent"}))
//!     .await?;
//! let stored = queue.get_job(job.id()).await?.unwrap();
//! assert_eq!(stored.status(), JobStatus::Completed);
//! # Ok(())
//! # }
//! ```

use crate::{
    Result, StevedoreError,
    clock::{SharedClock, system_clock},
    config::QueueConfig,
    error::ProcessingFailure,
    events::{EventBus, QueueEvent},
    job::{Job, JobId, JobProgress, JobStatus, LogLevel, StallOutcome, add_duration},
    options::{JobOptions, JobOptionsPatch, RemovalPolicy},
    repository::{JobRepository, StatusCounts},
    retry::BackoffFn,
};
use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, broadcast, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

/// A job to be created by [`QueueService::add_bulk`].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub payload: serde_json::Value,
    pub options: JobOptionsPatch,
}

impl NewJob {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            options: JobOptionsPatch::default(),
        }
    }

    pub fn with_options(mut self, options: JobOptionsPatch) -> Self {
        self.options = options;
        self
    }
}

struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct QueueService<R: JobRepository> {
    queue_name: String,
    repository: Arc<R>,
    clock: SharedClock,
    events: EventBus,
    config: QueueConfig,
    backoff_registry: RwLock<HashMap<String, BackoffFn>>,
    paused: AtomicBool,
    closed: AtomicBool,
    maintenance: Mutex<Option<MaintenanceHandle>>,
}

impl<R: JobRepository + 'static> QueueService<R> {
    pub fn new(queue_name: impl Into<String>, repository: Arc<R>, config: QueueConfig) -> Self {
        let events = EventBus::new(config.event_buffer_size);
        Self {
            queue_name: queue_name.into(),
            repository,
            clock: system_clock(),
            events,
            config,
            backoff_registry: RwLock::new(HashMap::new()),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            maintenance: Mutex::new(None),
        }
    }

    /// Use `clock` instead of wall-clock time. It should be the repository's clock too.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Publish on an existing bus, e.g. one shared by several queues.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Register the callback for custom backoff strategies named `name`.
    ///
    /// Jobs loaded from storage only carry the strategy name; this is how their
    /// callback is found again.
    pub fn register_backoff<F>(&self, name: impl Into<String>, func: F)
    where
        F: Fn(u32, &str) -> Option<Duration> + Send + Sync + 'static,
    {
        let mut registry = self
            .backoff_registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.insert(name.into(), BackoffFn::new(func));
    }

    /// Create and persist a job. Per-job options override the queue defaults.
    pub async fn add(
        &self,
        name: impl Into<String>,
        payload: serde_json::Value,
        options: JobOptionsPatch,
    ) -> Result<Job> {
        self.ensure_open()?;

        let options = JobOptions::resolve(&self.config.default_job_options, &options)?;
        let job = Job::new(
            self.queue_name.clone(),
            name,
            payload,
            options,
            self.clock.now(),
        );
        self.repository.save(&job).await?;

        debug!(
            job_id = %job.id(),
            queue_name = %self.queue_name,
            job_name = job.name(),
            status = %job.status(),
            "Job added"
        );
        self.events.emit(QueueEvent::JobAdded { job: job.clone() });
        Ok(job)
    }

    /// Add several jobs. Each one is persisted on its own; a failure does not roll
    /// back the others.
    pub async fn add_bulk(&self, jobs: Vec<NewJob>) -> Result<Vec<Result<Job>>> {
        self.ensure_open()?;

        let mut results = Vec::with_capacity(jobs.len());
        for new_job in jobs {
            results.push(self.add(new_job.name, new_job.payload, new_job.options).await);
        }
        Ok(results)
    }

    /// Claim the next eligible job for `worker_id`.
    ///
    /// Makes a single claim attempt on the best candidate. Losing the race to another
    /// worker returns `None`; callers poll again on their own schedule.
    pub async fn fetch_next_job_and_lock(
        &self,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<Job>> {
        let candidates = self
            .repository
            .find_next_jobs_to_process(&self.queue_name, 1)
            .await?;
        let Some(candidate) = candidates.into_iter().next() else {
            return Ok(None);
        };

        let lock_until = add_duration(self.clock.now(), lock_duration);
        if !self
            .repository
            .acquire_lock(candidate.id(), worker_id, lock_until)
            .await?
        {
            debug!(job_id = %candidate.id(), worker_id, "Lost claim race");
            return Ok(None);
        }

        let Some(job) = self.repository.find_by_id(candidate.id()).await? else {
            warn!(job_id = %candidate.id(), "Claimed job disappeared");
            return Ok(None);
        };

        debug!(
            job_id = %job.id(),
            worker_id,
            attempts_made = job.attempts_made(),
            "Job active"
        );
        self.events.emit(QueueEvent::JobActive { job: job.clone() });
        Ok(Some(job))
    }

    /// Extend the lock of a job still owned by `worker_id`.
    pub async fn extend_job_lock(
        &self,
        job_id: &JobId,
        worker_id: &str,
        duration: Duration,
    ) -> Result<bool> {
        if self.load_owned(job_id, worker_id, "extend lock").await?.is_none() {
            return Ok(false);
        }

        let lock_until = add_duration(self.clock.now(), duration);
        if !self
            .repository
            .extend_lock(job_id, worker_id, lock_until)
            .await?
        {
            warn!(job_id = %job_id, worker_id, "Lock lost before it could be extended");
            return Ok(false);
        }

        debug!(job_id = %job_id, worker_id, %lock_until, "Lock extended");
        self.events.emit(QueueEvent::JobLockExtended {
            job_id: job_id.clone(),
            queue_name: self.queue_name.clone(),
            worker_id: worker_id.to_string(),
            lock_until,
        });
        Ok(true)
    }

    /// Complete a job owned by `worker_id`. Returns `false` if ownership was lost.
    pub async fn mark_job_as_completed(
        &self,
        job_id: &JobId,
        worker_id: &str,
        return_value: serde_json::Value,
    ) -> Result<bool> {
        let Some(mut job) = self.load_owned(job_id, worker_id, "complete").await? else {
            return Ok(false);
        };

        job.mark_as_completed(return_value.clone(), self.clock.now());
        if !self.write_owned(&job, worker_id, "complete").await? {
            return Ok(false);
        }

        info!(job_id = %job_id, worker_id, "Job completed");
        let policy = job.options().remove_on_complete.clone();
        self.events.emit(QueueEvent::JobCompleted {
            job: job.clone(),
            return_value,
        });
        self.apply_removal_policy(&job, &policy).await;
        Ok(true)
    }

    /// Record a failed attempt of a job owned by `worker_id`.
    ///
    /// Retries with backoff while attempts remain, otherwise fails the job for good.
    /// Attempts are counted at activation, so the attempt that just failed is already
    /// included in `attempts_made`. Returns `false` if ownership was lost.
    pub async fn mark_job_as_failed(
        &self,
        job_id: &JobId,
        worker_id: &str,
        failure: &ProcessingFailure,
    ) -> Result<bool> {
        let Some(mut job) = self.load_owned(job_id, worker_id, "fail").await? else {
            return Ok(false);
        };

        let now = self.clock.now();
        let retry_delay = (job.attempts_made() < job.options().attempts)
            .then(|| self.retry_delay(&job, &failure.message));

        match retry_delay {
            Some(delay) => {
                job.move_to_delayed(add_duration(now, delay), Some(&failure.message), now)?;
                info!(
                    job_id = %job_id,
                    attempts_made = job.attempts_made(),
                    delay_ms = delay.as_millis() as u64,
                    error = %failure.message,
                    "Job failed, retrying"
                );
            }
            None => {
                job.mark_as_failed(failure.message.clone(), failure.stacktrace.clone(), now);
                warn!(
                    job_id = %job_id,
                    attempts_made = job.attempts_made(),
                    error = %failure.message,
                    "Job failed permanently"
                );
            }
        }

        if !self.write_owned(&job, worker_id, "fail").await? {
            return Ok(false);
        }
        let terminal = job.status() == JobStatus::Failed;
        let policy = job.options().remove_on_fail.clone();
        self.events.emit(QueueEvent::JobFailed {
            job: job.clone(),
            error: failure.message.clone(),
        });
        if terminal {
            self.apply_removal_policy(&job, &policy).await;
        }
        Ok(true)
    }

    pub async fn update_job_progress(
        &self,
        job_id: &JobId,
        worker_id: &str,
        progress: JobProgress,
    ) -> Result<bool> {
        let Some(mut job) = self
            .load_owned(job_id, worker_id, "update progress")
            .await?
        else {
            return Ok(false);
        };

        if !job.update_progress(progress.clone(), self.clock.now())
            || !self.write_owned(&job, worker_id, "update progress").await?
        {
            return Ok(false);
        }

        self.events.emit(QueueEvent::JobProgress {
            job_id: job_id.clone(),
            queue_name: self.queue_name.clone(),
            progress,
        });
        Ok(true)
    }

    pub async fn add_job_log(
        &self,
        job_id: &JobId,
        worker_id: &str,
        message: impl Into<String>,
        level: LogLevel,
    ) -> Result<bool> {
        let Some(mut job) = self.load_owned(job_id, worker_id, "add log").await? else {
            return Ok(false);
        };

        if !job.add_log(message, level, self.clock.now())
            || !self.write_owned(&job, worker_id, "add log").await?
        {
            return Ok(false);
        }

        if let Some(entry) = job.logs().last() {
            self.events.emit(QueueEvent::JobLog {
                job_id: job_id.clone(),
                queue_name: self.queue_name.clone(),
                entry: entry.clone(),
            });
        }
        Ok(true)
    }

    /// Ask workers to stop fetching. Advisory: fetches are not filtered here.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!(queue_name = %self.queue_name, "Queue paused");
            self.events.emit(QueueEvent::QueuePaused {
                queue_name: self.queue_name.clone(),
            });
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!(queue_name = %self.queue_name, "Queue resumed");
            self.events.emit(QueueEvent::QueueResumed {
                queue_name: self.queue_name.clone(),
            });
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>> {
        self.repository.find_by_id(job_id).await
    }

    pub async fn remove_job(&self, job_id: &JobId) -> Result<bool> {
        self.repository.remove(job_id).await
    }

    pub async fn count_jobs_by_status(
        &self,
        statuses: Option<&[JobStatus]>,
    ) -> Result<StatusCounts> {
        self.repository
            .count_jobs_by_status(&self.queue_name, statuses)
            .await
    }

    pub async fn get_jobs_by_status(
        &self,
        statuses: &[JobStatus],
        offset: usize,
        limit: usize,
        ascending: bool,
    ) -> Result<Vec<Job>> {
        self.repository
            .get_jobs_by_status(&self.queue_name, statuses, offset, limit, ascending)
            .await
    }

    /// Delete up to `limit` of the oldest finished jobs older than `grace_period`.
    pub async fn clean(
        &self,
        grace_period: Duration,
        limit: usize,
        status: Option<JobStatus>,
    ) -> Result<u64> {
        let removed = self
            .repository
            .clean(&self.queue_name, grace_period, limit, status)
            .await?;
        info!(queue_name = %self.queue_name, removed, "Queue cleaned");
        Ok(removed)
    }

    /// Start the stalled-job maintenance loop. Does nothing if it is already running.
    pub async fn start_maintenance(self: &Arc<Self>) {
        let mut maintenance = self.maintenance.lock().await;
        if maintenance.is_some() || self.is_closed() {
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let service: Weak<Self> = Arc::downgrade(self);
        let period = self
            .config
            .stalled_jobs
            .check_interval
            .max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = interval.tick() => {
                        let Some(service) = service.upgrade() else { break };
                        service.run_maintenance_tick().await;
                    }
                }
            }
            debug!("Maintenance loop stopped");
        });

        info!(queue_name = %self.queue_name, ?period, "Maintenance loop started");
        *maintenance = Some(MaintenanceHandle { shutdown, task });
    }

    async fn run_maintenance_tick(&self) {
        if let Err(e) = self.run_maintenance_cycle().await {
            error!(queue_name = %self.queue_name, "Maintenance cycle failed: {}", e);
            self.events.emit(QueueEvent::QueueError {
                queue_name: self.queue_name.clone(),
                error: e.to_string(),
            });
        }
    }

    /// Recover `ACTIVE` jobs whose lock expired. Returns how many were recovered.
    ///
    /// Jobs with attempts left go back to `WAITING`; the rest are failed.
    pub async fn run_maintenance_cycle(&self) -> Result<usize> {
        let now = self.clock.now();
        let grace = chrono::Duration::from_std(self.config.stalled_jobs.grace_period)
            .unwrap_or(chrono::Duration::MAX);
        let older_than = now.checked_sub_signed(grace).unwrap_or(now);

        let stalled = self
            .repository
            .find_stalled_jobs(
                &self.queue_name,
                older_than,
                self.config.stalled_jobs.limit_per_check,
            )
            .await?;

        let mut recovered = 0;
        for mut job in stalled {
            let previous_worker = job.worker_id().map(str::to_string);
            let outcome = job.mark_as_stalled(now)?;
            if outcome == StallOutcome::NeedsRequeue {
                job.move_to_waiting(now)?;
            }

            // The scan holds no lock, so the owner may have finished since.
            if !self
                .repository
                .update_if(&job, JobStatus::Active, previous_worker.as_deref())
                .await?
            {
                debug!(job_id = %job.id(), "Stalled job changed since the scan, skipping");
                continue;
            }
            recovered += 1;

            let previous_worker = previous_worker.unwrap_or_default();
            match outcome {
                StallOutcome::PermanentlyFailed => {
                    warn!(
                        job_id = %job.id(),
                        worker_id = %previous_worker,
                        reason = job.failed_reason().unwrap_or_default(),
                        "Stalled job failed"
                    );
                    let policy = job.options().remove_on_fail.clone();
                    self.events.emit(QueueEvent::JobStalled { job: job.clone() });
                    self.apply_removal_policy(&job, &policy).await;
                }
                StallOutcome::NeedsRequeue => {
                    warn!(
                        job_id = %job.id(),
                        worker_id = %previous_worker,
                        stalled_count = job.stalled_count(),
                        "Stalled job moved back to waiting"
                    );
                    self.events.emit(QueueEvent::JobStalled { job });
                }
            }
        }

        if recovered > 0 {
            info!(queue_name = %self.queue_name, recovered, "Recovered stalled jobs");
        }
        Ok(recovered)
    }

    /// Stop maintenance and reject new jobs. Emits `queue.closed` once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.maintenance.lock().await.take() {
            let _ = handle.shutdown.send(true);
            if let Err(e) = handle.task.await {
                error!(queue_name = %self.queue_name, "Maintenance task ended abnormally: {}", e);
            }
        }

        info!(queue_name = %self.queue_name, "Queue closed");
        self.events.emit(QueueEvent::QueueClosed {
            queue_name: self.queue_name.clone(),
        });
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StevedoreError::QueueClosed {
                queue_name: self.queue_name.clone(),
            });
        }
        Ok(())
    }

    /// Load a job and check that `worker_id` still owns it.
    async fn load_owned(
        &self,
        job_id: &JobId,
        worker_id: &str,
        action: &str,
    ) -> Result<Option<Job>> {
        match self.repository.find_by_id(job_id).await? {
            Some(job) if job.is_owned_by(worker_id) => Ok(Some(job)),
            Some(job) => {
                warn!(
                    job_id = %job_id,
                    worker_id,
                    owner = job.worker_id().unwrap_or("<none>"),
                    status = %job.status(),
                    "Cannot {} job not owned by worker",
                    action
                );
                Ok(None)
            }
            None => {
                warn!(job_id = %job_id, worker_id, "Cannot {} missing job", action);
                Ok(None)
            }
        }
    }

    /// Persist a change to a job only if `worker_id` still owns the stored row.
    async fn write_owned(&self, job: &Job, worker_id: &str, action: &str) -> Result<bool> {
        let written = self
            .repository
            .update_if(job, JobStatus::Active, Some(worker_id))
            .await?;
        if !written {
            warn!(
                job_id = %job.id(),
                worker_id,
                "Cannot {} job, ownership changed while it was being written",
                action
            );
        }
        Ok(written)
    }

    /// Delay before the next attempt of a job that still has attempts left.
    fn retry_delay(&self, job: &Job, error: &str) -> Duration {
        let Some(strategy) = &job.options().backoff else {
            return Duration::ZERO;
        };

        let delay = match strategy.unresolved_custom_name() {
            Some(name) => {
                let registry = self
                    .backoff_registry
                    .read()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                match registry.get(name) {
                    Some(func) => func.call(job.attempts_made(), error),
                    None => {
                        warn!(
                            job_id = %job.id(),
                            strategy = name,
                            "No backoff registered under this name, retrying without delay"
                        );
                        None
                    }
                }
            }
            None => strategy.calculate_delay(job.attempts_made(), error),
        };

        delay.unwrap_or_else(|| {
            debug!(job_id = %job.id(), "Backoff proposed no delay, retrying immediately");
            Duration::ZERO
        })
    }

    /// Apply a removal policy after a job reached a terminal status.
    ///
    /// The job's outcome is already persisted, so failures here are reported as
    /// `queue.error` instead of being returned.
    async fn apply_removal_policy(&self, job: &Job, policy: &RemovalPolicy) {
        if let Err(e) = self.try_apply_removal_policy(job, policy).await {
            error!(job_id = %job.id(), "Failed to apply removal policy: {}", e);
            self.events.emit(QueueEvent::QueueError {
                queue_name: self.queue_name.clone(),
                error: e.to_string(),
            });
        }
    }

    async fn try_apply_removal_policy(&self, job: &Job, policy: &RemovalPolicy) -> Result<()> {
        match policy {
            RemovalPolicy::Keep => Ok(()),
            RemovalPolicy::Remove => {
                self.repository.remove(job.id()).await?;
                debug!(job_id = %job.id(), "Removed finished job");
                Ok(())
            }
            RemovalPolicy::Retain { max_age, max_count } => {
                let status = job.status();
                if let Some(max_age) = max_age {
                    self.repository
                        .clean(&self.queue_name, *max_age, usize::MAX, Some(status))
                        .await?;
                }
                if let Some(max_count) = max_count {
                    let excess = self
                        .repository
                        .get_jobs_by_status(&self.queue_name, &[status], *max_count, usize::MAX, false)
                        .await?;
                    for old in excess {
                        self.repository.remove(old.id()).await?;
                    }
                }
                Ok(())
            }
        }
    }
}
