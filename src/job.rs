//! The job entity and its state machine.
//!
//! A [`Job`] owns all of its fields; the only way to change one is through a
//! transition method. Transitions take the current time explicitly so the entity has
//! no dependency on a clock and no I/O.
//!
//! ```text
//!   create ──► WAITING ◄──────────────┐
//!     │          │  ▲                 │
//!     ▼          ▼  │ resume          │ move_to_waiting
//!   DELAYED ◄─► PAUSED                │
//!     │          │                    │
//!     └──► move_to_active ──► ACTIVE ─┴─► COMPLETED | FAILED | DELAYED (retry)
//! ```

use crate::{Result, StevedoreError, options::JobOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};
use tracing::warn;
use uuid::Uuid;

const MAX_JOB_ID_LEN: usize = 255;

/// Failure reason recorded when a stalled job has no attempts left.
pub const STALLED_ATTEMPTS_EXHAUSTED: &str =
    "Job failed after becoming stalled and exceeding max attempts";

/// Failure reason recorded when a job stalled more often than `max_stalled_count`.
pub const STALLED_LIMIT_EXCEEDED: &str = "job stalled more than allowable limit";

/// Unique job identifier. Generated as a UUID v4 unless the caller supplies one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Validate a caller-supplied identifier.
    pub fn parse(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(StevedoreError::validation("job id must not be empty"));
        }
        if id.len() > MAX_JOB_ID_LEN {
            return Err(StevedoreError::validation(format!(
                "job id must be at most {} characters",
                MAX_JOB_ID_LEN
            )));
        }
        if id.chars().any(char::is_whitespace) {
            return Err(StevedoreError::validation(
                "job id must not contain whitespace",
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for JobId {
    type Error = StevedoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
    Paused,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Waiting,
        JobStatus::Active,
        JobStatus::Delayed,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Paused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Delayed => "delayed",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Paused => "paused",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "waiting" => Ok(JobStatus::Waiting),
            "active" => Ok(JobStatus::Active),
            "delayed" => Ok(JobStatus::Delayed),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "paused" => Ok(JobStatus::Paused),
            other => Err(StevedoreError::validation(format!(
                "unknown job status: {}",
                other
            ))),
        }
    }
}

/// Progress reported by a processor: a percentage or any structured value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobProgress {
    Number(f64),
    Value(serde_json::Value),
}

impl Default for JobProgress {
    fn default() -> Self {
        JobProgress::Number(0.0)
    }
}

impl From<f64> for JobProgress {
    fn from(value: f64) -> Self {
        JobProgress::Number(value)
    }
}

impl From<serde_json::Value> for JobProgress {
    fn from(value: serde_json::Value) -> Self {
        match value.as_f64() {
            Some(n) => JobProgress::Number(n),
            None => JobProgress::Value(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Result of [`Job::mark_as_stalled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallOutcome {
    /// The job is now `FAILED`.
    PermanentlyFailed,
    /// The lock was released; the caller must follow up with [`Job::move_to_waiting`].
    NeedsRequeue,
}

/// Every persisted field of a job, used by repositories to store and rebuild jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParts {
    pub id: JobId,
    pub queue_name: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub options: JobOptions,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
    pub delay_until: Option<DateTime<Utc>>,
    pub lock_until: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub attempts_made: u32,
    pub stalled_count: u32,
    pub progress: JobProgress,
    pub logs: Vec<JobLogEntry>,
    pub return_value: Option<serde_json::Value>,
    pub failed_reason: Option<String>,
    pub stacktrace: Vec<String>,
}

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JobParts", into = "JobParts")]
pub struct Job {
    id: JobId,
    queue_name: String,
    name: String,
    payload: serde_json::Value,
    options: JobOptions,
    status: JobStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    processed_on: Option<DateTime<Utc>>,
    finished_on: Option<DateTime<Utc>>,
    delay_until: Option<DateTime<Utc>>,
    lock_until: Option<DateTime<Utc>>,
    worker_id: Option<String>,
    attempts_made: u32,
    stalled_count: u32,
    progress: JobProgress,
    logs: Vec<JobLogEntry>,
    return_value: Option<serde_json::Value>,
    failed_reason: Option<String>,
    stacktrace: Vec<String>,
}

impl Job {
    /// Create a job. A positive delay in `options` starts it `DELAYED`.
    pub fn new(
        queue_name: impl Into<String>,
        name: impl Into<String>,
        payload: serde_json::Value,
        options: JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let id = options.job_id.clone().unwrap_or_default();
        let (status, delay_until) = if options.delay.is_zero() {
            (JobStatus::Waiting, None)
        } else {
            (JobStatus::Delayed, Some(add_duration(now, options.delay)))
        };

        Self {
            id,
            queue_name: queue_name.into(),
            name: name.into(),
            payload,
            options,
            status,
            created_at: now,
            updated_at: now,
            processed_on: None,
            finished_on: None,
            delay_until,
            lock_until: None,
            worker_id: None,
            attempts_made: 0,
            stalled_count: 0,
            progress: JobProgress::default(),
            logs: Vec::new(),
            return_value: None,
            failed_reason: None,
            stacktrace: Vec::new(),
        }
    }

    /// Rebuild a job from storage, rejecting rows that break the lock or finish invariants.
    pub fn from_parts(parts: JobParts) -> Result<Self> {
        let active = parts.status == JobStatus::Active;
        if active != (parts.lock_until.is_some() && parts.worker_id.is_some()) {
            return Err(StevedoreError::validation(format!(
                "job {} is {} but lock fields are inconsistent",
                parts.id, parts.status
            )));
        }
        if parts.status.is_terminal() != parts.finished_on.is_some() {
            return Err(StevedoreError::validation(format!(
                "job {} is {} but finished_on is inconsistent",
                parts.id, parts.status
            )));
        }

        Ok(Self {
            id: parts.id,
            queue_name: parts.queue_name,
            name: parts.name,
            payload: parts.payload,
            options: parts.options,
            status: parts.status,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
            processed_on: parts.processed_on,
            finished_on: parts.finished_on,
            delay_until: parts.delay_until,
            lock_until: parts.lock_until,
            worker_id: parts.worker_id,
            attempts_made: parts.attempts_made,
            stalled_count: parts.stalled_count,
            progress: parts.progress,
            logs: parts.logs,
            return_value: parts.return_value,
            failed_reason: parts.failed_reason,
            stacktrace: parts.stacktrace,
        })
    }

    pub fn into_parts(self) -> JobParts {
        JobParts {
            id: self.id,
            queue_name: self.queue_name,
            name: self.name,
            payload: self.payload,
            options: self.options,
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            processed_on: self.processed_on,
            finished_on: self.finished_on,
            delay_until: self.delay_until,
            lock_until: self.lock_until,
            worker_id: self.worker_id,
            attempts_made: self.attempts_made,
            stalled_count: self.stalled_count,
            progress: self.progress,
            logs: self.logs,
            return_value: self.return_value,
            failed_reason: self.failed_reason,
            stacktrace: self.stacktrace,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn processed_on(&self) -> Option<DateTime<Utc>> {
        self.processed_on
    }

    pub fn finished_on(&self) -> Option<DateTime<Utc>> {
        self.finished_on
    }

    pub fn delay_until(&self) -> Option<DateTime<Utc>> {
        self.delay_until
    }

    pub fn lock_until(&self) -> Option<DateTime<Utc>> {
        self.lock_until
    }

    pub fn worker_id(&self) -> Option<&str> {
        self.worker_id.as_deref()
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    pub fn stalled_count(&self) -> u32 {
        self.stalled_count
    }

    pub fn progress(&self) -> &JobProgress {
        &self.progress
    }

    pub fn logs(&self) -> &[JobLogEntry] {
        &self.logs
    }

    pub fn return_value(&self) -> Option<&serde_json::Value> {
        self.return_value.as_ref()
    }

    pub fn failed_reason(&self) -> Option<&str> {
        self.failed_reason.as_deref()
    }

    pub fn stacktrace(&self) -> &[String] {
        &self.stacktrace
    }

    /// True while a retry of a previously failed attempt is pending or running.
    pub fn is_retry(&self) -> bool {
        match self.status {
            JobStatus::Active => self.attempts_made > 1,
            JobStatus::Waiting | JobStatus::Delayed => {
                self.attempts_made > 0 && self.failed_reason.is_some()
            }
            _ => false,
        }
    }

    /// `WAITING`, or `DELAYED` with its delay elapsed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Waiting => true,
            JobStatus::Delayed => self.delay_until.is_none_or(|until| until <= now),
            _ => false,
        }
    }

    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.status == JobStatus::Active && self.worker_id.as_deref() == Some(worker_id)
    }

    pub fn is_lock_expired(&self, now: DateTime<Utc>) -> bool {
        self.lock_until.is_some_and(|until| until < now)
    }

    /// Claim the job for `worker_id`. Only valid from `WAITING`, `PAUSED` or `DELAYED`.
    pub fn move_to_active(
        &mut self,
        worker_id: impl Into<String>,
        lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !matches!(
            self.status,
            JobStatus::Waiting | JobStatus::Paused | JobStatus::Delayed
        ) {
            return Err(self.invalid_transition("move to active"));
        }
        self.activate(worker_id.into(), lock_until, now);
        Ok(())
    }

    /// Hand an `ACTIVE` job whose lock has already expired to another worker.
    pub fn take_over_expired_lock(
        &mut self,
        worker_id: impl Into<String>,
        lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.status != JobStatus::Active || !self.is_lock_expired(now) {
            return Err(self.invalid_transition("take over a live lock"));
        }
        self.activate(worker_id.into(), lock_until, now);
        Ok(())
    }

    fn activate(&mut self, worker_id: String, lock_until: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = JobStatus::Active;
        self.worker_id = Some(worker_id);
        self.lock_until = Some(lock_until);
        self.processed_on = Some(now);
        self.delay_until = None;
        self.attempts_made += 1;
        self.touch(now);
    }

    /// Push the lock expiry forward. Fails with `LockNotHeld` if `worker_id` lost the job.
    pub fn extend_lock(
        &mut self,
        lock_until: DateTime<Utc>,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.is_owned_by(worker_id) {
            return Err(StevedoreError::LockNotHeld {
                job_id: self.id.to_string(),
                worker_id: worker_id.to_string(),
            });
        }
        self.lock_until = Some(lock_until);
        self.touch(now);
        Ok(())
    }

    /// Finish the job successfully. Applied even when not `ACTIVE`, with a warning.
    pub fn mark_as_completed(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        if self.status != JobStatus::Active {
            warn!(
                job_id = %self.id,
                status = %self.status,
                "Completing job that is not active"
            );
        }
        self.status = JobStatus::Completed;
        self.return_value = Some(result);
        self.finished_on = Some(now);
        self.failed_reason = None;
        self.stacktrace.clear();
        self.release_lock();
        self.touch(now);
    }

    /// Fail the job permanently. Applied even when not `ACTIVE`, with a warning.
    pub fn mark_as_failed(
        &mut self,
        reason: impl Into<String>,
        stacktrace: Vec<String>,
        now: DateTime<Utc>,
    ) {
        if self.status != JobStatus::Active {
            warn!(
                job_id = %self.id,
                status = %self.status,
                "Failing job that is not active"
            );
        }
        self.status = JobStatus::Failed;
        self.failed_reason = Some(reason.into());
        self.stacktrace = stacktrace;
        self.return_value = None;
        self.finished_on = Some(now);
        self.release_lock();
        self.touch(now);
    }

    /// Park the job until `delay_until`, optionally recording the error that caused it.
    pub fn move_to_delayed(
        &mut self,
        delay_until: DateTime<Utc>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.invalid_transition("move to delayed"));
        }
        self.status = JobStatus::Delayed;
        self.delay_until = Some(delay_until);
        self.processed_on = None;
        if let Some(error) = error {
            self.failed_reason = Some(error.to_string());
        }
        self.release_lock();
        self.touch(now);
        Ok(())
    }

    pub fn move_to_waiting(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.invalid_transition("move to waiting"));
        }
        self.status = JobStatus::Waiting;
        self.delay_until = None;
        self.processed_on = None;
        self.release_lock();
        self.touch(now);
        Ok(())
    }

    /// Release the lock of an `ACTIVE` job whose worker disappeared.
    ///
    /// Fails the job when its attempts are exhausted or it stalled more often than
    /// `max_stalled_count`. Otherwise the job stays `ACTIVE` without a lock and the
    /// caller must requeue it with [`move_to_waiting`](Self::move_to_waiting).
    pub fn mark_as_stalled(&mut self, now: DateTime<Utc>) -> Result<StallOutcome> {
        if self.status != JobStatus::Active {
            return Err(self.invalid_transition("mark as stalled"));
        }

        let message = format!(
            "Job stalled: worker {} held the lock until {}",
            self.worker_id.as_deref().unwrap_or("<none>"),
            self.lock_until
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "<none>".to_string()),
        );
        self.push_log(LogLevel::Warn, message, now);

        self.stalled_count += 1;
        self.processed_on = None;
        self.release_lock();
        self.touch(now);

        if self.attempts_made >= self.options.attempts {
            self.mark_as_failed(STALLED_ATTEMPTS_EXHAUSTED, Vec::new(), now);
            return Ok(StallOutcome::PermanentlyFailed);
        }
        if self.stalled_count > self.options.max_stalled_count {
            self.mark_as_failed(STALLED_LIMIT_EXCEEDED, Vec::new(), now);
            return Ok(StallOutcome::PermanentlyFailed);
        }
        Ok(StallOutcome::NeedsRequeue)
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !matches!(self.status, JobStatus::Waiting | JobStatus::Delayed) {
            return Err(self.invalid_transition("pause"));
        }
        self.status = JobStatus::Paused;
        self.touch(now);
        Ok(())
    }

    /// Leave `PAUSED`, back to `DELAYED` if the delay is still in the future.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != JobStatus::Paused {
            return Err(self.invalid_transition("resume"));
        }
        match self.delay_until {
            Some(until) if until > now => self.status = JobStatus::Delayed,
            _ => {
                self.status = JobStatus::Waiting;
                self.delay_until = None;
            }
        }
        self.touch(now);
        Ok(())
    }

    /// Record progress. Returns `false` (and leaves the job untouched) once terminal.
    pub fn update_progress(&mut self, progress: JobProgress, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            warn!(job_id = %self.id, status = %self.status, "Ignoring progress update on finished job");
            return false;
        }
        self.progress = progress;
        self.touch(now);
        true
    }

    /// Append a log entry. Returns `false` (and leaves the job untouched) once terminal.
    pub fn add_log(
        &mut self,
        message: impl Into<String>,
        level: LogLevel,
        now: DateTime<Utc>,
    ) -> bool {
        if self.status.is_terminal() {
            warn!(job_id = %self.id, status = %self.status, "Ignoring log entry on finished job");
            return false;
        }
        self.push_log(level, message.into(), now);
        self.touch(now);
        true
    }

    fn push_log(&mut self, level: LogLevel, message: String, now: DateTime<Utc>) {
        self.logs.push(JobLogEntry {
            timestamp: now,
            level,
            message,
        });
    }

    fn release_lock(&mut self) {
        self.worker_id = None;
        self.lock_until = None;
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    fn invalid_transition(&self, action: &'static str) -> StevedoreError {
        StevedoreError::InvalidTransition {
            job_id: self.id.to_string(),
            status: self.status.to_string(),
            action,
        }
    }
}

impl TryFrom<JobParts> for Job {
    type Error = StevedoreError;

    fn try_from(parts: JobParts) -> Result<Self> {
        Job::from_parts(parts)
    }
}

impl From<Job> for JobParts {
    fn from(job: Job) -> Self {
        job.into_parts()
    }
}

/// `at + duration`, saturating at the largest representable instant.
pub(crate) fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::JobOptionsPatch;
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn job_with(patch: JobOptionsPatch) -> Job {
        let options = JobOptions::resolve(&JobOptionsPatch::new(), &patch).unwrap();
        Job::new("emails", "send-email", json!({"to": "a@b.com"}), options, t0())
    }

    fn active_job(attempts: u32) -> Job {
        let mut job = job_with(JobOptionsPatch::new().attempts(attempts));
        job.move_to_active("w1", t0() + secs(30), t0()).unwrap();
        job
    }

    #[test]
    fn test_new_job_is_waiting() {
        let job = job_with(JobOptionsPatch::new());
        assert_eq!(job.status(), JobStatus::Waiting);
        assert_eq!(job.attempts_made(), 0);
        assert!(job.delay_until().is_none());
        assert!(job.is_eligible(t0()));
        assert!(Uuid::parse_str(job.id().as_str()).is_ok());
    }

    #[test]
    fn test_new_job_with_delay_is_delayed() {
        let job = job_with(JobOptionsPatch::new().delay(Duration::from_secs(10)));
        assert_eq!(job.status(), JobStatus::Delayed);
        assert_eq!(job.delay_until(), Some(t0() + secs(10)));
        assert!(!job.is_eligible(t0() + secs(9)));
        assert!(job.is_eligible(t0() + secs(10)));
    }

    #[test]
    fn test_custom_job_id() {
        let id = JobId::parse("invoice-42").unwrap();
        let job = job_with(JobOptionsPatch::new().job_id(id.clone()));
        assert_eq!(job.id(), &id);

        assert!(JobId::parse("").is_err());
        assert!(JobId::parse("has space").is_err());
        assert!(JobId::parse("x".repeat(256)).is_err());
    }

    #[test]
    fn test_move_to_active_sets_lock_and_counts_attempt() {
        let job = active_job(3);
        assert_eq!(job.status(), JobStatus::Active);
        assert_eq!(job.worker_id(), Some("w1"));
        assert_eq!(job.lock_until(), Some(t0() + secs(30)));
        assert_eq!(job.processed_on(), Some(t0()));
        assert_eq!(job.attempts_made(), 1);
        assert!(!job.is_retry());
    }

    #[test]
    fn test_move_to_active_rejected_when_active_or_terminal() {
        let mut job = active_job(1);
        let err = job.move_to_active("w2", t0() + secs(30), t0()).unwrap_err();
        assert!(matches!(err, StevedoreError::InvalidTransition { .. }));

        job.mark_as_completed(json!(null), t0());
        assert!(job.move_to_active("w2", t0() + secs(30), t0()).is_err());
    }

    #[test]
    fn test_take_over_only_after_expiry() {
        let mut job = active_job(3);
        assert!(job.take_over_expired_lock("w2", t0() + secs(60), t0() + secs(10)).is_err());

        job.take_over_expired_lock("w2", t0() + secs(90), t0() + secs(31))
            .unwrap();
        assert_eq!(job.worker_id(), Some("w2"));
        assert_eq!(job.attempts_made(), 2);
    }

    #[test]
    fn test_extend_lock_requires_ownership() {
        let mut job = active_job(1);
        job.extend_lock(t0() + secs(60), "w1", t0() + secs(5)).unwrap();
        assert_eq!(job.lock_until(), Some(t0() + secs(60)));

        let err = job.extend_lock(t0() + secs(90), "w2", t0()).unwrap_err();
        assert!(matches!(err, StevedoreError::LockNotHeld { .. }));
        assert_eq!(job.lock_until(), Some(t0() + secs(60)));
    }

    #[test]
    fn test_completion_clears_lock() {
        let mut job = active_job(1);
        job.mark_as_completed(json!({"status": "sent"}), t0() + secs(2));

        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.return_value(), Some(&json!({"status": "sent"})));
        assert_eq!(job.finished_on(), Some(t0() + secs(2)));
        assert!(job.lock_until().is_none());
        assert!(job.worker_id().is_none());
        assert_eq!(job.updated_at(), t0() + secs(2));
    }

    #[test]
    fn test_late_completion_is_tolerated() {
        let mut job = job_with(JobOptionsPatch::new());
        job.mark_as_completed(json!(1), t0());
        assert_eq!(job.status(), JobStatus::Completed);
        assert!(job.finished_on().is_some());
    }

    #[test]
    fn test_failure_records_reason_and_stack() {
        let mut job = active_job(1);
        job.mark_as_failed("boom", vec!["at handler".to_string()], t0());
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.failed_reason(), Some("boom"));
        assert_eq!(job.stacktrace(), ["at handler".to_string()]);
        assert!(job.return_value().is_none());
        assert!(job.worker_id().is_none());
    }

    #[test]
    fn test_move_to_delayed_for_retry() {
        let mut job = active_job(3);
        job.move_to_delayed(t0() + secs(5), Some("timeout"), t0())
            .unwrap();

        assert_eq!(job.status(), JobStatus::Delayed);
        assert_eq!(job.delay_until(), Some(t0() + secs(5)));
        assert_eq!(job.failed_reason(), Some("timeout"));
        assert!(job.processed_on().is_none());
        assert!(job.lock_until().is_none());
        assert!(job.is_retry());

        job.move_to_active("w2", t0() + secs(40), t0() + secs(5))
            .unwrap();
        assert_eq!(job.attempts_made(), 2);
        assert!(job.delay_until().is_none());
        assert!(job.is_retry());
    }

    #[test]
    fn test_terminal_jobs_cannot_be_requeued() {
        let mut job = active_job(1);
        job.mark_as_failed("boom", Vec::new(), t0());
        assert!(job.move_to_waiting(t0()).is_err());
        assert!(job.move_to_delayed(t0(), None, t0()).is_err());
        assert!(job.finished_on().is_some());
    }

    #[test]
    fn test_stall_with_attempts_left_needs_requeue() {
        let mut job = active_job(3);
        let outcome = job.mark_as_stalled(t0() + secs(60)).unwrap();
        assert_eq!(outcome, StallOutcome::NeedsRequeue);
        assert_eq!(job.status(), JobStatus::Active);
        assert!(job.worker_id().is_none());
        assert_eq!(job.stalled_count(), 1);
        assert_eq!(job.logs().last().map(|l| l.level), Some(LogLevel::Warn));

        job.move_to_waiting(t0() + secs(60)).unwrap();
        assert_eq!(job.status(), JobStatus::Waiting);
    }

    #[test]
    fn test_stall_without_attempts_left_fails() {
        let mut job = active_job(1);
        let outcome = job.mark_as_stalled(t0() + secs(60)).unwrap();
        assert_eq!(outcome, StallOutcome::PermanentlyFailed);
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.failed_reason(), Some(STALLED_ATTEMPTS_EXHAUSTED));
    }

    #[test]
    fn test_stall_limit_fails_job() {
        let mut job = job_with(JobOptionsPatch::new().attempts(10).max_stalled_count(1));
        for round in 0..2 {
            let now = t0() + secs(100 * round);
            job.move_to_active("w1", now + secs(30), now).unwrap();
            let outcome = job.mark_as_stalled(now + secs(31)).unwrap();
            if round == 0 {
                assert_eq!(outcome, StallOutcome::NeedsRequeue);
                job.move_to_waiting(now + secs(31)).unwrap();
            } else {
                assert_eq!(outcome, StallOutcome::PermanentlyFailed);
            }
        }
        assert_eq!(job.failed_reason(), Some(STALLED_LIMIT_EXCEEDED));
    }

    #[test]
    fn test_pause_and_resume() {
        let mut job = job_with(JobOptionsPatch::new().delay(Duration::from_secs(10)));
        job.pause(t0()).unwrap();
        assert_eq!(job.status(), JobStatus::Paused);
        assert!(!job.is_eligible(t0() + secs(20)));

        job.resume(t0() + secs(5)).unwrap();
        assert_eq!(job.status(), JobStatus::Delayed);

        job.pause(t0() + secs(6)).unwrap();
        job.resume(t0() + secs(11)).unwrap();
        assert_eq!(job.status(), JobStatus::Waiting);
        assert!(job.delay_until().is_none());

        let mut active = active_job(1);
        assert!(active.pause(t0()).is_err());
        assert!(active.resume(t0()).is_err());
    }

    #[test]
    fn test_progress_and_logs_ignored_once_terminal() {
        let mut job = active_job(1);
        assert!(job.update_progress(JobProgress::Number(50.0), t0()));
        assert!(job.add_log("halfway", LogLevel::Info, t0()));

        job.mark_as_completed(json!(null), t0());
        assert!(!job.update_progress(JobProgress::Number(99.0), t0()));
        assert!(!job.add_log("late", LogLevel::Info, t0()));
        assert_eq!(job.progress(), &JobProgress::Number(50.0));
        assert_eq!(job.logs().len(), 1);
    }

    #[test]
    fn test_updated_at_never_moves_backwards() {
        let mut job = active_job(1);
        job.add_log("later", LogLevel::Info, t0() + secs(10));
        job.add_log("clock skew", LogLevel::Info, t0() + secs(5));
        assert_eq!(job.updated_at(), t0() + secs(10));
    }

    #[test]
    fn test_from_parts_rejects_broken_invariants() {
        let job = active_job(1);
        let mut parts = job.clone().into_parts();
        parts.worker_id = None;
        assert!(Job::from_parts(parts).is_err());

        let mut parts = job.into_parts();
        parts.status = JobStatus::Completed;
        parts.worker_id = None;
        parts.lock_until = None;
        assert!(Job::from_parts(parts).is_err());
    }

    #[test]
    fn test_serde_goes_through_parts() {
        let job = active_job(2);
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "active");
        assert_eq!(json["worker_id"], "w1");

        let restored: Job = serde_json::from_value(json).unwrap();
        assert_eq!(restored, job);
    }
}
