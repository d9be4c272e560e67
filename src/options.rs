//! Job options and their merge rules.
//!
//! Options come in two shapes:
//!
//! - [`JobOptionsPatch`] - every field optional, used for queue-level defaults and
//!   per-job overrides; this is what callers and configuration files provide
//! - [`JobOptions`] - the resolved, validated set attached to a job at creation
//!
//! Resolution is deterministic: built-in defaults, then the queue patch, then the job
//! patch. A `Some` in a later layer wins.
//!
//! ```rust
//! use stevedore::options::{JobOptions, JobOptionsPatch};
//! use stevedore::retry::BackoffStrategy;
//! use std::time::Duration;
//!
//! let queue_defaults = JobOptionsPatch::new()
//!     .attempts(3)
//!     .backoff(BackoffStrategy::fixed(Duration::from_secs(5)));
//! let per_job = JobOptionsPatch::new().attempts(5).priority(1);
//!
//! let options = JobOptions::resolve(&queue_defaults, &per_job).unwrap();
//! assert_eq!(options.attempts, 5);
//! assert_eq!(options.priority, 1);
//! assert_eq!(options.backoff, Some(BackoffStrategy::fixed(Duration::from_secs(5))));
//! ```

use crate::{Result, StevedoreError, config::duration_str, job::JobId, retry::BackoffStrategy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do with a job once it reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RemovalPolicy {
    /// Leave the job in storage.
    #[default]
    Keep,
    /// Delete the job as soon as it is finished.
    Remove,
    /// Keep recent jobs with the same terminal status, bounded by age and/or count.
    Retain {
        #[serde(
            default,
            with = "duration_str::option",
            skip_serializing_if = "Option::is_none"
        )]
        max_age: Option<Duration>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_count: Option<usize>,
    },
}

/// Resolved options attached to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Lower values are processed first. Never negative.
    pub priority: i32,
    /// Initial delay before the job becomes eligible.
    #[serde(with = "duration_str")]
    pub delay: Duration,
    /// Maximum number of activations, including the first.
    pub attempts: u32,
    /// Delay strategy between retries. `None` retries immediately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffStrategy>,
    #[serde(default)]
    pub remove_on_complete: RemovalPolicy,
    #[serde(default)]
    pub remove_on_fail: RemovalPolicy,
    /// Caller-chosen identifier used instead of a generated one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(
        default,
        with = "duration_str::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    /// How many times the job may be recovered from a stall before it is failed.
    pub max_stalled_count: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay: Duration::ZERO,
            attempts: 1,
            backoff: None,
            remove_on_complete: RemovalPolicy::Keep,
            remove_on_fail: RemovalPolicy::Keep,
            job_id: None,
            timeout: None,
            max_stalled_count: 3,
        }
    }
}

impl JobOptions {
    /// Merge `defaults <- queue <- job` and validate the result.
    pub fn resolve(queue: &JobOptionsPatch, job: &JobOptionsPatch) -> Result<Self> {
        let options = Self::default().apply(queue).apply(job);
        options.validate()?;
        Ok(options)
    }

    /// Overlay every `Some` field of `patch`.
    pub fn apply(mut self, patch: &JobOptionsPatch) -> Self {
        if let Some(priority) = patch.priority {
            self.priority = priority.max(0);
        }
        if let Some(delay) = patch.delay {
            self.delay = delay;
        }
        if let Some(attempts) = patch.attempts {
            self.attempts = attempts;
        }
        if let Some(backoff) = &patch.backoff {
            self.backoff = Some(backoff.clone());
        }
        if let Some(policy) = &patch.remove_on_complete {
            self.remove_on_complete = policy.clone();
        }
        if let Some(policy) = &patch.remove_on_fail {
            self.remove_on_fail = policy.clone();
        }
        if let Some(job_id) = &patch.job_id {
            self.job_id = Some(job_id.clone());
        }
        if let Some(timeout) = patch.timeout {
            self.timeout = Some(timeout);
        }
        if let Some(max_stalled_count) = patch.max_stalled_count {
            self.max_stalled_count = max_stalled_count;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.attempts < 1 {
            return Err(StevedoreError::validation("attempts must be at least 1"));
        }
        if let Some(backoff) = &self.backoff {
            backoff.validate()?;
        }
        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(StevedoreError::validation(
                    "timeout must be greater than 0",
                ));
            }
        }
        Ok(())
    }
}

/// Partial job options. Unset fields fall through to the layer below.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptionsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(with = "duration_str::option", skip_serializing_if = "Option::is_none")]
    pub delay: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_on_complete: Option<RemovalPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_on_fail: Option<RemovalPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(with = "duration_str::option", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_stalled_count: Option<u32>,
}

impl JobOptionsPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Negative priorities are clamped to zero on resolution.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn remove_on_complete(mut self, policy: RemovalPolicy) -> Self {
        self.remove_on_complete = Some(policy);
        self
    }

    pub fn remove_on_fail(mut self, policy: RemovalPolicy) -> Self {
        self.remove_on_fail = Some(policy);
        self
    }

    pub fn job_id(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_stalled_count(mut self, count: u32) -> Self {
        self.max_stalled_count = Some(count);
        self
    }
}
