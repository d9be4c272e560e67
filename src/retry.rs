//! Backoff strategies applied before a failed job is retried.
//!
//! A strategy is a tagged value so it can be stored with the job's options:
//!
//! - [`Fixed`](BackoffStrategy::Fixed) - constant delay between retries
//! - [`Exponential`](BackoffStrategy::Exponential) - `base * 2^(attempts_made - 1)`,
//!   optionally capped and jittered
//! - [`Custom`](BackoffStrategy::Custom) - a named callback; only the name is persisted,
//!   the callback is either carried in memory or registered on the queue service
//!
//! # Examples
//!
//! ```rust
//! use stevedore::retry::BackoffStrategy;
//! use std::time::Duration;
//!
//! let strategy = BackoffStrategy::exponential(Duration::from_millis(100));
//!
//! assert_eq!(strategy.calculate_delay(1, "boom"), Some(Duration::from_millis(100)));
//! assert_eq!(strategy.calculate_delay(2, "boom"), Some(Duration::from_millis(200)));
//! assert_eq!(strategy.calculate_delay(3, "boom"), Some(Duration::from_millis(400)));
//! ```

use crate::{Result, StevedoreError, config::duration_str};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};

/// Signature of a custom backoff callback.
///
/// Receives the number of attempts made so far (counted at activation) and the last
/// error message. Returns the delay before the next attempt. `None` means no delay:
/// the number of attempts alone decides when a job stops retrying.
pub type BackoffFnInner = dyn Fn(u32, &str) -> Option<Duration> + Send + Sync;

/// Cloneable handle to a custom backoff callback.
#[derive(Clone)]
pub struct BackoffFn(Arc<BackoffFnInner>);

impl BackoffFn {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(u32, &str) -> Option<Duration> + Send + Sync + 'static,
    {
        Self(Arc::new(func))
    }

    pub fn call(&self, attempts_made: u32, error: &str) -> Option<Duration> {
        (self.0)(attempts_made, error)
    }
}

impl fmt::Debug for BackoffFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BackoffFn(<function>)")
    }
}

impl PartialEq for BackoffFn {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Delay strategy used between retry attempts of a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// The same delay before every retry.
    Fixed {
        #[serde(with = "duration_str")]
        delay: Duration,
        /// Fraction in `[0, 1]`; the delay is scaled by a random factor in `1 ± jitter`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jitter: Option<f64>,
    },

    /// Delay doubling with every attempt: `base * 2^(attempts_made - 1)`.
    Exponential {
        #[serde(with = "duration_str")]
        base: Duration,
        #[serde(
            default,
            with = "duration_str::option",
            skip_serializing_if = "Option::is_none"
        )]
        max_delay: Option<Duration>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jitter: Option<f64>,
    },

    /// Caller-defined delay. `func` is not persisted; a strategy loaded from storage
    /// resolves its callback by `name` through the queue service's registry.
    Custom {
        name: String,
        #[serde(skip)]
        func: Option<BackoffFn>,
    },
}

impl BackoffStrategy {
    /// Fixed delay without jitter.
    pub fn fixed(delay: Duration) -> Self {
        BackoffStrategy::Fixed {
            delay,
            jitter: None,
        }
    }

    /// Uncapped exponential backoff without jitter.
    pub fn exponential(base: Duration) -> Self {
        BackoffStrategy::Exponential {
            base,
            max_delay: None,
            jitter: None,
        }
    }

    /// Exponential backoff capped at `max_delay`, with optional jitter.
    pub fn exponential_capped(base: Duration, max_delay: Duration, jitter: Option<f64>) -> Self {
        BackoffStrategy::Exponential {
            base,
            max_delay: Some(max_delay),
            jitter,
        }
    }

    /// A named custom strategy carrying its callback.
    ///
    /// ```rust
    /// use stevedore::retry::BackoffStrategy;
    /// use std::time::Duration;
    ///
    /// let strategy = BackoffStrategy::custom("rate-limited", |attempts, error| {
    ///     if error.contains("429") {
    ///         Some(Duration::from_secs(60))
    ///     } else if attempts < 5 {
    ///         Some(Duration::from_secs(1))
    ///     } else {
    ///         None
    ///     }
    /// });
    ///
    /// assert_eq!(strategy.calculate_delay(1, "HTTP 429"), Some(Duration::from_secs(60)));
    /// assert_eq!(strategy.calculate_delay(5, "timeout"), None);
    /// ```
    pub fn custom<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(u32, &str) -> Option<Duration> + Send + Sync + 'static,
    {
        BackoffStrategy::Custom {
            name: name.into(),
            func: Some(BackoffFn::new(func)),
        }
    }

    /// Delay before the next attempt, given the attempts already made and the error
    /// that caused this failure.
    ///
    /// Returns `None` only for a custom strategy whose callback proposes no delay or is
    /// not available in memory.
    pub fn calculate_delay(&self, attempts_made: u32, error: &str) -> Option<Duration> {
        match self {
            BackoffStrategy::Fixed { delay, jitter } => Some(apply_jitter(*delay, *jitter)),
            BackoffStrategy::Exponential {
                base,
                max_delay,
                jitter,
            } => {
                let exponent = attempts_made.saturating_sub(1).min(31);
                let delay = base.saturating_mul(1u32 << exponent);
                let capped = match max_delay {
                    Some(max) => delay.min(*max),
                    None => delay,
                };
                Some(apply_jitter(capped, *jitter))
            }
            BackoffStrategy::Custom { func, .. } => {
                func.as_ref().and_then(|f| f.call(attempts_made, error))
            }
        }
    }

    /// Name of a custom strategy whose callback is not attached.
    pub fn unresolved_custom_name(&self) -> Option<&str> {
        match self {
            BackoffStrategy::Custom { name, func: None } => Some(name),
            _ => None,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            BackoffStrategy::Fixed { delay, jitter } => {
                if delay.is_zero() {
                    return Err(StevedoreError::validation(
                        "backoff delay must be greater than 0",
                    ));
                }
                validate_jitter(*jitter)
            }
            BackoffStrategy::Exponential {
                base,
                max_delay,
                jitter,
            } => {
                if base.is_zero() {
                    return Err(StevedoreError::validation(
                        "backoff delay must be greater than 0",
                    ));
                }
                if let Some(max) = max_delay {
                    if max < base {
                        return Err(StevedoreError::validation(
                            "backoff max_delay must not be smaller than the base delay",
                        ));
                    }
                }
                validate_jitter(*jitter)
            }
            BackoffStrategy::Custom { name, .. } => {
                if name.trim().is_empty() {
                    return Err(StevedoreError::validation(
                        "custom backoff strategies need a name",
                    ));
                }
                Ok(())
            }
        }
    }
}

fn validate_jitter(jitter: Option<f64>) -> Result<()> {
    match jitter {
        Some(j) if !(0.0..=1.0).contains(&j) => Err(StevedoreError::validation(
            "backoff jitter must be between 0 and 1",
        )),
        _ => Ok(()),
    }
}

/// Scale `delay` by a uniform random factor in `[1 - factor, 1 + factor]`.
fn apply_jitter(delay: Duration, factor: Option<f64>) -> Duration {
    match factor {
        Some(factor) if factor > 0.0 => {
            let mut rng = rand::thread_rng();
            let jitter_factor = rng.gen_range((1.0 - factor)..=(1.0 + factor));
            Duration::from_millis((delay.as_millis() as f64 * jitter_factor) as u64)
        }
        _ => delay,
    }
}
