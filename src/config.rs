//! Configuration management for stevedore.
//!
//! Configuration is a tree of serde structs with sensible defaults, loadable from a
//! TOML file or from `STEVEDORE_*` environment variables.
//!
//! ```rust
//! use stevedore::config::StevedoreConfig;
//! use std::time::Duration;
//!
//! let config = StevedoreConfig::new()
//!     .with_database_url("postgresql://localhost/stevedore")
//!     .with_lock_duration(Duration::from_secs(60))
//!     .with_poll_interval(Duration::from_millis(250));
//!
//! assert_eq!(config.worker.lock_duration, Duration::from_secs(60));
//! ```

use crate::{Result, StevedoreError, options::JobOptionsPatch};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Serialize `std::time::Duration` as human-readable strings ("250ms", "30s", "5m", "1h").
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(D::Error::custom)
    }

    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis == 0 {
            "0s".to_string()
        } else if millis % 3_600_000 == 0 {
            format!("{}h", millis / 3_600_000)
        } else if millis % 60_000 == 0 {
            format!("{}m", millis / 60_000)
        } else if millis % 1000 == 0 {
            format!("{}s", millis / 1000)
        } else {
            format!("{}ms", millis)
        }
    }

    /// Parse a duration string like "250ms", "30s", "5m", "1h" or "90" (seconds).
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
            (num, "ms")
        } else if s.len() >= 2 {
            s.split_at(s.len() - 1)
        } else {
            return Err(format!("Invalid duration format: {}", s));
        };

        let num: u64 = num_str
            .trim()
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

        let secs_per_unit = match unit {
            "ms" => return Ok(Duration::from_millis(num)),
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            _ => return Err(format!("Invalid duration unit: {}", unit)),
        };
        num.checked_mul(secs_per_unit)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("Duration too large: {}", s))
    }

    /// Same encoding for `Option<Duration>`.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&super::format_duration(*d)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            use serde::de::Error;

            let value = Option::<String>::deserialize(deserializer)?;
            value
                .map(|s| super::parse_duration(&s).map_err(D::Error::custom))
                .transpose()
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StevedoreConfig {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Queue service configuration
    pub queue: QueueConfig,

    /// Worker runtime configuration
    pub worker: WorkerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl StevedoreConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database_url(mut self, url: &str) -> Self {
        self.database.url = url.to_string();
        self
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.worker.lock_duration = lock_duration;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.worker.poll_interval = interval;
        self
    }

    pub fn with_default_job_options(mut self, options: JobOptionsPatch) -> Self {
        self.queue.default_job_options = options;
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.worker.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from `STEVEDORE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_env_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("STEVEDORE_DATABASE_URL") {
            config.database.url = url;
        }
        if let Some(pool_size) = lookup("STEVEDORE_DATABASE_POOL_SIZE") {
            config.database.pool_size = parse_env("STEVEDORE_DATABASE_POOL_SIZE", &pool_size)?;
        }

        if let Some(value) = lookup("STEVEDORE_LOCK_DURATION") {
            config.worker.lock_duration = parse_env_duration("STEVEDORE_LOCK_DURATION", &value)?;
        }
        if let Some(value) = lookup("STEVEDORE_LOCK_RENEW_BUFFER") {
            config.worker.lock_renew_time_buffer =
                Some(parse_env_duration("STEVEDORE_LOCK_RENEW_BUFFER", &value)?);
        }
        if let Some(value) = lookup("STEVEDORE_POLL_INTERVAL") {
            config.worker.poll_interval = parse_env_duration("STEVEDORE_POLL_INTERVAL", &value)?;
        }
        if let Some(value) = lookup("STEVEDORE_STALLED_CHECK_INTERVAL") {
            config.queue.stalled_jobs.check_interval =
                parse_env_duration("STEVEDORE_STALLED_CHECK_INTERVAL", &value)?;
        }
        if let Some(value) = lookup("STEVEDORE_LOG_LEVEL") {
            config.logging.level = value;
        }
        if let Some(value) = lookup("STEVEDORE_LOG_JSON") {
            config.logging.json_format = parse_env("STEVEDORE_LOG_JSON", &value)?;
        }

        config.worker.validate()?;
        Ok(config)
    }

    /// Create a configuration for development use
    pub fn development() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/stevedore_dev".to_string(),
                pool_size: 5,
                ..Default::default()
            },
            worker: WorkerConfig {
                poll_interval: Duration::from_millis(200),
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                include_location: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a configuration for production use
    pub fn production() -> Self {
        Self {
            database: DatabaseConfig {
                pool_size: 20,
                connection_timeout_secs: 60,
                ..Default::default()
            },
            queue: QueueConfig {
                stalled_jobs: StalledJobsConfig {
                    limit_per_check: 100,
                    ..Default::default()
                },
                ..Default::default()
            },
            logging: LoggingConfig {
                json_format: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| StevedoreError::Config(format!("Invalid value for {}: {}", key, value)))
}

fn parse_env_duration(key: &str, value: &str) -> Result<Duration> {
    duration_str::parse_duration(value)
        .map_err(|e| StevedoreError::Config(format!("Invalid value for {}: {}", key, e)))
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: String,

    /// Connection pool size
    pub pool_size: u32,

    /// Connection timeout in seconds
    pub connection_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/stevedore".to_string(),
            pool_size: 10,
            connection_timeout_secs: 30,
        }
    }
}

/// Queue service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue-level defaults merged under every job's own options
    pub default_job_options: JobOptionsPatch,

    /// Stalled-job maintenance loop
    pub stalled_jobs: StalledJobsConfig,

    /// Capacity of the lifecycle event channel
    pub event_buffer_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_job_options: JobOptionsPatch::default(),
            stalled_jobs: StalledJobsConfig::default(),
            event_buffer_size: 1024,
        }
    }
}

/// Stalled-job maintenance configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StalledJobsConfig {
    /// How often the maintenance loop scans for stalled jobs
    #[serde(with = "duration_str")]
    pub check_interval: Duration,

    /// Extra time past `lock_until` before an active job counts as stalled
    #[serde(with = "duration_str")]
    pub grace_period: Duration,

    /// Maximum number of stalled jobs recovered per cycle
    pub limit_per_check: usize,
}

impl Default for StalledJobsConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(15),
            grace_period: Duration::ZERO,
            limit_per_check: 10,
        }
    }
}

/// Worker runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// How long a fetched job stays locked before it must be renewed
    #[serde(with = "duration_str")]
    pub lock_duration: Duration,

    /// Renew this long before the lock expires; defaults to half the lock duration
    #[serde(with = "duration_str::option", skip_serializing_if = "Option::is_none")]
    pub lock_renew_time_buffer: Option<Duration>,

    /// Sleep between polls when the queue is empty
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,

    /// Jobs per worker instance. Only 1 is supported; run more workers instead.
    pub concurrency: usize,

    /// Graceful close waits at most `lock_duration * shutdown_timeout_multiplier`
    pub shutdown_timeout_multiplier: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(30),
            lock_renew_time_buffer: None,
            poll_interval: Duration::from_secs(1),
            concurrency: 1,
            shutdown_timeout_multiplier: 2,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lock_duration.is_zero() {
            return Err(StevedoreError::Config(
                "worker lock_duration must be greater than 0".to_string(),
            ));
        }
        if let Some(buffer) = self.lock_renew_time_buffer {
            if buffer >= self.lock_duration {
                return Err(StevedoreError::Config(
                    "worker lock_renew_time_buffer must be smaller than lock_duration".to_string(),
                ));
            }
        }
        if self.poll_interval.is_zero() {
            return Err(StevedoreError::Config(
                "worker poll_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Period of the lock-renewal timer: `lock_duration - lock_renew_time_buffer`.
    pub fn renew_interval(&self) -> Duration {
        let buffer = self
            .lock_renew_time_buffer
            .unwrap_or(self.lock_duration / 2);
        self.lock_duration
            .saturating_sub(buffer)
            .max(Duration::from_millis(1))
    }

    /// Upper bound on how long `close()` waits for an in-flight job.
    pub fn shutdown_timeout(&self) -> Duration {
        self.lock_duration
            .saturating_mul(self.shutdown_timeout_multiplier.max(1))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error), overridden by `RUST_LOG`
    pub level: String,

    /// Whether to enable structured JSON logging
    pub json_format: bool,

    /// Whether to include file and line information
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
        }
    }
}
