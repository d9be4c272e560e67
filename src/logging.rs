//! Structured logging setup.
//!
//! The crate only emits `tracing` events; installing a subscriber is left to the
//! application. [`init_logging`] is a convenience for binaries that want the defaults:
//!
//! ```rust,no_run
//! use stevedore::{config::LoggingConfig, logging::init_logging};
//!
//! # fn main() -> stevedore::Result<()> {
//! init_logging(&LoggingConfig {
//!     level: "debug".to_string(),
//!     json_format: true,
//!     include_location: false,
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! `RUST_LOG` takes precedence over the configured level when it is set.

use crate::{Result, StevedoreError, config::LoggingConfig};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Build the filter: `RUST_LOG` if set, otherwise the configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            StevedoreError::Config(format!("Invalid log level '{}': {}", config.level, e))
        }),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json_format {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init()
    };

    result.map_err(|e| {
        StevedoreError::Config(format!("Failed to initialize logging subscriber: {}", e))
    })
}
