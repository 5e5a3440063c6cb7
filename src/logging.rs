//! Subscriber setup for binaries and demos.
//!
//! The library only emits `tracing` events; installing a subscriber is left to
//! the application. [`init_tracing`] is the one-call setup driven by
//! [`LoggingConfig`].

use crate::config::{LogLevel, LoggingConfig};
use crate::error::{ClaimqError, ClaimqResult};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Filter directive for a configured level
pub fn level_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

/// Build the event filter; `RUST_LOG` wins over the configured level.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_directive(config.level)))
}

/// Install a global fmt subscriber.
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(config: &LoggingConfig) -> ClaimqResult<()> {
    let registry = tracing_subscriber::registry().with(env_filter(config));

    let result = if config.json_format {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(config.include_targets),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(config.colored)
                    .with_target(config.include_targets),
            )
            .try_init()
    };

    result.map_err(|e| ClaimqError::config(format!("Failed to install tracing subscriber: {}", e)))
}
