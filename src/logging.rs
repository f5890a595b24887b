// src/logging.rs

//! Logging setup for `watchbuild` using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the log level:
//! 1. the level passed by the caller (usually from [`BuildConfig::log_level`])
//! 2. `WATCHBUILD_LOG` environment variable (e.g. "info", "debug")
//! 3. default to `info`
//!
//! Logs go to STDERR.
//!
//! [`BuildConfig::log_level`]: crate::config::BuildConfig

use anyhow::Result;
use tracing_subscriber::fmt;

use crate::types::LogLevel;

/// Environment variable consulted when no explicit level is given.
pub const LOG_ENV_VAR: &str = "WATCHBUILD_LOG";

/// Initialise the global logging subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(level: Option<LogLevel>) -> Result<()> {
    let level = match level {
        Some(lvl) => level_from_log_level(lvl),
        None => std::env::var(LOG_ENV_VAR)
            .ok()
            .and_then(|s| s.parse::<LogLevel>().ok())
            .map(level_from_log_level)
            .unwrap_or(tracing::Level::INFO),
    };

    fmt()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(())
}

pub(crate) fn level_from_log_level(lvl: LogLevel) -> tracing::Level {
    match lvl {
        LogLevel::Error => tracing::Level::ERROR,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Trace => tracing::Level::TRACE,
    }
}

/// Emit a line at a runtime-selected level (used for relayed worker logs).
pub(crate) fn log_at(level: LogLevel, task: &str, message: &str) {
    match level {
        LogLevel::Error => tracing::error!(task = %task, "{message}"),
        LogLevel::Warn => tracing::warn!(task = %task, "{message}"),
        LogLevel::Info => tracing::info!(task = %task, "{message}"),
        LogLevel::Debug => tracing::debug!(task = %task, "{message}"),
        LogLevel::Trace => tracing::trace!(task = %task, "{message}"),
    }
}
