//! Shared logging infrastructure for PerpLab binaries.
//!
//! The backtesting core itself reads no environment variables; binaries
//! configure logging here using the `tracing` ecosystem, with support for:
//! - File-based logging with daily rotation (per-run `logs/` directories)
//! - Environment-based configuration
//!
//! # Usage
//!
//! ```rust,ignore
//! use perplab_logging::{LogConfig, init_cli_logging};
//!
//! let config = LogConfig::from_env();
//! let _guard = init_cli_logging(&config);
//!
//! tracing::info!("run started");
//! ```

use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Configuration for PerpLab logging.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Enable logging output.
    pub enabled: bool,
    /// Log level filter (e.g., "info", "perplab=debug,polars=warn").
    pub filter: String,
    /// Directory for log files.
    pub log_dir: PathBuf,
    /// Enable daily log rotation.
    pub rotate_daily: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            filter: "info,perplab=debug,polars=warn".to_string(),
            log_dir: PathBuf::from("data/logs"),
            rotate_daily: true,
        }
    }
}

impl LogConfig {
    /// Create a new LogConfig with the specified filter.
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            enabled: true,
            filter: filter.into(),
            ..Default::default()
        }
    }

    /// Create LogConfig from environment variables.
    ///
    /// Reads:
    /// - `PERPLAB_LOG_ENABLED`: Set to "1" to enable logging
    /// - `PERPLAB_LOG_FILTER`: Log filter string (default: "info,perplab=debug")
    /// - `PERPLAB_LOG_DIR`: Log directory (default: "data/logs")
    pub fn from_env() -> Self {
        let enabled = std::env::var("PERPLAB_LOG_ENABLED")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let filter = std::env::var("PERPLAB_LOG_FILTER")
            .unwrap_or_else(|_| "info,perplab=debug".to_string());

        let log_dir = std::env::var("PERPLAB_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/logs"));

        Self {
            enabled,
            filter,
            log_dir,
            rotate_daily: true,
        }
    }

    /// Point logging at a specific run's `logs/` directory.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }
}

/// Guard that ensures logs are flushed on drop.
///
/// Keep this guard alive for the duration of logging.
/// When dropped, it will flush any buffered log entries.
pub struct LogGuard {
    _worker_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

impl LogGuard {
    fn new(worker_guard: Option<tracing_appender::non_blocking::WorkerGuard>) -> Self {
        Self {
            _worker_guard: worker_guard,
        }
    }

    /// Create an empty guard (no-op).
    pub fn empty() -> Self {
        Self {
            _worker_guard: None,
        }
    }
}

/// Create a file appender with optional daily rotation.
fn create_file_appender(config: &LogConfig) -> RollingFileAppender {
    // Ensure log directory exists
    if let Err(e) = std::fs::create_dir_all(&config.log_dir) {
        eprintln!("Warning: Failed to create log directory: {}", e);
    }

    let rotation = if config.rotate_daily {
        Rotation::DAILY
    } else {
        Rotation::NEVER
    };

    RollingFileAppender::new(rotation, &config.log_dir, "perplab.log")
}

/// Create an EnvFilter from the config's filter string.
fn create_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_new(&config.filter).unwrap_or_else(|e| {
        eprintln!("Warning: Invalid log filter '{}': {}", config.filter, e);
        EnvFilter::new("info")
    })
}

/// Initialize logging for the CLI (stderr output).
///
/// Logs go to stderr so they don't interfere with command output on stdout
/// (reports, JSON results).
///
/// Returns `None` if logging is disabled.
pub fn init_cli_logging(config: &LogConfig) -> Option<LogGuard> {
    if !config.enabled {
        return None;
    }

    let filter = create_filter(config);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_ansi(true)
        .compact()
        .with_writer(std::io::stderr)
        .with_filter(filter);

    tracing_subscriber::registry().with(stderr_layer).init();

    Some(LogGuard::empty())
}

/// Initialize logging to a run's log directory (file-only output).
///
/// Used for long batch runs where stderr is reserved for progress display.
/// The log file is located at `{log_dir}/perplab.YYYY-MM-DD.log`.
///
/// Returns `None` if logging is disabled.
pub fn init_run_logging(config: &LogConfig) -> Option<LogGuard> {
    if !config.enabled {
        return None;
    }

    let filter = create_filter(config);
    let file_appender = create_file_appender(config);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_ansi(false)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(non_blocking)
        .with_filter(filter);

    tracing_subscriber::registry().with(file_layer).init();

    Some(LogGuard::new(Some(guard)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_disabled() {
        let config = LogConfig::default();
        assert!(!config.enabled);
        assert!(config.rotate_daily);
    }

    #[test]
    fn new_config_enables_logging() {
        let config = LogConfig::new("debug");
        assert!(config.enabled);
        assert_eq!(config.filter, "debug");
    }

    #[test]
    fn with_log_dir_overrides_path() {
        let config = LogConfig::default().with_log_dir("/tmp/run42/logs");
        assert_eq!(config.log_dir, PathBuf::from("/tmp/run42/logs"));
    }
}
