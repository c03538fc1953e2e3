//! Logging bootstrap for processes embedding the lock catalog.
//!
//! | Log File          | Component                     | Target Prefixes    |
//! |-------------------|-------------------------------|--------------------|
//! | distlock.log      | Root logger (all components)  | (all)              |
//! | lock-catalog.log  | Lock catalog protocol         | distlock_catalog   |
//!
//! Log files are stored in `~/distlock/logs` by default.
//! Override with the `DISTLOCK_LOG_DIR` environment variable.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

const ROOT_LOG_FILE: &str = "distlock.log";
const CATALOG_LOG_FILE: &str = "lock-catalog.log";
const CATALOG_TARGET: &str = "distlock_catalog";

/// Log rotation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Base log directory (default: `~/distlock/logs`)
    pub log_dir: PathBuf,
    /// Enable console output
    pub console_output: bool,
    /// Console log level
    pub console_level: Level,
    /// Enable file logging
    pub file_logging: bool,
    /// Default log level for files
    pub file_level: Level,
    /// Log rotation policy
    pub rotation: LogRotation,
}

fn default_log_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(format!("{}/distlock/logs", home))
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            console_output: true,
            console_level: Level::INFO,
            file_logging: false,
            file_level: Level::INFO,
            rotation: LogRotation::Daily,
        }
    }
}

impl LoggingConfig {
    /// Create from environment variables.
    pub fn from_env() -> Self {
        let log_dir = std::env::var("DISTLOCK_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_log_dir());

        let console_output = std::env::var("DISTLOCK_LOG_CONSOLE")
            .map(|v| v.to_lowercase() != "false" && v != "0")
            .unwrap_or(true);

        let file_logging = std::env::var("DISTLOCK_LOG_FILE")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(false);

        let console_level = std::env::var("DISTLOCK_LOG_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Level::INFO);

        Self {
            log_dir,
            console_output,
            console_level,
            file_logging,
            file_level: console_level,
            rotation: LogRotation::Daily,
        }
    }

    /// Console-only configuration at the given level.
    pub fn console(level: &str) -> Self {
        let level = level.parse().unwrap_or(Level::INFO);
        Self {
            console_level: level,
            file_level: level,
            ..Default::default()
        }
    }

    /// Enable file logging into `log_dir`.
    pub fn with_file_logging(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = log_dir.into();
        self.file_logging = true;
        self
    }
}

/// Keeps the non-blocking file writers alive; buffered output is flushed on drop.
pub struct LoggingGuard {
    _file_guards: Vec<WorkerGuard>,
}

#[derive(thiserror::Error, Debug)]
pub enum LoggingError {
    #[error("failed to create log directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to initialize logging: {0}")]
    Init(String),
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured levels for the console and root file
/// layers. The catalog file captures every event targeted at the lock
/// catalog regardless of level.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, LoggingError> {
    if config.file_logging {
        std::fs::create_dir_all(&config.log_dir)?;
    }

    let mut guards: Vec<WorkerGuard> = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.console_output {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.console_level.to_string()));
        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_filter(filter);
        layers.push(Box::new(console_layer));
    }

    if config.file_logging {
        let root_appender =
            RollingFileAppender::new(config.rotation.into(), &config.log_dir, ROOT_LOG_FILE);
        let (root_nb, root_guard) = tracing_appender::non_blocking(root_appender);
        guards.push(root_guard);

        let root_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.file_level.to_string()));
        let root_layer = fmt::layer()
            .with_writer(root_nb)
            .with_target(true)
            .with_ansi(false)
            .with_filter(root_filter);
        layers.push(Box::new(root_layer));

        let catalog_appender =
            RollingFileAppender::new(config.rotation.into(), &config.log_dir, CATALOG_LOG_FILE);
        let (catalog_nb, catalog_guard) = tracing_appender::non_blocking(catalog_appender);
        guards.push(catalog_guard);

        let catalog_layer = fmt::layer()
            .with_writer(catalog_nb)
            .with_target(true)
            .with_ansi(false)
            .with_filter(Targets::new().with_target(CATALOG_TARGET, LevelFilter::TRACE));
        layers.push(Box::new(catalog_layer));
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    if config.file_logging {
        tracing::info!(log_dir = %config.log_dir.display(), "file logging initialized");
    }

    Ok(LoggingGuard {
        _file_guards: guards,
    })
}
