//! Logging setup shared by the PVH binaries.
//!
//! Human-readable output goes to stderr (or stdout); an optional JSON copy of
//! every event goes to a file through a non-blocking writer. The returned
//! [`LogGuard`] must be held until exit so buffered lines are flushed.

use std::path::PathBuf;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::EnvOverrides;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {message}")]
    Filter { filter: String, message: String },

    #[error("log file {} has no file name", .0.display())]
    BadPath(PathBuf),

    #[error("failed to create log directory {}: {source}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a global subscriber is already installed: {0}")]
    Init(String),
}

/// Console output style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Some(Self::Pretty),
            "compact" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `pvhd=debug,pvh_common=info`.
    pub level: String,
    pub format: LogFormat,
    /// JSON log file written alongside console output.
    pub file: Option<PathBuf>,
    /// Write console output to stderr instead of stdout.
    pub stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
            stderr: false,
        }
    }
}

impl LogConfig {
    /// Read `PVH_LOG_LEVEL`, `PVH_LOG_FORMAT` and `PVH_LOG_FILE`.
    ///
    /// `RUST_LOG`, when set, wins over `PVH_LOG_LEVEL` so per-module
    /// directives keep working.
    pub fn from_env(default_level: &str) -> Self {
        let mut env = EnvOverrides::new();
        let level = match std::env::var("RUST_LOG") {
            Ok(directives) if !directives.is_empty() => directives,
            _ => env
                .log_level("LOG_LEVEL")
                .unwrap_or_else(|| default_level.to_string()),
        };
        let format = env
            .choice("LOG_FORMAT", "pretty, compact or json", LogFormat::parse)
            .unwrap_or_default();
        let file = env.path("LOG_FILE");

        // The subscriber is not installed yet.
        for err in env.errors() {
            eprintln!("warning: {err}");
        }

        Self {
            level,
            format,
            file,
            stderr: false,
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_file(mut self, file: Option<PathBuf>) -> Self {
        if file.is_some() {
            self.file = file;
        }
        self
    }
}

/// Keeps the file writer alive.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<LogGuard, LoggingError> {
    let filter = EnvFilter::try_new(&config.level).map_err(|e| LoggingError::Filter {
        filter: config.level.clone(),
        message: e.to_string(),
    })?;

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let file_name = path
                .file_name()
                .ok_or_else(|| LoggingError::BadPath(path.clone()))?
                .to_owned();
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), PathBuf::from);
            std::fs::create_dir_all(&dir).map_err(|source| LoggingError::Directory {
                path: dir.clone(),
                source,
            })?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let console = match (config.format, config.stderr) {
        (LogFormat::Json, true) => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        (LogFormat::Json, false) => fmt::layer().json().boxed(),
        (LogFormat::Compact, true) => fmt::layer().compact().with_writer(std::io::stderr).boxed(),
        (LogFormat::Compact, false) => fmt::layer().compact().boxed(),
        (LogFormat::Pretty, true) => fmt::layer().with_writer(std::io::stderr).boxed(),
        (LogFormat::Pretty, false) => fmt::layer().boxed(),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .with(filter)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    Ok(LogGuard { _file: guard })
}
