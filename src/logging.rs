//! Logging setup.
//!
//! Console output in one of three formats (pretty, compact, JSON), filtered by
//! `RUST_LOG` when set and by the configured level otherwise. When a log
//! directory is configured, every event is also written to a file in that
//! directory that rotates daily at midnight.
//!
//! ```no_run
//! use last_unit::{config::UnitConfig, logging};
//!
//! # fn main() -> Result<(), String> {
//! let config = UnitConfig::default();
//! let _guard = logging::init_from_config(&config.logging)?;
//! tracing::info!("unit starting");
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Console output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, coloured
    Pretty,
    /// Single line, no colours
    Compact,
    /// One JSON object per event
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                s
            )),
        }
    }
}

/// Resolved logging options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Console format
    pub format: OutputFormat,
    /// Include file and line numbers
    pub with_file_and_line: bool,
    /// Include thread names
    pub with_thread_names: bool,
    /// Colour the pretty format
    pub with_ansi: bool,
    /// Directory and file name of the daily log file
    pub file: Option<(PathBuf, String)>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_file_and_line: false,
            with_thread_names: false,
            with_ansi: true,
            file: None,
        }
    }
}

impl TracingConfig {
    /// Options from the `[logging]` section.
    pub fn from_config(config: &LoggingConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.level)?,
            format: config.format.parse()?,
            file: config
                .directory
                .clone()
                .map(|dir| (dir, config.file_name.clone())),
            ..Default::default()
        })
    }

    /// Options at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set the console format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable colours.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    /// Also log to `directory/file_name`, rotated daily.
    pub fn with_file(mut self, directory: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        self.file = Some((directory.into(), file_name.into()));
        self
    }
}

/// Keeps the file writer flushing; drop it only at exit.
#[derive(Debug, Default)]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Initialize from the `[logging]` section.
pub fn init_from_config(config: &LoggingConfig) -> Result<LogGuard, String> {
    init(TracingConfig::from_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: if a subscriber is already installed this returns without error,
/// which keeps tests and embedded use safe.
pub fn init(config: TracingConfig) -> Result<LogGuard, String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let console = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .boxed(),
    };

    let mut guard = LogGuard::default();
    let file_layer = match &config.file {
        Some((directory, file_name)) => {
            std::fs::create_dir_all(directory)
                .map_err(|e| format!("Failed to create log directory {}: {}", directory.display(), e))?;
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, worker) = tracing_appender::non_blocking(appender);
            guard._file = Some(worker);
            Some(fmt::layer().with_writer(writer).with_ansi(false).with_target(true))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .or_else(|e| {
            if e.to_string().contains("a global default trace dispatcher has already been set") {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {}", e))
            }
        })?;

    Ok(guard)
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}

fn level_to_filter_string(level: Level) -> String {
    match level {
        Level::TRACE => "trace".to_string(),
        Level::DEBUG => "debug".to_string(),
        Level::INFO => "info".to_string(),
        Level::WARN => "warn".to_string(),
        Level::ERROR => "error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("debug"), Ok(Level::DEBUG)));
        assert!(matches!(parse_log_level("WARN"), Ok(Level::WARN)));
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn from_logging_section() {
        let section = LoggingConfig {
            level: "debug".into(),
            format: "json".into(),
            directory: Some(PathBuf::from("/var/log/last")),
            file_name: "unit.log".into(),
        };
        let config = TracingConfig::from_config(&section).unwrap();
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, OutputFormat::Json);
        assert_eq!(
            config.file,
            Some((PathBuf::from("/var/log/last"), "unit.log".to_string()))
        );
    }

    #[test]
    fn bad_format_is_rejected() {
        let section = LoggingConfig {
            format: "xml".into(),
            ..Default::default()
        };
        assert!(TracingConfig::from_config(&section).is_err());
    }

    #[test]
    fn init_twice_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let config = TracingConfig::new(Level::INFO)
            .with_format(OutputFormat::Compact)
            .with_file(dir.path(), "unit.log");
        let _first = init(config.clone()).unwrap();
        let _second = init(config).unwrap();
    }
}
