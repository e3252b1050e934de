//! Logging setup for divvy.
//!
//! Everything goes to stderr through `tracing`; an optional log file
//! can be added on top. The dispatch engine logs at info and below,
//! worker diagnostics at error, so a quiet run stays quiet.
//!
//! # Environment variables
//!
//! - `DIVVY_LOG` - log filter (overrides `RUST_LOG`)
//! - `DIVVY_LOG_LEVEL` - error, warn, info, debug, trace
//! - `DIVVY_LOG_FORMAT` - pretty, compact, json
//! - `DIVVY_LOG_FILE` - log file path (in addition to stderr)

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format (default)
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON for log aggregation
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

/// Logging configuration. Build with the setters, then pass to
/// [`init`].
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Base log level; `None` means INFO unless a filter is set.
    pub level: Option<Level>,
    /// Output format.
    pub format: LogFormat,
    /// Custom filter string (overrides `level` when set).
    pub filter: Option<String>,
    /// Log file (in addition to stderr).
    pub file_path: Option<PathBuf>,
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a counted `-v` flag onto a level: 1 debug, 2+ trace. An
    /// unset flag leaves the level open for `DIVVY_LOG_LEVEL`, with
    /// info as the fallback.
    pub fn from_verbosity(count: u8) -> Self {
        let level = match count {
            0 => None,
            1 => Some(Level::DEBUG),
            _ => Some(Level::TRACE),
        };
        Self {
            level,
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    /// Apply environment overrides. CLI-provided settings win: the
    /// filter env vars are only consulted when no filter is set, and
    /// `DIVVY_LOG_LEVEL` only when neither a filter nor a level is.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("DIVVY_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && self.level.is_none()
            && let Ok(level) = std::env::var("DIVVY_LOG_LEVEL")
        {
            self.level = parse_level(&level);
        }

        if let Ok(format) = std::env::var("DIVVY_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Ok(path) = std::env::var("DIVVY_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        if let Some(ref filter) = self.filter {
            EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: invalid log filter '{}', using default", filter);
                EnvFilter::new(self.level_str())
            })
        } else {
            EnvFilter::new(self.level_str())
        }
    }

    fn level_str(&self) -> String {
        self.level
            .unwrap_or(Level::INFO)
            .to_string()
            .to_lowercase()
    }
}

fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Initialize the global tracing subscriber. Idempotent: repeated
/// calls are silently ignored.
pub fn init(config: LogConfig) {
    let filter = config.build_filter();

    let file_appender = config.file_path.as_ref().map(|path| {
        let parent = path.parent().unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("divvy.log");
        tracing_appender::rolling::never(parent, file_name)
    });

    let result = match (config.format, file_appender) {
        (LogFormat::Json, appender) => {
            let stderr_layer = fmt::layer().json().with_writer(std::io::stderr);
            let file_layer = appender
                .map(|a| fmt::layer().json().with_ansi(false).with_writer(a));
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init()
        }
        (LogFormat::Compact, appender) => {
            let stderr_layer = fmt::layer().compact().with_writer(std::io::stderr);
            let file_layer = appender
                .map(|a| fmt::layer().compact().with_ansi(false).with_writer(a));
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init()
        }
        (LogFormat::Pretty, appender) => {
            let stderr_layer = fmt::layer().with_writer(std::io::stderr);
            let file_layer = appender.map(|a| fmt::layer().with_ansi(false).with_writer(a));
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init()
        }
    };

    let _ = result;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("invalid".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("error"), Some(Level::ERROR));
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level("TRACE"), Some(Level::TRACE));
        assert_eq!(parse_level("invalid"), None);
    }

    #[test]
    fn test_verbosity_mapping() {
        assert_eq!(LogConfig::from_verbosity(0).level, None);
        assert_eq!(LogConfig::from_verbosity(1).level, Some(Level::DEBUG));
        assert_eq!(LogConfig::from_verbosity(5).level, Some(Level::TRACE));
    }
}
