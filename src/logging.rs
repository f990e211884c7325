//! Tracing subscriber setup.
//!
//! Drivers only emit `tracing` events; the binary decides where they go.
//! `RUST_LOG` wins over the configured level when set.
//!
//! # Example
//! ```no_run
//! use astro_daq::logging::{self, LogFormat, LoggingConfig};
//! use tracing::Level;
//!
//! let config = LoggingConfig::new(Level::DEBUG).with_format(LogFormat::Json);
//! logging::init(&config);
//! tracing::info!(endpoint = "EQ6", "connected");
//! ```

use crate::config::AstroConfig;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Multi-line with colors (for development)
    #[default]
    Pretty,
    /// One line per event, no colors
    Compact,
    /// JSON objects for log aggregation
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Emit span open/close events
    pub with_span_events: bool,
    pub with_file_and_line: bool,
    /// ANSI colors, only honored by [`LogFormat::Pretty`]
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Level and format from the `[application]` section.
    pub fn from_config(config: &AstroConfig) -> Result<Self, String> {
        Ok(Self::new(parse_log_level(&config.application.log_level)?)
            .with_format(config.application.log_format))
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Install the global subscriber.
///
/// Idempotent: returns `false` if a subscriber was already installed (tests,
/// embedding applications) and leaves that one in place.
pub fn init(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let base = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line);

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Pretty => base.pretty().with_ansi(config.with_ansi).boxed(),
        LogFormat::Compact => base.compact().with_ansi(false).boxed(),
        LogFormat::Json => base.json().with_ansi(false).boxed(),
    };

    match tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
    {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "tracing already initialized");
            false
        }
    }
}

/// Parse a log level name, case-insensitive.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(format!(
            "unknown log level '{other}' (expected trace, debug, info, warn or error)"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels_case_insensitively() {
        assert_eq!(parse_log_level("trace"), Ok(Level::TRACE));
        assert_eq!(parse_log_level("Debug"), Ok(Level::DEBUG));
        assert_eq!(parse_log_level("WARN"), Ok(Level::WARN));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn from_config_takes_level_and_format() {
        let mut config = AstroConfig::default();
        config.application.log_level = "debug".into();
        config.application.log_format = LogFormat::Compact;
        let logging = LoggingConfig::from_config(&config).unwrap();
        assert_eq!(logging.level, Level::DEBUG);
        assert_eq!(logging.format, LogFormat::Compact);

        config.application.log_level = "nope".into();
        assert!(LoggingConfig::from_config(&config).is_err());
    }

    #[test]
    fn builder() {
        let config = LoggingConfig::new(Level::WARN)
            .with_format(LogFormat::Json)
            .with_span_events(true)
            .with_ansi(false);
        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.with_span_events);
        assert!(!config.with_ansi);
    }

    #[test]
    fn init_is_idempotent() {
        let config = LoggingConfig::new(Level::INFO).with_format(LogFormat::Compact);
        init(&config);
        assert!(!init(&config));
    }
}
