//! Structured logging.
//!
//! Built on `tracing` and `tracing-subscriber`:
//! - spans around every engine operation and phase
//! - three output formats (pretty, compact, JSON)
//! - `RUST_LOG` overrides the configured level
//!
//! # Example
//! ```no_run
//! use nexus_writer::{config::WriterSettings, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = WriterSettings::load()?;
//! logging::init_from_settings(&settings)?;
//! tracing::info!("writer ready");
//! # Ok(())
//! # }
//! ```

use crate::config::WriterSettings;
use crate::error::{WriterError, WriterResult};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, colored (interactive use)
    Pretty,
    /// Single-line, uncolored
    Compact,
    /// One JSON object per event (log aggregation)
    Json,
}

impl FromStr for OutputFormat {
    type Err = WriterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(WriterError::SettingsValidation(format!(
                "Invalid log format '{s}'. Must be one of: pretty, compact, json"
            ))),
        }
    }
}

/// Logging options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Minimum level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
}

impl LoggingConfig {
    /// Options derived from loaded settings.
    pub fn from_settings(settings: &WriterSettings) -> WriterResult<Self> {
        Ok(Self {
            level: parse_log_level(&settings.logging.level)?,
            format: settings.logging.format.parse()?,
        })
    }
}

/// Initialize logging from loaded settings.
pub fn init_from_settings(settings: &WriterSettings) -> WriterResult<()> {
    init(LoggingConfig::from_settings(settings)?)
}

/// Install the global subscriber.
///
/// Does nothing when a global subscriber is already installed, so repeated
/// calls and embedding applications with their own subscriber are fine.
pub fn init(config: LoggingConfig) -> WriterResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.format {
        OutputFormat::Pretty => builder.pretty().try_init(),
        OutputFormat::Compact => builder.compact().with_ansi(false).try_init(),
        OutputFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| WriterError::Internal(format!("Failed to initialize logging: {e}")))
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> WriterResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(WriterError::SettingsValidation(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("warn"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_config_from_settings() {
        let mut settings = WriterSettings::default();
        settings.logging.level = "debug".into();
        settings.logging.format = "JSON".into();
        let config = LoggingConfig::from_settings(&settings).unwrap();
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, OutputFormat::Json);

        settings.logging.format = "xml".into();
        assert!(LoggingConfig::from_settings(&settings).is_err());
    }
}
