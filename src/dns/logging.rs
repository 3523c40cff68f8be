//! Logging setup
//!
//! The library itself only emits records through the `log` facade. This
//! module installs a `tracing-subscriber` formatter for binaries and tests
//! that want to see them, in either human readable or JSON form.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Log levels for different types of events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level `{}`", other)),
        }
    }
}

/// Logger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Minimum log level to output
    pub level: LogLevel,
    /// Enable JSON formatting
    pub json_format: bool,
    /// Enable console output
    pub console_output: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Warn,
            json_format: false,
            console_output: true,
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the configured
/// level. Calling this again after a subscriber is in place is harmless.
pub fn init_logging(config: &LoggerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("{:?}", config.level).to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let init_result = if !config.console_output {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("off"))
            .try_init()
    } else if config.json_format {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .try_init()
    };

    if let Err(e) = init_result {
        log::debug!("logging already initialized: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(Level::from(LogLevel::Trace), Level::TRACE);
        assert_eq!(Level::from(LogLevel::Debug), Level::DEBUG);
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
        assert_eq!(Level::from(LogLevel::Warn), Level::WARN);
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(Ok(LogLevel::Warn), "WARNING".parse());
        assert_eq!(Ok(LogLevel::Debug), "debug".parse());
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_logger_config_default() {
        let config = LoggerConfig::default();

        assert!(matches!(config.level, LogLevel::Warn));
        assert!(!config.json_format);
        assert!(config.console_output);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let config = LoggerConfig {
            console_output: false,
            ..LoggerConfig::default()
        };
        init_logging(&config);
        init_logging(&config);
    }
}
