//! Log output for the CLI.
//!
//! The `[application]` table picks the level and one of three formats
//! (pretty, compact, json). `RUST_LOG`, when set, replaces the configured
//! level with a full `EnvFilter` directive.
//!
//! ```no_run
//! use ghz_fpga::{config::GhzConfig, tracing_setup};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GhzConfig::load()?;
//! tracing_setup::init_from_config(&config)?;
//! tracing::info!(group = %config.group.name, "starting");
//! # Ok(())
//! # }
//! ```

use crate::config::GhzConfig;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, coloured.
    Pretty,
    /// One line per event, no colour, for lab terminals that log to file.
    Compact,
    /// One JSON object per event.
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("unknown log format '{s}', expected pretty, compact or json")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracingConfig {
    pub level: Level,
    pub format: OutputFormat,
}

impl TracingConfig {
    pub fn from_config(config: &GhzConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format.parse()?,
        })
    }
}

pub fn init_from_config(config: &GhzConfig) -> Result<(), String> {
    init(TracingConfig::from_config(config)?)
}

/// Install the global subscriber. A second call is a no-op, so tests may
/// call it freely.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string().to_lowercase()));

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer().pretty().boxed(),
        OutputFormat::Compact => fmt::layer().compact().with_ansi(false).boxed(),
        OutputFormat::Json => fmt::layer().json().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .or_else(|e| {
            if e.to_string().contains("a global default trace dispatcher has already been set") {
                Ok(())
            } else {
                Err(format!("failed to install log subscriber: {e}"))
            }
        })
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    Level::from_str(level).map_err(|_| {
        format!("unknown log level '{level}', expected trace, debug, info, warn or error")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("warn"), Ok(Level::WARN));
        assert_eq!(parse_log_level("Debug"), Ok(Level::DEBUG));
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert_eq!("compact".parse::<OutputFormat>(), Ok(OutputFormat::Compact));
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_tracing_config_from_config() {
        let mut config = GhzConfig::default();
        config.application.log_level = "debug".to_string();
        config.application.log_format = "json".to_string();
        assert_eq!(
            TracingConfig::from_config(&config),
            Ok(TracingConfig {
                level: Level::DEBUG,
                format: OutputFormat::Json
            })
        );

        config.application.log_format = "xml".to_string();
        assert!(TracingConfig::from_config(&config).is_err());
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = TracingConfig {
            level: Level::WARN,
            format: OutputFormat::Compact,
        };
        assert!(init(config).is_ok());
        assert!(init(config).is_ok());
    }
}
