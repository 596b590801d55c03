//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/ghz-fpga.toml` by default)
//! 2. environment variables prefixed with `GHZ_FPGA_`, with `__` between
//!    nested keys (`GHZ_FPGA_BRINGUP__FIFO_TRIES=4`)
//!
//! Every section has defaults, so an empty file yields an emulated lab with
//! one DAC and one ADC.
//!
//! # Example
//! ```no_run
//! use ghz_fpga::config::GhzConfig;
//!
//! let config = GhzConfig::load()?;
//! println!("Group: {}", config.group.name);
//! # Ok::<(), figment::Error>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use ghz_bringup::BringupConfig;
use ghz_core::MacAddress;
use ghz_driver_fpga::GroupSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config/ghz-fpga.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GhzConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Direct-ethernet transport
    pub transport: TransportConfig,
    /// Board group settings
    pub group: GroupConfig,
    /// Bring-up settings
    pub bringup: BringupConfig,
    /// Boards simulated when the transport is emulated
    pub emulator: EmulatorConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "GHz FPGA".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Which direct-ethernet adapter to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// In-process board emulators
    #[default]
    Emulated,
    /// TCP frame relay in front of a real ethernet adapter
    Relay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub mode: TransportMode,
    /// Relay address (`host:port`), used in relay mode
    pub relay_address: String,
    /// Adapter port the boards are cabled to
    pub port: u32,
    /// Source MAC of outgoing frames
    pub host_mac: String,
    /// Per-board reply timeout in milliseconds
    pub board_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::default(),
            relay_address: "127.0.0.1:5610".to_string(),
            port: 1,
            host_mac: "02:00:00:00:00:01".to_string(),
            board_timeout_ms: 1000,
        }
    }
}

impl TransportConfig {
    pub fn host_mac(&self) -> Result<MacAddress, String> {
        self.host_mac
            .parse()
            .map_err(|e| format!("Invalid transport.host_mac '{}': {}", self.host_mac, e))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Group name, the prefix of every device name
    pub name: String,
    /// How long detection listens for ping replies, in milliseconds
    pub detection_timeout_ms: u64,
    /// Added to every synchronized-run timeout, in milliseconds
    pub timeout_slack_ms: u64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            name: "Lab".to_string(),
            detection_timeout_ms: 1000,
            timeout_slack_ms: 1000,
        }
    }
}

/// One emulated board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmulatedBoard {
    pub number: u8,
    pub build: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub dacs: Vec<EmulatedBoard>,
    pub adcs: Vec<EmulatedBoard>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            dacs: vec![EmulatedBoard { number: 1, build: 11 }],
            adcs: vec![EmulatedBoard { number: 1, build: 6 }],
        }
    }
}

impl GhzConfig {
    /// Load configuration from the default file and environment variables
    ///
    /// Environment variables override the file with prefix `GHZ_FPGA_`.
    /// Example: `GHZ_FPGA_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(GhzConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("GHZ_FPGA_").split("__"))
    }

    /// The default configuration as TOML, for writing a starter file.
    pub fn default_toml() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&GhzConfig::default())
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        self.transport.host_mac()?;
        if self.transport.mode == TransportMode::Relay && self.transport.relay_address.is_empty() {
            return Err("transport.relay_address is required in relay mode".to_string());
        }
        if self.transport.board_timeout_ms == 0 {
            return Err("transport.board_timeout_ms must be positive".to_string());
        }

        if self.group.name.trim().is_empty() {
            return Err("group.name must not be empty".to_string());
        }

        self.bringup.validate()?;

        // Board numbers must be unique per class
        for (class, boards) in [("DAC", &self.emulator.dacs), ("ADC", &self.emulator.adcs)] {
            let mut numbers = std::collections::HashSet::new();
            for board in boards {
                if !numbers.insert(board.number) {
                    return Err(format!("Duplicate emulated {} number: {}", class, board.number));
                }
            }
        }

        Ok(())
    }

    /// Group settings for the configured transport.
    pub fn group_settings(&self) -> GroupSettings {
        let mut settings = GroupSettings::new(self.group.name.clone(), self.transport.port);
        settings.board_timeout = Duration::from_millis(self.transport.board_timeout_ms);
        settings.detection_timeout = Duration::from_millis(self.group.detection_timeout_ms);
        settings.timeout_slack = Duration::from_millis(self.group.timeout_slack_ms);
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghz_bringup::LvdsPolicy;

    #[test]
    fn test_defaults_are_valid() {
        let config = GhzConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.transport.mode, TransportMode::Emulated);
        assert_eq!(config.bringup.lvds_policy, LvdsPolicy::Advisory);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = GhzConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().unwrap_err().contains("log_level"));
    }

    #[test]
    fn test_invalid_host_mac() {
        let mut config = GhzConfig::default();
        config.transport.host_mac = "not-a-mac".to_string();
        assert!(config.validate().unwrap_err().contains("host_mac"));
    }

    #[test]
    fn test_duplicate_emulated_boards() {
        let mut config = GhzConfig::default();
        config.emulator.dacs.push(EmulatedBoard { number: 1, build: 7 });
        assert!(config.validate().unwrap_err().contains("DAC"));
    }

    #[test]
    fn test_bringup_section_is_validated() {
        let mut config = GhzConfig::default();
        config.bringup.fifo_tries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_group_settings_conversion() {
        let mut config = GhzConfig::default();
        config.group.timeout_slack_ms = 250;
        config.transport.port = 3;
        let settings = config.group_settings();
        assert_eq!(settings.name, "Lab");
        assert_eq!(settings.port, 3);
        assert_eq!(settings.timeout_slack, Duration::from_millis(250));
    }

    #[test]
    fn test_default_toml_round_trips() {
        let text = GhzConfig::default_toml().unwrap();
        let parsed: GhzConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, GhzConfig::default());
    }
}
