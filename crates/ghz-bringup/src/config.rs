//! Bring-up settings.

use ghz_driver_fpga::LvdsSetting;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default bound for both the FIFO calibration retries and the whole-board
/// retries.
pub const NUM_TRIES: u32 = 2;

/// FIFO counter separation a calibrated DAC should show.
pub const DEFAULT_FIFO_TARGET: u8 = 3;

/// Random samples played during the built-in self-test.
pub const DEFAULT_BIST_SAMPLES: usize = 1000;

/// Wait between programming the PLL and pulsing its reset.
pub const DEFAULT_PLL_SETTLE_MS: u64 = 100;

/// Whether a failed LVDS calibration fails the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LvdsPolicy {
    /// LVDS results are reported and logged but never fail a board.
    #[default]
    Advisory,
    /// A board passes only if LVDS calibration also succeeded.
    Gating,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BringupConfig {
    /// FIFO calibration attempts per channel; the clock polarity flips on
    /// every retry.
    pub fifo_tries: u32,
    /// Full bring-up attempts per board.
    pub board_retries: u32,
    pub lvds_policy: LvdsPolicy,
    pub fifo_target: u8,
    pub bist_samples: usize,
    /// Program the DAC chips for signed data.
    pub signed_data: bool,
    /// Measure the LVDS clock edges instead of using `lvds_sd`.
    pub optimize_lvds: bool,
    /// Sample delay used when `optimize_lvds` is off.
    pub lvds_sd: u8,
    pub pll_settle_ms: u64,
    /// Seed for the BIST sample generator; random when unset.
    pub seed: Option<u64>,
}

impl Default for BringupConfig {
    fn default() -> Self {
        Self {
            fifo_tries: NUM_TRIES,
            board_retries: NUM_TRIES,
            lvds_policy: LvdsPolicy::default(),
            fifo_target: DEFAULT_FIFO_TARGET,
            bist_samples: DEFAULT_BIST_SAMPLES,
            signed_data: true,
            optimize_lvds: true,
            lvds_sd: 0,
            pll_settle_ms: DEFAULT_PLL_SETTLE_MS,
            seed: None,
        }
    }
}

impl BringupConfig {
    pub fn lvds_setting(&self) -> LvdsSetting {
        if self.optimize_lvds {
            LvdsSetting::Optimize
        } else {
            LvdsSetting::Fixed(self.lvds_sd)
        }
    }

    pub fn pll_settle(&self) -> Duration {
        Duration::from_millis(self.pll_settle_ms)
    }

    /// First violated constraint, if any.
    pub fn validate(&self) -> Result<(), String> {
        if self.fifo_tries == 0 {
            return Err("bringup.fifo_tries must be at least 1".into());
        }
        if self.board_retries == 0 {
            return Err("bringup.board_retries must be at least 1".into());
        }
        if self.fifo_target > 7 {
            return Err(format!(
                "bringup.fifo_target {} does not fit the 3-bit FIFO counter",
                self.fifo_target
            ));
        }
        if self.lvds_sd > 15 {
            return Err(format!("bringup.lvds_sd {} must be in 0..=15", self.lvds_sd));
        }
        if self.bist_samples == 0 {
            return Err("bringup.bist_samples must be at least 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BringupConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fifo_tries, NUM_TRIES);
        assert_eq!(config.lvds_setting(), LvdsSetting::Optimize);
        assert_eq!(config.pll_settle(), Duration::from_millis(100));
    }

    #[test]
    fn test_fixed_sd_setting() {
        let config = BringupConfig {
            optimize_lvds: false,
            lvds_sd: 5,
            ..Default::default()
        };
        assert_eq!(config.lvds_setting(), LvdsSetting::Fixed(5));
    }

    #[test]
    fn test_validation_rejects_out_of_range_values() {
        let config = BringupConfig {
            fifo_target: 8,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("fifo_target"));

        let config = BringupConfig {
            board_retries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
