//! Calibration primitives the bring-up state machine drives.

use async_trait::async_trait;
use ghz_core::codec::DacChannel;
use ghz_core::FpgaResult;
use ghz_driver_fpga::{BistReading, DacBoard, FifoReading, FpgaBoard, LvdsReading, LvdsSetting};

/// Test-mode operations needed to bring up one DAC board.
///
/// [`DacBoard`] is the hardware implementation; tests substitute scripted
/// boards to exercise the retry paths.
#[async_trait]
pub trait DacCalibration: Send + Sync {
    fn name(&self) -> &str;

    async fn init_pll(&self) -> FpgaResult<()>;

    async fn reset_pll(&self) -> FpgaResult<()>;

    async fn init_dac(&self, dac: DacChannel, signed: bool) -> FpgaResult<()>;

    async fn set_lvds(&self, dac: DacChannel, setting: LvdsSetting) -> FpgaResult<LvdsReading>;

    /// One FIFO calibration attempt at a fixed clock polarity.
    async fn fifo_attempt(
        &self,
        dac: DacChannel,
        target: u8,
        invert_clock: bool,
    ) -> FpgaResult<FifoReading>;

    async fn run_bist(&self, dac: DacChannel, data: &[u16]) -> FpgaResult<BistReading>;
}

#[async_trait]
impl DacCalibration for DacBoard {
    fn name(&self) -> &str {
        FpgaBoard::name(self)
    }

    async fn init_pll(&self) -> FpgaResult<()> {
        FpgaBoard::init_pll(self).await
    }

    async fn reset_pll(&self) -> FpgaResult<()> {
        DacBoard::reset_pll(self).await
    }

    async fn init_dac(&self, dac: DacChannel, signed: bool) -> FpgaResult<()> {
        DacBoard::init_dac(self, dac, signed).await
    }

    async fn set_lvds(&self, dac: DacChannel, setting: LvdsSetting) -> FpgaResult<LvdsReading> {
        DacBoard::set_lvds(self, dac, setting).await
    }

    async fn fifo_attempt(
        &self,
        dac: DacChannel,
        target: u8,
        invert_clock: bool,
    ) -> FpgaResult<FifoReading> {
        DacBoard::fifo_attempt(self, dac, target, invert_clock).await
    }

    async fn run_bist(&self, dac: DacChannel, data: &[u16]) -> FpgaResult<BistReading> {
        DacBoard::run_bist(self, dac, data).await
    }
}
