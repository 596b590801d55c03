//! Frame-level board firmware emulators.
//!
//! Emulators stand in for real boards behind [`EmulatedEthernet`]. They
//! consume raw register and SRAM frames exactly as the firmware would and
//! answer with readback, timing and acquisition packets, so every driver
//! code path can be exercised without hardware.
//!
//! [`EmulatedEthernet`]: crate::transport::EmulatedEthernet

mod adc;
mod dac;

pub use adc::{AdcEmulator, EMULATED_DEMOD_RANGE};
pub use dac::DacEmulator;

use bytes::Bytes;
use ghz_core::{BoardAddress, MacAddress};

/// Firmware model of one board.
pub trait BoardEmulator: Send {
    fn address(&self) -> BoardAddress;

    fn mac(&self) -> MacAddress {
        self.address().mac()
    }

    /// Process one incoming payload and return the reply payloads, in order.
    fn handle(&mut self, payload: &[u8]) -> Vec<Bytes>;
}
