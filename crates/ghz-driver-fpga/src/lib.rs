//! Drivers for GHz FPGA DAC and ADC boards.
//!
//! Boards sit on a raw-ethernet segment behind a direct-ethernet server. This
//! crate provides
//!
//! - [`transport`]: the direct-ethernet client trait with an in-process
//!   emulated adapter and a TCP relay adapter,
//! - [`emulator`]: frame-level firmware models used by tests and dry runs,
//! - [`board`]: per-board drivers with connection lifecycle and the test-mode
//!   operations used during bring-up,
//! - [`group`]: board detection, the board registry and daisy-chained
//!   synchronized runs.
//!
//! # Example
//!
//! ```rust,ignore
//! use ghz_driver_fpga::{BoardGroup, EmulatedEthernet, GroupSettings};
//! use ghz_driver_fpga::emulator::DacEmulator;
//! use std::sync::Arc;
//!
//! let ethernet = Arc::new(EmulatedEthernet::new(1));
//! ethernet.attach(DacEmulator::new(1, 11));
//! let group = BoardGroup::new(ethernet, GroupSettings::new("Lab", 1));
//! let report = group.refresh().await?;
//! ```

pub mod board;
pub mod emulator;
pub mod group;
pub mod transport;

pub use board::{
    connect_board, AdcBoard, BistReading, Board, BoardSession, BoardState, DacBoard, FifoReading,
    FpgaBoard, LvdsReading, LvdsSetting, DEFAULT_BOARD_TIMEOUT,
};
pub use group::{
    AcquisitionMode, AdcSequence, BoardGroup, BoardRegistry, DacSequence, DaisyChain,
    DetectedBoard, GroupSettings, RefreshReport, RunData, Sequence,
};
pub use transport::{DirectEthernet, EmulatedEthernet, EthernetPacket, RelayEthernet};
