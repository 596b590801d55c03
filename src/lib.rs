//! # GHz FPGA
//!
//! Application layer for GHz DAC/ADC FPGA boards. The board logic lives in
//! the workspace crates:
//!
//! - **`ghz-core`**: register, SRAM and readback codecs, board addressing and
//!   the `FpgaError` taxonomy.
//! - **`ghz-driver-fpga`**: direct-ethernet transport, board drivers, board
//!   detection and daisy-chain synchronized runs.
//! - **`ghz-bringup`**: the LVDS/FIFO/BIST bring-up state machine.
//!
//! This crate adds what the `ghz-fpga` binary needs on top of them:
//!
//! - **`config`**: Figment-based configuration (`GhzConfig`).
//! - **`lab`**: opening the configured adapter and connecting a board group.
//! - **`tracing_setup`**: `tracing-subscriber` initialisation.

pub mod config;
pub mod lab;
pub mod tracing_setup;

pub use config::GhzConfig;
