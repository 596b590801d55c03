//! Core types for GHz DAC/ADC FPGA boards
//!
//! This crate holds everything about the boards that does not need I/O:
//!
//! - [`address`] - board classes, MAC addresses and board identities
//! - [`codec`] - register, SRAM and readback wire formats per firmware build
//! - [`error`] - the [`FpgaError`] taxonomy shared by all board crates
//! - [`retry`] - the bounded retry combinator used by calibration
//!
//! # Usage
//!
//! ```rust
//! use ghz_core::address::{BoardAddress, BoardClass};
//! use ghz_core::codec::{board_model, BoardModel};
//!
//! let board = BoardAddress::dac(3);
//! assert_eq!(board.mac().to_string(), "00:01:CA:AA:00:03");
//!
//! let model = board_model(BoardClass::Dac, 8).unwrap();
//! assert!(matches!(model, BoardModel::Dac(_)));
//! ```

pub mod address;
pub mod codec;
pub mod error;
pub mod retry;

pub use address::{BoardAddress, BoardClass, MacAddress};
pub use error::{BoardTimeout, ErrorKind, FpgaError, FpgaResult};
pub use retry::{retry, Attempt, RetryPolicy};
