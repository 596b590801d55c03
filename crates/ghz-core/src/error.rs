//! Error types for GHz FPGA board control.
//!
//! `FpgaError` covers the whole board-control stack, from packet encoding to
//! multi-board synchronized runs. Variants fall into a small number of
//! categories, exposed through [`FpgaError::kind`]:
//!
//! - **Transport**: `Timeout`, `Connection`, `Io`. Often transient; the
//!   bring-up retry loop treats them as a failed attempt.
//! - **Protocol**: `PageOutOfRange`, `FilterTooShort`, `OperandOverflow`,
//!   `PayloadTooLong`, `ChannelOutOfRange`, `Protocol`. Raised before any
//!   transport I/O is attempted and never silently truncated.
//! - **Synchronization**: `ChainMismatch`, `InvalidMaster`, `BoardsTimedOut`.
//! - **Configuration**: `UnsupportedBuild`, `Unsupported`, `InvalidAddress`,
//!   `NotConnected`.

use crate::address::{BoardAddress, BoardClass};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using [`FpgaError`].
pub type FpgaResult<T> = std::result::Result<T, FpgaError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Synchronization,
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Synchronization => "synchronization",
            ErrorKind::Configuration => "configuration",
        };
        write!(f, "{}", label)
    }
}

/// One board that did not finish a synchronized run in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardTimeout {
    pub board: BoardAddress,
    /// Executions the board was asked to perform.
    pub expected: u32,
    /// Execution counter read back after the timeout, if the board answered.
    pub executed: Option<u16>,
}

impl fmt::Display for BoardTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.executed {
            Some(n) => write!(f, "{} ({} of {} executions)", self.board, n, self.expected),
            None => write!(f, "{} (no response, {} executions expected)", self.board, self.expected),
        }
    }
}

fn join_timeouts(boards: &[BoardTimeout]) -> String {
    boards
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Error, Debug)]
pub enum FpgaError {
    /// No reply frame arrived within the read timeout.
    ///
    /// **Recovery Strategy**: calibration code counts this as a failed attempt
    /// and retries; data-taking code reports it to the caller.
    #[error("Timed out after {after:?} waiting for {target}")]
    Timeout { target: String, after: Duration },

    /// The direct-ethernet endpoint could not be reached or rejected the
    /// adapter port.
    #[error("Connection error: {0}")]
    Connection(String),

    /// SRAM page index outside `[0, pages)` for this firmware build.
    #[error("SRAM page {page} out of range (build has {pages} pages)")]
    PageOutOfRange { page: usize, pages: usize },

    /// ADC filter functions need at least two samples.
    #[error("Filter function must have at least 2 samples, got {len}")]
    FilterTooShort { len: usize },

    /// A numeric operand does not fit its wire field.
    #[error("{field} value {value:#x} does not fit in {bits} bits")]
    OperandOverflow {
        field: &'static str,
        value: u64,
        bits: u32,
    },

    /// Data passed for a single SRAM page is longer than the page.
    #[error("Payload of {len} bytes exceeds page capacity of {capacity} bytes")]
    PayloadTooLong { len: usize, capacity: usize },

    /// Demodulator channel index beyond what the firmware build provides.
    #[error("Demodulator channel {channel} out of range (build has {channels} channels)")]
    ChannelOutOfRange { channel: usize, channels: usize },

    /// No packet layout is known for this firmware build.
    #[error("Unsupported {class} firmware build {build}")]
    UnsupportedBuild { class: BoardClass, build: u8 },

    /// The firmware build exists but lacks this feature.
    #[error("{operation} is not supported by {class} build {build}")]
    Unsupported {
        operation: &'static str,
        class: BoardClass,
        build: u8,
    },

    #[error("Invalid board address: {0}")]
    InvalidAddress(String),

    /// Daisy-chain slave and start-delay lists differ in length.
    #[error("Daisy chain has {slaves} slaves but {delays} start delays")]
    ChainMismatch { slaves: usize, delays: usize },

    /// Only DAC boards can trigger a daisy chain.
    #[error("{0} cannot be the daisy-chain master")]
    InvalidMaster(BoardAddress),

    /// Some boards of a synchronized run never delivered their data.
    #[error("Boards timed out: {}", join_timeouts(.0))]
    BoardsTimedOut(Vec<BoardTimeout>),

    #[error("Board {0} is not connected")]
    NotConnected(BoardAddress),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FpgaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FpgaError::Timeout { .. } | FpgaError::Connection(_) | FpgaError::Io(_) => {
                ErrorKind::Transport
            }
            FpgaError::PageOutOfRange { .. }
            | FpgaError::FilterTooShort { .. }
            | FpgaError::OperandOverflow { .. }
            | FpgaError::PayloadTooLong { .. }
            | FpgaError::ChannelOutOfRange { .. }
            | FpgaError::Protocol(_) => ErrorKind::Protocol,
            FpgaError::ChainMismatch { .. }
            | FpgaError::InvalidMaster(_)
            | FpgaError::BoardsTimedOut(_) => ErrorKind::Synchronization,
            FpgaError::UnsupportedBuild { .. }
            | FpgaError::Unsupported { .. }
            | FpgaError::InvalidAddress(_)
            | FpgaError::NotConnected(_) => ErrorKind::Configuration,
        }
    }

    /// True for failures a retry might clear.
    pub fn is_transient(&self) -> bool {
        matches!(self, FpgaError::Timeout { .. } | FpgaError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boards_timed_out_names_every_board() {
        let err = FpgaError::BoardsTimedOut(vec![
            BoardTimeout {
                board: BoardAddress::dac(2),
                expected: 30,
                executed: Some(12),
            },
            BoardTimeout {
                board: BoardAddress::adc(4),
                expected: 30,
                executed: None,
            },
        ]);
        let message = err.to_string();
        assert!(message.contains("DAC 2 (12 of 30 executions)"));
        assert!(message.contains("ADC 4 (no response"));
        assert_eq!(err.kind(), ErrorKind::Synchronization);
    }

    #[test]
    fn test_kinds() {
        let timeout = FpgaError::Timeout {
            target: "00:01:CA:AA:00:01".into(),
            after: Duration::from_secs(1),
        };
        assert_eq!(timeout.kind(), ErrorKind::Transport);
        assert!(timeout.is_transient());

        let short = FpgaError::FilterTooShort { len: 1 };
        assert_eq!(short.kind(), ErrorKind::Protocol);
        assert!(!short.is_transient());
    }
}
