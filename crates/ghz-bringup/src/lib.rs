//! Bring-up of GHz FPGA boards.
//!
//! A freshly powered DAC board needs its PLL programmed, then each of its
//! two DAC chips calibrated: LVDS sample timing, FIFO counter alignment and a
//! built-in self-test over random data. [`Bringup`] runs that sequence with
//! bounded retries and produces a [`BatchReport`] naming the boards that did
//! not come up.
//!
//! ```rust,ignore
//! use ghz_bringup::{Bringup, BringupConfig};
//!
//! let bringup = Bringup::new(BringupConfig::default());
//! let report = bringup.bringup_group(&group).await;
//! println!("{report}");
//! ```

pub mod calibration;
pub mod config;
pub mod machine;
pub mod report;

pub use calibration::DacCalibration;
pub use config::{BringupConfig, LvdsPolicy, NUM_TRIES};
pub use machine::{
    Bringup, BringupResult, BringupTarget, ChannelReport, FifoOutcome, Stage, Verdict,
};
pub use report::{BatchReport, BoardBringup, BoardOutcome};
