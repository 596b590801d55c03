//! Per-board and batch bring-up reports.

use crate::machine::{BringupResult, ChannelReport};
use ghz_core::{BoardClass, ErrorKind};
use std::fmt;

/// What the last bring-up attempt of a board produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardOutcome {
    Dac(BringupResult),
    Adc,
    /// A board operation failed outright.
    Error { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardBringup {
    pub name: String,
    pub class: BoardClass,
    /// Whole-board attempts used, including the successful one.
    pub attempts: u32,
    pub passed: bool,
    pub outcome: BoardOutcome,
}

/// Results for a batch of boards, in bring-up order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub boards: Vec<BoardBringup>,
}

impl BatchReport {
    pub fn new(boards: Vec<BoardBringup>) -> Self {
        Self { boards }
    }

    /// Names of the boards that did not pass.
    pub fn failed(&self) -> Vec<&str> {
        self.boards
            .iter()
            .filter(|b| !b.passed)
            .map(|b| b.name.as_str())
            .collect()
    }

    pub fn all_passed(&self) -> bool {
        self.boards.iter().all(|b| b.passed)
    }

    pub fn get(&self, name: &str) -> Option<&BoardBringup> {
        self.boards.iter().find(|b| b.name == name)
    }
}

fn write_channel(f: &mut fmt::Formatter<'_>, channel: &ChannelReport) -> fmt::Result {
    let dac = channel.channel;
    let lvds = &channel.lvds;
    writeln!(f, "DAC {} LVDS parameters:", dac)?;
    writeln!(f, "  SD: {}", lvds.sd)?;
    writeln!(f, "  Check: {}", lvds.check)?;
    writeln!(f, "  Plot MSD:  {}", lvds.msd_plot())?;
    writeln!(f, "  Plot MHD:  {}", lvds.mhd_plot())?;
    writeln!(f)?;

    let fifo = &channel.fifo;
    writeln!(f, "DAC {} FIFO parameters:", dac)?;
    if fifo.success {
        writeln!(f, "  FIFO calibration succeeded after {} tries", fifo.tries)?;
        if let Some(phof) = fifo.phof {
            writeln!(f, "  FIFO PHOF: {}", phof)?;
        }
        writeln!(f, "  Clk polarity: {}", u8::from(fifo.clock_inverted))?;
        if let Some(counter) = fifo.counter {
            writeln!(f, "  FIFO counter: {}", counter)?;
        }
    } else {
        writeln!(f, "  FIFO failure after {} tries", fifo.tries)?;
    }
    writeln!(f)?;

    writeln!(f, "DAC {} BIST:", dac)?;
    writeln!(f, "  Success: {}", channel.bist.success)?;
    writeln!(f)
}

impl fmt::Display for BoardBringup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({})", self.name, self.class)?;
        match &self.outcome {
            BoardOutcome::Dac(result) => {
                for channel in &result.channels {
                    write_channel(f, channel)?;
                }
            }
            BoardOutcome::Adc => writeln!(f, "  PLL initialized")?,
            BoardOutcome::Error { kind, message } => {
                writeln!(f, "  {:?} error: {}", kind, message)?
            }
        }
        if self.passed && self.attempts > 1 {
            writeln!(f, "WARNING: {} took {} tries to succeed", self.name, self.attempts)?;
        }
        Ok(())
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for board in &self.boards {
            writeln!(f, "{}", board)?;
        }
        let failed = self.failed();
        if failed.is_empty() {
            writeln!(f, "All boards successful!")
        } else {
            writeln!(f, "The following boards failed:")?;
            for name in failed {
                writeln!(f, "  {}", name)?;
            }
            Ok(())
        }
    }
}
