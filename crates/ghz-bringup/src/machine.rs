//! The bring-up state machine.
//!
//! Every DAC channel goes through
//!
//! ```text
//! LVDS -> FIFO (bounded retries, clock polarity flips each retry) -> BIST
//! ```
//!
//! and the board passes when FIFO and BIST succeeded on both channels (and
//! LVDS too under [`LvdsPolicy::Gating`]). A failing board is brought up again
//! from the start, up to `board_retries` times. ADC boards only have their PLL
//! programmed.

use crate::calibration::DacCalibration;
use crate::config::{BringupConfig, LvdsPolicy};
use crate::report::{BatchReport, BoardBringup, BoardOutcome};
use ghz_core::codec::DacChannel;
use ghz_core::{retry, Attempt, BoardClass, FpgaError, FpgaResult, RetryPolicy};
use ghz_driver_fpga::{Board, BoardGroup, BistReading, FifoReading, FpgaBoard, LvdsReading};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::fmt;
use tokio::time::sleep;
use tracing::instrument;

/// Stages of a channel calibration, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Lvds,
    Fifo,
    Bist,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Lvds => "LVDS",
            Stage::Fifo => "FIFO",
            Stage::Bist => "BIST",
        };
        write!(f, "{}", label)
    }
}

/// Result of the bounded FIFO calibration on one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoOutcome {
    pub success: bool,
    pub tries: u32,
    pub phof: Option<u8>,
    pub clock_inverted: bool,
    pub counter: Option<u8>,
}

impl FifoOutcome {
    fn from_reading(reading: &FifoReading, success: bool, tries: u32) -> Self {
        Self {
            success,
            tries,
            phof: reading.phof,
            clock_inverted: reading.clock_inverted,
            counter: reading.counter,
        }
    }
}

/// Calibration results for one DAC channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelReport {
    pub channel: DacChannel,
    pub lvds: LvdsReading,
    pub fifo: FifoOutcome,
    pub bist: BistReading,
}

/// One bring-up attempt of a DAC board. A retry produces a new result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BringupResult {
    pub channels: Vec<ChannelReport>,
}

/// Pass/fail of a bring-up attempt, naming the first stage that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(Stage),
}

impl BringupResult {
    pub fn lvds_ok(&self) -> bool {
        self.channels.iter().all(|c| c.lvds.success)
    }

    pub fn fifo_ok(&self) -> bool {
        self.channels.iter().all(|c| c.fifo.success)
    }

    pub fn bist_ok(&self) -> bool {
        self.channels.iter().all(|c| c.bist.success)
    }

    pub fn verdict(&self, policy: LvdsPolicy) -> Verdict {
        if policy == LvdsPolicy::Gating && !self.lvds_ok() {
            Verdict::Fail(Stage::Lvds)
        } else if !self.fifo_ok() {
            Verdict::Fail(Stage::Fifo)
        } else if !self.bist_ok() {
            Verdict::Fail(Stage::Bist)
        } else {
            Verdict::Pass
        }
    }

    pub fn passed(&self, policy: LvdsPolicy) -> bool {
        self.verdict(policy) == Verdict::Pass
    }
}

/// A board to bring up.
#[derive(Clone, Copy)]
pub enum BringupTarget<'a> {
    Dac(&'a dyn DacCalibration),
    Adc(&'a dyn FpgaBoard),
}

impl BringupTarget<'_> {
    pub fn name(&self) -> &str {
        match self {
            BringupTarget::Dac(board) => board.name(),
            BringupTarget::Adc(board) => board.name(),
        }
    }

    pub fn class(&self) -> BoardClass {
        match self {
            BringupTarget::Dac(_) => BoardClass::Dac,
            BringupTarget::Adc(_) => BoardClass::Adc,
        }
    }
}

impl<'a> From<&'a Board> for BringupTarget<'a> {
    fn from(board: &'a Board) -> Self {
        match board {
            Board::Dac(dac) => BringupTarget::Dac(&**dac),
            Board::Adc(adc) => BringupTarget::Adc(&**adc),
        }
    }
}

/// Why one whole-board attempt did not pass.
enum AttemptFailure {
    Failed(BringupResult),
    Error(FpgaError),
}

/// Drives boards through bring-up.
pub struct Bringup {
    config: BringupConfig,
    rng: Mutex<ChaCha8Rng>,
}

impl fmt::Debug for Bringup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bringup")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Bringup {
    pub fn new(config: BringupConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            config,
            rng: Mutex::new(rng),
        }
    }

    pub fn config(&self) -> &BringupConfig {
        &self.config
    }

    /// Random 14-bit samples for the self-test.
    fn bist_data(&self) -> Vec<u16> {
        let mut rng = self.rng.lock();
        (0..self.config.bist_samples)
            .map(|_| rng.gen_range(0..=0x3FFF))
            .collect()
    }

    /// FIFO calibration with bounded retries. Even attempts use the normal
    /// clock polarity, odd attempts the inverted one. A transport error
    /// counts as a failed attempt.
    #[instrument(skip(self, board), fields(board = board.name()))]
    pub async fn calibrate_fifo(&self, board: &dyn DacCalibration, dac: DacChannel) -> FifoOutcome {
        let target = self.config.fifo_target;
        let policy = RetryPolicy::attempts(self.config.fifo_tries);
        let attempt = retry(&policy, |index| async move {
            let invert = index % 2 == 1;
            match board.fifo_attempt(dac, target, invert).await {
                Ok(reading) if reading.locked => Ok(reading),
                Ok(reading) => Err((invert, Some(reading))),
                Err(e) => {
                    tracing::warn!(attempt = index + 1, error = %e, "FIFO attempt failed");
                    Err((invert, None))
                }
            }
        })
        .await;

        match attempt {
            Attempt::Succeeded { value, tries } => FifoOutcome::from_reading(&value, true, tries),
            Attempt::Exhausted {
                last_error: (_, Some(reading)),
                tries,
            } => FifoOutcome::from_reading(&reading, false, tries),
            Attempt::Exhausted {
                last_error: (invert, None),
                tries,
            } => FifoOutcome {
                success: false,
                tries,
                phof: None,
                clock_inverted: invert,
                counter: None,
            },
        }
    }

    /// LVDS, FIFO and BIST on one channel. FIFO failure falls through to BIST.
    async fn calibrate_channel(
        &self,
        board: &dyn DacCalibration,
        dac: DacChannel,
    ) -> FpgaResult<ChannelReport> {
        board.init_dac(dac, self.config.signed_data).await?;
        let lvds = board.set_lvds(dac, self.config.lvds_setting()).await?;
        if !lvds.success {
            tracing::warn!(board = board.name(), channel = %dac, sd = lvds.sd, "LVDS calibration failed");
        }
        let fifo = self.calibrate_fifo(board, dac).await;
        let bist = board.run_bist(dac, &self.bist_data()).await?;
        tracing::debug!(
            board = board.name(),
            channel = %dac,
            lvds = lvds.success,
            fifo = fifo.success,
            fifo_tries = fifo.tries,
            bist = bist.success,
            "channel calibrated"
        );
        Ok(ChannelReport {
            channel: dac,
            lvds,
            fifo,
            bist,
        })
    }

    /// One bring-up attempt of a DAC board: program and reset the PLL, then
    /// calibrate both channels.
    #[instrument(skip(self, board), fields(board = board.name()))]
    pub async fn bringup_dac(&self, board: &dyn DacCalibration) -> FpgaResult<BringupResult> {
        board.init_pll().await?;
        sleep(self.config.pll_settle()).await;
        board.reset_pll().await?;
        let mut channels = Vec::with_capacity(DacChannel::BOTH.len());
        for dac in DacChannel::BOTH {
            channels.push(self.calibrate_channel(board, dac).await?);
        }
        Ok(BringupResult { channels })
    }

    /// ADC bring-up: program the PLL.
    #[instrument(skip(self, board), fields(board = board.name()))]
    pub async fn bringup_adc(&self, board: &dyn FpgaBoard) -> FpgaResult<()> {
        board.init_pll().await
    }

    /// Bring up one board, restarting the whole sequence while it fails.
    pub async fn bringup_board(&self, target: BringupTarget<'_>) -> BoardBringup {
        let name = target.name().to_string();
        let class = target.class();
        let policy = RetryPolicy::attempts(self.config.board_retries);
        let lvds_policy = self.config.lvds_policy;

        let attempt = retry(&policy, |index| async move {
            tracing::info!(board = target.name(), attempt = index + 1, "bringing up board");
            match target {
                BringupTarget::Dac(board) => match self.bringup_dac(board).await {
                    Ok(result) if result.passed(lvds_policy) => Ok(BoardOutcome::Dac(result)),
                    Ok(result) => Err(AttemptFailure::Failed(result)),
                    Err(e) => Err(AttemptFailure::Error(e)),
                },
                BringupTarget::Adc(board) => match self.bringup_adc(board).await {
                    Ok(()) => Ok(BoardOutcome::Adc),
                    Err(e) => Err(AttemptFailure::Error(e)),
                },
            }
        })
        .await;

        let (passed, attempts, outcome) = match attempt {
            Attempt::Succeeded { value, tries } => (true, tries, value),
            Attempt::Exhausted { last_error, tries } => {
                let outcome = match last_error {
                    AttemptFailure::Failed(result) => BoardOutcome::Dac(result),
                    AttemptFailure::Error(e) => BoardOutcome::Error {
                        kind: e.kind(),
                        message: e.to_string(),
                    },
                };
                (false, tries, outcome)
            }
        };

        if passed {
            if attempts > 1 {
                tracing::warn!(board = %name, attempts, "board took more than one try");
            }
            if let BoardOutcome::Dac(result) = &outcome {
                if !result.lvds_ok() {
                    tracing::warn!(board = %name, "board ok but LVDS calibration failed");
                }
            }
            tracing::info!(board = %name, "bring-up ok");
        } else {
            tracing::error!(board = %name, attempts, "bring-up failed");
        }

        BoardBringup {
            name,
            class,
            attempts,
            passed,
            outcome,
        }
    }

    /// Bring up boards one after another and collect a batch report.
    pub async fn bringup_targets(&self, targets: &[BringupTarget<'_>]) -> BatchReport {
        let mut boards = Vec::with_capacity(targets.len());
        for &target in targets {
            boards.push(self.bringup_board(target).await);
        }
        let report = BatchReport::new(boards);
        if report.all_passed() {
            tracing::info!(boards = report.boards.len(), "all boards successful");
        } else {
            tracing::error!(failed = ?report.failed(), "some boards failed bring-up");
        }
        report
    }

    pub async fn bringup_boards(&self, boards: &[Board]) -> BatchReport {
        let targets: Vec<BringupTarget<'_>> = boards.iter().map(BringupTarget::from).collect();
        self.bringup_targets(&targets).await
    }

    /// Bring up every board of a group inside the group's test-mode lock.
    #[instrument(skip(self, group), fields(group = group.name()))]
    pub async fn bringup_group(&self, group: &BoardGroup) -> BatchReport {
        let boards = group.registry().boards();
        group.test_mode(|| self.bringup_boards(&boards)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NUM_TRIES;
    use async_trait::async_trait;
    use ghz_driver_fpga::LvdsSetting;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tracing_test::traced_test;

    /// Board whose FIFO locks after a scripted number of failures.
    struct ScriptedDac {
        fifo_failures: u32,
        fifo_calls: AtomicU32,
        fifo_polarities: Mutex<Vec<bool>>,
        lvds_success: bool,
        bist_success: bool,
        pll_inits: AtomicU32,
    }

    impl ScriptedDac {
        fn new(fifo_failures: u32) -> Self {
            Self {
                fifo_failures,
                fifo_calls: AtomicU32::new(0),
                fifo_polarities: Mutex::new(Vec::new()),
                lvds_success: true,
                bist_success: true,
                pll_inits: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl DacCalibration for ScriptedDac {
        fn name(&self) -> &str {
            "sim DAC 1"
        }

        async fn init_pll(&self) -> FpgaResult<()> {
            self.pll_inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reset_pll(&self) -> FpgaResult<()> {
            Ok(())
        }

        async fn init_dac(&self, _dac: DacChannel, _signed: bool) -> FpgaResult<()> {
            Ok(())
        }

        async fn set_lvds(&self, _dac: DacChannel, setting: LvdsSetting) -> FpgaResult<LvdsReading> {
            let sd = match setting {
                LvdsSetting::Optimize => 2,
                LvdsSetting::Fixed(sd) => sd,
            };
            Ok(LvdsReading {
                success: self.lvds_success,
                msd: Some(5),
                mhd: Some(9),
                sd,
                msd_bits: [false; 16],
                mhd_bits: [false; 16],
                check: 1,
            })
        }

        async fn fifo_attempt(
            &self,
            _dac: DacChannel,
            target: u8,
            invert_clock: bool,
        ) -> FpgaResult<FifoReading> {
            self.fifo_polarities.lock().push(invert_clock);
            let call = self.fifo_calls.fetch_add(1, Ordering::SeqCst);
            let locked = call >= self.fifo_failures;
            Ok(FifoReading {
                counters: [2, target, 4, 5],
                phof: locked.then_some(1),
                counter: locked.then_some(target),
                locked,
                clock_inverted: invert_clock,
            })
        }

        async fn run_bist(&self, _dac: DacChannel, data: &[u16]) -> FpgaResult<BistReading> {
            let theory = ghz_core::codec::bist_checksum(data);
            Ok(BistReading {
                success: self.bist_success,
                theory,
                lvds: theory,
                fifo: theory,
            })
        }
    }

    fn bringup(config: BringupConfig) -> Bringup {
        Bringup::new(BringupConfig {
            seed: Some(7),
            pll_settle_ms: 0,
            ..config
        })
    }

    #[tokio::test]
    async fn test_fifo_succeeds_within_tries() {
        for k in 0..NUM_TRIES {
            let board = ScriptedDac::new(k);
            let outcome = bringup(BringupConfig::default())
                .calibrate_fifo(&board, DacChannel::A)
                .await;
            assert!(outcome.success);
            assert_eq!(outcome.tries, k + 1);
            assert_eq!(outcome.counter, Some(3));
        }
    }

    #[tokio::test]
    async fn test_fifo_fails_after_exactly_num_tries() {
        for k in [NUM_TRIES, NUM_TRIES + 3] {
            let board = ScriptedDac::new(k);
            let outcome = bringup(BringupConfig::default())
                .calibrate_fifo(&board, DacChannel::B)
                .await;
            assert!(!outcome.success);
            assert_eq!(outcome.tries, NUM_TRIES);
            assert_eq!(board.fifo_calls.load(Ordering::SeqCst), NUM_TRIES);
        }
    }

    #[tokio::test]
    async fn test_fifo_retry_flips_clock_polarity() {
        let board = ScriptedDac::new(3);
        let config = BringupConfig {
            fifo_tries: 4,
            ..Default::default()
        };
        let outcome = bringup(config).calibrate_fifo(&board, DacChannel::A).await;
        assert!(outcome.success);
        assert!(outcome.clock_inverted);
        assert_eq!(*board.fifo_polarities.lock(), vec![false, true, false, true]);
    }

    #[tokio::test]
    async fn test_fifo_failure_falls_through_to_bist() {
        let board = ScriptedDac::new(u32::MAX);
        let result = bringup(BringupConfig::default())
            .bringup_dac(&board)
            .await
            .unwrap();
        assert_eq!(result.channels.len(), 2);
        assert!(!result.fifo_ok());
        assert!(result.bist_ok());
        assert_eq!(result.verdict(LvdsPolicy::Advisory), Verdict::Fail(Stage::Fifo));
    }

    #[tokio::test]
    async fn test_lvds_policy_decides_gating() {
        let mut board = ScriptedDac::new(0);
        board.lvds_success = false;
        let result = bringup(BringupConfig::default())
            .bringup_dac(&board)
            .await
            .unwrap();
        assert!(result.passed(LvdsPolicy::Advisory));
        assert_eq!(result.verdict(LvdsPolicy::Gating), Verdict::Fail(Stage::Lvds));
    }

    #[tokio::test]
    async fn test_failing_board_is_retried_from_the_start() {
        let mut board = ScriptedDac::new(0);
        board.bist_success = false;
        let report = bringup(BringupConfig::default())
            .bringup_board(BringupTarget::Dac(&board))
            .await;
        assert!(!report.passed);
        assert_eq!(report.attempts, NUM_TRIES);
        assert_eq!(board.pll_inits.load(Ordering::SeqCst), NUM_TRIES);
        let BoardOutcome::Dac(result) = &report.outcome else {
            panic!("expected DAC results, got {:?}", report.outcome);
        };
        assert_eq!(result.verdict(LvdsPolicy::Advisory), Verdict::Fail(Stage::Bist));
    }

    #[tokio::test]
    async fn test_passing_board_needs_one_attempt() {
        let board = ScriptedDac::new(1);
        let report = bringup(BringupConfig::default())
            .bringup_board(BringupTarget::Dac(&board))
            .await;
        assert!(report.passed);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.class, BoardClass::Dac);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_retried_board_is_flagged() {
        // Channel A burns both FIFO tries on the first attempt only.
        let board = ScriptedDac::new(NUM_TRIES);
        let report = bringup(BringupConfig::default())
            .bringup_board(BringupTarget::Dac(&board))
            .await;
        assert!(report.passed);
        assert_eq!(report.attempts, 2);
        assert!(logs_contain("board took more than one try"));
    }

    #[test]
    fn test_seeded_bist_data_is_reproducible() {
        let a = bringup(BringupConfig::default()).bist_data();
        let b = bringup(BringupConfig::default()).bist_data();
        assert_eq!(a.len(), 1000);
        assert_eq!(a, b);
        assert!(a.iter().all(|&s| s <= 0x3FFF));
    }
}
