//! Driver for the paged-SRAM DAC boards.

use super::{BoardCore, BoardState, Channel, FpgaBoard, SetupCache};
use crate::transport::DirectEthernet;
use async_trait::async_trait;
use bytes::Bytes;
use ghz_core::codec::dac::{PLL_INIT_SEQUENCE, READBACK_LEN};
use ghz_core::codec::{
    bist_checksum, DacChannel, DacCodec, DacRun, Readback, RegisterCodec, SerialTarget,
};
use ghz_core::{BoardAddress, FpgaError, FpgaResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// LVDS sweep: for every delay step, set MSD then read the check bit, set MHD
/// then read the check bit.
fn lvds_sweep() -> Vec<u32> {
    (0..16u32)
        .flat_map(|i| [0x0400 + (i << 4), 0x8500, 0x0400 + i, 0x8500])
        .collect()
}

const FIFO_SCAN: [u32; 8] = [0x0700, 0x8700, 0x0701, 0x8700, 0x0702, 0x8700, 0x0703, 0x8700];

const BIST_PREPARE: [u32; 3] = [0x0004, 0x1107, 0x1106];

const BIST_READOUT: [u32; 20] = [
    0x1126, 0x9200, 0x9300, 0x9400, 0x9500, //
    0x1166, 0x9200, 0x9300, 0x9400, 0x9500, //
    0x11A6, 0x9200, 0x9300, 0x9400, 0x9500, //
    0x11E6, 0x9200, 0x9300, 0x9400, 0x9500,
];

/// Shortest SRAM sequence a BIST run uploads.
const BIST_MIN_WORDS: usize = 20;

/// Largest cross-controller delay magnitude.
pub const MAX_CROSS_DELAY: i8 = 63;

/// How the LVDS sample delay is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LvdsSetting {
    /// Measure the data clock edges and centre SD between them.
    Optimize,
    /// Use this SD value (low 4 bits).
    Fixed(u8),
}

/// Outcome of one LVDS timing calibration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LvdsReading {
    /// MSD and MHD flip exactly once, within one step of each other.
    pub success: bool,
    /// Measured setup delay edge, when it could be located.
    pub msd: Option<u8>,
    /// Measured hold delay edge, when it could be located.
    pub mhd: Option<u8>,
    /// SD value programmed.
    pub sd: u8,
    pub msd_bits: [bool; 16],
    pub mhd_bits: [bool; 16],
    /// Low three bits of the LVDS status register.
    pub check: u8,
}

impl LvdsReading {
    /// `_`/`-` rendering of the MSD sweep.
    pub fn msd_plot(&self) -> String {
        plot(&self.msd_bits)
    }

    /// `_`/`-` rendering of the MHD sweep.
    pub fn mhd_plot(&self) -> String {
        plot(&self.mhd_bits)
    }
}

fn plot(bits: &[bool]) -> String {
    bits.iter().map(|&b| if b { '-' } else { '_' }).collect()
}

/// Outcome of one FIFO calibration attempt at a fixed clock polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoReading {
    /// FIFO counter measured for PHOF 0..4.
    pub counters: [u8; 4],
    /// PHOF that produced the target counter, if any.
    pub phof: Option<u8>,
    /// Counter read back after programming `phof`.
    pub counter: Option<u8>,
    /// The verification read matched the target.
    pub locked: bool,
    pub clock_inverted: bool,
}

/// Outcome of a built-in self-test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BistReading {
    pub success: bool,
    pub theory: [u32; 2],
    pub lvds: [u32; 2],
    pub fifo: [u32; 2],
}

/// Accept a checksum pair read back in either order.
fn orient(reading: [u32; 2], theory: [u32; 2]) -> [u32; 2] {
    let [a, b] = reading;
    if [b, a] == theory {
        [b, a]
    } else {
        reading
    }
}

/// Locate where a sweep's check bit first goes from 1 to 0.
fn falling_edge(bits: impl Iterator<Item = bool>) -> u8 {
    let mut seen_high = false;
    for (i, bit) in bits.enumerate() {
        if bit {
            seen_high = true;
        } else if seen_high {
            return i as u8;
        }
    }
    0
}

/// Driver for one DAC board.
#[derive(Debug)]
pub struct DacBoard {
    core: BoardCore,
    codec: DacCodec,
}

impl DacBoard {
    pub(crate) async fn connect(
        ethernet: Arc<dyn DirectEthernet>,
        port: u32,
        name: String,
        address: BoardAddress,
        codec: DacCodec,
        timeout: Duration,
    ) -> FpgaResult<Self> {
        let build = codec.build();
        let core = BoardCore::connect(
            ethernet,
            port,
            name,
            address,
            build,
            Some(READBACK_LEN),
            timeout,
        )
        .await?;
        Ok(Self { core, codec })
    }

    pub(crate) fn core(&self) -> &BoardCore {
        &self.core
    }

    pub fn codec(&self) -> &DacCodec {
        &self.codec
    }

    fn decode(&self, reply: Option<Bytes>) -> FpgaResult<Readback> {
        match reply {
            Some(bytes) if bytes.len() == READBACK_LEN => Ok(self.codec.decode_readback(&bytes)),
            Some(bytes) => Err(FpgaError::Protocol(format!(
                "{}: readback of {} bytes, expected {}",
                self.core.name,
                bytes.len(),
                READBACK_LEN
            ))),
            None => Err(FpgaError::Protocol(format!("{}: missing readback", self.core.name))),
        }
    }

    pub(crate) async fn ping(&self, channel: &mut Channel) -> FpgaResult<Readback> {
        let reply = channel.register(self.codec.encode_ping(), true).await?;
        self.decode(reply)
    }

    /// Shift words one at a time through a serial target and collect the
    /// byte each write shifts out.
    async fn serial(
        &self,
        channel: &mut Channel,
        target: SerialTarget,
        words: &[u32],
    ) -> FpgaResult<Vec<u8>> {
        let packets = words
            .iter()
            .map(|&w| self.codec.encode_serial(target, w))
            .collect::<FpgaResult<Vec<_>>>()?;
        let mut answers = Vec::with_capacity(packets.len());
        for packet in packets {
            let reply = channel.register(packet, true).await?;
            answers.push(self.decode(reply)?.serial_reply.unwrap_or(0));
        }
        Ok(answers)
    }

    async fn polarity(&self, channel: &mut Channel, dac: DacChannel, invert: bool) -> FpgaResult<()> {
        let packet = self.codec.encode_clock_polarity(dac, invert);
        self.decode(channel.register(packet, true).await?)?;
        Ok(())
    }

    /// Play nothing: an empty SRAM range, fire and forget.
    async fn run_empty(&self, channel: &mut Channel) -> FpgaResult<()> {
        let packet = self.codec.encode_run_sram(0, 0, false, 0, ghz_core::codec::dac::DEFAULT_SYNC)?;
        channel.register(packet, false).await?;
        Ok(())
    }

    async fn upload(&self, channel: &mut Channel, words: &[u32], page: usize) -> FpgaResult<()> {
        let pages = self.codec.encode_sram(words, page)?;
        channel
            .write_batch(pages.into_iter().map(|p| p.into_bytes()).collect())
            .await
    }

    /// Upload a sequence's SRAM unless the same words already sit in `page`.
    pub(crate) async fn load_sram(
        &self,
        channel: &mut Channel,
        words: &[u32],
        page: usize,
    ) -> FpgaResult<()> {
        let setup = SetupCache::Dac {
            page,
            words: words.to_vec(),
        };
        if channel.setup_matches(&setup) {
            tracing::debug!(board = %self.core.name, page, "SRAM unchanged, skipping upload");
            return Ok(());
        }
        self.upload(channel, words, page).await?;
        channel.remember_setup(Some(setup));
        Ok(())
    }

    /// Run register for a memory sequence in a daisy-chain run.
    pub(crate) fn run_packet(&self, run: &DacRun) -> FpgaResult<ghz_core::codec::RegisterPacket> {
        self.codec.encode_run(run)
    }

    pub(crate) fn idle_packet(&self, delay: u8) -> ghz_core::codec::RegisterPacket {
        self.codec.encode_idle(delay)
    }

    // =========================================================================
    // Test-mode operations
    // =========================================================================

    /// Raw serial access to the PLL or one of the DAC chips.
    pub async fn run_serial(&self, target: SerialTarget, words: &[u32]) -> FpgaResult<Vec<u8>> {
        let mut session = self.core.test_mode().await?;
        self.serial(&mut session, target, words).await
    }

    /// Pulse the PLL reset line.
    pub async fn reset_pll(&self) -> FpgaResult<()> {
        let mut session = self.core.test_mode().await?;
        self.decode(session.register(self.codec.encode_pll_reset(), true).await?)?;
        Ok(())
    }

    pub async fn set_clock_polarity(&self, dac: DacChannel, invert: bool) -> FpgaResult<()> {
        let mut session = self.core.test_mode().await?;
        self.polarity(&mut session, dac, invert).await
    }

    /// Put a DAC chip into its operating data format.
    #[instrument(skip(self), fields(board = %self.core.name))]
    pub async fn init_dac(&self, dac: DacChannel, signed: bool) -> FpgaResult<()> {
        let words: [u32; 4] = if signed {
            [0x0024, 0x0004, 0x1603, 0x0500]
        } else {
            [0x0026, 0x0006, 0x1603, 0x0500]
        };
        self.run_serial(dac.serial_target(), &words).await.map(|_| ())
    }

    /// Program the cross-controller delay, in `-63..=63`.
    pub async fn set_cross_delay(&self, dac: DacChannel, delay: i8) -> FpgaResult<()> {
        if !(-MAX_CROSS_DELAY..=MAX_CROSS_DELAY).contains(&delay) {
            return Err(FpgaError::Protocol(format!(
                "cross-controller delay {delay} outside -{MAX_CROSS_DELAY}..={MAX_CROSS_DELAY}"
            )));
        }
        let magnitude = u32::from(delay.unsigned_abs());
        let words = if delay < 0 {
            [0x0A00, 0x0B00 + magnitude]
        } else {
            [0x0A00 + magnitude, 0x0B00]
        };
        self.run_serial(dac.serial_target(), &words).await.map(|_| ())
    }

    /// Align a DAC chip's LVDS data bus to its clock.
    #[instrument(skip(self), fields(board = %self.core.name))]
    pub async fn set_lvds(&self, dac: DacChannel, setting: LvdsSetting) -> FpgaResult<LvdsReading> {
        let target = dac.serial_target();
        let sweep = lvds_sweep();
        let mut session = self.core.test_mode().await?;

        let (sd, measured) = match setting {
            LvdsSetting::Optimize => {
                let words: Vec<u32> = std::iter::once(0x0500).chain(sweep.iter().copied()).collect();
                let answer = self.serial(&mut session, target, &words).await?;
                let bit = |i: usize| answer.get(4 * i + 2).is_some_and(|a| a & 1 == 1);
                let hold = |i: usize| answer.get(4 * i + 4).is_some_and(|a| a & 1 == 1);
                let msd = falling_edge((0..16).map(bit));
                let mhd = falling_edge((0..16).map(hold));
                let sd = ((i16::from(mhd) - i16::from(msd)).div_euclid(2) & 0xF) as u8;
                (sd, Some((msd, mhd)))
            }
            LvdsSetting::Fixed(sd) => (sd & 0xF, None),
        };

        let words: Vec<u32> = std::iter::once(0x0500 + (u32::from(sd) << 4))
            .chain(sweep)
            .collect();
        let answer = self.serial(&mut session, target, &words).await?;
        let mut msd_bits = [false; 16];
        let mut mhd_bits = [false; 16];
        for i in 0..16 {
            msd_bits[i] = answer.get(4 * i + 2).is_some_and(|a| a & 1 == 1);
            mhd_bits[i] = answer.get(4 * i + 4).is_some_and(|a| a & 1 == 1);
        }
        let switches = |bits: &[bool; 16]| -> Vec<usize> {
            (0..15).filter(|&i| bits[i] != bits[i + 1]).collect()
        };
        let msd_switches = switches(&msd_bits);
        let mhd_switches = switches(&mhd_bits);
        let single = msd_switches.len() == 1 && mhd_switches.len() == 1;
        let success = match (msd_switches.first(), mhd_switches.first()) {
            (Some(&lead), Some(&trail)) => single && lead.abs_diff(trail) <= 1,
            _ => false,
        };

        let (msd, mhd) = match measured {
            Some((msd, mhd)) => (Some(msd), Some(mhd)),
            None => (
                (msd_switches.len() == 1).then(|| msd_switches[0] as u8),
                (mhd_switches.len() == 1).then(|| mhd_switches[0] as u8),
            ),
        };

        let check = self
            .serial(&mut session, target, &[0x8500])
            .await?
            .first()
            .copied()
            .unwrap_or(0)
            & 0x7;

        let reading = LvdsReading {
            success,
            msd,
            mhd,
            sd,
            msd_bits,
            mhd_bits,
            check,
        };
        tracing::debug!(
            channel = %dac,
            sd,
            success,
            msd = %reading.msd_plot(),
            mhd = %reading.mhd_plot(),
            "LVDS sweep"
        );
        Ok(reading)
    }

    /// One FIFO calibration attempt: set the clock polarity, measure the FIFO
    /// counter for every PHOF and verify the first PHOF hitting `target`.
    #[instrument(skip(self), fields(board = %self.core.name))]
    pub async fn fifo_attempt(
        &self,
        dac: DacChannel,
        target: u8,
        invert_clock: bool,
    ) -> FpgaResult<FifoReading> {
        let op = dac.serial_target();
        let mut session = self.core.test_mode().await?;
        self.polarity(&mut session, dac, invert_clock).await?;

        let reading = self.serial(&mut session, op, &FIFO_SCAN).await?;
        let mut counters = [0u8; 4];
        for (slot, index) in counters.iter_mut().zip([1, 3, 5, 7]) {
            *slot = reading.get(index).map_or(0, |r| (r >> 4) & 0xF);
        }

        let mut result = FifoReading {
            counters,
            phof: None,
            counter: None,
            locked: false,
            clock_inverted: invert_clock,
        };
        for phof in (0..4u8).filter(|&p| counters[usize::from(p)] == target) {
            let verify = self
                .serial(&mut session, op, &[0x0700 + u32::from(phof), 0x8700])
                .await?;
            let counter = verify.get(1).map_or(0, |r| (r >> 4) & 0xF);
            result.phof = Some(phof);
            result.counter = Some(counter);
            if counter == target {
                result.locked = true;
                break;
            }
        }
        tracing::debug!(channel = %dac, ?counters, phof = ?result.phof, locked = result.locked, "FIFO attempt");
        Ok(result)
    }

    /// Play `data` out of SRAM and compare the chip's checksums against the
    /// expected ones.
    #[instrument(skip(self, data), fields(board = %self.core.name, samples = data.len()))]
    pub async fn run_bist(&self, dac: DacChannel, data: &[u16]) -> FpgaResult<BistReading> {
        let op = dac.serial_target();
        let samples: Vec<u16> = data.iter().map(|d| d & 0x3FFF).collect();
        let mut words: Vec<u32> = [0u32; 4]
            .into_iter()
            .chain(samples.iter().map(|&d| u32::from(d) << dac.sample_shift()))
            .collect();
        if words.len() < BIST_MIN_WORDS {
            words.resize(BIST_MIN_WORDS, 0);
        }
        let end = u32::try_from(words.len()).map_err(|_| FpgaError::PayloadTooLong {
            len: words.len(),
            capacity: self.codec.layout().sram_len,
        })?;
        let run = self
            .codec
            .encode_run_sram(0, end, false, 0, ghz_core::codec::dac::DEFAULT_SYNC)?;
        let pages = self.codec.encode_sram(&words, 0)?;

        let mut session = self.core.test_mode().await?;
        session.remember_setup(None);
        self.run_empty(&mut session).await?;
        session
            .write_batch(pages.into_iter().map(|p| p.into_bytes()).collect())
            .await?;
        self.serial(&mut session, op, &BIST_PREPARE).await?;
        session.register(run, false).await?;

        let bist = self.serial(&mut session, op, &BIST_READOUT).await?;
        let word = |i: usize| {
            let byte = |k: usize| u32::from(bist.get(i + k).copied().unwrap_or(0));
            byte(4) | byte(3) << 8 | byte(2) << 16 | byte(1) << 24
        };
        let theory = bist_checksum(&samples);
        let lvds = orient([word(0), word(5)], theory);
        let fifo = orient([word(10), word(15)], theory);
        Ok(BistReading {
            success: lvds == theory && fifo == theory,
            theory,
            lvds,
            fifo,
        })
    }

    /// Upload `words` and play them directly from SRAM.
    pub async fn run_sram(&self, words: &[u32], looping: bool, block_delay: u8) -> FpgaResult<()> {
        let end = u32::try_from(words.len()).map_err(|_| FpgaError::PayloadTooLong {
            len: words.len(),
            capacity: self.codec.layout().sram_len,
        })?;
        let run = self.codec.encode_run_sram(
            0,
            end,
            looping,
            block_delay,
            ghz_core::codec::dac::DEFAULT_SYNC,
        )?;
        let mut session = self.core.test_mode().await?;
        self.ping(&mut session).await?;
        session.remember_setup(None);
        self.upload(&mut session, words, 0).await?;
        session.register(run, false).await?;
        Ok(())
    }
}

#[async_trait]
impl FpgaBoard for DacBoard {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn address(&self) -> BoardAddress {
        self.core.address
    }

    fn build(&self) -> u8 {
        self.core.build
    }

    fn state(&self) -> BoardState {
        self.core.state()
    }

    #[instrument(skip(self), fields(board = %self.core.name))]
    async fn init_pll(&self) -> FpgaResult<()> {
        let mut session = self.core.test_mode().await?;
        self.serial(&mut session, SerialTarget::Pll, &PLL_INIT_SEQUENCE).await?;
        self.run_empty(&mut session).await?;
        session.remember_setup(None);
        tracing::info!("PLL programmed");
        Ok(())
    }

    async fn query_pll(&self) -> FpgaResult<bool> {
        let mut session = self.core.test_mode().await?;
        let reply = session.register(self.codec.encode_pll_query(), true).await?;
        Ok(self.decode(reply)?.pll_unlocked)
    }

    async fn execution_count(&self) -> FpgaResult<u16> {
        let mut session = self.core.lock().await?;
        session.clear().await?;
        Ok(self.ping(&mut session).await?.execution_count)
    }

    async fn build_number(&self) -> FpgaResult<u8> {
        let mut session = self.core.lock().await?;
        Ok(self.ping(&mut session).await?.build)
    }

    async fn disconnect(&self) -> FpgaResult<()> {
        self.core.disconnect().await
    }
}
