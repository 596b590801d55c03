//! DAC register and SRAM layouts for the paged-SRAM firmware builds.

use super::{check_width, RegisterCodec, RegisterPacket, Readback, Registers, SramPage};
use crate::address::BoardClass;
use crate::error::{FpgaError, FpgaResult};
use std::fmt;

pub const REGISTER_LEN: usize = 56;
pub const READBACK_LEN: usize = 70;
pub(crate) const READBACK_BUILD_OFFSET: usize = 51;

/// Offsets of the serial-interface fields.
pub const SERIAL_OP_OFFSET: usize = 47;
pub const SERIAL_DATA_OFFSET: usize = 48;

/// Timer values carried by one timing packet.
pub const TIMING_VALUES_PER_PACKET: usize = 30;
const TIMING_DATA_OFFSET: usize = 3;

/// 32-bit SRAM words per SRAM write packet.
pub const SRAM_WRITE_WORDS: usize = 256;

pub const DEFAULT_SYNC: u8 = 249;

/// PLL programming words for the 1 GHz clock chip.
pub const PLL_INIT_SEQUENCE: [u32; 4] = [0x1F_C093, 0x1F_C092, 0x10_0004, 0x00_0C11];

/// Device addressed by a serial-interface write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerialTarget {
    Pll = 1,
    DacA = 2,
    DacB = 3,
}

impl SerialTarget {
    pub const fn opcode(self) -> u8 {
        self as u8
    }

    pub fn from_opcode(op: u8) -> Option<Self> {
        match op {
            1 => Some(SerialTarget::Pll),
            2 => Some(SerialTarget::DacA),
            3 => Some(SerialTarget::DacB),
            _ => None,
        }
    }
}

/// One of the two DAC chips on a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DacChannel {
    A,
    B,
}

impl DacChannel {
    pub const BOTH: [DacChannel; 2] = [DacChannel::A, DacChannel::B];

    pub const fn serial_target(self) -> SerialTarget {
        match self {
            DacChannel::A => SerialTarget::DacA,
            DacChannel::B => SerialTarget::DacB,
        }
    }

    /// Bit position of this channel's 14-bit sample inside an SRAM word.
    pub const fn sample_shift(self) -> u32 {
        match self {
            DacChannel::A => 0,
            DacChannel::B => 14,
        }
    }

    /// (select bit, invert bit) in the clock-polarity byte.
    pub const fn polarity_bits(self) -> (u8, u8) {
        match self {
            DacChannel::A => (4, 0),
            DacChannel::B => (5, 1),
        }
    }
}

impl fmt::Display for DacChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DacChannel::A => f.write_str("A"),
            DacChannel::B => f.write_str("B"),
        }
    }
}

/// Role of a board when a run register is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartMode {
    Master = 0,
    Slave = 1,
    Idle = 3,
}

/// Parameters of a memory-sequence run register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DacRun {
    pub reps: u16,
    /// SRAM page, 0 or 1.
    pub page: u8,
    pub mode: StartMode,
    /// Daisy-chain start delay in clock cycles.
    pub delay: u16,
    pub block_delay: Option<u8>,
    pub sync: u8,
}

impl Default for DacRun {
    fn default() -> Self {
        Self {
            reps: 1,
            page: 0,
            mode: StartMode::Master,
            delay: 0,
            block_delay: None,
            sync: DEFAULT_SYNC,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DacLayout {
    pub build: u8,
    /// SRAM size in words.
    pub sram_len: usize,
    pub sram_pages: usize,
    /// Words per SRAM page used for paged sequences.
    pub sram_page_len: usize,
    pub sram_delay_len: usize,
}

impl DacLayout {
    pub fn for_build(build: u8) -> FpgaResult<Self> {
        let (sram_len, sram_page_len) = match build {
            7 | 11 => (10_240, 5_120),
            8 | 12 => (18_432, 9_216),
            _ => {
                return Err(FpgaError::UnsupportedBuild {
                    class: BoardClass::Dac,
                    build,
                })
            }
        };
        Ok(Self {
            build,
            sram_len,
            sram_pages: sram_len / SRAM_WRITE_WORDS,
            sram_page_len,
            sram_delay_len: 1024,
        })
    }
}

/// Built-in self-test checksums over the even and odd samples of a sequence.
pub fn bist_checksum(samples: &[u16]) -> [u32; 2] {
    let mut bist = [0u32; 2];
    for pair in samples.chunks(2) {
        for (acc, &sample) in bist.iter_mut().zip(pair) {
            let sample = u32::from(sample) & 0x3FFF;
            if sample != 0 {
                *acc = acc.rotate_left(1) ^ ((sample ^ 0x3FFF) & 0x3FFF);
            }
        }
    }
    bist
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DacCodec {
    layout: DacLayout,
}

impl DacCodec {
    pub fn new(layout: DacLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &DacLayout {
        &self.layout
    }

    fn registers(&self) -> Registers {
        Registers::new(REGISTER_LEN)
    }

    /// Serial write, with readback so the shifted-out byte can be read.
    pub fn encode_serial(&self, target: SerialTarget, data: u32) -> FpgaResult<RegisterPacket> {
        check_width("serial word", u64::from(data), 24)?;
        let mut regs = self.registers();
        regs.set(1, 1)
            .set(SERIAL_OP_OFFSET, target.opcode())
            .set_le(SERIAL_DATA_OFFSET, 3, u64::from(data));
        Ok(regs.finish())
    }

    /// Reset pulse to the 1 GHz PLL.
    pub fn encode_pll_reset(&self) -> RegisterPacket {
        let mut regs = self.registers();
        regs.set(1, 1).set(46, 0x80);
        regs.finish()
    }

    pub fn encode_clock_polarity(&self, channel: DacChannel, invert: bool) -> RegisterPacket {
        let (select, bit) = channel.polarity_bits();
        let mut regs = self.registers();
        regs.set(1, 1).set(46, (1 << select) | (u8::from(invert) << bit));
        regs.finish()
    }

    /// Memory-sequence run. Streams timing data back.
    pub fn encode_run(&self, run: &DacRun) -> FpgaResult<RegisterPacket> {
        check_width("SRAM page", u64::from(run.page), 1)?;
        let [delay_lo, delay_hi] = run.delay.to_le_bytes();
        let mut regs = self.registers();
        regs.set(0, 1 + (run.page << 7))
            .set(1, 3)
            .set_le(13, 2, u64::from(run.reps))
            .set(43, run.mode as u8)
            .set(44, delay_lo)
            .set(51, delay_hi)
            .set(45, run.sync);
        if let Some(block_delay) = run.block_delay {
            regs.set(19, block_delay);
        }
        Ok(regs.finish())
    }

    /// Play SRAM directly between `start` and `end` (exclusive) words.
    pub fn encode_run_sram(
        &self,
        start: u32,
        end: u32,
        looping: bool,
        block_delay: u8,
        sync: u8,
    ) -> FpgaResult<RegisterPacket> {
        check_width("SRAM start address", u64::from(start), 24)?;
        // The firmware takes the inclusive end address; an empty range wraps
        // to 0xFFFFFF, which the board treats as "no data".
        let stop = i64::from(end) - 1 + self.layout.sram_delay_len as i64 * i64::from(block_delay);
        if stop >= 1 << 24 {
            return Err(FpgaError::OperandOverflow {
                field: "SRAM end address",
                value: stop as u64,
                bits: 24,
            });
        }
        let mut regs = self.registers();
        regs.set(0, if looping { 3 } else { 4 })
            .set_le(13, 3, u64::from(start))
            .set_le(16, 3, (stop as u64) & 0xFF_FFFF)
            .set(19, block_delay)
            .set(45, sync);
        Ok(regs.finish())
    }

    /// Daisy-chain pass-through for boards with nothing to play.
    pub fn encode_idle(&self, delay: u8) -> RegisterPacket {
        let mut regs = self.registers();
        regs.set(43, StartMode::Idle as u8).set(44, delay);
        regs.finish()
    }

    /// One SRAM write packet of up to 256 words at write page `page`.
    pub fn encode_sram_words(&self, page: usize, words: &[u32]) -> FpgaResult<SramPage> {
        if words.is_empty() {
            return Err(FpgaError::Protocol("SRAM write needs at least one word".into()));
        }
        let data: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.encode_sram_page(page, &data)
    }

    /// Split `words` into write packets starting at the given sequence page.
    pub fn encode_sram(&self, words: &[u32], sequence_page: usize) -> FpgaResult<Vec<SramPage>> {
        let first = sequence_page * self.layout.sram_page_len / SRAM_WRITE_WORDS;
        words
            .chunks(SRAM_WRITE_WORDS)
            .enumerate()
            .map(|(n, chunk)| self.encode_sram_words(first + n, chunk))
            .collect()
    }

    /// Timer values streamed back by a run, in packet order.
    pub fn decode_timing<P: AsRef<[u8]>>(&self, packets: &[P]) -> Vec<u16> {
        packets
            .iter()
            .flat_map(|p| {
                let p = p.as_ref();
                let end = (TIMING_DATA_OFFSET + 2 * TIMING_VALUES_PER_PACKET).min(p.len());
                let start = TIMING_DATA_OFFSET.min(end);
                p[start..end]
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

impl RegisterCodec for DacCodec {
    fn class(&self) -> BoardClass {
        BoardClass::Dac
    }

    fn build(&self) -> u8 {
        self.layout.build
    }

    fn register_len(&self) -> usize {
        REGISTER_LEN
    }

    fn readback_len(&self) -> usize {
        READBACK_LEN
    }

    fn sram_pages(&self) -> usize {
        self.layout.sram_pages
    }

    fn sram_page_capacity(&self) -> usize {
        SRAM_WRITE_WORDS * 4
    }

    fn encode_ping(&self) -> RegisterPacket {
        let mut regs = self.registers();
        regs.set(1, 1);
        regs.finish()
    }

    fn encode_pll_query(&self) -> RegisterPacket {
        self.encode_ping()
    }

    fn decode_readback(&self, bytes: &[u8]) -> Readback {
        let byte = |i: usize| bytes.get(i).copied().unwrap_or(0);
        Readback {
            build: byte(READBACK_BUILD_OFFSET),
            pll_unlocked: byte(58) & 0x80 != 0,
            execution_count: u16::from_le_bytes([byte(52), byte(53)]),
            serial_reply: Some(byte(56)),
        }
    }
}
