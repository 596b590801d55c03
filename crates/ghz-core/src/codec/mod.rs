//! Binary register and SRAM codec.
//!
//! Pure functions between structured command parameters and the fixed-width
//! byte arrays understood by the board firmware. All multi-byte operands are
//! little-endian; field offsets are part of the firmware contract and must not
//! move.
//!
//! Layouts depend on the firmware build. [`board_model`] maps a
//! `(class, build)` pair to the codec for that build and rejects builds with
//! no known layout.

pub mod adc;
pub mod dac;

use crate::address::BoardClass;
use crate::error::{FpgaError, FpgaResult};
use bytes::Bytes;

pub use adc::{
    decode_average_block, decode_demod_block, AdcCodec, AdcLayout, AdcRunMode, DemodBlock,
    DemodChannel, DemodConfig, DemodRange, FilterFunction, IqBlock,
};
pub use dac::{bist_checksum, DacChannel, DacCodec, DacLayout, DacRun, SerialTarget, StartMode};

/// Bytes of SRAM page header (little-endian page index).
pub const SRAM_HEADER_LEN: usize = 2;

// =============================================================================
// Packet types
// =============================================================================

/// A complete register write, ready for the wire. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegisterPacket(Bytes);

impl RegisterPacket {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Byte at `offset`, zero when out of range.
    pub fn byte(&self, offset: usize) -> u8 {
        self.0.get(offset).copied().unwrap_or(0)
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl AsRef<[u8]> for RegisterPacket {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// One SRAM page write: page header followed by the zero-padded payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SramPage {
    index: usize,
    bytes: Bytes,
}

impl SramPage {
    /// Build a page packet of `SRAM_HEADER_LEN + capacity` bytes.
    pub(crate) fn build(index: usize, pages: usize, capacity: usize, data: &[u8]) -> FpgaResult<Self> {
        if index >= pages {
            return Err(FpgaError::PageOutOfRange { page: index, pages });
        }
        if data.len() > capacity {
            return Err(FpgaError::PayloadTooLong {
                len: data.len(),
                capacity,
            });
        }
        let mut buf = vec![0u8; SRAM_HEADER_LEN + capacity];
        put_le(&mut buf[..SRAM_HEADER_LEN], index as u64);
        buf[SRAM_HEADER_LEN..SRAM_HEADER_LEN + data.len()].copy_from_slice(data);
        Ok(Self {
            index,
            bytes: Bytes::from(buf),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[SRAM_HEADER_LEN..]
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

/// Zero-initialised register image with little-endian field setters.
#[derive(Debug, Clone)]
pub(crate) struct Registers(Vec<u8>);

impl Registers {
    pub(crate) fn new(len: usize) -> Self {
        Self(vec![0; len])
    }

    pub(crate) fn set(&mut self, offset: usize, value: u8) -> &mut Self {
        self.0[offset] = value;
        self
    }

    /// Write `value` little-endian into `width` bytes at `offset`. The caller
    /// has already range-checked `value`.
    pub(crate) fn set_le(&mut self, offset: usize, width: usize, value: u64) -> &mut Self {
        put_le(&mut self.0[offset..offset + width], value);
        self
    }

    pub(crate) fn finish(self) -> RegisterPacket {
        RegisterPacket(Bytes::from(self.0))
    }
}

fn put_le(dst: &mut [u8], value: u64) {
    for (i, byte) in dst.iter_mut().enumerate() {
        *byte = (value >> (8 * i)) as u8;
    }
}

/// Reject `value` if it needs more than `bits` bits.
pub fn check_width(field: &'static str, value: u64, bits: u32) -> FpgaResult<()> {
    if bits < 64 && value >> bits != 0 {
        return Err(FpgaError::OperandOverflow { field, value, bits });
    }
    Ok(())
}

/// Little-endian unsigned integer from `bytes[offset..offset + width]`,
/// missing bytes read as zero.
pub fn read_le(bytes: &[u8], offset: usize, width: usize) -> u64 {
    (0..width).fold(0u64, |acc, i| {
        let byte = bytes.get(offset + i).copied().unwrap_or(0);
        acc | (u64::from(byte) << (8 * i))
    })
}

// =============================================================================
// Readback & codec capability
// =============================================================================

/// Fields common to every register readback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readback {
    pub build: u8,
    pub pll_unlocked: bool,
    pub execution_count: u16,
    /// Byte shifted out of the serial interface (DAC boards only).
    pub serial_reply: Option<u8>,
}

/// Encoding capability shared by every board class and build.
pub trait RegisterCodec: Send + Sync {
    fn class(&self) -> BoardClass;
    fn build(&self) -> u8;
    fn register_len(&self) -> usize;
    fn readback_len(&self) -> usize;
    /// Number of SRAM write pages (`SRAM_WRITE_PAGES`).
    fn sram_pages(&self) -> usize;
    /// Payload bytes carried by one SRAM page.
    fn sram_page_capacity(&self) -> usize;
    fn encode_ping(&self) -> RegisterPacket;
    fn encode_pll_query(&self) -> RegisterPacket;
    fn encode_sram_page(&self, page: usize, data: &[u8]) -> FpgaResult<SramPage> {
        SramPage::build(page, self.sram_pages(), self.sram_page_capacity(), data)
    }
    /// Decode a readback. The caller guarantees the length.
    fn decode_readback(&self, bytes: &[u8]) -> Readback;
}

/// Codec configuration for one `(class, build)` pair.
#[derive(Debug, Clone, PartialEq)]
pub enum BoardModel {
    Dac(DacCodec),
    Adc(AdcCodec),
}

impl BoardModel {
    pub fn class(&self) -> BoardClass {
        match self {
            BoardModel::Dac(_) => BoardClass::Dac,
            BoardModel::Adc(_) => BoardClass::Adc,
        }
    }

    pub fn codec(&self) -> &dyn RegisterCodec {
        match self {
            BoardModel::Dac(codec) => codec,
            BoardModel::Adc(codec) => codec,
        }
    }
}

/// Select the packet layout for a firmware build.
pub fn board_model(class: BoardClass, build: u8) -> FpgaResult<BoardModel> {
    match class {
        BoardClass::Dac => DacLayout::for_build(build).map(|l| BoardModel::Dac(DacCodec::new(l))),
        BoardClass::Adc => AdcLayout::for_build(build).map(|l| BoardModel::Adc(AdcCodec::new(l))),
    }
}

/// Firmware build number from a raw readback, without knowing the build yet.
pub fn readback_build(class: BoardClass, bytes: &[u8]) -> Option<u8> {
    let offset = match class {
        BoardClass::Dac => dac::READBACK_BUILD_OFFSET,
        BoardClass::Adc => adc::READBACK_BUILD_OFFSET,
    };
    bytes.get(offset).copied()
}

/// Readback length for a board class. Fixed across the supported builds.
pub fn readback_len(class: BoardClass) -> usize {
    match class {
        BoardClass::Dac => dac::READBACK_LEN,
        BoardClass::Adc => adc::READBACK_LEN,
    }
}

/// Register-readback request understood by every build of a class, used to
/// find boards before their build is known.
pub fn detection_ping(class: BoardClass) -> RegisterPacket {
    match class {
        BoardClass::Dac => {
            let mut regs = Registers::new(dac::REGISTER_LEN);
            regs.set(1, 1);
            regs.finish()
        }
        BoardClass::Adc => {
            let mut regs = Registers::new(adc::REGISTER_LEN);
            regs.set(0, adc::AdcRunMode::RegisterReadback.opcode());
            regs.finish()
        }
    }
}
