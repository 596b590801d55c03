//! ADC register, SRAM and acquisition-data layouts.

use super::{check_width, RegisterCodec, RegisterPacket, Readback, Registers, SramPage};
use crate::address::BoardClass;
use crate::error::{FpgaError, FpgaResult};
use std::collections::BTreeMap;
use std::f64::consts::FRAC_PI_2;

pub const REGISTER_LEN: usize = 59;
pub const READBACK_LEN: usize = 46;
pub(crate) const READBACK_BUILD_OFFSET: usize = 0;

/// Offset of the 24-bit serial operand.
pub const SERIAL_OFFSET: usize = 3;

/// Bytes of I/Q payload at the start of each demodulator packet.
pub const DEMOD_PAYLOAD_LEN: usize = 44;
/// Offset of the I and Q range bytes in a demodulator packet.
pub const DEMOD_RANGE_OFFSET: usize = 46;

/// PLL programming words for the ADC clock chip.
pub const PLL_INIT_SEQUENCE: [u32; 4] = [0x1F_C093, 0x1F_C092, 0x10_0004, 0x00_0C11];

/// Run-mode opcodes (register byte 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdcRunMode {
    RegisterReadback = 1,
    AverageAuto = 2,
    AverageDaisy = 3,
    DemodAuto = 4,
    DemodDaisy = 5,
    Calibrate = 7,
}

impl AdcRunMode {
    pub const fn opcode(self) -> u8 {
        self as u8
    }
}

/// Build-dependent constants of the first ADC firmware branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdcLayout {
    pub build: u8,
    pub demod_channels: usize,
    /// Interleaved I/Q pairs per demodulator packet.
    pub demod_channels_per_packet: usize,
    pub demod_packet_len: usize,
    pub average_packets: usize,
    pub average_packet_len: usize,
    pub trig_amp: u8,
    pub lookup_table_len: usize,
    pub filter_len: usize,
    pub filter_pages: usize,
    pub sram_pages: usize,
    pub sram_page_len: usize,
    /// Build 1 firmware never reports the PLL latch bit.
    pub reports_pll_lock: bool,
}

impl AdcLayout {
    pub fn for_build(build: u8) -> FpgaResult<Self> {
        let base = Self {
            build,
            demod_channels: 4,
            demod_channels_per_packet: 11,
            demod_packet_len: 48,
            average_packets: 32,
            average_packet_len: 1024,
            trig_amp: 255,
            lookup_table_len: 256,
            filter_len: 4096,
            filter_pages: 4,
            sram_pages: 9,
            sram_page_len: 1024,
            reports_pll_lock: true,
        };
        match build {
            1 => Ok(Self {
                reports_pll_lock: false,
                ..base
            }),
            2 | 3 => Ok(base),
            6 => Ok(Self {
                demod_channels: 6,
                ..base
            }),
            _ => Err(FpgaError::UnsupportedBuild {
                class: BoardClass::Adc,
                build,
            }),
        }
    }
}

// =============================================================================
// Acquisition configuration
// =============================================================================

/// Filter (window) function applied before demodulation, one byte per sample.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FilterFunction {
    pub samples: Vec<u8>,
    pub stretch_at: u16,
    pub stretch_len: u16,
}

impl FilterFunction {
    pub fn new(samples: Vec<u8>) -> Self {
        Self {
            samples,
            ..Default::default()
        }
    }

    pub fn with_stretch(mut self, at: u16, len: u16) -> Self {
        self.stretch_at = at;
        self.stretch_len = len;
        self
    }
}

/// One demodulator channel: lookup-table stepping and trig table amplitudes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DemodChannel {
    /// Lookup-table phase step per sample.
    pub d_phi: i16,
    /// Lookup-table start phase.
    pub phi0: i16,
    pub cosine_amp: u8,
    pub sine_amp: u8,
}

impl DemodChannel {
    pub fn cosine_table(&self, len: usize) -> Vec<u8> {
        trig_table(self.cosine_amp, len)
    }

    pub fn sine_table(&self, len: usize) -> Vec<u8> {
        trig_table(self.sine_amp, len)
    }
}

/// Demodulator configuration keyed by channel index.
pub type DemodConfig = BTreeMap<usize, DemodChannel>;

/// Quarter-wave lookup table sampled at bin centres.
pub fn trig_table(amp: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|n| {
            let phi = FRAC_PI_2 * (n as f64 + 0.5) / len as f64;
            (f64::from(amp) * phi.sin() + 0.5).floor() as u8
        })
        .collect()
}

// =============================================================================
// Acquisition results
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IqBlock {
    pub i: Vec<i16>,
    pub q: Vec<i16>,
}

impl IqBlock {
    pub fn len(&self) -> usize {
        self.i.len()
    }

    pub fn is_empty(&self) -> bool {
        self.i.is_empty()
    }
}

/// Global I/Q range reported by the demodulators, 4-bit signed codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemodRange {
    pub i_max: i8,
    pub i_min: i8,
    pub q_max: i8,
    pub q_min: i8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DemodBlock {
    pub channels: Vec<IqBlock>,
    /// `None` when no packet carried range bytes.
    pub range: Option<DemodRange>,
}

/// Concatenate packet payloads and split little-endian `i16` pairs into I and Q.
pub fn decode_average_block<P: AsRef<[u8]>>(packets: &[P]) -> IqBlock {
    let data: Vec<u8> = packets.iter().flat_map(|p| p.as_ref().iter().copied()).collect();
    split_iq(&data)
}

/// Decode demodulator packets into per-channel I/Q and the reduced range.
///
/// Only the first 44 bytes of each packet carry I/Q data; bytes 46 and 47 hold
/// the I and Q range nibbles (max in the high nibble, min in the low one).
/// Samples are dealt round-robin across `num_channels`.
pub fn decode_demod_block<P: AsRef<[u8]>>(packets: &[P], num_channels: usize) -> DemodBlock {
    let data: Vec<u8> = packets
        .iter()
        .flat_map(|p| {
            let p = p.as_ref();
            p[..p.len().min(DEMOD_PAYLOAD_LEN)].iter().copied()
        })
        .collect();
    let iq = split_iq(&data);

    let channels = (0..num_channels)
        .map(|ch| IqBlock {
            i: iq.i.iter().skip(ch).step_by(num_channels).copied().collect(),
            q: iq.q.iter().skip(ch).step_by(num_channels).copied().collect(),
        })
        .collect();

    let range = packets
        .iter()
        .filter_map(|p| packet_range(p.as_ref()))
        .reduce(|a, b| DemodRange {
            i_max: a.i_max.max(b.i_max),
            i_min: a.i_min.min(b.i_min),
            q_max: a.q_max.max(b.q_max),
            q_min: a.q_min.min(b.q_min),
        });

    DemodBlock { channels, range }
}

fn split_iq(data: &[u8]) -> IqBlock {
    let (i, q) = data
        .chunks_exact(4)
        .map(|c| (i16::from_le_bytes([c[0], c[1]]), i16::from_le_bytes([c[2], c[3]])))
        .unzip();
    IqBlock { i, q }
}

fn nibble(value: u8) -> i8 {
    let v = (value & 0xF) as i8;
    if v < 8 {
        v
    } else {
        v - 16
    }
}

fn packet_range(packet: &[u8]) -> Option<DemodRange> {
    let i_rng = *packet.get(DEMOD_RANGE_OFFSET)?;
    let q_rng = *packet.get(DEMOD_RANGE_OFFSET + 1)?;
    Some(DemodRange {
        i_max: nibble(i_rng >> 4),
        i_min: nibble(i_rng),
        q_max: nibble(q_rng >> 4),
        q_min: nibble(q_rng),
    })
}

// =============================================================================
// AdcCodec
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdcCodec {
    layout: AdcLayout,
}

impl AdcCodec {
    pub fn new(layout: AdcLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &AdcLayout {
        &self.layout
    }

    fn registers(&self) -> Registers {
        Registers::new(REGISTER_LEN)
    }

    /// Serial write to the PLL chip. Values wider than 24 bits are rejected.
    pub fn encode_serial(&self, bits: u32) -> FpgaResult<RegisterPacket> {
        check_width("serial word", u64::from(bits), 24)?;
        let mut regs = self.registers();
        regs.set(0, 6).set_le(SERIAL_OFFSET, 3, u64::from(bits));
        Ok(regs.finish())
    }

    pub fn encode_recalibrate(&self) -> RegisterPacket {
        let mut regs = self.registers();
        regs.set(0, 7);
        regs.finish()
    }

    /// Run register for an acquisition.
    pub fn encode_run(
        &self,
        mode: AdcRunMode,
        reps: u16,
        filter: &FilterFunction,
        demods: &DemodConfig,
        start_delay: u16,
    ) -> FpgaResult<RegisterPacket> {
        let len = filter.samples.len();
        if len < 2 {
            return Err(FpgaError::FilterTooShort { len });
        }
        let end_address = len - 1;
        check_width("filter end address", end_address as u64, 16)?;
        self.check_channels(demods)?;

        let mut regs = self.registers();
        regs.set(0, mode.opcode())
            .set_le(1, 2, u64::from(start_delay))
            .set_le(7, 2, u64::from(reps))
            .set_le(9, 2, end_address as u64)
            .set_le(11, 2, u64::from(filter.stretch_at))
            .set_le(13, 2, u64::from(filter.stretch_len));
        for (&ch, demod) in demods {
            let addr = 15 + 4 * ch;
            regs.set_le(addr, 2, u64::from(demod.d_phi as u16))
                .set_le(addr + 2, 2, u64::from(demod.phi0 as u16));
        }
        Ok(regs.finish())
    }

    fn check_channels(&self, demods: &DemodConfig) -> FpgaResult<()> {
        match demods.keys().find(|&&ch| ch >= self.layout.demod_channels) {
            Some(&channel) => Err(FpgaError::ChannelOutOfRange {
                channel,
                channels: self.layout.demod_channels,
            }),
            None => Ok(()),
        }
    }

    /// Filter function split over the filter pages, zero-padded.
    pub fn filter_pages(&self, filter: &FilterFunction) -> FpgaResult<Vec<SramPage>> {
        let capacity = self.layout.filter_pages * self.layout.sram_page_len;
        if filter.samples.len() > capacity {
            return Err(FpgaError::PayloadTooLong {
                len: filter.samples.len(),
                capacity,
            });
        }
        (0..self.layout.filter_pages)
            .map(|page| {
                let start = (page * self.layout.sram_page_len).min(filter.samples.len());
                let end = (start + self.layout.sram_page_len).min(filter.samples.len());
                self.encode_sram_page(page, &filter.samples[start..end])
            })
            .collect()
    }

    /// Cosine/sine lookup tables, two channels per page after the filter.
    pub fn trig_lookup_pages(&self, demods: &DemodConfig) -> FpgaResult<Vec<SramPage>> {
        self.check_channels(demods)?;
        let table_len = self.layout.lookup_table_len;
        let zeros = vec![0u8; table_len];
        (0..self.layout.demod_channels)
            .step_by(2)
            .enumerate()
            .map(|(n, channel)| {
                let mut data = Vec::with_capacity(4 * table_len);
                for ch in [channel, channel + 1] {
                    match demods.get(&ch) {
                        Some(demod) => {
                            data.extend(demod.cosine_table(table_len));
                            data.extend(demod.sine_table(table_len));
                        }
                        None => {
                            data.extend_from_slice(&zeros);
                            data.extend_from_slice(&zeros);
                        }
                    }
                }
                self.encode_sram_page(self.layout.filter_pages + n, &data)
            })
            .collect()
    }
}

impl RegisterCodec for AdcCodec {
    fn class(&self) -> BoardClass {
        BoardClass::Adc
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
        self.layout.sram_page_len
    }

    fn encode_ping(&self) -> RegisterPacket {
        let mut regs = self.registers();
        regs.set(0, AdcRunMode::RegisterReadback.opcode());
        regs.finish()
    }

    fn encode_pll_query(&self) -> RegisterPacket {
        self.encode_ping()
    }

    fn decode_readback(&self, bytes: &[u8]) -> Readback {
        let byte = |i: usize| bytes.get(i).copied().unwrap_or(0);
        Readback {
            build: byte(READBACK_BUILD_OFFSET),
            pll_unlocked: byte(1) & 1 == 1,
            execution_count: u16::from_le_bytes([byte(2), byte(3)]),
            serial_reply: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::read_le;

    fn codec(build: u8) -> AdcCodec {
        AdcCodec::new(AdcLayout::for_build(build).unwrap())
    }

    #[test]
    fn test_ping_packet() {
        let ping = codec(2).encode_ping();
        assert_eq!(ping.len(), REGISTER_LEN);
        assert_eq!(ping.byte(0), 1);
        assert!(ping.as_bytes()[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_serial_operand_round_trip() {
        let codec = codec(2);
        for bits in [0u32, 1, 0x1F_C093, 0xAB_CDEF, 0xFF_FFFF] {
            let packet = codec.encode_serial(bits).unwrap();
            assert_eq!(packet.byte(0), 6);
            assert_eq!(read_le(packet.as_bytes(), SERIAL_OFFSET, 3), u64::from(bits));
        }
    }

    #[test]
    fn test_serial_rejects_wide_values() {
        let err = codec(2).encode_serial(0x100_0000).unwrap_err();
        assert!(matches!(err, FpgaError::OperandOverflow { bits: 24, .. }));
    }

    #[test]
    fn test_average_run_packet() {
        let filter = FilterFunction::new(vec![0; 100]);
        let packet = codec(2)
            .encode_run(AdcRunMode::AverageAuto, 1, &filter, &DemodConfig::new(), 0)
            .unwrap();
        let bytes = packet.as_bytes();
        assert_eq!(bytes[0], 2);
        assert_eq!(read_le(bytes, 7, 2), 1);
        assert_eq!(read_le(bytes, 9, 2), 99);
        assert_eq!(read_le(bytes, 11, 2), 0);
        assert_eq!(read_le(bytes, 13, 2), 0);
    }

    #[test]
    fn test_run_filter_length_limits() {
        let codec = codec(1);
        for len in [0, 1] {
            let filter = FilterFunction::new(vec![0; len]);
            let err = codec
                .encode_run(AdcRunMode::AverageAuto, 1, &filter, &DemodConfig::new(), 0)
                .unwrap_err();
            assert!(matches!(err, FpgaError::FilterTooShort { .. }));
        }
        let filter = FilterFunction::new(vec![0; 2]);
        let packet = codec
            .encode_run(AdcRunMode::AverageAuto, 1, &filter, &DemodConfig::new(), 0)
            .unwrap();
        assert_eq!(read_le(packet.as_bytes(), 9, 2), 1);
    }

    #[test]
    fn test_run_demod_fields() {
        let mut demods = DemodConfig::new();
        demods.insert(
            0,
            DemodChannel {
                d_phi: 1000,
                phi0: -2,
                ..Default::default()
            },
        );
        demods.insert(
            3,
            DemodChannel {
                d_phi: -1,
                phi0: 7,
                ..Default::default()
            },
        );
        let filter = FilterFunction::new(vec![255; 10]).with_stretch(4, 500);
        let packet = codec(2)
            .encode_run(AdcRunMode::DemodDaisy, 300, &filter, &demods, 0x1234)
            .unwrap();
        let b = packet.as_bytes();
        assert_eq!(b[0], 5);
        assert_eq!(&b[1..3], &[0x34, 0x12]);
        assert_eq!(read_le(b, 7, 2), 300);
        assert_eq!(read_le(b, 11, 2), 4);
        assert_eq!(read_le(b, 13, 2), 500);
        assert_eq!(read_le(b, 15, 2), 1000);
        assert_eq!(&b[17..19], &[0xFE, 0xFF]);
        assert_eq!(read_le(b, 19, 4), 0);
        assert_eq!(&b[27..29], &[0xFF, 0xFF]);
        assert_eq!(read_le(b, 29, 2), 7);
    }

    #[test]
    fn test_run_rejects_missing_channel() {
        let mut demods = DemodConfig::new();
        demods.insert(4, DemodChannel::default());
        let filter = FilterFunction::new(vec![0; 4]);
        assert!(matches!(
            codec(2).encode_run(AdcRunMode::DemodAuto, 1, &filter, &demods, 0),
            Err(FpgaError::ChannelOutOfRange { channel: 4, channels: 4 })
        ));
        assert!(codec(6)
            .encode_run(AdcRunMode::DemodAuto, 1, &filter, &demods, 0)
            .is_ok());
    }

    #[test]
    fn test_trig_table_shape() {
        let table = trig_table(255, 256);
        assert_eq!(table.len(), 256);
        assert_eq!(table[0], 1);
        assert_eq!(table[255], 255);
        assert!(table.windows(2).all(|w| w[0] <= w[1]));
        assert!(trig_table(0, 256).iter().all(|&v| v == 0));
    }

    #[test]
    fn test_filter_and_lookup_pages() {
        let codec = codec(2);
        let filter = FilterFunction::new((0..=255u8).cycle().take(1500).collect());
        let pages = codec.filter_pages(&filter).unwrap();
        assert_eq!(pages.iter().map(SramPage::index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(pages[1].payload()[0], (1024 % 256) as u8);
        assert!(pages[1].payload()[476..].iter().all(|&b| b == 0));
        assert!(pages[2].payload().iter().all(|&b| b == 0));

        let mut demods = DemodConfig::new();
        demods.insert(
            1,
            DemodChannel {
                cosine_amp: 100,
                sine_amp: 50,
                ..Default::default()
            },
        );
        let lookups = codec.trig_lookup_pages(&demods).unwrap();
        assert_eq!(lookups.len(), 2);
        assert_eq!(lookups[0].index(), 4);
        assert_eq!(lookups[1].index(), 5);
        let payload = lookups[0].payload();
        assert!(payload[..512].iter().all(|&b| b == 0));
        assert_eq!(&payload[512..768], trig_table(100, 256).as_slice());
        assert_eq!(&payload[768..1024], trig_table(50, 256).as_slice());
        assert!(lookups[1].payload().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_six_channel_build_uses_three_lookup_pages() {
        let lookups = codec(6).trig_lookup_pages(&DemodConfig::new()).unwrap();
        assert_eq!(
            lookups.iter().map(SramPage::index).collect::<Vec<_>>(),
            vec![4, 5, 6]
        );
    }

    #[test]
    fn test_readback() {
        let mut raw = [0u8; READBACK_LEN];
        raw[0] = 2;
        raw[1] = 0x01;
        raw[2] = 0x10;
        raw[3] = 0x02;
        let rb = codec(2).decode_readback(&raw);
        assert_eq!(
            rb,
            Readback {
                build: 2,
                pll_unlocked: true,
                execution_count: 0x0210,
                serial_reply: None
            }
        );
    }

    #[test]
    fn test_average_block_inverse() {
        for samples in [0usize, 1, 1024] {
            let i: Vec<i16> = (0..samples).map(|n| n as i16 - 512).collect();
            let q: Vec<i16> = (0..samples).map(|n| (n as i16).wrapping_mul(-3)).collect();
            let mut raw = Vec::new();
            for (a, b) in i.iter().zip(&q) {
                raw.extend_from_slice(&a.to_le_bytes());
                raw.extend_from_slice(&b.to_le_bytes());
            }
            let packets: Vec<&[u8]> = raw.chunks(1024).collect();
            let block = decode_average_block(&packets);
            assert_eq!(block.i, i);
            assert_eq!(block.q, q);
        }
    }

    #[test]
    fn test_demod_block_decoding() {
        let channels = 11;
        let mut packets = Vec::new();
        for p in 0..11u8 {
            let mut pkt = vec![0u8; 48];
            for k in 0..11usize {
                let i = (i16::from(p) * 100 + k as i16).to_le_bytes();
                let q = (-(i16::from(p) * 100 + k as i16)).to_le_bytes();
                pkt[4 * k..4 * k + 2].copy_from_slice(&i);
                pkt[4 * k + 2..4 * k + 4].copy_from_slice(&q);
            }
            // I: max 3, min -2 (0xE); Q: max p%8-1, min -8 on the last packet
            pkt[46] = 0x3E;
            let q_max = (p % 8) as i8 - 1;
            let q_min: u8 = if p == 10 { 0x8 } else { 0xF };
            pkt[47] = (((q_max as u8) & 0xF) << 4) | q_min;
            packets.push(pkt);
        }

        let block = decode_demod_block(&packets, channels);
        assert_eq!(block.channels.len(), 11);
        for (k, ch) in block.channels.iter().enumerate() {
            assert_eq!(ch.len(), 11);
            let expected: Vec<i16> = (0..11).map(|p| p * 100 + k as i16).collect();
            assert_eq!(ch.i, expected);
            assert_eq!(ch.q, expected.iter().map(|v| -v).collect::<Vec<_>>());
        }
        assert_eq!(
            block.range,
            Some(DemodRange {
                i_max: 3,
                i_min: -2,
                q_max: 6,
                q_min: -8
            })
        );
    }

    #[test]
    fn test_demod_block_without_packets() {
        let block = decode_demod_block::<Vec<u8>>(&[], 4);
        assert_eq!(block.channels.len(), 4);
        assert!(block.channels.iter().all(IqBlock::is_empty));
        assert_eq!(block.range, None);
    }
}
