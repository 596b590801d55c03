use super::BoardEmulator;
use bytes::Bytes;
use ghz_core::codec::adc::{PLL_INIT_SEQUENCE, READBACK_LEN, REGISTER_LEN, SERIAL_OFFSET};
use ghz_core::codec::{read_le, AdcLayout, AdcRunMode, SRAM_HEADER_LEN};
use ghz_core::BoardAddress;

/// Emulated ADC board.
///
/// Average runs return a ramp (`I = n`, `Q = -n`); demodulator runs return
/// packets whose I/Q values count up across the stream, with a fixed range
/// byte pair.
#[derive(Debug, Clone)]
pub struct AdcEmulator {
    address: BoardAddress,
    build: u8,
    /// `None` for builds without a known layout; those only answer pings.
    layout: Option<AdcLayout>,
    sram: Vec<Vec<u8>>,
    pll_unlocked: bool,
    serial_words: Vec<u32>,
    recalibrations: usize,
    execution_count: u16,
    demod_packets: usize,
    sram_writes: usize,
}

/// I and Q range bytes reported in every demodulator packet.
pub const EMULATED_DEMOD_RANGE: [u8; 2] = [0x3E, 0x2D];

impl AdcEmulator {
    pub fn new(number: u8, build: u8) -> Self {
        let layout = AdcLayout::for_build(build).ok();
        let sram = layout
            .as_ref()
            .map(|l| vec![vec![0; l.sram_page_len]; l.sram_pages])
            .unwrap_or_default();
        Self {
            address: BoardAddress::adc(number),
            build,
            sram,
            layout,
            pll_unlocked: true,
            serial_words: Vec::new(),
            recalibrations: 0,
            execution_count: 0,
            demod_packets: 0,
            sram_writes: 0,
        }
    }

    pub fn build(&self) -> u8 {
        self.build
    }

    pub fn pll_unlocked(&self) -> bool {
        self.pll_unlocked
    }

    pub fn set_pll_unlocked(&mut self, unlocked: bool) {
        self.pll_unlocked = unlocked;
    }

    pub fn serial_words(&self) -> &[u32] {
        &self.serial_words
    }

    pub fn recalibrations(&self) -> usize {
        self.recalibrations
    }

    pub fn execution_count(&self) -> u16 {
        self.execution_count
    }

    /// SRAM page contents (filter pages first, then lookup tables).
    pub fn sram_page(&self, page: usize) -> Option<&[u8]> {
        self.sram.get(page).map(Vec::as_slice)
    }

    /// SRAM page packets received so far.
    pub fn sram_writes(&self) -> usize {
        self.sram_writes
    }

    fn readback(&self) -> Bytes {
        let mut rb = vec![0u8; READBACK_LEN];
        rb[0] = self.build;
        rb[1] = u8::from(self.pll_unlocked);
        rb[2..4].copy_from_slice(&self.execution_count.to_le_bytes());
        Bytes::from(rb)
    }

    fn average_packets(layout: &AdcLayout) -> Vec<Bytes> {
        let samples_per_packet = layout.average_packet_len / 4;
        (0..layout.average_packets)
            .map(|p| {
                let mut pkt = Vec::with_capacity(layout.average_packet_len);
                for k in 0..samples_per_packet {
                    let n = (p * samples_per_packet + k) as i16;
                    pkt.extend_from_slice(&n.to_le_bytes());
                    pkt.extend_from_slice(&n.wrapping_neg().to_le_bytes());
                }
                Bytes::from(pkt)
            })
            .collect()
    }

    fn demod_packet(&mut self, layout: &AdcLayout) -> Bytes {
        let pairs = layout.demod_channels_per_packet;
        let mut pkt = vec![0u8; layout.demod_packet_len];
        for k in 0..pairs {
            let n = (self.demod_packets * pairs + k) as i16;
            pkt[4 * k..4 * k + 2].copy_from_slice(&n.to_le_bytes());
            pkt[4 * k + 2..4 * k + 4].copy_from_slice(&n.wrapping_neg().to_le_bytes());
        }
        pkt[46..48].copy_from_slice(&EMULATED_DEMOD_RANGE);
        self.demod_packets += 1;
        Bytes::from(pkt)
    }

    fn handle_register(&mut self, reg: &[u8]) -> Vec<Bytes> {
        let reps = read_le(reg, 7, 2) as usize;
        if reg[0] == AdcRunMode::RegisterReadback.opcode() {
            return vec![self.readback()];
        }
        let Some(layout) = self.layout.clone() else {
            return Vec::new();
        };
        match reg[0] {
            6 => {
                self.serial_words.push(read_le(reg, SERIAL_OFFSET, 3) as u32);
                if self.serial_words.ends_with(&PLL_INIT_SEQUENCE) {
                    self.pll_unlocked = false;
                }
                Vec::new()
            }
            op if op == AdcRunMode::Calibrate.opcode() => {
                self.recalibrations += 1;
                Vec::new()
            }
            2 | 3 => {
                self.execution_count = self.execution_count.wrapping_add(reps as u16);
                Self::average_packets(&layout)
            }
            4 => {
                self.execution_count = self.execution_count.wrapping_add(1);
                vec![self.demod_packet(&layout)]
            }
            5 => {
                self.execution_count = self.execution_count.wrapping_add(reps as u16);
                (0..reps).map(|_| self.demod_packet(&layout)).collect()
            }
            _ => Vec::new(),
        }
    }
}

impl BoardEmulator for AdcEmulator {
    fn address(&self) -> BoardAddress {
        self.address
    }

    fn handle(&mut self, payload: &[u8]) -> Vec<Bytes> {
        if payload.len() == REGISTER_LEN {
            return self.handle_register(payload);
        }
        let page_len = self.layout.as_ref().map_or(0, |l| l.sram_page_len);
        if page_len > 0 && payload.len() == SRAM_HEADER_LEN + page_len {
            let page = read_le(payload, 0, 2) as usize;
            if let Some(slot) = self.sram.get_mut(page) {
                slot.copy_from_slice(&payload[SRAM_HEADER_LEN..]);
                self.sram_writes += 1;
            }
            return Vec::new();
        }
        tracing::warn!(board = %self.address, len = payload.len(), "emulated ADC ignoring frame");
        Vec::new()
    }
}
