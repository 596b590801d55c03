use super::BoardEmulator;
use bytes::Bytes;
use ghz_core::codec::dac::{
    PLL_INIT_SEQUENCE, READBACK_LEN, REGISTER_LEN, SERIAL_DATA_OFFSET, SERIAL_OP_OFFSET,
    SRAM_WRITE_WORDS, TIMING_VALUES_PER_PACKET,
};
use ghz_core::codec::{bist_checksum, read_le, DacChannel, DacLayout, SerialTarget, SRAM_HEADER_LEN};
use ghz_core::BoardAddress;

const SRAM_PACKET_LEN: usize = SRAM_HEADER_LEN + SRAM_WRITE_WORDS * 4;
const DEFAULT_SRAM_LEN: usize = 10_240;

/// Serial register map of one DAC chip.
#[derive(Debug, Clone)]
struct DacChip {
    regs: [u8; 0x80],
    setup_edge: u8,
    hold_edge: u8,
    /// FIFO counter per PHOF, indexed by clock inversion.
    fifo_counters: [[u8; 4]; 2],
    /// lvds even, lvds odd, fifo even, fifo odd
    bist: [u32; 4],
    bist_fault: bool,
}

impl Default for DacChip {
    fn default() -> Self {
        Self {
            regs: [0; 0x80],
            setup_edge: 7,
            hold_edge: 7,
            fifo_counters: [[2, 3, 4, 5], [6, 7, 0, 1]],
            bist: [0; 4],
            bist_fault: false,
        }
    }
}

impl DacChip {
    fn lvds_check(&self) -> u8 {
        let msd = self.regs[4] >> 4;
        let mhd = self.regs[4] & 0xF;
        let ok = if msd > 0 {
            msd < self.setup_edge
        } else if mhd > 0 {
            mhd < self.hold_edge
        } else {
            true
        };
        u8::from(ok)
    }

    /// Shift one 16-bit word through the chip's serial port.
    fn serial(&mut self, word: u32, inverted: bool) -> u8 {
        let addr = ((word >> 8) & 0x7F) as usize;
        let value = (word & 0xFF) as u8;
        if word & 0x8000 == 0 {
            self.regs[addr] = value;
            return 0;
        }
        match addr {
            0x05 => (self.regs[5] & 0xF0) | self.lvds_check(),
            0x07 => self.fifo_counters[usize::from(inverted)][usize::from(self.regs[7] & 3)] << 4,
            0x12..=0x15 => {
                let word = self.bist[usize::from((self.regs[0x11] >> 6) & 3)];
                (word >> (8 * (0x15 - addr))) as u8
            }
            _ => self.regs[addr],
        }
    }

    fn run_bist(&mut self, samples: &[u16]) {
        let [even, odd] = bist_checksum(samples);
        let fault = u32::from(self.bist_fault);
        self.bist = [even, odd, even ^ fault, odd];
    }
}

/// Emulated DAC board on one of the paged-SRAM firmware builds.
#[derive(Debug, Clone)]
pub struct DacEmulator {
    address: BoardAddress,
    build: u8,
    sram: Vec<u32>,
    chips: [DacChip; 2],
    polarity: [bool; 2],
    pll_unlocked: bool,
    pll_words: Vec<u32>,
    execution_count: u16,
    serial_reply: u8,
    timers_per_rep: usize,
    register_writes: usize,
}

impl DacEmulator {
    pub fn new(number: u8, build: u8) -> Self {
        let sram_len = DacLayout::for_build(build).map_or(DEFAULT_SRAM_LEN, |l| l.sram_len);
        Self {
            address: BoardAddress::dac(number),
            build,
            sram: vec![0; sram_len],
            chips: [DacChip::default(), DacChip::default()],
            polarity: [false; 2],
            pll_unlocked: true,
            pll_words: Vec::new(),
            execution_count: 0,
            serial_reply: 0,
            timers_per_rep: 1,
            register_writes: 0,
        }
    }

    pub fn build(&self) -> u8 {
        self.build
    }

    pub fn execution_count(&self) -> u16 {
        self.execution_count
    }

    pub fn pll_unlocked(&self) -> bool {
        self.pll_unlocked
    }

    pub fn set_pll_unlocked(&mut self, unlocked: bool) {
        self.pll_unlocked = unlocked;
    }

    /// Words written to the PLL chip, oldest first.
    pub fn pll_words(&self) -> &[u32] {
        &self.pll_words
    }

    pub fn sram(&self) -> &[u32] {
        &self.sram
    }

    pub fn clock_inverted(&self, channel: DacChannel) -> bool {
        self.polarity[chip_index(channel)]
    }

    pub fn chip_register(&self, channel: DacChannel, addr: u8) -> u8 {
        self.chips[chip_index(channel)].regs[usize::from(addr & 0x7F)]
    }

    /// Register packets received so far.
    pub fn register_writes(&self) -> usize {
        self.register_writes
    }

    /// Positions where the LVDS check bit drops while sweeping MSD and MHD.
    pub fn set_lvds_edges(&mut self, channel: DacChannel, setup: u8, hold: u8) {
        let chip = &mut self.chips[chip_index(channel)];
        chip.setup_edge = setup;
        chip.hold_edge = hold;
    }

    pub fn set_fifo_counters(&mut self, channel: DacChannel, inverted: bool, counters: [u8; 4]) {
        self.chips[chip_index(channel)].fifo_counters[usize::from(inverted)] = counters;
    }

    /// Corrupt the FIFO-side BIST checksum of a chip.
    pub fn set_bist_fault(&mut self, channel: DacChannel, fault: bool) {
        self.chips[chip_index(channel)].bist_fault = fault;
    }

    /// Timer values a memory sequence reports per repetition.
    pub fn set_timers_per_rep(&mut self, timers: usize) {
        self.timers_per_rep = timers;
    }

    fn readback(&self, register: &[u8]) -> Bytes {
        let mut rb = vec![0u8; READBACK_LEN];
        rb[..51].copy_from_slice(&register[..51]);
        rb[51] = self.build;
        rb[52..54].copy_from_slice(&self.execution_count.to_le_bytes());
        rb[56] = self.serial_reply;
        rb[58] = if self.pll_unlocked { 0x80 } else { 0 };
        Bytes::from(rb)
    }

    fn timing_packets(&self, reps: usize) -> Vec<Bytes> {
        let values = reps * self.timers_per_rep;
        // Only whole packets are sent; a partial tail is dropped.
        let packets = values / TIMING_VALUES_PER_PACKET;
        (0..packets)
            .map(|p| {
                let mut pkt = vec![0u8; READBACK_LEN];
                for n in 0..TIMING_VALUES_PER_PACKET {
                    let value = (1000 + p * TIMING_VALUES_PER_PACKET + n) as u16;
                    pkt[3 + 2 * n..5 + 2 * n].copy_from_slice(&value.to_le_bytes());
                }
                Bytes::from(pkt)
            })
            .collect()
    }

    fn serial(&mut self, op: u8, data: u32) {
        match SerialTarget::from_opcode(op) {
            Some(SerialTarget::Pll) => {
                self.pll_words.push(data);
                if self.pll_words.ends_with(&PLL_INIT_SEQUENCE) {
                    self.pll_unlocked = false;
                }
                self.serial_reply = 0;
            }
            Some(SerialTarget::DacA) => self.serial_reply = self.chips[0].serial(data, self.polarity[0]),
            Some(SerialTarget::DacB) => self.serial_reply = self.chips[1].serial(data, self.polarity[1]),
            None => {}
        }
    }

    fn run_sram(&mut self, start: usize, end: usize) {
        self.execution_count = self.execution_count.wrapping_add(1);
        if end == 0xFF_FFFF || start >= self.sram.len() {
            return;
        }
        let end = end.min(self.sram.len() - 1);
        for (chip, channel) in self.chips.iter_mut().zip(DacChannel::BOTH) {
            let samples: Vec<u16> = self.sram[start..=end]
                .iter()
                .map(|w| ((w >> channel.sample_shift()) & 0x3FFF) as u16)
                .collect();
            chip.run_bist(&samples);
        }
    }

    fn handle_register(&mut self, reg: &[u8]) -> Vec<Bytes> {
        self.register_writes += 1;
        let control = reg[46];
        if control & 0x80 != 0 {
            self.pll_unlocked = false;
        }
        for (index, channel) in DacChannel::BOTH.iter().enumerate() {
            let (select, bit) = channel.polarity_bits();
            if control & (1 << select) != 0 {
                self.polarity[index] = control & (1 << bit) != 0;
            }
        }
        let op = reg[SERIAL_OP_OFFSET];
        if op != 0 {
            self.serial(op, read_le(reg, SERIAL_DATA_OFFSET, 3) as u32);
        }

        match (reg[0], reg[1]) {
            (3 | 4, _) => {
                self.run_sram(read_le(reg, 13, 3) as usize, read_le(reg, 16, 3) as usize);
                Vec::new()
            }
            (_, 3) => {
                let reps = read_le(reg, 13, 2) as usize;
                self.execution_count = self.execution_count.wrapping_add(reps as u16);
                self.timing_packets(reps)
            }
            (_, 1) => vec![self.readback(reg)],
            _ => Vec::new(),
        }
    }

    fn handle_sram(&mut self, packet: &[u8]) {
        let page = read_le(packet, 0, 2) as usize;
        let base = page * SRAM_WRITE_WORDS;
        for (n, word) in packet[SRAM_HEADER_LEN..].chunks_exact(4).enumerate() {
            if let Some(slot) = self.sram.get_mut(base + n) {
                *slot = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            }
        }
    }
}

fn chip_index(channel: DacChannel) -> usize {
    match channel {
        DacChannel::A => 0,
        DacChannel::B => 1,
    }
}

impl BoardEmulator for DacEmulator {
    fn address(&self) -> BoardAddress {
        self.address
    }

    fn handle(&mut self, payload: &[u8]) -> Vec<Bytes> {
        match payload.len() {
            REGISTER_LEN => self.handle_register(payload),
            SRAM_PACKET_LEN => {
                self.handle_sram(payload);
                Vec::new()
            }
            len => {
                tracing::warn!(board = %self.address, len, "emulated DAC ignoring frame");
                Vec::new()
            }
        }
    }
}
