//! Board identity and MAC-style addressing.
//!
//! Every GHz FPGA board answers on a fixed MAC address derived from its board
//! class and the board number set on its DIP switches. The address is always
//! computed from `(class, number)` and never stored on its own.

use crate::error::{FpgaError, FpgaResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Class of FPGA board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BoardClass {
    /// Dual 14-bit 1 GS/s DAC board.
    Dac,
    /// Dual 8-bit ADC board with demodulators.
    Adc,
}

impl BoardClass {
    /// Both classes, in detection order.
    pub const ALL: [BoardClass; 2] = [BoardClass::Dac, BoardClass::Adc];

    /// First five octets shared by every board of this class.
    pub const fn mac_prefix(self) -> [u8; 5] {
        match self {
            BoardClass::Dac => [0x00, 0x01, 0xCA, 0xAA, 0x00],
            BoardClass::Adc => [0x00, 0x01, 0xCA, 0xAA, 0x01],
        }
    }

    /// Class whose prefix matches `mac`, if any.
    pub fn from_mac(mac: &MacAddress) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|class| mac.0[..5] == class.mac_prefix())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BoardClass::Dac => "DAC",
            BoardClass::Adc => "ADC",
        }
    }
}

impl fmt::Display for BoardClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BoardClass {
    type Err = FpgaError;

    fn from_str(s: &str) -> FpgaResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DAC" => Ok(BoardClass::Dac),
            "ADC" => Ok(BoardClass::Adc),
            _ => Err(FpgaError::InvalidAddress(format!("unknown board class '{}'", s))),
        }
    }
}

// =============================================================================
// MacAddress
// =============================================================================

/// Six-octet hardware address, rendered as `00:01:CA:AA:00:0A`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}", a, b, c, d, e, g)
    }
}

impl FromStr for MacAddress {
    type Err = FpgaError;

    fn from_str(s: &str) -> FpgaResult<Self> {
        let mut octets = [0u8; 6];
        let mut parts = s.trim().split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| FpgaError::InvalidAddress(format!("'{}' has fewer than 6 octets", s)))?;
            if part.is_empty() || part.len() > 2 {
                return Err(FpgaError::InvalidAddress(format!("bad octet '{}' in '{}'", part, s)));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| FpgaError::InvalidAddress(format!("bad octet '{}' in '{}'", part, s)))?;
        }
        if parts.next().is_some() {
            return Err(FpgaError::InvalidAddress(format!("'{}' has more than 6 octets", s)));
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = FpgaError;

    fn try_from(value: String) -> FpgaResult<Self> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

// =============================================================================
// BoardAddress
// =============================================================================

/// Physical identity of one board: its class and its board number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BoardAddress {
    pub class: BoardClass,
    pub number: u8,
}

impl BoardAddress {
    pub const fn new(class: BoardClass, number: u8) -> Self {
        Self { class, number }
    }

    pub const fn dac(number: u8) -> Self {
        Self::new(BoardClass::Dac, number)
    }

    pub const fn adc(number: u8) -> Self {
        Self::new(BoardClass::Adc, number)
    }

    /// Checked constructor for board numbers coming from untyped sources.
    pub fn try_new(class: BoardClass, number: u32) -> FpgaResult<Self> {
        let number = u8::try_from(number).map_err(|_| {
            FpgaError::InvalidAddress(format!("board number {} outside 0..=255", number))
        })?;
        Ok(Self::new(class, number))
    }

    /// Transport address: class prefix followed by the board number octet.
    pub const fn mac(&self) -> MacAddress {
        let p = self.class.mac_prefix();
        MacAddress([p[0], p[1], p[2], p[3], p[4], self.number])
    }

    /// Inverse of [`BoardAddress::mac`].
    pub fn from_mac(mac: &MacAddress) -> Option<Self> {
        BoardClass::from_mac(mac).map(|class| Self::new(class, mac.0[5]))
    }

    /// Device name used by a board group, e.g. `"Vince DAC 3"`.
    pub fn device_name(&self, group: &str) -> String {
        format!("{} {} {}", group, self.class, self.number)
    }
}

impl fmt::Display for BoardAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.class, self.number)
    }
}

/// Accepts `"DAC 3"`, `"dac:3"` and `"ADC3"`.
impl FromStr for BoardAddress {
    type Err = FpgaError;

    fn from_str(s: &str) -> FpgaResult<Self> {
        let s = s.trim();
        if s.len() < 4 || !s.is_char_boundary(3) {
            return Err(FpgaError::InvalidAddress(format!("cannot parse board '{}'", s)));
        }
        let (class, rest) = s.split_at(3);
        let class: BoardClass = class.parse()?;
        let rest = rest.trim_start_matches([' ', ':', '-']);
        let number: u32 = rest
            .parse()
            .map_err(|_| FpgaError::InvalidAddress(format!("bad board number in '{}'", s)))?;
        Self::try_new(class, number)
    }
}
