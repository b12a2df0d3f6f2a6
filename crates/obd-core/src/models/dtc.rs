//! Diagnostic trouble code models

use serde::{Deserialize, Serialize};

/// DTC category, encoded in the top two bits of the first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtcCategory {
    /// P-codes: engine, transmission
    Powertrain,
    /// C-codes: braking, steering, suspension
    Chassis,
    /// B-codes: airbags, climate, lighting
    Body,
    /// U-codes: CAN bus, module communication
    Network,
}

impl DtcCategory {
    /// Extract the category from the high byte of a 2-byte DTC group
    pub fn from_high_byte(high_byte: u8) -> Self {
        match (high_byte >> 6) & 0x03 {
            0 => Self::Powertrain,
            1 => Self::Chassis,
            2 => Self::Body,
            _ => Self::Network,
        }
    }

    /// Letter prefix for the display code
    pub fn prefix(&self) -> char {
        match self {
            Self::Powertrain => 'P',
            Self::Chassis => 'C',
            Self::Body => 'B',
            Self::Network => 'U',
        }
    }
}

/// A single diagnostic trouble code as read from mode 03
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dtc {
    /// Display code, e.g. "P0133"
    pub code: String,
    /// Category derived from the high bits
    pub category: DtcCategory,
    /// Raw 2-byte group as received
    pub raw: [u8; 2],
}

impl Dtc {
    /// Build a DTC from a 2-byte group. Returns `None` for the all-zero
    /// padding groups that fill out a mode 03 response.
    pub fn from_bytes(high: u8, low: u8) -> Option<Self> {
        if high == 0 && low == 0 {
            return None;
        }
        let category = DtcCategory::from_high_byte(high);
        let number = ((high as u16 & 0x3F) << 8) | low as u16;
        Some(Self {
            code: format!("{}{:04X}", category.prefix(), number),
            category,
            raw: [high, low],
        })
    }
}
