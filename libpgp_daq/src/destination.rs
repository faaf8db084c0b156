use serde::{Deserialize, Serialize};
use std::fmt::Display;

use super::constants::{LANE_MASK, VC_MASK};

/// The sub-streams multiplexed onto one lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum VirtualChannel {
    Data,
    #[default]
    Registers,
    Oscilloscope,
    Monitor,
}

impl VirtualChannel {
    /// Decode the two bit vc field. Only the low two bits are considered
    pub fn from_bits(bits: u8) -> Self {
        match bits & VC_MASK {
            0 => Self::Data,
            1 => Self::Registers,
            2 => Self::Oscilloscope,
            _ => Self::Monitor,
        }
    }

    pub fn bits(&self) -> u8 {
        match self {
            Self::Data => 0,
            Self::Registers => 1,
            Self::Oscilloscope => 2,
            Self::Monitor => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Data => "Data",
            Self::Registers => "Registers",
            Self::Oscilloscope => "Oscilloscope",
            Self::Monitor => "Monitor",
        }
    }
}

/// Destination identifies one hardware endpoint (lane, virtual channel) on a physical link.
///
/// Destinations are small Copy values built per request; nothing about them is shared or global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    lane: u8,
    vc: VirtualChannel,
}

impl Destination {
    pub fn new(lane: u8, vc: VirtualChannel) -> Self {
        Self {
            lane: lane & LANE_MASK,
            vc,
        }
    }

    /// Decode the packed destination code `(lane << 2) | vc`
    pub fn from_code(code: u32) -> Self {
        Self::new((code >> 2) as u8, VirtualChannel::from_bits(code as u8))
    }

    pub fn code(&self) -> u32 {
        ((self.lane as u32) << 2) | self.vc.bits() as u32
    }

    pub fn lane(&self) -> u8 {
        self.lane
    }

    pub fn vc(&self) -> VirtualChannel {
        self.vc
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lane{}:{}", self.lane, self.vc.name())
    }
}
