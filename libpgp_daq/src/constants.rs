use std::time::Duration;

// Register frame field widths
pub const TID_MASK: u32 = (1 << 23) - 1;
pub const ADDRESS_MASK: u32 = (1 << 30) - 1;
pub const LANE_MASK: u8 = 0x7;
pub const VC_MASK: u8 = 0x3;
pub const NUMBER_OF_VCS: usize = 4;

/// Words in a single register request: two header words, one data word, one reserved trailer
pub const REQUEST_WORDS: usize = 4;
/// Words a response carries on top of its data: two header words and the status trailer
pub const RESPONSE_OVERHEAD_WORDS: usize = 3;
pub const BYTES_PER_WORD: usize = 4;

// Register protocol retry limits
pub const MAX_ADDRESS_MISMATCHES: u32 = 5;
pub const MAX_SKIPPED_ACKNOWLEDGMENTS: u32 = 6;
pub const VERSION_READ_TRIES: u32 = 3;

/// Fixed select-style poll interval used by every blocking read
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

// Fiducial (time code) counter
pub const FIDUCIAL_ROLLOVER: u32 = 0x20000;
pub const FIDUCIAL_WRAP_BAND: u32 = 32 + 720 + 7;
pub const FIDUCIAL_SMALL_TARGET: u32 = 720 + 7;
pub const FIDUCIAL_REARM_OFFSET: u32 = 4;
/// Polls allowed for a lane to report its fiducial synchronized enable
pub const ENABLE_POLLS: u32 = 1000;
pub const ENABLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

// DAQ trigger delay derivation
pub const RUN_TO_DAQ_TRIGGER_DELAY: u32 = 15;
pub const DAQ_DELAY_WINDOW: u32 = 64;

pub const DEFAULT_WRITE_AHEAD: usize = 18;
pub const MAX_RUN_TIME_ADDITIONS: usize = 1024;

// Data frame header
pub const DATA_HEADER_WORDS: usize = 8;
pub const DATA_HEADER_BYTES: usize = DATA_HEADER_WORDS * BYTES_PER_WORD;

// Front end reset handshake
pub const ADC_ACK_POLLS: u32 = 10;

/// Receive buffer for register traffic on a DMA device
pub const REGISTER_FRAME_WORDS: usize = 1024;
/// Receive buffer for data payloads: header, pixels, calibration and environmental rows
pub const DATA_FRAME_WORDS: usize = 1 << 19;
