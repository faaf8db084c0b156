//! Bit-exact codec for the register request/response frames and the data frame header.
//!
//! Register frames share a two word header:
//!
//! ```text
//! word0: tid[22:0] waiting[23] lane[26:24] z[29:27] vc[31:30]
//! word1: address[29:0] opcode[31:30]
//! ```
//!
//! Requests follow the header with one data word (the value, or `size - 1` for reads) or a
//! caller supplied block, then one reserved trailing word. Responses follow the header with
//! the data words and a trailing status word whose bit 16 is `failed` and bit 17 is `timeout`.
//! There is no checksum; the status bits and the echoed header are all the integrity the
//! protocol offers.
use bitvec::prelude::*;
use byteorder::{ByteOrder, LittleEndian};

use super::constants::{
    ADDRESS_MASK, BYTES_PER_WORD, DATA_HEADER_BYTES, DATA_HEADER_WORDS, REQUEST_WORDS,
    RESPONSE_OVERHEAD_WORDS, TID_MASK,
};
use super::destination::{Destination, VirtualChannel};
use super::error::WireFrameError;

const STATUS_FAILED_BIT: usize = 16;
const STATUS_TIMEOUT_BIT: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Read,
    Write,
    Set,
    Clear,
}

impl Opcode {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Self::Read,
            1 => Self::Write,
            2 => Self::Set,
            _ => Self::Clear,
        }
    }

    pub fn bits(&self) -> u32 {
        match self {
            Self::Read => 0,
            Self::Write => 1,
            Self::Set => 2,
            Self::Clear => 3,
        }
    }
}

/// The two header words shared by requests and responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterHeader {
    pub destination: Destination,
    pub opcode: Opcode,
    pub address: u32,
    pub tid: u32,
    pub waiting: bool,
}

impl RegisterHeader {
    pub fn new(
        destination: Destination,
        opcode: Opcode,
        address: u32,
        tid: u32,
        waiting: bool,
    ) -> Self {
        Self {
            destination,
            opcode,
            address: address & ADDRESS_MASK,
            tid: tid & TID_MASK,
            waiting,
        }
    }

    pub fn encode(&self) -> [u32; 2] {
        let mut words = [0u32; 2];
        {
            let bits = words[0].view_bits_mut::<Lsb0>();
            bits[0..23].store_le(self.tid & TID_MASK);
            bits.set(23, self.waiting);
            bits[24..27].store_le(self.destination.lane());
            bits[30..32].store_le(self.destination.vc().bits());
        }
        {
            let bits = words[1].view_bits_mut::<Lsb0>();
            bits[0..30].store_le(self.address & ADDRESS_MASK);
            bits[30..32].store_le(self.opcode.bits());
        }
        words
    }

    pub fn decode(words: [u32; 2]) -> Self {
        let word0 = words[0].view_bits::<Lsb0>();
        let word1 = words[1].view_bits::<Lsb0>();
        let lane: u8 = word0[24..27].load_le();
        let vc: u8 = word0[30..32].load_le();
        Self {
            destination: Destination::new(lane, VirtualChannel::from_bits(vc)),
            opcode: Opcode::from_bits(word1[30..32].load_le()),
            address: word1[0..30].load_le(),
            tid: word0[0..23].load_le(),
            waiting: word0[23],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPayload {
    /// Read `size` words starting at the address
    Read { size: u32 },
    Single(u32),
    Block(Vec<u32>),
}

/// An outgoing register request. Built per call and never retained
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRequest {
    pub header: RegisterHeader,
    pub payload: RequestPayload,
}

impl WireRequest {
    /// A read of `size` words. A size of zero is treated as one word
    pub fn read(destination: Destination, address: u32, tid: u32, size: u32) -> Self {
        Self {
            header: RegisterHeader::new(destination, Opcode::Read, address, tid, true),
            payload: RequestPayload::Read { size: size.max(1) },
        }
    }

    pub fn write(
        destination: Destination,
        address: u32,
        tid: u32,
        value: u32,
        waiting: bool,
    ) -> Self {
        Self {
            header: RegisterHeader::new(destination, Opcode::Write, address, tid, waiting),
            payload: RequestPayload::Single(value),
        }
    }

    /// Set (OR) or clear (AND NOT) the bits of `value` in the register
    pub fn modify(
        destination: Destination,
        opcode: Opcode,
        address: u32,
        tid: u32,
        value: u32,
        waiting: bool,
    ) -> Self {
        Self {
            header: RegisterHeader::new(destination, opcode, address, tid, waiting),
            payload: RequestPayload::Single(value),
        }
    }

    pub fn block(
        destination: Destination,
        address: u32,
        tid: u32,
        words: &[u32],
        waiting: bool,
    ) -> Self {
        Self {
            header: RegisterHeader::new(destination, Opcode::Write, address, tid, waiting),
            payload: RequestPayload::Block(words.to_vec()),
        }
    }

    pub fn encode(&self) -> Vec<u32> {
        let header = self.header.encode();
        let mut words = Vec::with_capacity(self.encoded_len());
        words.extend_from_slice(&header);
        match &self.payload {
            RequestPayload::Read { size } => words.push(size.saturating_sub(1)),
            RequestPayload::Single(value) => words.push(*value),
            RequestPayload::Block(block) => words.extend_from_slice(block),
        }
        words.push(0);
        words
    }

    pub fn encoded_len(&self) -> usize {
        match &self.payload {
            RequestPayload::Block(block) => block.len() + RESPONSE_OVERHEAD_WORDS,
            _ => REQUEST_WORDS,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        words_to_bytes(&self.encode())
    }

    /// Decode a request as the hardware sees it
    pub fn decode(words: &[u32]) -> Result<Self, WireFrameError> {
        if words.len() < REQUEST_WORDS {
            return Err(WireFrameError::TooShort {
                expected: REQUEST_WORDS,
                found: words.len(),
            });
        }
        let header = RegisterHeader::decode([words[0], words[1]]);
        let body = &words[2..words.len() - 1];
        let payload = match header.opcode {
            Opcode::Read => RequestPayload::Read {
                size: body[0].saturating_add(1),
            },
            _ if body.len() == 1 => RequestPayload::Single(body[0]),
            _ => RequestPayload::Block(body.to_vec()),
        };
        Ok(Self { header, payload })
    }
}

/// Trailing status word set by hardware on the return path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusWord {
    pub failed: bool,
    pub timeout: bool,
}

impl StatusWord {
    pub fn encode(&self) -> u32 {
        let mut word = 0u32;
        let bits = word.view_bits_mut::<Lsb0>();
        bits.set(STATUS_FAILED_BIT, self.failed);
        bits.set(STATUS_TIMEOUT_BIT, self.timeout);
        word
    }

    pub fn decode(word: u32) -> Self {
        let bits = word.view_bits::<Lsb0>();
        Self {
            failed: bits[STATUS_FAILED_BIT],
            timeout: bits[STATUS_TIMEOUT_BIT],
        }
    }
}

/// An incoming register response. Owned by the RegisterClient until matched or discarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResponse {
    pub header: RegisterHeader,
    pub data: Vec<u32>,
    pub status: StatusWord,
}

impl WireResponse {
    pub fn decode(words: &[u32]) -> Result<Self, WireFrameError> {
        if words.len() < RESPONSE_OVERHEAD_WORDS {
            return Err(WireFrameError::TooShort {
                expected: RESPONSE_OVERHEAD_WORDS,
                found: words.len(),
            });
        }
        let last = words.len() - 1;
        Ok(Self {
            header: RegisterHeader::decode([words[0], words[1]]),
            data: words[2..last].to_vec(),
            status: StatusWord::decode(words[last]),
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireFrameError> {
        Self::decode(&words_from_bytes(bytes)?)
    }

    pub fn encode(&self) -> Vec<u32> {
        let mut words = Vec::with_capacity(self.data.len() + RESPONSE_OVERHEAD_WORDS);
        words.extend_from_slice(&self.header.encode());
        words.extend_from_slice(&self.data);
        words.push(self.status.encode());
        words
    }
}

/// Little-endian bytes to words. The byte count must be a whole number of words
pub fn words_from_bytes(bytes: &[u8]) -> Result<Vec<u32>, WireFrameError> {
    if bytes.len() % BYTES_PER_WORD != 0 {
        return Err(WireFrameError::RaggedLength(bytes.len()));
    }
    let mut words = vec![0u32; bytes.len() / BYTES_PER_WORD];
    LittleEndian::read_u32_into(bytes, &mut words);
    Ok(words)
}

pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut bytes = vec![0u8; words.len() * BYTES_PER_WORD];
    LittleEndian::write_u32_into(words, &mut bytes);
    bytes
}

/// The eight word header that opens every per-lane data payload.
///
/// ```text
/// word0: vc[1:0] z[5:2] lane[8:6] tid[31:9]
/// word1: acqCount[15:0] opCode[23:16] elementId[27:24] z[31:28]
/// word2: frame number
/// word3: ticks
/// word4: fiducials
/// word5-6: four 16 bit board temperatures
/// word7: frame type
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataFrameHeader {
    pub lane: u8,
    pub vc: u8,
    pub tid: u32,
    pub acq_count: u16,
    pub op_code: u8,
    pub element_id: u8,
    pub frame_number: u32,
    pub ticks: u32,
    pub fiducials: u32,
    pub board_temperatures: [u16; 4],
    pub frame_type: u32,
}

impl DataFrameHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self, WireFrameError> {
        if bytes.len() < DATA_HEADER_BYTES {
            return Err(WireFrameError::TooShort {
                expected: DATA_HEADER_WORDS,
                found: bytes.len() / BYTES_PER_WORD,
            });
        }
        let words = words_from_bytes(&bytes[..DATA_HEADER_BYTES])?;
        let word0 = words[0].view_bits::<Lsb0>();
        let word1 = words[1].view_bits::<Lsb0>();
        let mut board_temperatures = [0u16; 4];
        LittleEndian::read_u16_into(&bytes[20..28], &mut board_temperatures);
        Ok(Self {
            vc: word0[0..2].load_le(),
            lane: word0[6..9].load_le(),
            tid: word0[9..32].load_le(),
            acq_count: word1[0..16].load_le(),
            op_code: word1[16..24].load_le(),
            element_id: word1[24..28].load_le(),
            frame_number: words[2],
            ticks: words[3],
            fiducials: words[4],
            board_temperatures,
            frame_type: words[7],
        })
    }

    pub fn encode(&self) -> [u32; DATA_HEADER_WORDS] {
        let mut words = [0u32; DATA_HEADER_WORDS];
        {
            let bits = words[0].view_bits_mut::<Lsb0>();
            bits[0..2].store_le(self.vc & 0x3);
            bits[6..9].store_le(self.lane & 0x7);
            bits[9..32].store_le(self.tid & TID_MASK);
        }
        {
            let bits = words[1].view_bits_mut::<Lsb0>();
            bits[0..16].store_le(self.acq_count);
            bits[16..24].store_le(self.op_code);
            bits[24..28].store_le(self.element_id & 0xf);
        }
        words[2] = self.frame_number;
        words[3] = self.ticks;
        words[4] = self.fiducials;
        words[5] = self.board_temperatures[0] as u32 | (self.board_temperatures[1] as u32) << 16;
        words[6] = self.board_temperatures[2] as u32 | (self.board_temperatures[3] as u32) << 16;
        words[7] = self.frame_type;
        words
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_request_layout() {
        let dest = Destination::new(2, VirtualChannel::Registers);
        let request = WireRequest::read(dest, 0x80, 7, 4);
        let words = request.encode();
        assert_eq!(words.len(), REQUEST_WORDS);
        // tid 7, waiting, lane 2, vc 1
        assert_eq!(words[0], 7 | (1 << 23) | (2 << 24) | (1 << 30));
        assert_eq!(words[1], 0x80);
        // size - 1
        assert_eq!(words[2], 3);
        assert_eq!(words[3], 0);
        assert_eq!(WireRequest::decode(&words).unwrap(), request);
    }

    #[test]
    fn test_fields_are_masked() {
        let dest = Destination::new(1, VirtualChannel::Monitor);
        let request = WireRequest::write(dest, 0xffff_ffff, (1 << 23) + 5, 0xdead, false);
        let header = RegisterHeader::decode([request.encode()[0], request.encode()[1]]);
        assert_eq!(header.tid, 5);
        assert_eq!(header.address, ADDRESS_MASK);
        assert_eq!(header.opcode, Opcode::Write);
        assert!(!header.waiting);
        assert_eq!(header.destination, dest);
    }

    #[test]
    fn test_block_write_layout() {
        let dest = Destination::new(0, VirtualChannel::Registers);
        let block = [1, 2, 3, 4, 5];
        let request = WireRequest::block(dest, 0x1000, 1, &block, true);
        let words = request.encode();
        assert_eq!(words.len(), block.len() + 3);
        assert_eq!(&words[2..7], &block);
        assert_eq!(*words.last().unwrap(), 0);
        assert_eq!(
            WireRequest::decode(&words).unwrap().payload,
            RequestPayload::Block(block.to_vec())
        );
    }

    #[test]
    fn test_response_status_bits() {
        let dest = Destination::new(0, VirtualChannel::Registers);
        let header = RegisterHeader::new(dest, Opcode::Read, 0x10, 3, true);
        let mut words = header.encode().to_vec();
        words.push(0x1234);
        words.push(1 << 17);
        let response = WireResponse::decode(&words).unwrap();
        assert_eq!(response.data, vec![0x1234]);
        assert!(response.status.timeout);
        assert!(!response.status.failed);

        let bytes = words_to_bytes(&response.encode());
        assert_eq!(WireResponse::from_bytes(&bytes).unwrap(), response);
        assert!(WireResponse::from_bytes(&bytes[..5]).is_err());
    }

    #[test]
    fn test_data_header() {
        let header = DataFrameHeader {
            lane: 5,
            vc: 0,
            tid: 0x1234,
            acq_count: 77,
            op_code: 2,
            element_id: 3,
            frame_number: 1001,
            ticks: 9,
            fiducials: 0x1fff0,
            board_temperatures: [1, 2, 3, 4],
            frame_type: 0,
        };
        let words = header.encode();
        assert_eq!(words[0] & 0x3f, 0);
        assert_eq!((words[0] >> 6) & 0x7, 5);
        assert_eq!(words[0] >> 9, 0x1234);
        let decoded = DataFrameHeader::decode(&words_to_bytes(&words)).unwrap();
        assert_eq!(decoded, header);
    }
}
