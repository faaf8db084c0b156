use bit_set::BitSet;
use byteorder::{ByteOrder, LittleEndian};
use ndarray::{s, Array3, ArrayViewMut1};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

use super::constants::DATA_HEADER_BYTES;
use super::error::ReassemblyError;
use super::wire_frame::DataFrameHeader;

/// Elements (2x2 ASIC groups) carried by one quad
pub const ELEMENTS_PER_QUAD: usize = 4;

/// Detector geometry that fixes the size and order of a lane payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuadGeometry {
    pub asic_rows: usize,
    pub pixels_per_asic_row: usize,
    pub asics_per_row: usize,
    pub calibration_rows: usize,
    pub environmental_rows: usize,
    pub quads: usize,
}

impl Default for QuadGeometry {
    fn default() -> Self {
        Self {
            asic_rows: 176,
            pixels_per_asic_row: 192,
            asics_per_row: 2,
            calibration_rows: 4,
            environmental_rows: 1,
            quads: 4,
        }
    }
}

impl QuadGeometry {
    /// Pixels in one row of an element
    pub fn element_row_size(&self) -> usize {
        self.asics_per_row * self.pixels_per_asic_row
    }

    pub fn element_rows(&self) -> usize {
        2 * self.asic_rows
    }

    pub fn elements(&self) -> usize {
        self.quads * ELEMENTS_PER_QUAD
    }

    /// Environmental rows carry 32 bit words, so half as many per row
    pub fn environmental_row_size(&self) -> usize {
        self.element_row_size() / 2
    }

    /// Exact byte length of one lane payload, header included
    pub fn expected_payload_bytes(&self) -> usize {
        let pixel_words =
            ELEMENTS_PER_QUAD * self.element_row_size() * (self.element_rows() + self.calibration_rows);
        let environmental_words =
            ELEMENTS_PER_QUAD * self.environmental_row_size() * self.environmental_rows;
        DATA_HEADER_BYTES + 2 * pixel_words + 4 * environmental_words
    }
}

/// Damage flags for a reassembled frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Damage(u32);

impl Damage {
    pub const MISSING_QUAD: u32 = 1 << 0;
    pub const LENGTH_MISMATCH: u32 = 1 << 1;
    pub const FRAME_MISMATCH: u32 = 1 << 2;
    pub const UNKNOWN_LANE: u32 = 1 << 3;

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn is_clean(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn insert(&mut self, flag: u32) {
        self.0 |= flag;
    }
}

impl Display for Damage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (Self::MISSING_QUAD, "missing quad"),
            (Self::LENGTH_MISMATCH, "length mismatch"),
            (Self::FRAME_MISMATCH, "frame mismatch"),
            (Self::UNKNOWN_LANE, "unknown lane"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", set.join(", "))
        }
    }
}

/// One detector image built from every lane's payload for an event
#[derive(Debug, Clone)]
pub struct ReassembledFrame {
    pub frame_number: u32,
    pub acq_count: u16,
    /// element, row, column
    pub pixels: Array3<u16>,
    pub calibration: Array3<u16>,
    pub environmental: Array3<u32>,
    pub damage: Damage,
}

impl ReassembledFrame {
    fn new(geometry: &QuadGeometry) -> Self {
        let elements = geometry.elements();
        Self {
            frame_number: 0,
            acq_count: 0,
            pixels: Array3::zeros((
                elements,
                geometry.element_rows(),
                geometry.element_row_size(),
            )),
            calibration: Array3::zeros((
                elements,
                geometry.calibration_rows,
                geometry.element_row_size(),
            )),
            environmental: Array3::zeros((
                elements,
                geometry.environmental_rows,
                geometry.environmental_row_size(),
            )),
            damage: Damage::default(),
        }
    }
}

/// Reads rows out of a payload, refusing to run past its end
struct RowCursor<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> RowCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn take(&mut self, bytes: usize) -> Option<&'a [u8]> {
        let chunk = self.data.get(self.position..self.position + bytes);
        self.position = match chunk {
            Some(_) => self.position + bytes,
            None => self.data.len(),
        };
        chunk
    }

    /// The ASIC sends each row right to left
    fn reversed_u16(&mut self, mut row: ArrayViewMut1<u16>) {
        let len = row.len();
        if let Some(src) = self.take(2 * len) {
            for (k, value) in src.chunks_exact(2).enumerate() {
                row[len - 1 - k] = LittleEndian::read_u16(value);
            }
        }
    }

    fn reversed_u32(&mut self, mut row: ArrayViewMut1<u32>) {
        let len = row.len();
        if let Some(src) = self.take(4 * len) {
            for (k, value) in src.chunks_exact(4).enumerate() {
                row[len - 1 - k] = LittleEndian::read_u32(value);
            }
        }
    }
}

/// FrameReassembler collects one payload per lane for an event and scatters them into a
/// single detector image.
///
/// Each lane carries one quad of four elements. The ASICs read out from the middle of the
/// element outwards, two super rows at a time, with every row reversed. For each pair of rows
/// the order is elements 2, 3 (upper row), 2, 3 (lower row), 0, 1 (upper), 0, 1 (lower).
/// Calibration rows follow in element order 2, 3, 0, 1, then the environmental rows in the same
/// order as 32 bit words.
#[derive(Debug)]
pub struct FrameReassembler {
    geometry: QuadGeometry,
    lane_offset: u8,
    payloads: Vec<Option<(DataFrameHeader, Vec<u8>)>>,
    present: BitSet,
    first_frame: Option<(u32, u16)>,
    damage: Damage,
}

impl FrameReassembler {
    pub fn new(geometry: QuadGeometry, lane_offset: u8) -> Self {
        Self {
            geometry,
            lane_offset,
            payloads: vec![None; geometry.quads],
            present: BitSet::with_capacity(geometry.quads),
            first_frame: None,
            damage: Damage::default(),
        }
    }

    pub fn geometry(&self) -> &QuadGeometry {
        &self.geometry
    }

    /// Accept the payload a lane delivered for the current event
    pub fn add_lane(&mut self, payload: Vec<u8>) -> Result<(), ReassemblyError> {
        if payload.len() < DATA_HEADER_BYTES {
            return Err(ReassemblyError::HeaderTooShort(payload.len()));
        }
        let header = DataFrameHeader::decode(&payload)
            .map_err(|_| ReassemblyError::HeaderTooShort(payload.len()))?;
        let quad = match header.lane.checked_sub(self.lane_offset) {
            Some(quad) if (quad as usize) < self.geometry.quads => quad as usize,
            _ => {
                spdlog::warn!(
                    "Dropping payload from lane {} outside of the configured quads",
                    header.lane
                );
                self.damage.insert(Damage::UNKNOWN_LANE);
                return Ok(());
            }
        };
        if self.present.contains(quad) {
            return Err(ReassemblyError::DuplicateLane(header.lane));
        }
        match self.first_frame {
            None => self.first_frame = Some((header.frame_number, header.acq_count)),
            Some((frame_number, _)) if frame_number != header.frame_number => {
                spdlog::warn!(
                    "Lane {} sent frame {} while assembling frame {}",
                    header.lane,
                    header.frame_number,
                    frame_number
                );
                self.damage.insert(Damage::FRAME_MISMATCH);
            }
            Some(_) => (),
        }
        self.present.insert(quad);
        self.payloads[quad] = Some((header, payload));
        Ok(())
    }

    /// Build the frame from the payloads received so far and reset for the next event
    pub fn finish(&mut self) -> ReassembledFrame {
        let mut frame = ReassembledFrame::new(&self.geometry);
        let (frame_number, acq_count) = self.first_frame.take().unwrap_or((0, 0));
        frame.frame_number = frame_number;
        frame.acq_count = acq_count;
        frame.damage = std::mem::take(&mut self.damage);

        let expected = self.geometry.expected_payload_bytes();
        for quad in 0..self.geometry.quads {
            let (header, payload) = match self.payloads[quad].take() {
                Some(p) => p,
                None => {
                    frame.damage.insert(Damage::MISSING_QUAD);
                    continue;
                }
            };
            if payload.len() != expected {
                spdlog::warn!(
                    "Lane {} payload is {} bytes, expected {}",
                    header.lane,
                    payload.len(),
                    expected
                );
                frame.damage.insert(Damage::LENGTH_MISMATCH);
            }
            self.add_quad(&mut frame, quad, &payload[DATA_HEADER_BYTES..]);
        }
        self.present.clear();
        if !frame.damage.is_clean() {
            spdlog::debug!("Frame {} damage: {}", frame.frame_number, frame.damage);
        }
        frame
    }

    /// Convenience for one event whose payloads are all at hand
    pub fn assemble(
        &mut self,
        payloads: Vec<Vec<u8>>,
    ) -> Result<ReassembledFrame, ReassemblyError> {
        for payload in payloads {
            if let Err(e) = self.add_lane(payload) {
                self.reset();
                return Err(e);
            }
        }
        Ok(self.finish())
    }

    fn reset(&mut self) {
        self.payloads.iter_mut().for_each(|p| *p = None);
        self.present.clear();
        self.first_frame = None;
        self.damage = Damage::default();
    }

    fn add_quad(&self, frame: &mut ReassembledFrame, quad: usize, data: &[u8]) {
        let asic_rows = self.geometry.asic_rows;
        let base = ELEMENTS_PER_QUAD * quad;
        let mut cursor = RowCursor::new(data);

        for i in 0..asic_rows {
            let up = asic_rows - i - 1;
            let down = asic_rows + i;
            for (element, row) in [
                (2, up),
                (3, up),
                (2, down),
                (3, down),
                (0, up),
                (1, up),
                (0, down),
                (1, down),
            ] {
                cursor.reversed_u16(frame.pixels.slice_mut(s![base + element, row, ..]));
            }
        }

        for row in 0..self.geometry.calibration_rows {
            for element in [2, 3, 0, 1] {
                cursor.reversed_u16(frame.calibration.slice_mut(s![base + element, row, ..]));
            }
        }

        for row in 0..self.geometry.environmental_rows {
            for element in [2, 3, 0, 1] {
                cursor.reversed_u32(
                    frame
                        .environmental
                        .slice_mut(s![base + element, row, ..]),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire_frame::words_to_bytes;

    fn small_geometry() -> QuadGeometry {
        QuadGeometry {
            asic_rows: 2,
            pixels_per_asic_row: 2,
            asics_per_row: 2,
            calibration_rows: 1,
            environmental_rows: 1,
            quads: 2,
        }
    }

    /// Pixel values carry the quad in the top nibble and the read order index below
    fn payload(geometry: &QuadGeometry, lane: u8, frame_number: u32) -> Vec<u8> {
        let header = DataFrameHeader {
            lane,
            vc: 0,
            frame_number,
            acq_count: 7,
            ..Default::default()
        };
        let mut bytes = words_to_bytes(&header.encode());
        let quad = lane as u16;
        let pixel_words = ELEMENTS_PER_QUAD
            * geometry.element_row_size()
            * (geometry.element_rows() + geometry.calibration_rows);
        for index in 0..pixel_words as u16 {
            bytes.extend_from_slice(&((quad << 12) | index).to_le_bytes());
        }
        let environmental_words =
            ELEMENTS_PER_QUAD * geometry.environmental_row_size() * geometry.environmental_rows;
        for index in 0..environmental_words as u32 {
            bytes.extend_from_slice(&(((lane as u32) << 24) | index).to_le_bytes());
        }
        bytes
    }

    #[test]
    fn test_expected_length() {
        let geometry = small_geometry();
        assert_eq!(geometry.expected_payload_bytes(), payload(&geometry, 0, 1).len());
        // 32 + 2 * 4 * 384 * (352 + 4) + 4 * 4 * 192
        assert_eq!(QuadGeometry::default().expected_payload_bytes(), 1_096_736);
    }

    #[test]
    fn test_quadrant_placement() {
        let geometry = small_geometry();
        let mut reassembler = FrameReassembler::new(geometry, 0);
        let frame = reassembler
            .assemble(vec![payload(&geometry, 1, 9), payload(&geometry, 0, 9)])
            .unwrap();
        assert!(frame.damage.is_clean(), "{}", frame.damage);
        assert_eq!(frame.frame_number, 9);
        assert_eq!(frame.acq_count, 7);

        // first super row pair: rows 1 (up) and 2 (down), reversed columns
        assert_eq!(frame.pixels[[2, 1, 3]], 0);
        assert_eq!(frame.pixels[[2, 1, 0]], 3);
        assert_eq!(frame.pixels[[3, 1, 3]], 4);
        assert_eq!(frame.pixels[[2, 2, 3]], 8);
        assert_eq!(frame.pixels[[3, 2, 3]], 12);
        assert_eq!(frame.pixels[[0, 1, 3]], 16);
        assert_eq!(frame.pixels[[1, 1, 3]], 20);
        assert_eq!(frame.pixels[[0, 2, 3]], 24);
        assert_eq!(frame.pixels[[1, 2, 3]], 28);
        // second pair moves outwards
        assert_eq!(frame.pixels[[2, 0, 3]], 32);
        assert_eq!(frame.pixels[[1, 3, 0]], 63);

        assert_eq!(frame.calibration[[2, 0, 3]], 64);
        assert_eq!(frame.calibration[[1, 0, 0]], 79);
        assert_eq!(frame.environmental[[2, 0, 1]], 0);
        assert_eq!(frame.environmental[[3, 0, 1]], 2);
        assert_eq!(frame.environmental[[1, 0, 0]], 7);

        // no lane leaks into another quad
        for ((element, _, _), value) in frame.pixels.indexed_iter() {
            assert_eq!((value >> 12) as usize, element / ELEMENTS_PER_QUAD);
        }
        assert_eq!(frame.pixels[[6, 1, 3]], 0x1000);
        assert_eq!(frame.environmental[[6, 0, 1]], 1 << 24);
    }

    #[test]
    fn test_length_mismatch_is_damage() {
        let geometry = small_geometry();
        let mut reassembler = FrameReassembler::new(geometry, 0);
        let mut short = payload(&geometry, 0, 3);
        short.truncate(short.len() - 10);
        let mut long = payload(&geometry, 1, 3);
        long.extend_from_slice(&[0xff; 64]);
        let frame = reassembler.assemble(vec![short, long]).unwrap();
        assert!(frame.damage.contains(Damage::LENGTH_MISMATCH));
        assert!(!frame.damage.contains(Damage::MISSING_QUAD));
        // the short lane stops at the last whole row
        assert_eq!(frame.calibration[[1, 0, 0]], 79);
        assert_eq!(frame.environmental[[1, 0, 0]], 0);
        assert_eq!(frame.environmental[[1, 0, 1]], 0);
        assert_eq!(frame.pixels.dim(), (8, 4, 4));
    }

    #[test]
    fn test_missing_and_unknown_lanes() {
        let geometry = small_geometry();
        let mut reassembler = FrameReassembler::new(geometry, 2);
        let frame = reassembler
            .assemble(vec![payload(&geometry, 2, 5), payload(&geometry, 7, 5)])
            .unwrap();
        assert!(frame.damage.contains(Damage::MISSING_QUAD));
        assert!(frame.damage.contains(Damage::UNKNOWN_LANE));
        assert!(frame.pixels.slice(s![4.., .., ..]).iter().all(|v| *v == 0));

        // state is reset between events
        let frame = reassembler
            .assemble(vec![payload(&geometry, 2, 6), payload(&geometry, 3, 6)])
            .unwrap();
        assert!(frame.damage.is_clean());
        assert_eq!(frame.frame_number, 6);
    }

    #[test]
    fn test_frame_mismatch_and_duplicates() {
        let geometry = small_geometry();
        let mut reassembler = FrameReassembler::new(geometry, 0);
        let frame = reassembler
            .assemble(vec![payload(&geometry, 0, 5), payload(&geometry, 1, 6)])
            .unwrap();
        assert!(frame.damage.contains(Damage::FRAME_MISMATCH));
        assert_eq!(frame.frame_number, 5);

        assert!(matches!(
            reassembler.assemble(vec![payload(&geometry, 0, 1), payload(&geometry, 0, 1)]),
            Err(ReassemblyError::DuplicateLane(0))
        ));
        assert!(matches!(
            reassembler.add_lane(vec![0; 8]),
            Err(ReassemblyError::HeaderTooShort(8))
        ));
    }
}
