use ndarray::Array2;
use serde::{Deserialize, Serialize};

const PIXEL_VALUE_MASK: u8 = 0xf;
const CALIBRATION_VALUE_MASK: u8 = 0x3;
const CALIBRATION_ROWS: usize = 2;
const BANKS_PER_ASIC: u32 = 4;

/// Whether `asic` has its bit set in `asic_mask`; ASICs past bit 31 never do
pub fn asic_enabled(asic_mask: u32, asic: u8) -> bool {
    asic_mask
        .checked_shr(asic as u32)
        .is_some_and(|bits| bits & 1 != 0)
}

/// Where the ASIC registers live and how a 2x2 ASIC group maps onto the pixel matrix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsicLayout {
    pub asic_base: u32,
    pub asic_stride: u32,
    pub number_of_asics: u8,
    /// Offset of the per-ASIC register block written with one block write
    pub block_offset: u32,
    pub prepare_multi_config: u32,
    pub whole_matrix: u32,
    pub row_counter: u32,
    pub col_counter: u32,
    pub pixel_data: u32,
    pub pixels_per_bank: u32,
    pub bank_selects: [u32; 4],
    pub rows: usize,
    pub cols: usize,
}

impl Default for AsicLayout {
    fn default() -> Self {
        Self {
            asic_base: 0x0080_0000,
            asic_stride: 0x0010_0000,
            number_of_asics: 4,
            block_offset: 0x1000,
            prepare_multi_config: 0x8000,
            whole_matrix: 0x84000,
            row_counter: 0x6011,
            col_counter: 0x6013,
            pixel_data: 0x5000,
            pixels_per_bank: 48,
            bank_selects: [0xe << 7, 0xd << 7, 0xb << 7, 0x7 << 7],
            rows: 352,
            cols: 384,
        }
    }
}

impl AsicLayout {
    /// Wraps on overflow; `Config::validate` rejects layouts that would
    pub fn asic_address(&self, asic: u8, register: u32) -> u32 {
        self.asic_base
            .wrapping_add(self.asic_stride.wrapping_mul(asic as u32))
            .wrapping_add(register)
    }

    /// Bit mask with one bit per ASIC
    pub fn all_asics(&self) -> u32 {
        1u32.checked_shl(self.number_of_asics as u32)
            .map(|bit| bit - 1)
            .unwrap_or(u32::MAX)
    }

    /// Row counter value that selects the calibration rows
    pub fn calibration_row(&self) -> u32 {
        (self.rows / 2) as u32
    }

    fn bank(&self, col: u32) -> usize {
        ((col % (self.pixels_per_bank * BANKS_PER_ASIC)) / self.pixels_per_bank) as usize
    }
}

/// One pixel that differs from the dominant value, in ASIC coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWrite {
    pub asic: u8,
    pub row: u32,
    pub col: u32,
    pub bank: usize,
    pub value: u8,
}

impl PixelWrite {
    /// Column counter value: bank select in the high bits, column within the bank below
    pub fn column_word(&self, layout: &AsicLayout) -> u32 {
        layout.bank_selects[self.bank] | (self.col % layout.pixels_per_bank)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelPlan {
    pub dominant: u8,
    pub writes: Vec<PixelWrite>,
}

/// Per pixel configuration for a 2x2 ASIC group, 4 bits per pixel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelConfig {
    values: Array2<u8>,
}

impl PixelConfig {
    pub fn uniform(rows: usize, cols: usize, value: u8) -> Self {
        Self {
            values: Array2::from_elem((rows, cols), value & PIXEL_VALUE_MASK),
        }
    }

    pub fn from_array(values: Array2<u8>) -> Self {
        Self {
            values: values.mapv(|v| v & PIXEL_VALUE_MASK),
        }
    }

    /// Out of range pixels are ignored
    pub fn set(&mut self, row: usize, col: usize, value: u8) {
        if let Some(v) = self.values.get_mut((row, col)) {
            *v = value & PIXEL_VALUE_MASK;
        }
    }

    pub fn get(&self, row: usize, col: usize) -> Option<u8> {
        self.values.get((row, col)).copied()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.values.dim()
    }

    /// The most common pixel value, lowest value on ties
    pub fn dominant_value(&self) -> u8 {
        let mut counts = [0usize; 16];
        for value in self.values.iter() {
            counts[(*value & PIXEL_VALUE_MASK) as usize] += 1;
        }
        let mut dominant = 0;
        for (value, count) in counts.iter().enumerate() {
            if *count > counts[dominant] {
                dominant = value;
            }
        }
        dominant as u8
    }

    /// Work out which pixels need individual writes once the whole matrix is set to the
    /// dominant value. The lower half holds ASICs 3 (left) and 0 (right) as read; the upper
    /// half holds ASICs 2 and 1 rotated by 180 degrees. ASICs outside `asic_mask` are skipped.
    pub fn plan(&self, layout: &AsicLayout, asic_mask: u32) -> PixelPlan {
        let dominant = self.dominant_value();
        let (rows, cols) = self.values.dim();
        let half_rows = rows / 2;
        let half_cols = cols / 2;
        let mut writes = Vec::new();
        for ((row, col), value) in self.values.indexed_iter() {
            if *value == dominant {
                continue;
            }
            let (asic, my_row, my_col) = if row >= half_rows {
                if col < half_cols {
                    (3u8, row - half_rows, col)
                } else {
                    (0u8, row - half_rows, col - half_cols)
                }
            } else if col < half_cols {
                (2u8, half_rows - 1 - row, half_cols - 1 - col)
            } else {
                (1u8, half_rows - 1 - row, cols - 1 - col)
            };
            if !asic_enabled(asic_mask, asic) {
                continue;
            }
            let col = my_col as u32;
            writes.push(PixelWrite {
                asic,
                row: my_row as u32,
                col,
                bank: layout.bank(col),
                value: *value,
            });
        }
        PixelPlan { dominant, writes }
    }
}

/// The two calibration rows that run along the seam between the upper and lower ASICs,
/// 2 bits per pixel. Row 0 belongs to the upper ASICs, row 1 to the lower ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationConfig {
    values: Array2<u8>,
}

impl CalibrationConfig {
    pub fn uniform(cols: usize, value: u8) -> Self {
        Self {
            values: Array2::from_elem((CALIBRATION_ROWS, cols), value & CALIBRATION_VALUE_MASK),
        }
    }

    /// Out of range pixels are ignored
    pub fn set(&mut self, row: usize, col: usize, value: u8) {
        if let Some(v) = self.values.get_mut((row, col)) {
            *v = value & CALIBRATION_VALUE_MASK;
        }
    }

    pub fn get(&self, row: usize, col: usize) -> Option<u8> {
        self.values.get((row, col)).copied()
    }

    /// Every calibration pixel of the enabled ASICs is written; there is no whole matrix
    /// shortcut for these rows. The upper row is mirrored like the upper ASICs.
    pub fn plan(&self, layout: &AsicLayout, asic_mask: u32) -> Vec<PixelWrite> {
        let cols = self.values.ncols();
        let half_cols = cols / 2;
        let row = layout.calibration_row();
        let mut writes = Vec::with_capacity(cols * CALIBRATION_ROWS);
        for ((calib_row, col), value) in self.values.indexed_iter() {
            let (asic, my_col) = match (calib_row, col < half_cols) {
                (1, true) => (3u8, col),
                (1, false) => (0u8, col - half_cols),
                (_, true) => (2u8, half_cols - 1 - col),
                (_, false) => (1u8, cols - 1 - col),
            };
            if !asic_enabled(asic_mask, asic) {
                continue;
            }
            let col = my_col as u32;
            writes.push(PixelWrite {
                asic,
                row,
                col,
                bank: layout.bank(col),
                value: *value,
            });
        }
        writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_needs_no_pixel_writes() {
        let layout = AsicLayout::default();
        let pixels = PixelConfig::uniform(layout.rows, layout.cols, 12);
        let plan = pixels.plan(&layout, 0xf);
        assert_eq!(plan.dominant, 12);
        assert!(plan.writes.is_empty());
    }

    #[test]
    fn test_quadrant_mapping() {
        let layout = AsicLayout::default();
        let mut pixels = PixelConfig::uniform(layout.rows, layout.cols, 0);
        pixels.set(0, 0, 5);
        pixels.set(351, 383, 6);
        pixels.set(200, 10, 7);
        pixels.set(10, 300, 8);
        let plan = pixels.plan(&layout, 0xf);
        assert_eq!(plan.writes.len(), 4);
        // upper left is ASIC 2 rotated
        assert_eq!(
            plan.writes[0],
            PixelWrite {
                asic: 2,
                row: 175,
                col: 191,
                bank: 3,
                value: 5
            }
        );
        assert_eq!(plan.writes[0].column_word(&layout), (0x7 << 7) | 47);
        // upper right is ASIC 1 rotated
        assert_eq!((plan.writes[1].asic, plan.writes[1].row), (1, 165));
        assert_eq!(plan.writes[1].col, 83);
        // lower left is ASIC 3 as read
        assert_eq!(
            (plan.writes[2].asic, plan.writes[2].row, plan.writes[2].col),
            (3, 24, 10)
        );
        // lower right is ASIC 0 as read
        assert_eq!(
            (plan.writes[3].asic, plan.writes[3].row, plan.writes[3].col),
            (0, 175, 191)
        );
    }

    #[test]
    fn test_calibration_rows() {
        let layout = AsicLayout::default();
        let mut calibration = CalibrationConfig::uniform(layout.cols, 1);
        calibration.set(0, 0, 6);
        calibration.set(1, 383, 3);
        assert_eq!(calibration.get(0, 0), Some(2));
        let writes = calibration.plan(&layout, 0xf);
        assert_eq!(writes.len(), 2 * layout.cols);
        assert!(writes.iter().all(|w| w.row == 176));
        // upper row is mirrored onto ASIC 2
        assert_eq!((writes[0].asic, writes[0].col, writes[0].value), (2, 191, 2));
        assert_eq!(writes[0].bank, 3);
        let last = writes[writes.len() - 1];
        assert_eq!((last.asic, last.col, last.value), (0, 191, 3));
        assert_eq!(calibration.plan(&layout, 0x8).len(), 192);
    }

    #[test]
    fn test_asic_mask_and_addresses() {
        let mut layout = AsicLayout::default();
        assert_eq!(layout.all_asics(), 0xf);
        assert_eq!(layout.asic_address(1, 0x10), 0x0090_0010);
        layout.number_of_asics = 32;
        assert_eq!(layout.all_asics(), u32::MAX);
        layout.number_of_asics = 200;
        assert_eq!(layout.all_asics(), u32::MAX);
        layout.asic_stride = u32::MAX;
        let _ = layout.asic_address(199, u32::MAX);
    }

    #[test]
    fn test_masked_asics_are_skipped() {
        let layout = AsicLayout::default();
        let mut pixels = PixelConfig::uniform(layout.rows, layout.cols, 1);
        pixels.set(0, 0, 2);
        pixels.set(351, 383, 2);
        let plan = pixels.plan(&layout, 0x1);
        assert_eq!(plan.writes.len(), 1);
        assert_eq!(plan.writes[0].asic, 0);
    }
}
