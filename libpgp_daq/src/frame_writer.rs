use hdf5::types::VarLenUnicode;
use hdf5::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::error::FrameWriterError;
use super::reassembler::ReassembledFrame;

const FRAMES_NAME: &str = "frames";
const PIXELS_NAME: &str = "pixels";
const CALIBRATION_NAME: &str = "calibration";
const ENVIRONMENTAL_NAME: &str = "environmental";

/// This is the version of the output format
const FORMAT_VERSION: &str = "1.0";

/// A simple struct which wraps around the hdf5-rust library.
///
/// Opens an HDF5 file for writing reassembled frames.
#[derive(Debug)]
pub struct FrameWriter {
    file_handle: File,
    path: PathBuf,
    frames_group: hdf5::Group,
    first_frame: Option<u64>,
    last_frame: u64,
    damaged_frames: u64,
}
// Structure
// frames - min_frame, max_frame, damaged, version
// |---- frame_# - frame_number, acq_count, damage
// |    |---- pixels(dset)
// |    |---- calibration(dset)
// |    |---- environmental(dset)

impl FrameWriter {
    /// Create the writer, opening a file at path and creating the frames group
    pub fn new(path: &Path) -> Result<Self, FrameWriterError> {
        let file_handle = File::create(path)?;
        let writer_version = format!("{}:{}", env!("CARGO_PKG_NAME"), FORMAT_VERSION);

        let frames_group = file_handle.create_group(FRAMES_NAME)?;
        frames_group.new_attr::<u64>().create("min_frame")?;
        frames_group.new_attr::<u64>().create("max_frame")?;
        frames_group.new_attr::<u64>().create("damaged")?;
        frames_group
            .new_attr::<VarLenUnicode>()
            .create("version")?
            .write_scalar(&VarLenUnicode::from_str(&writer_version)?)?;

        Ok(Self {
            file_handle,
            path: path.to_path_buf(),
            frames_group,
            first_frame: None,
            last_frame: 0,
            damaged_frames: 0,
        })
    }

    /// Write a frame as frame_<counter>
    pub fn write_frame(
        &mut self,
        frame: &ReassembledFrame,
        counter: u64,
    ) -> Result<(), FrameWriterError> {
        if self.first_frame.is_none() {
            self.first_frame = Some(counter);
        }
        self.last_frame = self.last_frame.max(counter);
        if !frame.damage.is_clean() {
            self.damaged_frames += 1;
        }

        let frame_group = self
            .frames_group
            .create_group(&format!("frame_{}", counter))?;
        frame_group
            .new_dataset_builder()
            .with_data(&frame.pixels)
            .create(PIXELS_NAME)?;
        frame_group
            .new_dataset_builder()
            .with_data(&frame.calibration)
            .create(CALIBRATION_NAME)?;
        frame_group
            .new_dataset_builder()
            .with_data(&frame.environmental)
            .create(ENVIRONMENTAL_NAME)?;
        frame_group
            .new_attr::<u32>()
            .create("frame_number")?
            .write_scalar(&frame.frame_number)?;
        frame_group
            .new_attr::<u16>()
            .create("acq_count")?
            .write_scalar(&frame.acq_count)?;
        frame_group
            .new_attr::<u32>()
            .create("damage")?
            .write_scalar(&frame.damage.bits())?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write meta information on first and last frames, consume the writer
    pub fn close(self) -> Result<(), FrameWriterError> {
        let first = self.first_frame.unwrap_or(0);
        self.frames_group.attr("min_frame")?.write_scalar(&first)?;
        self.frames_group
            .attr("max_frame")?
            .write_scalar(&self.last_frame)?;
        self.frames_group
            .attr("damaged")?
            .write_scalar(&self.damaged_frames)?;
        if self.damaged_frames > 0 {
            spdlog::warn!(
                "{} of the frames written to {} were damaged",
                self.damaged_frames,
                self.path.to_string_lossy()
            );
        }
        spdlog::info!(
            "Frames {} to {} written to {}",
            first,
            self.last_frame,
            self.path.to_string_lossy()
        );
        self.file_handle.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassembler::{FrameReassembler, QuadGeometry};

    #[test]
    fn test_write_frames() {
        let geometry = QuadGeometry {
            asic_rows: 2,
            pixels_per_asic_row: 2,
            asics_per_row: 2,
            calibration_rows: 1,
            environmental_rows: 1,
            quads: 1,
        };
        let mut reassembler = FrameReassembler::new(geometry, 0);
        let frame = reassembler.finish();
        let path = std::env::temp_dir().join("pgp_daq_frame_writer_test.h5");
        let mut writer = FrameWriter::new(&path).unwrap();
        writer.write_frame(&frame, 0).unwrap();
        writer.write_frame(&frame, 1).unwrap();
        writer.close().unwrap();

        let file = File::open(&path).unwrap();
        let frames = file.group(FRAMES_NAME).unwrap();
        assert_eq!(frames.attr("max_frame").unwrap().read_scalar::<u64>().unwrap(), 1);
        // a frame with no lanes is missing its quad
        assert_eq!(frames.attr("damaged").unwrap().read_scalar::<u64>().unwrap(), 2);
        let pixels = frames.dataset("frame_1/pixels").unwrap();
        assert_eq!(pixels.shape(), vec![4, 4, 4]);
        std::fs::remove_file(&path).unwrap();
    }
}
