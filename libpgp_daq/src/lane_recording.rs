use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use super::error::RecordingError;

/// A file of raw payloads received on one lane.
///
/// Each payload is stored as a little endian u32 byte count followed by the payload bytes,
/// exactly as the lane delivered them (data frame header included).
#[derive(Debug)]
pub struct LaneRecording {
    path: PathBuf,
    reader: BufReader<File>,
    size_bytes: u64,
    bytes_read: u64,
}

impl LaneRecording {
    pub fn open(path: &Path) -> Result<Self, RecordingError> {
        if !path.exists() {
            return Err(RecordingError::BadFilePath(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let size_bytes = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            size_bytes,
            bytes_read: 0,
        })
    }

    /// Read the next payload. Returns None at a clean end of file
    pub fn next_payload(&mut self) -> Result<Option<Vec<u8>>, RecordingError> {
        let length = match self.reader.read_u32::<LittleEndian>() {
            Ok(length) => length,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut payload = vec![0u8; length as usize];
        match self.reader.read_exact(&mut payload) {
            Ok(()) => (),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(RecordingError::TruncatedPayload(length))
            }
            Err(e) => return Err(e.into()),
        }
        self.bytes_read += 4 + length as u64;
        Ok(Some(payload))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Fraction of the file consumed so far
    pub fn progress(&self) -> f32 {
        if self.size_bytes == 0 {
            return 1.0;
        }
        self.bytes_read as f32 / self.size_bytes as f32
    }
}

/// Writes payloads in the LaneRecording format
#[derive(Debug)]
pub struct LaneRecordingWriter {
    writer: BufWriter<File>,
    payloads: u64,
}

impl LaneRecordingWriter {
    pub fn create(path: &Path) -> Result<Self, RecordingError> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
            payloads: 0,
        })
    }

    pub fn write_payload(&mut self, payload: &[u8]) -> Result<(), RecordingError> {
        self.writer.write_u32::<LittleEndian>(payload.len() as u32)?;
        self.writer.write_all(payload)?;
        self.payloads += 1;
        Ok(())
    }

    pub fn payloads(&self) -> u64 {
        self.payloads
    }

    /// Flush and close the file
    pub fn close(mut self) -> Result<(), RecordingError> {
        self.writer.flush()?;
        Ok(())
    }
}
