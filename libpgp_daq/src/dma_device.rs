use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::constants::BYTES_PER_WORD;
use super::error::TransportError;
use super::transport::Transport;
use super::wire_frame::{words_from_bytes, words_to_bytes};

/// Transport over a DMA character device.
///
/// The driver delivers exactly one frame per `read` and accepts one frame per `write`. `poll`
/// waits for the descriptor to become readable, then takes a single frame.
#[derive(Debug)]
pub struct DmaDevice {
    path: PathBuf,
    file: File,
    buffer: Vec<u8>,
}

impl DmaDevice {
    /// Open the device. `max_frame_words` sizes the receive buffer; longer frames are cut
    /// by the driver and will fail length checks further up.
    pub fn open(path: &Path, max_frame_words: usize) -> Result<Self, TransportError> {
        if !path.exists() {
            return Err(TransportError::BadDevicePath(path.to_path_buf()));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        spdlog::info!("Opened DMA device {}", path.to_string_lossy());
        Ok(Self {
            path: path.to_path_buf(),
            file,
            buffer: vec![0u8; max_frame_words * BYTES_PER_WORD],
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Wait up to `timeout` for `file` to have a frame. An interrupted wait counts as a timeout
#[cfg(unix)]
fn wait_readable(file: &File, timeout: Duration) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let mut descriptor = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    // SAFETY: exactly one valid pollfd, borrowed for the duration of the call
    let ready = unsafe { libc::poll(&mut descriptor, 1, millis) };
    if ready < 0 {
        let error = std::io::Error::last_os_error();
        if error.kind() == ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(error);
    }
    Ok(ready > 0)
}

/// Without poll(2) the read itself blocks
#[cfg(not(unix))]
fn wait_readable(_file: &File, _timeout: Duration) -> std::io::Result<bool> {
    Ok(true)
}

impl Transport for DmaDevice {
    fn post(&mut self, frame: &[u32]) -> Result<(), TransportError> {
        self.file.write_all(&words_to_bytes(frame))?;
        Ok(())
    }

    /// End of file reads as no frame
    fn poll(&mut self, timeout: Duration) -> Result<Option<Vec<u32>>, TransportError> {
        if !wait_readable(&self.file, timeout)? {
            return Ok(None);
        }
        match self.file.read(&mut self.buffer) {
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(words_from_bytes(&self.buffer[..n])?)),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
