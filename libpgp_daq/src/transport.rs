use std::time::Duration;

use super::destination::VirtualChannel;
use super::error::TransportError;

/// A frame oriented channel to the link driver.
///
/// `post` hands one whole request frame to the driver. `poll` waits at most `timeout` for one
/// whole response frame, returning `Ok(None)` when nothing arrived in time. Frames are never
/// split or merged by a Transport.
pub trait Transport {
    fn post(&mut self, frame: &[u32]) -> Result<(), TransportError>;
    fn poll(&mut self, timeout: Duration) -> Result<Option<Vec<u32>>, TransportError>;
}

/// Card (driver) level controls for a lane, separate from the register protocol.
///
/// These are the driver requests the front end core relies on: lane reset, virtual channel
/// allocation, and the event receiver (fiducial, trigger code and delay) settings.
pub trait CardControl {
    fn reset_lane(&mut self, lane: u8) -> Result<(), TransportError>;
    fn allocate_vc_mask(&mut self, lane: u8, vc_mask: u8) -> Result<(), TransportError>;
    /// Negotiated link bandwidth in lanes. A healthy card reports 4
    fn link_bandwidth(&mut self) -> Result<u32, TransportError>;
    /// The live fiducial (time code) counter
    fn current_fiducial(&mut self) -> Result<u32, TransportError>;
    fn set_fiducial_target(&mut self, lane: u8, target: u32) -> Result<(), TransportError>;
    fn set_lane_enable(&mut self, lane: u8, enable: bool) -> Result<(), TransportError>;
    fn lane_enabled(&mut self, lane: u8) -> Result<bool, TransportError>;
    fn set_header_check(
        &mut self,
        lane: u8,
        vc: VirtualChannel,
        enable: bool,
    ) -> Result<(), TransportError>;
    fn set_wait_for_fiducial(&mut self, lane: u8, enable: bool) -> Result<(), TransportError>;
    fn set_run_code(&mut self, lane: u8, code: u8, delay: u32) -> Result<(), TransportError>;
    fn set_daq_code(&mut self, lane: u8, code: u8, delay: u32) -> Result<(), TransportError>;
    fn mask_run_trigger(&mut self, lane: u8, mask: bool) -> Result<(), TransportError>;
    fn reset_sequence_count(&mut self, lane: u8) -> Result<(), TransportError>;
}
