use std::path::PathBuf;
use thiserror::Error;

use super::destination::Destination;
use super::worker_status::WorkerStatus;

#[derive(Debug, Error)]
pub enum WireFrameError {
    #[error("WireFrame is too short -- found {found} words, expected at least {expected}")]
    TooShort { expected: usize, found: usize },
    #[error("WireFrame byte length {0} is not a whole number of words")]
    RaggedLength(usize),
    #[error("Failed to parse buffer into a WireFrame: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Transport state was poisoned by a panicked thread")]
    Poisoned,
    #[error("Transport received a malformed frame: {0}")]
    BadFrame(#[from] WireFrameError),
    #[error("Could not open Transport because device {0:?} does not exist")]
    BadDevicePath(PathBuf),
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("RegisterClient failed due to Transport error: {0}")]
    TransportError(#[from] TransportError),
    #[error("RegisterClient failed to parse a response: {0}")]
    BadResponse(#[from] WireFrameError),
    #[error("No response from {0} for address {1:#x} within the poll interval")]
    NoResponse(Destination, u32),
    #[error("Gave up reading {0} address {1:#x} after {2} mismatched responses")]
    AddressMismatch(Destination, u32, u32),
    #[error("Response from {0} had {1} data words; expected {2}")]
    LengthMismatch(Destination, usize, usize),
    #[error("Hardware reported failure for {0} address {1:#x}")]
    HardwareFailure(Destination, u32),
    #[error("Hardware reported timeout for {0} address {1:#x}")]
    HardwareTimeout(Destination, u32),
}

#[derive(Debug, Error)]
pub enum SyncWindowError {
    #[error("SyncWindow failed to drain an acknowledgment: {0}")]
    DrainFailed(#[from] RegisterError),
    #[error("SyncWindow found no waiting acknowledgment after skipping {0} responses")]
    MissingAcknowledgment(u32),
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("TriggerController failed due to card error: {0}")]
    CardError(#[from] TransportError),
    #[error("Trigger timing error -- run tick {0}, daq tick {1}, run delay {2}")]
    TimingError(u32, u32, u32),
    #[error("TriggerController cannot enable lane {0} before it is armed")]
    NotArmed(u8),
}

#[derive(Debug, Error)]
pub enum ShadowError {
    #[error("ConfigShadow has no register named {0}")]
    UnknownRegister(String),
    #[error("ConfigShadow table defines register {0} more than once")]
    DuplicateRegister(String),
    #[error("ConfigShadow register {0} has byte offset {1} which is not word aligned")]
    MisalignedOffset(String, u32),
    #[error("ConfigShadow register {0} has bit shift {1} outside of a word")]
    BadShift(String, u32),
    #[error("Could not load register table because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("ConfigShadow failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("ConfigShadow failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum RunTimeConfigError {
    #[error("Could not open run time config because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Run time config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Run time config line {0} does not have three hex fields: {1}")]
    BadLine(usize, String),
    #[error("Run time config failed to parse a hex value: {0}")]
    ParsingError(#[from] std::num::ParseIntError),
}

#[derive(Debug, Error)]
pub enum ConfiguratorError {
    #[error("Configurator failed due to register error: {0}")]
    RegisterError(#[from] RegisterError),
    #[error("Configurator failed due to SyncWindow error: {0}")]
    SyncError(#[from] SyncWindowError),
    #[error("Configurator failed due to trigger error: {0}")]
    TriggerError(#[from] TriggerError),
    #[error("Configurator failed due to shadow error: {0}")]
    ShadowError(#[from] ShadowError),
    #[error("Configurator failed due to card error: {0}")]
    CardError(#[from] TransportError),
    #[error("Configurator failed due to run time config error: {0}")]
    RunTimeConfigError(#[from] RunTimeConfigError),
    #[error("ADC alignment failed on {0}, ADC control returned {1:#x}")]
    AdcAlignment(Destination, u32),
    #[error("{0} readback disagreed with the shadow for {1} registers")]
    ReadbackMismatch(Destination, usize),
    #[error("{0} firmware version unreadable after {1} lane resets")]
    VersionUnreadable(Destination, u32),
    #[error("{0} ASIC readback disagreed with the written blocks of {1} ASICs")]
    AsicReadbackMismatch(Destination, usize),
    #[error("{0} run time config additions had {1} failed writes")]
    RunTimeWrites(Destination, usize),
}

#[derive(Debug, Error)]
pub enum ReassemblyError {
    #[error("Lane payload of {0} bytes is too short for a data frame header")]
    HeaderTooShort(usize),
    #[error("Lane {0} delivered more than one payload for the same event")]
    DuplicateLane(u8),
}

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("Could not open lane recording because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Lane recording failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Lane recording ended inside a {0} byte payload")]
    TruncatedPayload(u32),
}

#[derive(Debug, Error)]
pub enum FrameWriterError {
    #[error("FrameWriter failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
    #[error("FrameWriter failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("FrameWriter failed to build a string attribute: {0}")]
    StringError(#[from] hdf5::types::StringError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config lists no lanes")]
    NoLanes,
    #[error("Config lane {0} is below the lane offset {1}")]
    LaneBelowOffset(u8, u8),
    #[error("Config asks for {0} ASICs, at most {1} are supported")]
    TooManyAsics(u8, u32),
    #[error("Config ASIC register {0:#x} of ASIC {1} is outside the address space")]
    AsicAddressRange(u32, u8),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Processor failed due to shadow error: {0}")]
    ShadowError(#[from] ShadowError),
    #[error("Processor failed due to Transport error: {0}")]
    TransportError(#[from] TransportError),
    #[error("Processor failed due to register error: {0}")]
    RegisterError(#[from] RegisterError),
    #[error("Processor failed due to SyncWindow error: {0}")]
    SyncError(#[from] SyncWindowError),
    #[error("Processor failed due to trigger error: {0}")]
    TriggerError(#[from] TriggerError),
    #[error("Lane {0} did not reach fiducial target {1:#x} within {2} polls")]
    EnableTimeout(u8, u32, u32),
    #[error("Processor failed due to reassembly error: {0}")]
    ReassemblyError(#[from] ReassemblyError),
    #[error("Processor failed due to lane recording error: {0}")]
    RecordingError(#[from] RecordingError),
    #[error("Processor failed due to FrameWriter error: {0}")]
    FrameWriterError(#[from] FrameWriterError),
    #[error("Processor failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WorkerStatus>),
    #[error("Lane {0} worker panicked")]
    WorkerPanicked(u8),
}
