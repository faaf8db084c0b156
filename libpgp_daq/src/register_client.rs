use fxhash::{FxHashMap, FxHashSet};
use std::cell::{Cell, RefCell};
use std::time::Duration;

use super::constants::{MAX_ADDRESS_MISMATCHES, MAX_SKIPPED_ACKNOWLEDGMENTS, POLL_INTERVAL, TID_MASK};
use super::destination::Destination;
use super::error::RegisterError;
use super::transport::Transport;
use super::wire_frame::{Opcode, StatusWord, WireRequest, WireResponse};

/// RegisterClient issues register transactions over a Transport and matches the responses.
///
/// All calls are synchronous. Reads block for at most one poll interval per received
/// frame and give up after a bounded number of mismatched echoes. Writes are fire and forget;
/// a waiting write produces an acknowledgment that the caller (usually a SyncWindow) drains.
///
/// The client is owned by one lane worker. It uses interior mutability so that `Register`
/// handles and a `SyncWindow` can share it by reference while the worker keeps issuing writes.
#[derive(Debug)]
pub struct RegisterClient<T: Transport> {
    transport: RefCell<T>,
    next_tid: Cell<u32>,
    poll_interval: Duration,
    masked_destinations: RefCell<FxHashSet<Destination>>,
    masked_hw_errors: RefCell<FxHashMap<Destination, u32>>,
}

impl<T: Transport> RegisterClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: RefCell::new(transport),
            next_tid: Cell::new(0),
            poll_interval: POLL_INTERVAL,
            masked_destinations: RefCell::new(FxHashSet::default()),
            masked_hw_errors: RefCell::new(FxHashMap::default()),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Transaction ids count up and wrap at 2^23. They are for correlation only
    fn allocate_tid(&self) -> u32 {
        let tid = self.next_tid.get();
        self.next_tid.set((tid + 1) & TID_MASK);
        tid
    }

    fn post(&self, request: &WireRequest) -> Result<(), RegisterError> {
        self.transport.borrow_mut().post(&request.encode())?;
        Ok(())
    }

    pub fn write_register(
        &self,
        destination: Destination,
        address: u32,
        value: u32,
        waiting: bool,
    ) -> Result<(), RegisterError> {
        let request = WireRequest::write(destination, address, self.allocate_tid(), value, waiting);
        self.post(&request)
    }

    /// Write a contiguous range of registers in one frame
    pub fn write_register_block(
        &self,
        destination: Destination,
        address: u32,
        words: &[u32],
        waiting: bool,
    ) -> Result<(), RegisterError> {
        let request = WireRequest::block(destination, address, self.allocate_tid(), words, waiting);
        self.post(&request)
    }

    /// Set or clear bits of a register without a read-modify-write round trip
    pub fn modify_register(
        &self,
        destination: Destination,
        opcode: Opcode,
        address: u32,
        bits: u32,
        waiting: bool,
    ) -> Result<(), RegisterError> {
        let request = WireRequest::modify(
            destination,
            opcode,
            address,
            self.allocate_tid(),
            bits,
            waiting,
        );
        self.post(&request)
    }

    /// Read `size` words starting at `address`.
    ///
    /// Responses for other addresses are echoes of concurrent traffic and are discarded; after
    /// more than five of them the read fails.
    pub fn read_register(
        &self,
        destination: Destination,
        address: u32,
        size: u32,
    ) -> Result<Vec<u32>, RegisterError> {
        let request = WireRequest::read(destination, address, self.allocate_tid(), size);
        self.post(&request)?;
        let expected = size.max(1) as usize;
        let mut mismatches = 0;
        loop {
            let response = match self.receive()? {
                Some(r) => r,
                None => {
                    spdlog::error!(
                        "No response from {} reading address {:#x}",
                        destination,
                        address
                    );
                    return Err(RegisterError::NoResponse(destination, address));
                }
            };
            if response.header.address != request.header.address {
                mismatches += 1;
                spdlog::debug!(
                    "Discarding response for {:#x} while reading {:#x} from {}",
                    response.header.address,
                    address,
                    destination
                );
                if mismatches > MAX_ADDRESS_MISMATCHES {
                    spdlog::error!(
                        "Read of {} address {:#x} failed after {} mismatched responses",
                        destination,
                        address,
                        mismatches
                    );
                    return Err(RegisterError::AddressMismatch(
                        destination,
                        address,
                        mismatches,
                    ));
                }
                continue;
            }
            self.check_status(destination, address, &response.status)?;
            if response.data.len() != expected {
                spdlog::error!(
                    "Read of {} address {:#x} returned {} words, expected {}",
                    destination,
                    address,
                    response.data.len(),
                    expected
                );
                return Err(RegisterError::LengthMismatch(
                    destination,
                    response.data.len(),
                    expected,
                ));
            }
            return Ok(response.data);
        }
    }

    pub fn read_one(&self, destination: Destination, address: u32) -> Result<u32, RegisterError> {
        let data = self.read_register(destination, address, 1)?;
        Ok(data[0])
    }

    /// Wait one poll interval for the next response that is either a read result or a waiting
    /// acknowledgment. Plain write echoes are skipped, a bounded number of times.
    pub fn receive(&self) -> Result<Option<WireResponse>, RegisterError> {
        let mut skipped = 0;
        loop {
            let frame = self.transport.borrow_mut().poll(self.poll_interval)?;
            let frame = match frame {
                Some(f) => f,
                None => return Ok(None),
            };
            let response = WireResponse::decode(&frame)?;
            if response.header.waiting || response.header.opcode == Opcode::Read {
                return Ok(Some(response));
            }
            skipped += 1;
            if skipped > MAX_SKIPPED_ACKNOWLEDGMENTS {
                return Ok(None);
            }
        }
    }

    /// Interpret the trailing status word. Timeouts are always fatal; failures are fatal unless
    /// hardware errors are masked for the destination, in which case they are counted.
    pub fn check_status(
        &self,
        destination: Destination,
        address: u32,
        status: &StatusWord,
    ) -> Result<(), RegisterError> {
        if status.timeout {
            spdlog::error!(
                "Hardware timeout from {} at address {:#x}",
                destination,
                address
            );
            return Err(RegisterError::HardwareTimeout(destination, address));
        }
        if status.failed {
            if self.masked_destinations.borrow().contains(&destination) {
                let mut counts = self.masked_hw_errors.borrow_mut();
                let count = counts.entry(destination).or_insert(0);
                *count += 1;
                spdlog::warn!(
                    "Masked hardware failure #{} from {} at address {:#x}",
                    count,
                    destination,
                    address
                );
            } else {
                spdlog::error!(
                    "Hardware failure from {} at address {:#x}",
                    destination,
                    address
                );
                return Err(RegisterError::HardwareFailure(destination, address));
            }
        }
        Ok(())
    }

    /// Mask or unmask hardware failures from one destination
    pub fn mask_hw_errors(&self, destination: Destination, mask: bool) {
        let mut masked = self.masked_destinations.borrow_mut();
        if mask {
            masked.insert(destination);
        } else {
            masked.remove(&destination);
        }
    }

    pub fn masked_hw_error_count(&self, destination: Destination) -> u32 {
        self.masked_hw_errors
            .borrow()
            .get(&destination)
            .copied()
            .unwrap_or(0)
    }

    /// A handle to one register on a destination
    pub fn register(&self, destination: Destination, address: u32) -> Register<'_, T> {
        Register {
            client: self,
            destination,
            address,
        }
    }
}

/// One hardware register, bound to the client and destination it is accessed through.
#[derive(Debug)]
pub struct Register<'a, T: Transport> {
    client: &'a RegisterClient<T>,
    destination: Destination,
    address: u32,
}

impl<T: Transport> Register<'_, T> {
    pub fn read(&self) -> Result<u32, RegisterError> {
        self.client.read_one(self.destination, self.address)
    }

    pub fn write(&self, value: u32) -> Result<(), RegisterError> {
        self.client
            .write_register(self.destination, self.address, value, false)
    }

    /// Write and request an acknowledgment
    pub fn write_waiting(&self, value: u32) -> Result<(), RegisterError> {
        self.client
            .write_register(self.destination, self.address, value, true)
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn destination(&self) -> Destination {
        self.destination
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::VirtualChannel;
    use crate::sim::SimFrontEnd;

    fn registers() -> Destination {
        Destination::new(0, VirtualChannel::Registers)
    }

    #[test]
    fn test_write_then_read() {
        let sim = SimFrontEnd::new();
        let client = RegisterClient::new(sim.transport());
        let reg = client.register(registers(), 0x20);
        reg.write(0x1234).unwrap();
        assert_eq!(reg.read().unwrap(), 0x1234);
        assert_eq!(sim.state().writes.len(), 1);
    }

    #[test]
    fn test_block_write_and_read() {
        let sim = SimFrontEnd::new();
        let client = RegisterClient::new(sim.transport());
        client
            .write_register_block(registers(), 0x100, &[5, 6, 7], false)
            .unwrap();
        assert_eq!(
            client.read_register(registers(), 0x100, 3).unwrap(),
            vec![5, 6, 7]
        );
    }

    #[test]
    fn test_set_and_clear() {
        let sim = SimFrontEnd::new();
        let client = RegisterClient::new(sim.transport());
        client.write_register(registers(), 0x8, 0b1001, false).unwrap();
        client
            .modify_register(registers(), Opcode::Set, 0x8, 0b0110, false)
            .unwrap();
        client
            .modify_register(registers(), Opcode::Clear, 0x8, 0b0001, false)
            .unwrap();
        assert_eq!(client.read_one(registers(), 0x8).unwrap(), 0b1110);
    }

    #[test]
    fn test_tolerates_five_mismatches() {
        let sim = SimFrontEnd::new();
        sim.preset(registers(), 0x30, 42);
        sim.state().faults.stray_responses = 5;
        let client = RegisterClient::new(sim.transport());
        assert_eq!(client.read_one(registers(), 0x30).unwrap(), 42);
    }

    #[test]
    fn test_six_mismatches_fail() {
        let sim = SimFrontEnd::new();
        sim.state().faults.stray_responses = 6;
        let client = RegisterClient::new(sim.transport());
        match client.read_one(registers(), 0x30) {
            Err(RegisterError::AddressMismatch(_, address, count)) => {
                assert_eq!(address, 0x30);
                assert_eq!(count, 6);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_no_response() {
        let sim = SimFrontEnd::new();
        sim.state().faults.silent = true;
        let client = RegisterClient::new(sim.transport());
        assert!(matches!(
            client.read_one(registers(), 0x0),
            Err(RegisterError::NoResponse(_, 0))
        ));
    }

    #[test]
    fn test_hardware_error_masking() {
        let sim = SimFrontEnd::new();
        sim.state().faults.failed_addresses.insert(0x44);
        let client = RegisterClient::new(sim.transport());
        assert!(matches!(
            client.read_one(registers(), 0x44),
            Err(RegisterError::HardwareFailure(_, 0x44))
        ));

        client.mask_hw_errors(registers(), true);
        assert!(client.read_one(registers(), 0x44).is_ok());
        assert!(client.read_one(registers(), 0x44).is_ok());
        assert_eq!(client.masked_hw_error_count(registers()), 2);
    }

    #[test]
    fn test_masking_is_per_destination() {
        let sim = SimFrontEnd::new();
        sim.state().faults.failed_addresses.insert(0x44);
        let client = RegisterClient::new(sim.transport());
        let other_lane = Destination::new(1, VirtualChannel::Registers);
        let monitor = Destination::new(0, VirtualChannel::Monitor);
        client.mask_hw_errors(registers(), true);

        assert!(client.read_one(registers(), 0x44).is_ok());
        assert!(matches!(
            client.read_one(other_lane, 0x44),
            Err(RegisterError::HardwareFailure(d, 0x44)) if d == other_lane
        ));
        assert!(matches!(
            client.read_one(monitor, 0x44),
            Err(RegisterError::HardwareFailure(_, 0x44))
        ));
        assert_eq!(client.masked_hw_error_count(registers()), 1);
        assert_eq!(client.masked_hw_error_count(other_lane), 0);

        client.mask_hw_errors(registers(), false);
        assert!(client.read_one(registers(), 0x44).is_err());
    }

    #[test]
    fn test_timeout_is_never_masked() {
        let sim = SimFrontEnd::new();
        sim.state().faults.timeout_reads.insert(0x0, 1);
        let client = RegisterClient::new(sim.transport());
        client.mask_hw_errors(registers(), true);
        assert!(matches!(
            client.read_one(registers(), 0x0),
            Err(RegisterError::HardwareTimeout(_, 0))
        ));
        // The fault was one-shot
        assert!(client.read_one(registers(), 0x0).is_ok());
    }

    #[test]
    fn test_tid_wraps() {
        let sim = SimFrontEnd::new();
        let client = RegisterClient::new(sim.transport());
        client.next_tid.set(TID_MASK);
        assert_eq!(client.allocate_tid(), TID_MASK);
        assert_eq!(client.allocate_tid(), 0);
    }
}
