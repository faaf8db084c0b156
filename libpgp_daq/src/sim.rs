//! A simulated front end and card, used by the tests and by the CLI when no device is
//! configured.
//!
//! SimFrontEnd owns the shared state. `transport()` and `card()` hand out handles implementing
//! Transport and CardControl over that state, so a test can drive a Configurator with them and
//! still inspect or fault the hardware through the SimFrontEnd.
use fxhash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::constants::{ADDRESS_MASK, FIDUCIAL_ROLLOVER, NUMBER_OF_VCS};
use super::destination::{Destination, VirtualChannel};
use super::error::TransportError;
use super::transport::{CardControl, Transport};
use super::wire_frame::{
    Opcode, RegisterHeader, RequestPayload, StatusWord, WireRequest, WireResponse,
};

const SIM_LANES: usize = 8;
const STRAY_ADDRESS_OFFSET: u32 = 0x1000;

/// Faults injected on the return path
#[derive(Debug, Clone, Default)]
pub struct SimFaults {
    /// Push this many responses for an unrelated address ahead of the next read result
    pub stray_responses: u32,
    /// Reads of these addresses carry the failed bit
    pub failed_addresses: FxHashSet<u32>,
    /// The next N reads of an address carry the timeout bit
    pub timeout_reads: FxHashMap<u32, u32>,
    /// Reads of these addresses return a fixed value whatever was written
    pub stuck_values: FxHashMap<u32, u32>,
    /// Waiting writes are not acknowledged
    pub drop_acknowledgments: bool,
    /// Nothing is ever sent back
    pub silent: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SimLane {
    pub enabled: bool,
    pub fiducial_target: u32,
    pub wait_for_fiducial: bool,
    pub header_check: [bool; NUMBER_OF_VCS],
    pub run_code: u8,
    pub run_delay: u32,
    pub daq_code: u8,
    pub daq_delay: u32,
    pub run_trigger_masked: bool,
    pub vc_mask: u8,
    pub resets: u32,
    pub sequence_resets: u32,
}

#[derive(Debug, Clone)]
pub struct SimState {
    pub registers: FxHashMap<(Destination, u32), u32>,
    /// Every register write in arrival order: destination, address, value
    pub writes: Vec<(Destination, u32, u32)>,
    pub reads: Vec<(Destination, u32)>,
    pub faults: SimFaults,
    pub fiducial: u32,
    /// Fiducial advance per `current_fiducial` query
    pub fiducial_step: u32,
    pub lanes: [SimLane; SIM_LANES],
    pub link_bandwidth: u32,
    /// Responses waiting for each transport handle
    outboxes: Vec<VecDeque<Vec<u32>>>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            registers: FxHashMap::default(),
            writes: Vec::new(),
            reads: Vec::new(),
            faults: SimFaults::default(),
            fiducial: 0,
            fiducial_step: 0,
            lanes: Default::default(),
            link_bandwidth: 4,
            outboxes: Vec::new(),
        }
    }
}

impl SimState {
    fn value(&self, destination: Destination, address: u32) -> u32 {
        if let Some(stuck) = self.faults.stuck_values.get(&address) {
            return *stuck;
        }
        self.registers
            .get(&(destination, address))
            .copied()
            .unwrap_or(0)
    }

    fn respond(&mut self, outbox: usize, response: WireResponse) {
        if !self.faults.silent {
            self.outboxes[outbox].push_back(response.encode());
        }
    }

    fn handle(&mut self, outbox: usize, request: WireRequest) {
        let header = request.header;
        let destination = header.destination;
        let address = header.address;
        match (header.opcode, request.payload) {
            (Opcode::Read, payload) => {
                let size = match payload {
                    RequestPayload::Read { size } => size,
                    _ => 1,
                };
                self.reads.push((destination, address));
                for _ in 0..self.faults.stray_responses {
                    let stray_address = (address + STRAY_ADDRESS_OFFSET) & ADDRESS_MASK;
                    let stray = WireResponse {
                        header: RegisterHeader::new(
                            destination,
                            Opcode::Read,
                            stray_address,
                            header.tid,
                            true,
                        ),
                        data: vec![0; size as usize],
                        status: StatusWord::default(),
                    };
                    self.respond(outbox, stray);
                }
                self.faults.stray_responses = 0;

                let mut status = StatusWord {
                    failed: self.faults.failed_addresses.contains(&address),
                    timeout: false,
                };
                if let Some(remaining) = self.faults.timeout_reads.get_mut(&address) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        status.timeout = true;
                    }
                }
                let data = (0..size)
                    .map(|offset| self.value(destination, address + offset))
                    .collect();
                self.respond(outbox, WireResponse {
                    header,
                    data,
                    status,
                });
            }
            (opcode, payload) => {
                let values = match payload {
                    RequestPayload::Single(value) => vec![value],
                    RequestPayload::Block(words) => words,
                    RequestPayload::Read { .. } => Vec::new(),
                };
                for (offset, value) in values.iter().enumerate() {
                    let key = (destination, address + offset as u32);
                    let current = self.registers.get(&key).copied().unwrap_or(0);
                    let next = match opcode {
                        Opcode::Set => current | value,
                        Opcode::Clear => current & !value,
                        _ => *value,
                    };
                    self.registers.insert(key, next);
                    self.writes.push((key.0, key.1, next));
                }
                if header.waiting && !self.faults.drop_acknowledgments {
                    let status = StatusWord {
                        failed: self.faults.failed_addresses.contains(&address),
                        timeout: false,
                    };
                    self.respond(outbox, WireResponse {
                        header,
                        data: values.first().copied().into_iter().collect(),
                        status,
                    });
                }
            }
        }
    }
}

fn lock(state: &Arc<Mutex<SimState>>) -> Result<MutexGuard<'_, SimState>, TransportError> {
    state.lock().map_err(|_| TransportError::Poisoned)
}

/// The simulated hardware. Cloning shares the same state
#[derive(Debug, Clone, Default)]
pub struct SimFrontEnd {
    state: Arc<Mutex<SimState>>,
}

impl SimFrontEnd {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new transport handle. Responses go back to the handle that posted the request
    pub fn transport(&self) -> SimTransport {
        let outbox = {
            let mut state = self.state();
            state.outboxes.push(VecDeque::new());
            state.outboxes.len() - 1
        };
        SimTransport {
            state: self.state.clone(),
            outbox,
        }
    }

    pub fn card(&self) -> SimCard {
        SimCard {
            state: self.state.clone(),
        }
    }

    /// Direct access to the simulated hardware, for setup and inspection
    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load a register value without going through the protocol
    pub fn preset(&self, destination: Destination, address: u32, value: u32) {
        self.state().registers.insert((destination, address), value);
    }
}

#[derive(Debug, Clone)]
pub struct SimTransport {
    state: Arc<Mutex<SimState>>,
    outbox: usize,
}

impl Transport for SimTransport {
    fn post(&mut self, frame: &[u32]) -> Result<(), TransportError> {
        let request = WireRequest::decode(frame)?;
        lock(&self.state)?.handle(self.outbox, request);
        Ok(())
    }

    /// Responses are produced synchronously, so an empty outbox means none is coming
    fn poll(&mut self, _timeout: Duration) -> Result<Option<Vec<u32>>, TransportError> {
        Ok(lock(&self.state)?.outboxes[self.outbox].pop_front())
    }
}

#[derive(Debug, Clone)]
pub struct SimCard {
    state: Arc<Mutex<SimState>>,
}

impl SimCard {
    fn with_lane<R>(
        &self,
        lane: u8,
        f: impl FnOnce(&mut SimLane) -> R,
    ) -> Result<R, TransportError> {
        let mut state = lock(&self.state)?;
        Ok(f(&mut state.lanes[lane as usize % SIM_LANES]))
    }
}

impl CardControl for SimCard {
    fn reset_lane(&mut self, lane: u8) -> Result<(), TransportError> {
        self.with_lane(lane, |l| l.resets += 1)
    }

    fn allocate_vc_mask(&mut self, lane: u8, vc_mask: u8) -> Result<(), TransportError> {
        self.with_lane(lane, |l| l.vc_mask = vc_mask)
    }

    fn link_bandwidth(&mut self) -> Result<u32, TransportError> {
        Ok(lock(&self.state)?.link_bandwidth)
    }

    fn current_fiducial(&mut self) -> Result<u32, TransportError> {
        let mut state = lock(&self.state)?;
        let fiducial = state.fiducial;
        state.fiducial = (fiducial + state.fiducial_step) % FIDUCIAL_ROLLOVER;
        Ok(fiducial)
    }

    fn set_fiducial_target(&mut self, lane: u8, target: u32) -> Result<(), TransportError> {
        self.with_lane(lane, |l| l.fiducial_target = target)
    }

    fn set_lane_enable(&mut self, lane: u8, enable: bool) -> Result<(), TransportError> {
        self.with_lane(lane, |l| l.enabled = enable)
    }

    fn lane_enabled(&mut self, lane: u8) -> Result<bool, TransportError> {
        self.with_lane(lane, |l| l.enabled)
    }

    fn set_header_check(
        &mut self,
        lane: u8,
        vc: VirtualChannel,
        enable: bool,
    ) -> Result<(), TransportError> {
        self.with_lane(lane, |l| l.header_check[vc.bits() as usize] = enable)
    }

    fn set_wait_for_fiducial(&mut self, lane: u8, enable: bool) -> Result<(), TransportError> {
        self.with_lane(lane, |l| l.wait_for_fiducial = enable)
    }

    fn set_run_code(&mut self, lane: u8, code: u8, delay: u32) -> Result<(), TransportError> {
        self.with_lane(lane, |l| {
            l.run_code = code;
            l.run_delay = delay;
        })
    }

    fn set_daq_code(&mut self, lane: u8, code: u8, delay: u32) -> Result<(), TransportError> {
        self.with_lane(lane, |l| {
            l.daq_code = code;
            l.daq_delay = delay;
        })
    }

    fn mask_run_trigger(&mut self, lane: u8, mask: bool) -> Result<(), TransportError> {
        self.with_lane(lane, |l| l.run_trigger_masked = mask)
    }

    fn reset_sequence_count(&mut self, lane: u8) -> Result<(), TransportError> {
        self.with_lane(lane, |l| l.sequence_resets += 1)
    }
}
