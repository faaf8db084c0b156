use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::constants::{
    DAQ_DELAY_WINDOW, FIDUCIAL_REARM_OFFSET, FIDUCIAL_ROLLOVER, FIDUCIAL_SMALL_TARGET,
    FIDUCIAL_WRAP_BAND, NUMBER_OF_VCS, RUN_TO_DAQ_TRIGGER_DELAY,
};
use super::destination::VirtualChannel;
use super::error::TriggerError;
use super::transport::CardControl;

/// Event receiver timing for one detector: the run and DAQ event codes, the run delay, and the
/// timeslot (in ticks) each event code lands on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerTiming {
    pub run_code: u8,
    pub run_delay: u32,
    pub daq_code: u8,
    pub timeslots: BTreeMap<u8, u32>,
}

impl Default for TriggerTiming {
    fn default() -> Self {
        Self {
            run_code: 40,
            run_delay: 0,
            daq_code: 40,
            timeslots: BTreeMap::new(),
        }
    }
}

impl TriggerTiming {
    /// Codes without a table entry sit on timeslot 0
    pub fn timeslot(&self, code: u8) -> u32 {
        self.timeslots.get(&code).copied().unwrap_or(0)
    }

    pub fn daq_delay(&self) -> Result<u32, TriggerError> {
        daq_delay(
            self.timeslot(self.run_code),
            self.timeslot(self.daq_code),
            self.run_delay,
        )
    }
}

/// Derive the DAQ trigger delay so the DAQ trigger follows the run trigger.
/// A delay that does not fit in 32 bits is a timing error.
pub fn daq_delay(run_tick: u32, daq_tick: u32, run_delay: u32) -> Result<u32, TriggerError> {
    let delay = if run_tick >= daq_tick {
        (run_tick - daq_tick)
            .checked_add(run_delay)
            .and_then(|d| d.checked_add(RUN_TO_DAQ_TRIGGER_DELAY))
    } else {
        let lead = daq_tick - run_tick;
        match run_delay.checked_add(DAQ_DELAY_WINDOW) {
            Some(window) if lead < window => Some(window - lead),
            _ => None,
        }
    };
    delay.ok_or(TriggerError::TimingError(run_tick, daq_tick, run_delay))
}

/// True while the fiducial has not yet reached the target, including the case where the
/// counter is about to roll over and the target sits just past zero.
pub fn target_pending(fiducial: u32, target: u32) -> bool {
    fiducial < target
        || (fiducial > FIDUCIAL_ROLLOVER - 1 - FIDUCIAL_WRAP_BAND && target < FIDUCIAL_SMALL_TARGET)
}

/// The target used when the requested one has already passed.
///
/// The compare register only ever sees counter values, so the target wraps with the counter.
/// Near the rollover the result is numerically smaller than `fiducial`; `target_pending` still
/// treats it as ahead because it falls in the wraparound band.
pub fn rearm_target(fiducial: u32) -> u32 {
    (fiducial + FIDUCIAL_REARM_OFFSET) % FIDUCIAL_ROLLOVER
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Disabled,
    Armed(u32),
    Enabled,
}

/// Fiducial synchronized trigger enable/disable for one lane.
///
/// `arm(target)` loads the compare register, `enable()` sets the lane enable bit, and the
/// transition to Enabled happens in hardware when the fiducial counter reaches the target.
/// `poll()` observes that transition. `disable()` takes effect immediately.
#[derive(Debug)]
pub struct TriggerController<C: CardControl> {
    card: C,
    lane: u8,
    state: TriggerState,
    header_check: [bool; NUMBER_OF_VCS],
}

impl<C: CardControl> TriggerController<C> {
    pub fn new(card: C, lane: u8) -> Self {
        Self {
            card,
            lane,
            state: TriggerState::Disabled,
            header_check: [false; NUMBER_OF_VCS],
        }
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    pub fn lane(&self) -> u8 {
        self.lane
    }

    pub fn header_check_enabled(&self, vc: VirtualChannel) -> bool {
        self.header_check[vc.bits() as usize]
    }

    pub fn card_mut(&mut self) -> &mut C {
        &mut self.card
    }

    /// Per configure cycle setup: header checking on the data channel, the run and DAQ codes
    /// and delays, then leave the lane disabled in wait-for-fiducial mode.
    /// Returns the DAQ delay that was loaded.
    pub fn configure_timing(&mut self, timing: &TriggerTiming) -> Result<u32, TriggerError> {
        let daq_delay = timing.daq_delay()?;
        self.set_header_check(VirtualChannel::Data, true)?;
        self.card
            .set_run_code(self.lane, timing.run_code, timing.run_delay)?;
        self.card
            .set_daq_code(self.lane, timing.daq_code, daq_delay)?;
        self.card.set_wait_for_fiducial(self.lane, false)?;
        self.card.set_lane_enable(self.lane, false)?;
        self.state = TriggerState::Disabled;
        self.card.set_wait_for_fiducial(self.lane, true)?;
        spdlog::info!(
            "Lane {} trigger timing: run code {} delay {}, daq code {} delay {}",
            self.lane,
            timing.run_code,
            timing.run_delay,
            timing.daq_code,
            daq_delay
        );
        Ok(daq_delay)
    }

    pub fn set_header_check(
        &mut self,
        vc: VirtualChannel,
        enable: bool,
    ) -> Result<(), TriggerError> {
        self.card.set_header_check(self.lane, vc, enable)?;
        self.header_check[vc.bits() as usize] = enable;
        Ok(())
    }

    /// Load the fiducial compare register. A target that already passed is replaced by one a
    /// few fiducials ahead of the live counter. Returns the target actually loaded.
    pub fn arm(&mut self, target: u32) -> Result<u32, TriggerError> {
        let requested = target % FIDUCIAL_ROLLOVER;
        let fiducial = self.card.current_fiducial()?;
        let target = if target_pending(fiducial, requested) {
            requested
        } else {
            let rearmed = rearm_target(fiducial);
            spdlog::info!(
                "Lane {} fiducial target {:#x} already passed at {:#x}, arming {:#x}",
                self.lane,
                requested,
                fiducial,
                rearmed
            );
            rearmed
        };
        self.card.set_fiducial_target(self.lane, target)?;
        self.state = TriggerState::Armed(target);
        Ok(target)
    }

    /// Set the lane enable bit. If the target slipped past while enabling, re-arm it.
    pub fn enable(&mut self) -> Result<(), TriggerError> {
        let target = match self.state {
            TriggerState::Armed(target) => target,
            TriggerState::Enabled => return Ok(()),
            TriggerState::Disabled => return Err(TriggerError::NotArmed(self.lane)),
        };
        self.card.set_lane_enable(self.lane, true)?;
        let fiducial = self.card.current_fiducial()?;
        if !target_pending(fiducial, target) {
            let rearmed = rearm_target(fiducial);
            spdlog::warn!(
                "Lane {} missed fiducial {:#x} (now {:#x}), re-arming {:#x}",
                self.lane,
                target,
                fiducial,
                rearmed
            );
            self.card.set_fiducial_target(self.lane, rearmed)?;
            self.state = TriggerState::Armed(rearmed);
        }
        Ok(())
    }

    /// Arm and enable in one step
    pub fn enable_at(&mut self, target: u32) -> Result<u32, TriggerError> {
        self.arm(target)?;
        self.enable()?;
        match self.state {
            TriggerState::Armed(target) => Ok(target),
            _ => Ok(target % FIDUCIAL_ROLLOVER),
        }
    }

    /// Observe whether the hardware transition has happened
    pub fn poll(&mut self) -> Result<TriggerState, TriggerError> {
        if let TriggerState::Armed(target) = self.state {
            if self.card.lane_enabled(self.lane)? {
                let fiducial = self.card.current_fiducial()?;
                if !target_pending(fiducial, target) {
                    self.state = TriggerState::Enabled;
                }
            }
        }
        Ok(self.state)
    }

    pub fn disable(&mut self) -> Result<(), TriggerError> {
        self.card.set_lane_enable(self.lane, false)?;
        self.state = TriggerState::Disabled;
        Ok(())
    }
}
