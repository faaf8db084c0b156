use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;
use time::OffsetDateTime;

use super::config_shadow::{AccessMode, ConfigShadow};
use super::constants::{ADC_ACK_POLLS, DEFAULT_WRITE_AHEAD, VERSION_READ_TRIES};
use super::destination::{Destination, VirtualChannel};
use super::error::{ConfiguratorError, RunTimeConfigError};
use super::pixel_map::{asic_enabled, AsicLayout, CalibrationConfig, PixelConfig, PixelWrite};
use super::register_client::RegisterClient;
use super::run_time_config::read_run_time_additions;
use super::sync_window::SyncWindow;
use super::transport::{CardControl, Transport};
use super::trigger::{TriggerController, TriggerTiming};

const RUN_CODE_REGISTER: &str = "EvrRunCode";
const DAQ_CODE_REGISTER: &str = "EvrDaqCode";
const RUN_DELAY_REGISTER: &str = "EvrRunTrigDelay";
const USE_PGP_EVR_REGISTER: &str = "UsePgpEvr";
const ASIC_MASK_REGISTER: &str = "AsicMask";

/// The steps of a configure cycle, in the order they run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FrontEndReset,
    Trigger,
    TopLevel,
    Asic,
    RunTimeAdditions,
    Readback,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::FrontEndReset,
        Stage::Trigger,
        Stage::TopLevel,
        Stage::Asic,
        Stage::RunTimeAdditions,
        Stage::Readback,
    ];

    pub fn bit(&self) -> u32 {
        1 << (*self as u32)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::FrontEndReset => "front end reset",
            Stage::Trigger => "trigger",
            Stage::TopLevel => "top level registers",
            Stage::Asic => "ASIC registers",
            Stage::RunTimeAdditions => "run time additions",
            Stage::Readback => "readback",
        }
    }
}

/// Outcome of a configure cycle as a bitmask, one bit per failed stage.
/// Zero is success; the FATAL sentinel means the front end could not be reached at all.
/// Results from several lanes combine with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigureResult(u32);

impl ConfigureResult {
    pub const FATAL: Self = Self(1 << 31);

    pub fn success() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn is_success(&self) -> bool {
        self.0 == 0
    }

    pub fn is_fatal(&self) -> bool {
        self.0 & Self::FATAL.0 != 0
    }

    pub fn stage_failed(&self, stage: Stage) -> bool {
        self.0 & stage.bit() != 0
    }

    pub fn mark(&mut self, stage: Stage) {
        self.0 |= stage.bit();
    }

    pub fn failed_stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|stage| self.stage_failed(*stage))
            .collect()
    }
}

impl BitOr for ConfigureResult {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ConfigureResult {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Display for ConfigureResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_success() {
            return write!(f, "success");
        }
        if self.is_fatal() {
            return write!(f, "fatal, front end unreachable");
        }
        let names: Vec<&str> = self.failed_stages().iter().map(|s| s.name()).collect();
        write!(f, "failed stages: {}", names.join(", "))
    }
}

/// Addresses of the front end control registers that sit outside the register table
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FrontEndMap {
    pub version: u32,
    pub reset: u32,
    pub run_trigger_enable: u32,
    pub reset_frame_counter: u32,
    pub reset_acq_counter: u32,
    pub adc_control: u32,
    pub adc_ack_mask: u32,
    pub adc_fail_mask: u32,
    pub monitor_enable: u32,
}

impl Default for FrontEndMap {
    fn default() -> Self {
        Self {
            version: 0x0,
            reset: 0x0,
            run_trigger_enable: 0x1,
            reset_frame_counter: 0xc,
            reset_acq_counter: 0x6,
            adc_control: 0x80,
            adc_ack_mask: 0x2,
            adc_fail_mask: 0x4,
            monitor_enable: 0x3e,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfiguratorSettings {
    /// Outstanding waiting writes allowed during pixel programming
    pub window_capacity: usize,
    pub timing: TriggerTiming,
    pub layout: AsicLayout,
    pub front_end: FrontEndMap,
    pub run_time_additions: Option<PathBuf>,
    pub mask_hw_errors: bool,
}

impl Default for ConfiguratorSettings {
    fn default() -> Self {
        Self {
            window_capacity: DEFAULT_WRITE_AHEAD,
            timing: TriggerTiming::default(),
            layout: AsicLayout::default(),
            front_end: FrontEndMap::default(),
            run_time_additions: None,
            mask_hw_errors: false,
        }
    }
}

/// The ASIC part of a configuration: one register block per ASIC (empty blocks are skipped),
/// an optional pixel map and optional calibration rows.
#[derive(Debug, Clone, Default)]
pub struct AsicProgram {
    pub blocks: Vec<Vec<u32>>,
    pub pixels: Option<PixelConfig>,
    pub calibration: Option<CalibrationConfig>,
}

/// Configurator runs the configure cycle for the front end on one lane.
///
/// The sequence is: front end reset (first cycle only), firmware version read, trigger timing,
/// counter resets, top level registers, ASIC registers with pixel and calibration row
/// programming and run time additions, and finally a readback of the registers and ASIC blocks. Register writes are bracketed by
/// disabling and re-enabling the run trigger. Each failed stage sets its bit in the
/// ConfigureResult. An unreadable version aborts the cycle with ConfigureResult::FATAL before
/// anything is written.
#[derive(Debug)]
pub struct Configurator<T: Transport, C: CardControl> {
    client: RegisterClient<T>,
    trigger: TriggerController<C>,
    destination: Destination,
    shadow: ConfigShadow,
    settings: ConfiguratorSettings,
    version: Option<u32>,
    /// ASIC register blocks as last written, corrected by readback
    asic_blocks: Vec<Vec<u32>>,
}

impl<T: Transport, C: CardControl> Configurator<T, C> {
    pub fn new(
        transport: T,
        card: C,
        lane: u8,
        mut shadow: ConfigShadow,
        settings: ConfiguratorSettings,
    ) -> Self {
        for (name, value) in [
            (RUN_CODE_REGISTER, settings.timing.run_code as u32),
            (DAQ_CODE_REGISTER, settings.timing.daq_code as u32),
            (RUN_DELAY_REGISTER, settings.timing.run_delay),
        ] {
            // tables without trigger registers keep the timing in settings only
            let _ = shadow.set(name, value);
        }
        let destination = Destination::new(lane, VirtualChannel::Registers);
        let client = RegisterClient::new(transport);
        client.mask_hw_errors(destination, settings.mask_hw_errors);
        Self {
            client,
            trigger: TriggerController::new(card, lane),
            destination,
            shadow,
            settings,
            version: None,
            asic_blocks: Vec::new(),
        }
    }

    pub fn lane(&self) -> u8 {
        self.destination.lane()
    }

    pub fn destination(&self) -> Destination {
        self.destination
    }

    pub fn shadow(&self) -> &ConfigShadow {
        &self.shadow
    }

    pub fn shadow_mut(&mut self) -> &mut ConfigShadow {
        &mut self.shadow
    }

    pub fn client(&self) -> &RegisterClient<T> {
        &self.client
    }

    pub fn trigger(&mut self) -> &mut TriggerController<C> {
        &mut self.trigger
    }

    pub fn settings(&self) -> &ConfiguratorSettings {
        &self.settings
    }

    /// Firmware version from the last successful configure
    pub fn version(&self) -> Option<u32> {
        self.version
    }

    /// ASIC register blocks from the last configure, with hardware values where readback
    /// disagreed. Skipped ASICs have empty blocks.
    pub fn asic_blocks(&self) -> &[Vec<u32>] {
        &self.asic_blocks
    }

    /// Run one configure cycle. `first` requests the front end reset.
    pub fn configure(&mut self, program: &AsicProgram, first: bool) -> ConfigureResult {
        let start = OffsetDateTime::now_utc();
        let mut result = ConfigureResult::success();
        spdlog::info!(
            "Configuring {} front end on {}{}",
            self.shadow.family(),
            self.destination,
            if first { " with reset" } else { "" }
        );

        if first {
            self.check_link();
            self.stage(&mut result, Stage::FrontEndReset, |c| c.reset_front_end());
        }

        match self.read_version() {
            Ok(version) => self.version = Some(version),
            Err(e) => {
                spdlog::error!("{} configure aborted: {e}", self.destination);
                return ConfigureResult::FATAL;
            }
        }

        self.stage(&mut result, Stage::Trigger, |c| c.configure_trigger());
        self.stage(&mut result, Stage::FrontEndReset, |c| {
            c.check_adc_alignment()
        });
        if !result.is_success() {
            spdlog::warn!(
                "{} skipping register writes after {}",
                self.destination,
                result
            );
            self.log_elapsed(start, result);
            return result;
        }

        self.stage(&mut result, Stage::TopLevel, |c| c.reset_sequence_count());
        self.stage(&mut result, Stage::TopLevel, |c| {
            c.with_run_trigger_masked(|c| c.write_config())
        });
        let mut additions_failed = false;
        self.stage(&mut result, Stage::Asic, |c| {
            c.with_run_trigger_masked(|c| {
                let asic = c.write_asic(program);
                if let Err(e) = c.load_run_time_additions() {
                    spdlog::error!(
                        "{} stage {} failed: {e}",
                        c.destination,
                        Stage::RunTimeAdditions.name()
                    );
                    additions_failed = true;
                }
                asic
            })
        });
        if additions_failed {
            result.mark(Stage::RunTimeAdditions);
        }
        self.stage(&mut result, Stage::Readback, |c| c.check_written_config());
        self.stage(&mut result, Stage::Readback, |c| c.check_written_asic());

        self.log_elapsed(start, result);
        result
    }

    fn stage<F>(&mut self, result: &mut ConfigureResult, stage: Stage, f: F)
    where
        F: FnOnce(&mut Self) -> Result<(), ConfiguratorError>,
    {
        if let Err(e) = f(self) {
            spdlog::error!("{} stage {} failed: {e}", self.destination, stage.name());
            result.mark(stage);
        }
    }

    fn log_elapsed(&self, start: OffsetDateTime, result: ConfigureResult) {
        let elapsed = OffsetDateTime::now_utc() - start;
        spdlog::info!(
            "{} configure finished in {:.3} s: {}",
            self.destination,
            elapsed.as_seconds_f64(),
            result
        );
    }

    fn check_link(&mut self) {
        match self.trigger.card_mut().link_bandwidth() {
            Ok(4) => (),
            Ok(bandwidth) => spdlog::warn!(
                "Card link bandwidth is {bandwidth}, the front end expects 4 lanes"
            ),
            Err(e) => spdlog::warn!("Could not read card link bandwidth: {e}"),
        }
    }

    /// Pulse the front end reset, wait for ADC alignment, and restore the monitor enable
    fn reset_front_end(&mut self) -> Result<(), ConfiguratorError> {
        let map = self.settings.front_end;
        let monitor = self.client.read_one(self.destination, map.monitor_enable)? & 1;
        self.client
            .write_register(self.destination, map.reset, 1, false)?;
        let mut adc = 0;
        for _ in 0..ADC_ACK_POLLS {
            adc = self.client.read_one(self.destination, map.adc_control)?;
            if adc & map.adc_ack_mask != 0 {
                break;
            }
        }
        if adc & map.adc_fail_mask != 0 {
            return Err(ConfiguratorError::AdcAlignment(self.destination, adc));
        }
        self.client
            .write_register(self.destination, map.monitor_enable, monitor, false)?;
        Ok(())
    }

    /// Read the firmware version, resetting the lane after each failed attempt
    fn read_version(&mut self) -> Result<u32, ConfiguratorError> {
        let address = self.settings.front_end.version;
        for attempt in 1..=VERSION_READ_TRIES {
            match self.client.read_one(self.destination, address) {
                Ok(version) => {
                    spdlog::info!("{} firmware version {version:#x}", self.destination);
                    return Ok(version);
                }
                Err(e) => {
                    spdlog::warn!(
                        "{} version read {attempt} of {VERSION_READ_TRIES} failed: {e}",
                        self.destination
                    );
                    let lane = self.lane();
                    self.trigger.card_mut().reset_lane(lane)?;
                }
            }
        }
        Err(ConfiguratorError::VersionUnreadable(
            self.destination,
            VERSION_READ_TRIES,
        ))
    }

    /// Trigger codes come from the shadow where the table has them, timeslots from settings
    fn effective_timing(&self) -> TriggerTiming {
        let mut timing = self.settings.timing.clone();
        if let Ok(code) = self.shadow.get(RUN_CODE_REGISTER) {
            timing.run_code = code as u8;
        }
        if let Ok(code) = self.shadow.get(DAQ_CODE_REGISTER) {
            timing.daq_code = code as u8;
        }
        if let Ok(delay) = self.shadow.get(RUN_DELAY_REGISTER) {
            timing.run_delay = delay;
        }
        timing
    }

    fn configure_trigger(&mut self) -> Result<(), ConfiguratorError> {
        if self.shadow.spec(USE_PGP_EVR_REGISTER).is_ok() {
            self.shadow.set(USE_PGP_EVR_REGISTER, 1)?;
        }
        let timing = self.effective_timing();
        self.trigger.configure_timing(&timing)?;
        Ok(())
    }

    fn check_adc_alignment(&mut self) -> Result<(), ConfiguratorError> {
        let map = self.settings.front_end;
        let adc = self.client.read_one(self.destination, map.adc_control)?;
        if adc & map.adc_fail_mask != 0 {
            return Err(ConfiguratorError::AdcAlignment(self.destination, adc));
        }
        Ok(())
    }

    fn reset_sequence_count(&mut self) -> Result<(), ConfiguratorError> {
        let map = self.settings.front_end;
        let lane = self.lane();
        self.trigger.card_mut().reset_sequence_count(lane)?;
        for address in [map.reset_frame_counter, map.reset_acq_counter] {
            self.client
                .write_register(self.destination, address, 1, false)?;
        }
        Ok(())
    }

    fn enable_run_trigger(&mut self, enable: bool) -> Result<(), ConfiguratorError> {
        let address = self.settings.front_end.run_trigger_enable;
        self.client
            .write_register(self.destination, address, enable as u32, false)?;
        let lane = self.lane();
        self.trigger.card_mut().mask_run_trigger(lane, !enable)?;
        Ok(())
    }

    /// Run `f` with the run trigger off, turning it back on whatever `f` returned
    fn with_run_trigger_masked<F>(&mut self, f: F) -> Result<(), ConfiguratorError>
    where
        F: FnOnce(&mut Self) -> Result<(), ConfiguratorError>,
    {
        self.enable_run_trigger(false)?;
        let result = f(self);
        self.enable_run_trigger(true)?;
        result
    }

    /// The ReadWrite fields packed into one word per register address, in table order.
    /// Each word starts from the shadow word of its first field, so fields sharing a word
    /// keep their neighbours' bits.
    fn packed_words(&self) -> Result<Vec<(u32, u32)>, ConfiguratorError> {
        let mut words: Vec<(u32, u32)> = Vec::new();
        for spec in self
            .shadow
            .registers()
            .iter()
            .filter(|spec| spec.access == AccessMode::ReadWrite)
        {
            let value = self.shadow.get(&spec.name)?;
            match words.iter().position(|(address, _)| *address == spec.address) {
                Some(idx) => words[idx].1 = spec.insert(words[idx].1, value),
                None => words.push((spec.address, self.shadow.word(&spec.name)?)),
            }
        }
        Ok(words)
    }

    /// Read each address once, however many fields live in it
    fn read_words(
        &self,
        addresses: impl Iterator<Item = u32>,
    ) -> Result<FxHashMap<u32, u32>, ConfiguratorError> {
        let mut words = FxHashMap::default();
        for address in addresses {
            if !words.contains_key(&address) {
                words.insert(address, self.client.read_one(self.destination, address)?);
            }
        }
        Ok(words)
    }

    /// Write every ReadWrite register word, and refresh every ReadOnly field from hardware
    fn write_config(&mut self) -> Result<(), ConfiguratorError> {
        for (address, word) in self.packed_words()? {
            self.client
                .write_register(self.destination, address, word, false)?;
        }
        let read_only: Vec<(String, u32)> = self
            .shadow
            .registers()
            .iter()
            .filter(|spec| spec.access == AccessMode::ReadOnly)
            .map(|spec| (spec.name.clone(), spec.address))
            .collect();
        let hardware = self.read_words(read_only.iter().map(|(_, address)| *address))?;
        for (name, address) in read_only {
            let spec = self.shadow.spec(&name)?;
            let value = spec.extract(hardware[&address]);
            self.shadow.set(&name, value)?;
        }
        Ok(())
    }

    fn asic_mask(&self) -> u32 {
        let all = self.settings.layout.all_asics();
        self.shadow.get(ASIC_MASK_REGISTER).unwrap_or(all) & all
    }

    /// Block write each enabled ASIC's registers, then program the pixels and calibration rows
    fn write_asic(&mut self, program: &AsicProgram) -> Result<(), ConfiguratorError> {
        let layout = self.settings.layout.clone();
        let asic_mask = self.asic_mask();
        self.asic_blocks = vec![Vec::new(); layout.number_of_asics as usize];
        for (asic, block) in program
            .blocks
            .iter()
            .enumerate()
            .take(layout.number_of_asics as usize)
        {
            if !asic_enabled(asic_mask, asic as u8) || block.is_empty() {
                continue;
            }
            let address = layout.asic_address(asic as u8, layout.block_offset);
            self.client
                .write_register_block(self.destination, address, block, false)?;
            self.asic_blocks[asic] = block.clone();
        }

        let mut writes = Vec::new();
        if let Some(pixels) = &program.pixels {
            writes.extend(self.prepare_matrix(pixels, asic_mask)?);
        }
        if let Some(calibration) = &program.calibration {
            let rows = calibration.plan(&layout, asic_mask);
            spdlog::info!(
                "{} calibration rows, {} pixels",
                self.destination,
                rows.len()
            );
            writes.extend(rows);
        }
        if !writes.is_empty() {
            self.write_pixels(&writes)?;
        }
        Ok(())
    }

    /// Set the whole matrix to the dominant value and return the pixels that still differ
    fn prepare_matrix(
        &self,
        pixels: &PixelConfig,
        asic_mask: u32,
    ) -> Result<Vec<PixelWrite>, ConfiguratorError> {
        let layout = &self.settings.layout;
        let plan = pixels.plan(layout, asic_mask);
        spdlog::info!(
            "{} pixel map dominant value {}, {} individual pixels",
            self.destination,
            plan.dominant,
            plan.writes.len()
        );
        let enabled = (0..layout.number_of_asics).filter(|asic| asic_enabled(asic_mask, *asic));
        for asic in enabled.clone() {
            self.client.write_register(
                self.destination,
                layout.asic_address(asic, layout.prepare_multi_config),
                0,
                false,
            )?;
        }
        for asic in enabled {
            self.client.write_register(
                self.destination,
                layout.asic_address(asic, layout.whole_matrix),
                plan.dominant as u32,
                false,
            )?;
        }
        Ok(plan.writes)
    }

    /// Write pixels one by one as row, column and value triples through a SyncWindow
    fn write_pixels(&self, writes: &[PixelWrite]) -> Result<(), ConfiguratorError> {
        let layout = &self.settings.layout;
        let mut window = SyncWindow::new(
            &self.client,
            self.destination,
            self.settings.window_capacity,
        );
        for pixel in writes.iter() {
            let triple = [
                (layout.row_counter, pixel.row),
                (layout.col_counter, pixel.column_word(layout)),
                (layout.pixel_data, pixel.value as u32),
            ];
            for (register, value) in triple {
                window.take()?;
                self.client.write_register(
                    self.destination,
                    layout.asic_address(pixel.asic, register),
                    value,
                    true,
                )?;
            }
        }
        window.clear()?;
        Ok(())
    }

    fn load_run_time_additions(&self) -> Result<(), ConfiguratorError> {
        let path = match &self.settings.run_time_additions {
            Some(path) => path,
            None => return Ok(()),
        };
        let writes = match read_run_time_additions(path) {
            Ok(writes) => writes,
            Err(RunTimeConfigError::BadFilePath(p)) => {
                spdlog::warn!("Run time config {p:?} not found, skipping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let mut failures = 0;
        for write in writes.iter() {
            spdlog::info!(
                "Run time config: {} address {:#x} data {:#x}",
                write.destination,
                write.address,
                write.data
            );
            if let Err(e) =
                self.client
                    .write_register(write.destination, write.address, write.data, false)
            {
                spdlog::error!("Run time config write failed: {e}");
                failures += 1;
            }
        }
        if failures > 0 {
            return Err(ConfiguratorError::RunTimeWrites(self.destination, failures));
        }
        Ok(())
    }

    /// Read back every ReadWrite register. Hardware wins: mismatches are copied into the shadow
    /// and reported.
    fn check_written_config(&mut self) -> Result<(), ConfiguratorError> {
        let read_write: Vec<_> = self
            .shadow
            .registers()
            .iter()
            .filter(|spec| spec.access == AccessMode::ReadWrite)
            .collect();
        let words = self.read_words(read_write.iter().map(|spec| spec.address))?;
        let mut corrections = Vec::new();
        for spec in read_write {
            let hardware = spec.extract(words[&spec.address]);
            let configured = self.shadow.get(&spec.name)?;
            if hardware != configured {
                spdlog::warn!(
                    "{} register {} read back {hardware:#x}, configured {configured:#x}",
                    self.destination,
                    spec.name
                );
                corrections.push((spec.name.clone(), hardware));
            }
        }
        if corrections.is_empty() {
            return Ok(());
        }
        let count = corrections.len();
        for (name, value) in corrections {
            self.shadow.set(&name, value)?;
        }
        Err(ConfiguratorError::ReadbackMismatch(self.destination, count))
    }

    /// Read back every written ASIC block. Hardware wins here too: a disagreeing block is
    /// replaced by what the ASIC returned.
    fn check_written_asic(&mut self) -> Result<(), ConfiguratorError> {
        let layout = &self.settings.layout;
        let mut mismatched = 0;
        for (asic, block) in self.asic_blocks.iter_mut().enumerate() {
            if block.is_empty() {
                continue;
            }
            let address = layout.asic_address(asic as u8, layout.block_offset);
            let hardware =
                self.client
                    .read_register(self.destination, address, block.len() as u32)?;
            if hardware != *block {
                spdlog::warn!(
                    "{} ASIC {} block at {:#x} read back {:x?}, configured {:x?}",
                    self.destination,
                    asic,
                    address,
                    hardware,
                    block
                );
                *block = hardware;
                mismatched += 1;
            }
        }
        if mismatched > 0 {
            return Err(ConfiguratorError::AsicReadbackMismatch(
                self.destination,
                mismatched,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_shadow::{DisplayKind, RegisterSpec, RegisterTable};
    use crate::sim::{SimCard, SimFrontEnd, SimTransport};

    fn configurator(sim: &SimFrontEnd, lane: u8) -> Configurator<SimTransport, SimCard> {
        let shadow = ConfigShadow::load(None).unwrap();
        Configurator::new(
            sim.transport(),
            sim.card(),
            lane,
            shadow,
            ConfiguratorSettings::default(),
        )
    }

    #[test]
    fn test_result_bits() {
        let mut result = ConfigureResult::success();
        assert!(result.is_success());
        result.mark(Stage::Readback);
        assert_eq!(result.bits(), 1 << 5);
        let combined = result | ConfigureResult::from_bits(Stage::Trigger.bit());
        assert_eq!(
            combined.failed_stages(),
            vec![Stage::Trigger, Stage::Readback]
        );
        assert!(!combined.is_fatal());
        assert!(ConfigureResult::FATAL.is_fatal());
        assert_eq!(format!("{}", ConfigureResult::success()), "success");
    }

    #[test]
    fn test_configure_writes_shadow() {
        let sim = SimFrontEnd::new();
        let mut config = configurator(&sim, 1);
        config.shadow_mut().set("AcqToAsicR0Delay", 1234).unwrap();
        config.shadow_mut().set("AsicMask", 0x3).unwrap();
        sim.preset(config.destination(), 0x30, 0xcafe);

        let result = config.configure(&AsicProgram::default(), true);
        assert!(result.is_success(), "{result}");

        let destination = config.destination();
        let state = sim.state();
        for spec in config
            .shadow()
            .registers()
            .iter()
            .filter(|s| s.access == AccessMode::ReadWrite)
        {
            let hardware = state
                .registers
                .get(&(destination, spec.address))
                .copied()
                .unwrap_or(0);
            assert_eq!(
                spec.extract(hardware),
                config.shadow().get(&spec.name).unwrap(),
                "{}",
                spec.name
            );
        }
        assert_eq!(config.shadow().get("AcqToAsicR0Delay").unwrap(), 1234);
        // ReadOnly registers are refreshed from hardware
        assert_eq!(config.shadow().get("DigitalCardId0").unwrap(), 0xcafe);
        assert!(config.version().is_some());
        // run trigger was left on
        assert!(!state.lanes[1].run_trigger_masked);
        assert_eq!(state.registers.get(&(destination, 0x1)), Some(&1));
        assert_eq!(state.lanes[1].sequence_resets, 1);
        assert_eq!(state.lanes[1].run_code, 40);
    }

    #[test]
    fn test_shared_address_fields_are_packed() {
        let field = |name: &str, address, byte_offset, shift, default, access| RegisterSpec {
            name: String::from(name),
            address,
            byte_offset,
            shift,
            mask: 0xff,
            default,
            access,
            display: DisplayKind::Hex,
        };
        let mut id = field("CardId", 0x30, 8, 4, 0, AccessMode::ReadOnly);
        id.mask = 0xf;
        let table = RegisterTable {
            family: String::from("packed"),
            registers: vec![
                field("Low", 0x29, 0, 0, 0x12, AccessMode::ReadWrite),
                // same address, kept in a separate shadow word
                field("High", 0x29, 4, 8, 0x34, AccessMode::ReadWrite),
                id,
            ],
        };
        let sim = SimFrontEnd::new();
        let shadow = ConfigShadow::new(table).unwrap();
        let mut config = Configurator::new(
            sim.transport(),
            sim.card(),
            0,
            shadow,
            ConfiguratorSettings::default(),
        );
        let destination = config.destination();
        sim.preset(destination, 0x30, 0xab);

        let result = config.configure(&AsicProgram::default(), false);
        assert!(result.is_success(), "{result}");
        let state = sim.state();
        assert_eq!(state.registers.get(&(destination, 0x29)), Some(&0x3412));
        let writes = state
            .writes
            .iter()
            .filter(|(d, address, _)| *d == destination && *address == 0x29)
            .count();
        assert_eq!(writes, 1);
        assert_eq!(config.shadow().get("CardId").unwrap(), 0xa);
        assert_eq!(config.shadow().get("High").unwrap(), 0x34);
    }

    #[test]
    fn test_asic_readback_corrects_blocks() {
        let sim = SimFrontEnd::new();
        let layout = AsicLayout::default();
        sim.state()
            .faults
            .stuck_values
            .insert(layout.asic_address(2, layout.block_offset), 9);
        let mut config = configurator(&sim, 0);
        let program = AsicProgram {
            blocks: vec![vec![1, 2], vec![3], vec![4], Vec::new()],
            ..Default::default()
        };
        let result = config.configure(&program, false);
        assert_eq!(result.failed_stages(), vec![Stage::Readback]);
        assert_eq!(config.asic_blocks()[0], vec![1, 2]);
        assert_eq!(config.asic_blocks()[2], vec![9]);
        assert!(config.asic_blocks()[3].is_empty());
    }

    #[test]
    fn test_masked_asic_blocks_are_not_read_back() {
        let sim = SimFrontEnd::new();
        let layout = AsicLayout::default();
        sim.state()
            .faults
            .stuck_values
            .insert(layout.asic_address(1, layout.block_offset), 9);
        let mut config = configurator(&sim, 0);
        config.shadow_mut().set("AsicMask", 0x1).unwrap();
        let program = AsicProgram {
            blocks: vec![vec![1], vec![3]],
            ..Default::default()
        };
        let result = config.configure(&program, false);
        assert!(result.is_success(), "{result}");
        assert!(config.asic_blocks()[1].is_empty());
    }

    #[test]
    fn test_calibration_rows_use_the_window() {
        let sim = SimFrontEnd::new();
        let mut config = configurator(&sim, 0);
        config.shadow_mut().set("AsicMask", 0x5).unwrap();
        let layout = AsicLayout::default();
        let program = AsicProgram {
            calibration: Some(CalibrationConfig::uniform(layout.cols, 2)),
            ..Default::default()
        };
        let result = config.configure(&program, false);
        assert!(result.is_success(), "{result}");

        let destination = config.destination();
        let state = sim.state();
        for asic in [0, 2] {
            let pixel_writes = state
                .writes
                .iter()
                .filter(|(_, address, value)| {
                    *address == layout.asic_address(asic, layout.pixel_data) && *value == 2
                })
                .count();
            assert_eq!(pixel_writes, 192);
            assert_eq!(
                state
                    .registers
                    .get(&(destination, layout.asic_address(asic, layout.row_counter))),
                Some(&176)
            );
        }
        assert!(!state
            .writes
            .iter()
            .any(|(_, address, _)| *address == layout.asic_address(1, layout.pixel_data)));
        // no whole matrix write without a pixel map
        assert!(!state
            .writes
            .iter()
            .any(|(_, address, _)| *address == layout.asic_address(0, layout.whole_matrix)));
        drop(state);
        assert!(config.client().receive().unwrap().is_none());
    }

    #[test]
    fn test_readback_mismatch_corrects_shadow() {
        let sim = SimFrontEnd::new();
        sim.state().faults.stuck_values.insert(0x20, 999);
        let mut config = configurator(&sim, 0);
        let result = config.configure(&AsicProgram::default(), false);
        assert!(result.stage_failed(Stage::Readback));
        assert!(!result.stage_failed(Stage::TopLevel));
        assert_eq!(config.shadow().get("AcqToAsicR0Delay").unwrap(), 999);
    }

    #[test]
    fn test_unreadable_version_is_fatal() {
        let sim = SimFrontEnd::new();
        sim.state().faults.timeout_reads.insert(0x0, VERSION_READ_TRIES);
        let mut config = configurator(&sim, 2);
        let result = config.configure(&AsicProgram::default(), false);
        assert_eq!(result, ConfigureResult::FATAL);
        let state = sim.state();
        assert!(state.writes.is_empty());
        assert_eq!(state.lanes[2].resets, VERSION_READ_TRIES);
    }

    #[test]
    fn test_version_recovers_after_reset() {
        let sim = SimFrontEnd::new();
        sim.state().faults.timeout_reads.insert(0x0, 2);
        sim.preset(Destination::new(0, VirtualChannel::Registers), 0x0, 0x1234);
        let mut config = configurator(&sim, 0);
        let result = config.configure(&AsicProgram::default(), false);
        assert!(!result.is_fatal());
        assert_eq!(config.version(), Some(0x1234));
        assert_eq!(sim.state().lanes[0].resets, 2);
    }

    #[test]
    fn test_bad_timing_skips_writes() {
        let sim = SimFrontEnd::new();
        let shadow = ConfigShadow::load(None).unwrap();
        let mut settings = ConfiguratorSettings::default();
        settings.timing.daq_code = 41;
        settings.timing.timeslots.insert(41, 500);
        let mut config = Configurator::new(sim.transport(), sim.card(), 0, shadow, settings);
        let result = config.configure(&AsicProgram::default(), false);
        assert!(result.stage_failed(Stage::Trigger));
        assert!(sim.state().writes.is_empty());
    }

    #[test]
    fn test_pixels_use_the_window() {
        let sim = SimFrontEnd::new();
        let mut config = configurator(&sim, 0);
        let layout = AsicLayout::default();
        let mut pixels = PixelConfig::uniform(layout.rows, layout.cols, 3);
        for col in 0..10 {
            pixels.set(300, col, 7);
        }
        let program = AsicProgram {
            blocks: vec![vec![1, 2, 3], Vec::new(), vec![4], vec![5]],
            pixels: Some(pixels),
            calibration: None,
        };
        let result = config.configure(&program, false);
        assert!(result.is_success(), "{result}");

        let destination = config.destination();
        let state = sim.state();
        let asic3 = |register| layout.asic_address(3, register);
        assert_eq!(
            state.registers.get(&(destination, layout.asic_address(0, layout.block_offset) + 2)),
            Some(&3)
        );
        assert_eq!(
            state.registers.get(&(destination, asic3(layout.whole_matrix))),
            Some(&3)
        );
        let pixel_writes = state
            .writes
            .iter()
            .filter(|(_, address, _)| *address == asic3(layout.pixel_data))
            .count();
        assert_eq!(pixel_writes, 10);
        // all acknowledgments were drained
        drop(state);
        assert!(config.client().receive().unwrap().is_none());
    }

    #[test]
    fn test_run_time_additions() {
        let sim = SimFrontEnd::new();
        let path = std::env::temp_dir().join("pgp_daq_run_time_additions_test.txt");
        std::fs::write(&path, "# extra\n1 0x44 0x99\n").unwrap();
        let shadow = ConfigShadow::load(None).unwrap();
        let settings = ConfiguratorSettings {
            run_time_additions: Some(path.clone()),
            ..Default::default()
        };
        let mut config = Configurator::new(sim.transport(), sim.card(), 0, shadow, settings);
        let result = config.configure(&AsicProgram::default(), false);
        std::fs::remove_file(&path).unwrap();
        assert!(result.is_success(), "{result}");
        let destination = Destination::from_code(1);
        assert_eq!(sim.state().registers.get(&(destination, 0x44)), Some(&0x99));
    }
}
