use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::config_shadow::ConfigShadow;
use super::configurator::{AsicProgram, ConfiguratorSettings, FrontEndMap};
use super::constants::{ADDRESS_MASK, DEFAULT_WRITE_AHEAD};
use super::error::{ConfigError, ShadowError};
use super::pixel_map::{AsicLayout, CalibrationConfig, PixelConfig};
use super::reassembler::QuadGeometry;
use super::trigger::TriggerTiming;

/// Debug mask bit that turns on debug level logging
pub const DEBUG_VERBOSE: u32 = 1 << 0;

/// One pixel that differs from the default pixel value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelOverride {
    pub row: usize,
    pub col: usize,
    pub value: u8,
}

/// Structure representing the application configuration. Contains the hardware, register and
/// readout settings for every lane.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// DMA device; None uses the simulated front end
    pub device_path: Option<PathBuf>,
    pub lanes: Vec<u8>,
    pub lane_offset: u8,
    pub debug_mask: u32,
    pub mask_hw_errors: bool,
    /// Register table; None uses the bundled epix10ka table
    pub register_map_path: Option<PathBuf>,
    pub run_time_config_path: Option<PathBuf>,
    pub window_capacity: usize,
    pub timing: TriggerTiming,
    pub layout: AsicLayout,
    pub front_end: FrontEndMap,
    /// Values loaded into the shadow on top of the table defaults
    pub registers: BTreeMap<String, u32>,
    pub asic_blocks: Vec<Vec<u32>>,
    /// None skips pixel programming
    pub pixel_default: Option<u8>,
    pub pixel_overrides: Vec<PixelOverride>,
    /// None skips the calibration rows
    pub calibration_default: Option<u8>,
    /// Rows are 0 (upper ASICs) and 1 (lower ASICs)
    #[serde(default)]
    pub calibration_overrides: Vec<PixelOverride>,
    pub geometry: QuadGeometry,
    pub recording_paths: Vec<PathBuf>,
    pub hdf_path: PathBuf,
}

impl Default for Config {
    /// Generate a new Config object: one simulated lane, bundled registers, default geometry
    fn default() -> Self {
        Self {
            device_path: None,
            lanes: vec![0],
            lane_offset: 0,
            debug_mask: 0,
            mask_hw_errors: false,
            register_map_path: None,
            run_time_config_path: None,
            window_capacity: DEFAULT_WRITE_AHEAD,
            timing: TriggerTiming::default(),
            layout: AsicLayout::default(),
            front_end: FrontEndMap::default(),
            registers: BTreeMap::new(),
            asic_blocks: Vec::new(),
            pixel_default: None,
            pixel_overrides: Vec::new(),
            calibration_default: None,
            calibration_overrides: Vec::new(),
            geometry: QuadGeometry::default(),
            recording_paths: Vec::new(),
            hdf_path: PathBuf::from("None"),
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        std::fs::write(config_path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Check the lane list against the lane offset, and that every ASIC register fits the
    /// address space
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lanes.is_empty() {
            return Err(ConfigError::NoLanes);
        }
        for lane in self.lanes.iter() {
            if *lane < self.lane_offset {
                return Err(ConfigError::LaneBelowOffset(*lane, self.lane_offset));
            }
        }
        let layout = &self.layout;
        if layout.number_of_asics as u32 > u32::BITS {
            return Err(ConfigError::TooManyAsics(layout.number_of_asics, u32::BITS));
        }
        if let Some(last) = layout.number_of_asics.checked_sub(1) {
            let highest = [
                layout.block_offset,
                layout.prepare_multi_config,
                layout.whole_matrix,
                layout.row_counter,
                layout.col_counter,
                layout.pixel_data,
            ]
            .into_iter()
            .max()
            .unwrap_or(0);
            let fits = layout
                .asic_stride
                .checked_mul(last as u32)
                .and_then(|offset| offset.checked_add(layout.asic_base))
                .and_then(|base| base.checked_add(highest))
                .is_some_and(|address| address <= ADDRESS_MASK);
            if !fits {
                return Err(ConfigError::AsicAddressRange(highest, last));
            }
        }
        Ok(())
    }

    pub fn is_simulated(&self) -> bool {
        self.device_path.is_none()
    }

    pub fn is_verbose(&self) -> bool {
        self.debug_mask & DEBUG_VERBOSE != 0
    }

    pub fn settings(&self) -> ConfiguratorSettings {
        ConfiguratorSettings {
            window_capacity: self.window_capacity,
            timing: self.timing.clone(),
            layout: self.layout.clone(),
            front_end: self.front_end,
            run_time_additions: self.run_time_config_path.clone(),
            mask_hw_errors: self.mask_hw_errors,
        }
    }

    /// The register table with this config's values applied
    pub fn load_shadow(&self) -> Result<ConfigShadow, ShadowError> {
        let mut shadow = ConfigShadow::load(self.register_map_path.as_deref())?;
        for (name, value) in self.registers.iter() {
            shadow.set(name, *value)?;
        }
        Ok(shadow)
    }

    pub fn asic_program(&self) -> AsicProgram {
        let pixels = self.pixel_default.map(|value| {
            let mut pixels = PixelConfig::uniform(self.layout.rows, self.layout.cols, value);
            for pixel in self.pixel_overrides.iter() {
                pixels.set(pixel.row, pixel.col, pixel.value);
            }
            pixels
        });
        let calibration = self.calibration_default.map(|value| {
            let mut calibration = CalibrationConfig::uniform(self.layout.cols, value);
            for pixel in self.calibration_overrides.iter() {
                calibration.set(pixel.row, pixel.col, pixel.value);
            }
            calibration
        });
        AsicProgram {
            blocks: self.asic_blocks.clone(),
            pixels,
            calibration,
        }
    }
}
