use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::constants::BYTES_PER_WORD;
use super::error::ShadowError;

/// Load the bundled register table for windows
#[cfg(target_family = "windows")]
fn load_default_table() -> String {
    String::from(include_str!("data\\epix10ka_registers.yml"))
}

/// Load the bundled register table for macos and linux
#[cfg(target_family = "unix")]
fn load_default_table() -> String {
    String::from(include_str!("data/epix10ka_registers.yml"))
}

/// How configure treats a register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// Written to hardware, then verified by readback
    ReadWrite,
    /// Read from hardware into the shadow
    ReadOnly,
    /// Used by software only, never touches hardware
    UseOnly,
    DoNotUse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DisplayKind {
    #[default]
    Decimal,
    Hex,
    Selection,
}

/// One named field of the register set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSpec {
    pub name: String,
    /// Front end register address
    pub address: u32,
    /// Location of the containing word in the shadow
    pub byte_offset: u32,
    #[serde(default)]
    pub shift: u32,
    pub mask: u32,
    #[serde(default)]
    pub default: u32,
    pub access: AccessMode,
    #[serde(default)]
    pub display: DisplayKind,
}

impl RegisterSpec {
    fn word_index(&self) -> usize {
        self.byte_offset as usize / BYTES_PER_WORD
    }

    pub fn extract(&self, word: u32) -> u32 {
        (word >> self.shift) & self.mask
    }

    pub fn insert(&self, word: u32, value: u32) -> u32 {
        (word & !(self.mask << self.shift)) | ((value & self.mask) << self.shift)
    }
}

/// A per detector family register table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterTable {
    pub family: String,
    pub registers: Vec<RegisterSpec>,
}

impl RegisterTable {
    /// Load a register table from a YAML file.
    /// If the path is None, we load the default that is bundled with the library
    pub fn load(path: Option<&Path>) -> Result<Self, ShadowError> {
        let contents = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(ShadowError::BadFilePath(p.to_path_buf()));
                }
                std::fs::read_to_string(p)?
            }
            None => load_default_table(),
        };
        Ok(serde_yaml::from_str::<Self>(&contents)?)
    }
}

/// ConfigShadow mirrors a detector's register set in memory.
///
/// Values live in words addressed by each register's byte offset, so several fields can share a
/// word at different shifts. Configure writes the shadow out, and readback corrections are
/// written back into it.
#[derive(Debug, Clone)]
pub struct ConfigShadow {
    family: String,
    specs: Vec<RegisterSpec>,
    words: Vec<u32>,
    index: FxHashMap<String, usize>,
}

impl ConfigShadow {
    /// Build a shadow holding each register's default value
    pub fn new(table: RegisterTable) -> Result<Self, ShadowError> {
        let mut index = FxHashMap::default();
        let mut word_count = 0;
        for (idx, spec) in table.registers.iter().enumerate() {
            if spec.byte_offset as usize % BYTES_PER_WORD != 0 {
                return Err(ShadowError::MisalignedOffset(
                    spec.name.clone(),
                    spec.byte_offset,
                ));
            }
            if spec.shift >= u32::BITS {
                return Err(ShadowError::BadShift(spec.name.clone(), spec.shift));
            }
            if index.insert(spec.name.clone(), idx).is_some() {
                return Err(ShadowError::DuplicateRegister(spec.name.clone()));
            }
            word_count = word_count.max(spec.word_index() + 1);
        }
        let mut shadow = Self {
            family: table.family,
            specs: table.registers,
            words: vec![0; word_count],
            index,
        };
        shadow.reset_defaults();
        Ok(shadow)
    }

    /// Shadow for the bundled or a user supplied table
    pub fn load(path: Option<&Path>) -> Result<Self, ShadowError> {
        Self::new(RegisterTable::load(path)?)
    }

    pub fn reset_defaults(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
        for spec in self.specs.iter() {
            let idx = spec.word_index();
            self.words[idx] = spec.insert(self.words[idx], spec.default);
        }
    }

    pub fn spec(&self, name: &str) -> Result<&RegisterSpec, ShadowError> {
        self.index
            .get(name)
            .map(|idx| &self.specs[*idx])
            .ok_or_else(|| ShadowError::UnknownRegister(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Result<u32, ShadowError> {
        let spec = self.spec(name)?;
        Ok(spec.extract(self.words[spec.word_index()]))
    }

    /// Store a value; bits outside the register's mask are dropped
    pub fn set(&mut self, name: &str, value: u32) -> Result<(), ShadowError> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| ShadowError::UnknownRegister(name.to_string()))?;
        let spec = &self.specs[idx];
        let word = spec.word_index();
        self.words[word] = spec.insert(self.words[word], value);
        Ok(())
    }

    /// The whole shadow word holding a register, neighbouring fields included
    pub fn word(&self, name: &str) -> Result<u32, ShadowError> {
        let spec = self.spec(name)?;
        Ok(self.words[spec.word_index()])
    }

    pub fn offset(&self, name: &str) -> Result<u32, ShadowError> {
        Ok(self.spec(name)?.byte_offset)
    }

    pub fn access_mode(&self, name: &str) -> Result<AccessMode, ShadowError> {
        Ok(self.spec(name)?.access)
    }

    /// Registers in table order
    pub fn registers(&self) -> &[RegisterSpec] {
        &self.specs
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// The value formatted the way the register wants to be displayed
    pub fn display(&self, name: &str) -> Result<String, ShadowError> {
        let spec = self.spec(name)?;
        let value = self.get(name)?;
        Ok(match spec.display {
            DisplayKind::Hex => format!("{value:#x}"),
            _ => format!("{value}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let shadow = match ConfigShadow::load(None) {
            Ok(s) => s,
            Err(e) => panic!("{e}"),
        };
        assert_eq!(shadow.family(), "epix10ka");
        assert_eq!(shadow.get("EvrRunCode").unwrap(), 40);
        assert_eq!(shadow.get("AsicMask").unwrap(), 0xf);
        assert_eq!(shadow.access_mode("Version").unwrap(), AccessMode::ReadOnly);
        assert_eq!(shadow.offset("AsicMask").unwrap(), 116);
        assert_eq!(shadow.display("AsicMask").unwrap(), "0xf");
        assert!(matches!(
            shadow.get("NoSuchRegister"),
            Err(ShadowError::UnknownRegister(_))
        ));
    }

    #[test]
    fn test_set_respects_mask_and_neighbours() {
        let mut shadow = ConfigShadow::load(None).unwrap();
        // AsicGR and AsicGRControl share one word
        shadow.set("AsicGRControl", 1).unwrap();
        shadow.set("AsicGR", 0).unwrap();
        assert_eq!(shadow.get("AsicGRControl").unwrap(), 1);
        assert_eq!(shadow.get("AsicGR").unwrap(), 0);

        shadow.set("AsicMask", 0x1234).unwrap();
        assert_eq!(shadow.get("AsicMask").unwrap(), 0x4);
    }

    #[test]
    fn test_duplicate_register() {
        let spec = RegisterSpec {
            name: String::from("A"),
            address: 0,
            byte_offset: 0,
            shift: 0,
            mask: 0xff,
            default: 0,
            access: AccessMode::ReadWrite,
            display: DisplayKind::Decimal,
        };
        let table = RegisterTable {
            family: String::from("test"),
            registers: vec![spec.clone(), spec],
        };
        assert!(matches!(
            ConfigShadow::new(table),
            Err(ShadowError::DuplicateRegister(_))
        ));
    }
}
