//! Patch configuration.
//!
//! Everything the patcher needs to know about a firmware build: where it is
//! loaded, how much free space to look for, and the table of prompt slots.
//! Built once (from the defaults or a JSON file), validated, then passed by
//! reference.

use crate::address::AddressTranslator;
use crate::error::{Error, Result};
use crate::fixup::{prompt_sample_rate_patch, BytePatch};
use crate::plan::PatchTarget;
use crate::scanner::ScannerConfig;

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Load address of the firmware image.
pub const DEFAULT_BASE_ADDRESS: u32 = 0x3C00_0000;
/// Payload alignment.
pub const DEFAULT_ALIGN: usize = 4;
/// Minimum free run searched for.
pub const DEFAULT_MIN_EMPTY_SPACE: usize = 1024 * 1024;
/// Distance kept from whatever precedes the free run.
pub const DEFAULT_SAFETY_MARGIN: usize = 24;
/// First byte of every SBC frame.
pub const SBC_SYNCWORD: u8 = 0x9C;

/// Configuration for a patch run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Virtual address of file offset 0.
    pub base_address: u32,
    /// Alignment applied to the cursor after each payload.
    pub align: usize,
    /// Minimum number of consecutive empty bytes.
    pub min_empty_space: usize,
    /// Offset from the start of the empty run to the first payload.
    pub safety_margin: usize,
    /// Required first byte of each payload.
    pub sync_byte: u8,
    /// Prompt slots to patch.
    pub targets: Vec<PatchTarget>,
    /// Verification patches applied after all targets.
    pub byte_patches: Vec<BytePatch>,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            base_address: DEFAULT_BASE_ADDRESS,
            align: DEFAULT_ALIGN,
            min_empty_space: DEFAULT_MIN_EMPTY_SPACE,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            sync_byte: SBC_SYNCWORD,
            targets: default_targets(),
            byte_patches: vec![prompt_sample_rate_patch()],
        }
    }
}

impl PatchConfig {
    /// Load a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Parse and validate a configuration from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check internal consistency. Addresses are checked against a concrete
    /// image later, in [`crate::plan::PatchPlan::new`].
    pub fn validate(&self) -> Result<()> {
        if !self.align.is_power_of_two() {
            return Err(Error::Config(format!(
                "align must be a non-zero power of two, got {}",
                self.align
            )));
        }
        if self.min_empty_space == 0 {
            return Err(Error::Config("min_empty_space must be non-zero".into()));
        }
        if self.safety_margin >= self.min_empty_space {
            return Err(Error::Config(format!(
                "safety_margin ({}) must be smaller than min_empty_space ({})",
                self.safety_margin, self.min_empty_space
            )));
        }

        let mut names: Vec<&str> = self.targets.iter().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(Error::Config(format!("duplicate target: {}", dup[0])));
        }

        for patch in &self.byte_patches {
            patch.expected()?;
            patch.replacement()?;
        }
        Ok(())
    }

    pub fn translator(&self) -> AddressTranslator {
        AddressTranslator::new(self.base_address)
    }

    pub fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            min_len: self.min_empty_space,
            safety_margin: self.safety_margin,
        }
    }
}

/// Prompt slots of the stock firmware.
fn default_targets() -> Vec<PatchTarget> {
    [
        ("ID_00.wav", 0x3C0D_1A8C, 0x3C0D_1C54),
        ("ID_01.wav", 0x3C0D_1B8C, 0x3C0D_1C98),
        ("ID_13.wav", 0x3C0D_1A6C, 0x3C0D_1C4C),
        ("ID_15.wav", 0x3C0D_1A5C, 0x3C0D_1C48),
        ("ID_23.wav", 0x3C0D_1A38, 0x3C0D_1C40),
        ("ID_29.wav", 0x3C0D_1A7C, 0x3C0D_1C50),
        ("ID_37.wav", 0x3C0D_1BB0, 0x3C0D_1CAC),
        ("ID_38.wav", 0x3C0D_1ABC, 0x3C0D_1C60),
        ("ID_40.wav", 0x3C0D_1AAC, 0x3C0D_1C5C),
        ("ID_41.wav", 0x3C0D_1A9C, 0x3C0D_1C58),
        ("ID_42.wav", 0x3C0D_1BF2, 0x3C0D_1CBC),
    ]
    .into_iter()
    .map(|(name, size_instr_addr, ptr_pool_addr)| PatchTarget::new(name, size_instr_addr, ptr_pool_addr))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = PatchConfig::default();
        config.validate().unwrap();
        assert_eq!(config.targets.len(), 11);
        assert_eq!(config.byte_patches.len(), 1);
        assert_eq!(config.translator().base(), 0x3C00_0000);
    }

    #[test]
    fn test_json_defaults_fill_in() {
        let config = PatchConfig::from_json_str(
            r#"{ "targets": [ { "name": "ID_05.wav", "size_instr_addr": 1006632968, "ptr_pool_addr": 1006632972 } ] }"#,
        )
        .unwrap();
        assert_eq!(config.base_address, DEFAULT_BASE_ADDRESS);
        assert_eq!(config.align, 4);
        assert_eq!(config.targets.len(), 1);
        assert_eq!(config.targets[0].size_instr_addr, 0x3C00_0008);
        assert_eq!(config.byte_patches.len(), 1);
    }

    #[test]
    fn test_json_round_trip() {
        let config = PatchConfig::default();
        let back = PatchConfig::from_json_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(back.targets, config.targets);
        assert_eq!(back.byte_patches, config.byte_patches);
    }

    #[test]
    fn test_rejects_bad_align() {
        let config = PatchConfig {
            align: 3,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_margin_past_threshold() {
        let config = PatchConfig {
            min_empty_space: 16,
            safety_margin: 16,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_duplicate_target() {
        let mut config = PatchConfig::default();
        config.targets.push(config.targets[0].clone());
        assert!(matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("ID_00.wav")));
    }

    #[test]
    fn test_rejects_bad_patch_hex() {
        let config = PatchConfig {
            byte_patches: vec![BytePatch::new("x", DEFAULT_BASE_ADDRESS, "4F F", "00")],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Hex(_))));
    }

    #[test]
    fn test_bad_json() {
        assert!(matches!(PatchConfig::from_json_str("{"), Err(Error::Json(_))));
    }
}
