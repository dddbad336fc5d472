//! Patch targets and their processing order.

use crate::config::PatchConfig;
use crate::error::Result;
use crate::image::FirmwareImage;
use crate::movw::MOVW_LEN;

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Sort key for names without a numeric ID; they go last.
pub const UNORDERED: u64 = 1_000_000_000;

/// One prompt slot in the firmware.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchTarget {
    /// Payload name, e.g. `ID_07.wav`.
    pub name: String,
    /// VA of the `MOVW` that loads the prompt's byte length.
    pub size_instr_addr: u32,
    /// VA of the literal-pool pointer to the prompt data.
    pub ptr_pool_addr: u32,
}

impl PatchTarget {
    /// Create a target from its name and the two slot addresses.
    pub fn new(name: &str, size_instr_addr: u32, ptr_pool_addr: u32) -> Self {
        Self {
            name: name.to_string(),
            size_instr_addr,
            ptr_pool_addr,
        }
    }

    /// Processing order key; see [`sort_key`].
    pub fn sort_key(&self) -> u64 {
        sort_key(&self.name)
    }
}

/// Extract the numeric ID from a name like `ID_07.wav` (→ 7).
///
/// Takes the file stem, splits on `_` and parses the second field. Anything
/// else yields [`UNORDERED`].
pub fn sort_key(name: &str) -> u64 {
    Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.split('_').nth(1))
        .and_then(|id| id.parse::<u64>().ok())
        .unwrap_or(UNORDERED)
}

/// Targets in processing order, checked against a concrete image.
#[derive(Clone, Debug)]
pub struct PatchPlan {
    targets: Vec<PatchTarget>,
}

impl PatchPlan {
    /// Order the configured targets and check that every address the run
    /// will touch lies inside `image`. Nothing is mutated here.
    pub fn new(config: &PatchConfig, image: &FirmwareImage) -> Result<Self> {
        config.validate()?;

        let mut targets = config.targets.clone();
        targets.sort_by_key(PatchTarget::sort_key);

        for target in &targets {
            image
                .va_range(target.ptr_pool_addr, 4)
                .map_err(|e| e.for_target(&target.name, target.ptr_pool_addr))?;
            image
                .va_range(target.size_instr_addr, MOVW_LEN)
                .map_err(|e| e.for_target(&target.name, target.size_instr_addr))?;
        }

        for patch in &config.byte_patches {
            patch
                .validate(image)
                .map_err(|e| e.for_target(&patch.name, patch.va))?;
        }

        if image.len() < config.min_empty_space {
            tracing::warn!(
                "image is only {} bytes, smaller than the {} byte free-space threshold",
                image.len(),
                config.min_empty_space
            );
        }

        Ok(Self { targets })
    }

    pub fn targets(&self) -> &[PatchTarget] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
