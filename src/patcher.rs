//! Patch application.
//!
//! This module ties together all components to perform a full run:
//! 1. Check every configured address against the image
//! 2. Find the injection point in free space
//! 3. For each target: fetch the payload, write it, retarget the literal-pool
//!    pointer, rewrite the `MOVW` size, align the cursor
//! 4. Apply the verification patches
//!
//! The image is taken by value. Any error drops it along with every change
//! made so far; only a run that finishes returns a [`PatchedImage`].

use crate::address::align_up;
use crate::config::PatchConfig;
use crate::encoder::PayloadSource;
use crate::error::{Error, Result};
use crate::fixup::{patch_movw_imm, patch_pointer, PointerFixup, SizeFixup};
use crate::image::{FirmwareImage, PatchedImage};
use crate::plan::{PatchPlan, PatchTarget};
use crate::scanner::EmptySpaceScanner;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Largest payload a `MOVW` immediate can describe.
pub const MAX_PAYLOAD_LEN: usize = 0xFFFF;

/// Progress stage during a patch run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressStage {
    Planning,
    Scanning,
    Resolving,
    Sizing,
    Writing,
    PointerPatching,
    InstructionPatching,
    Aligning,
    PostPatching,
    Complete,
}

impl ProgressStage {
    /// Get a human-readable name for the stage.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Planning => "Checking patch table",
            Self::Scanning => "Scanning for free space",
            Self::Resolving => "Encoding payload",
            Self::Sizing => "Checking payload size",
            Self::Writing => "Writing payload",
            Self::PointerPatching => "Patching pointer",
            Self::InstructionPatching => "Patching size instruction",
            Self::Aligning => "Aligning",
            Self::PostPatching => "Applying fixed patches",
            Self::Complete => "Complete",
        }
    }
}

/// Progress information during a run.
#[derive(Clone, Debug)]
pub struct ProgressInfo {
    /// Current stage.
    pub stage: ProgressStage,
    /// Target being processed.
    pub current_item: Option<String>,
    /// Index of the current target.
    pub current: usize,
    /// Number of targets.
    pub total: usize,
    /// Payload and padding bytes written so far.
    pub bytes_injected: usize,
}

impl Default for ProgressInfo {
    fn default() -> Self {
        Self {
            stage: ProgressStage::Planning,
            current_item: None,
            current: 0,
            total: 0,
            bytes_injected: 0,
        }
    }
}

/// Progress callback type.
pub type ProgressCallback = Box<dyn Fn(&ProgressInfo) + Send + Sync>;

/// Per-run options that are not part of the patch table.
#[derive(Default)]
pub struct PatchOptions {
    /// Progress callback.
    pub progress_callback: Option<ProgressCallback>,
    /// Checked between targets; when set the run aborts with [`Error::Cancelled`].
    pub cancel: Option<Arc<AtomicBool>>,
}

impl std::fmt::Debug for PatchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchOptions")
            .field("progress_callback", &self.progress_callback.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}

impl PatchOptions {
    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }
}

/// A payload that made it into the image.
#[derive(Clone, Debug)]
pub struct Injection {
    pub name: String,
    /// File offset of the payload.
    pub file_offset: usize,
    /// VA of the payload.
    pub va: u32,
    /// Payload length.
    pub size: usize,
    /// Zero bytes written after the payload.
    pub padding: usize,
    pub pointer: PointerFixup,
    pub size_fixup: SizeFixup,
}

/// What happened to one target.
#[derive(Clone, Debug)]
pub enum TargetOutcome {
    /// The source had no payload for this target.
    Skipped { name: String },
    Injected(Injection),
}

/// Summary of a successful run.
#[derive(Clone, Debug, Default)]
pub struct PatchReport {
    /// Where the first payload went.
    pub injection_offset: usize,
    /// Cursor after the last payload.
    pub cursor: usize,
    /// One entry per target, in processing order.
    pub outcomes: Vec<TargetOutcome>,
    /// Names of the verification patches applied.
    pub byte_patches: Vec<String>,
}

impl PatchReport {
    pub fn injected(&self) -> impl Iterator<Item = &Injection> {
        self.outcomes.iter().filter_map(|o| match o {
            TargetOutcome::Injected(inj) => Some(inj),
            TargetOutcome::Skipped { .. } => None,
        })
    }

    pub fn skipped(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().filter_map(|o| match o {
            TargetOutcome::Skipped { name } => Some(name.as_str()),
            TargetOutcome::Injected(_) => None,
        })
    }

    /// Payload and padding bytes written into free space.
    pub fn bytes_injected(&self) -> usize {
        self.cursor - self.injection_offset
    }
}

/// Progress state plus the callback it is reported to.
struct Progress<'o> {
    info: ProgressInfo,
    callback: Option<&'o ProgressCallback>,
}

impl Progress<'_> {
    fn stage(&mut self, stage: ProgressStage) {
        self.info.stage = stage;
        if let Some(cb) = self.callback {
            cb(&self.info);
        }
    }
}

/// Applies a [`PatchConfig`] to firmware images.
pub struct Patcher<'c> {
    config: &'c PatchConfig,
}

impl<'c> Patcher<'c> {
    pub fn new(config: &'c PatchConfig) -> Self {
        Self { config }
    }

    /// Run every step against `image`.
    ///
    /// Returns the sealed image on success. On error the image, with
    /// whatever was already written into it, is dropped.
    pub fn apply<S>(
        &self,
        mut image: FirmwareImage,
        source: &mut S,
        options: &PatchOptions,
    ) -> Result<PatchedImage>
    where
        S: PayloadSource + ?Sized,
    {
        let mut progress = Progress {
            info: ProgressInfo::default(),
            callback: options.progress_callback.as_ref(),
        };

        progress.stage(ProgressStage::Planning);
        let plan = PatchPlan::new(self.config, &image)?;
        progress.info.total = plan.len();

        progress.stage(ProgressStage::Scanning);
        let scanner = EmptySpaceScanner::new(self.config.scanner_config());
        let injection_offset = scanner.find_injection_offset(image.as_bytes())?;
        tracing::info!(
            "injection offset: 0x{:X} (va=0x{:X})",
            injection_offset,
            image.translator().to_virtual(injection_offset)?
        );

        let mut report = PatchReport {
            injection_offset,
            cursor: injection_offset,
            ..Default::default()
        };

        for (idx, target) in plan.targets().iter().enumerate() {
            options.check_cancelled()?;
            progress.info.current = idx;
            progress.info.current_item = Some(target.name.clone());

            let outcome = self.inject(&mut image, target, report.cursor, source, &mut progress)?;
            if let TargetOutcome::Injected(inj) = &outcome {
                report.cursor = inj.file_offset + inj.size + inj.padding;
                progress.info.bytes_injected = report.bytes_injected();
            }
            report.outcomes.push(outcome);
        }

        options.check_cancelled()?;
        progress.info.current = plan.len();
        progress.info.current_item = None;
        progress.stage(ProgressStage::PostPatching);

        for patch in &self.config.byte_patches {
            patch
                .apply(&mut image)
                .map_err(|e| e.for_target(&patch.name, patch.va))?;
            report.byte_patches.push(patch.name.clone());
        }

        progress.stage(ProgressStage::Complete);
        Ok(image.into_patched(report))
    }

    /// Process one target with the cursor at `cursor`.
    fn inject<S>(
        &self,
        image: &mut FirmwareImage,
        target: &PatchTarget,
        cursor: usize,
        source: &mut S,
        progress: &mut Progress<'_>,
    ) -> Result<TargetOutcome>
    where
        S: PayloadSource + ?Sized,
    {
        let name = target.name.as_str();
        let translator = image.translator();
        let image_len = image.len();
        let cursor_va = translator.to_virtual(cursor).unwrap_or(u32::MAX);
        let at_cursor = |e: Error| e.for_target(name, cursor_va);

        progress.stage(ProgressStage::Resolving);
        let payload = match source.fetch(name).map_err(at_cursor)? {
            Some(payload) => payload,
            None => {
                tracing::warn!("[SKIP] {}: no payload available", name);
                return Ok(TargetOutcome::Skipped {
                    name: name.to_string(),
                });
            }
        };
        if payload.first() != Some(&self.config.sync_byte) {
            return Err(at_cursor(Error::MalformedPayload {
                expected: self.config.sync_byte,
                first: payload.first().copied(),
            }));
        }

        progress.stage(ProgressStage::Sizing);
        let size = payload.len();
        if size > MAX_PAYLOAD_LEN {
            return Err(at_cursor(Error::PayloadTooLarge { size }));
        }
        let end = cursor + size;
        if end > image_len {
            return Err(at_cursor(Error::InsufficientSpace { end, image_len }));
        }

        progress.stage(ProgressStage::Writing);
        let va = translator.to_virtual(cursor).map_err(at_cursor)?;
        image.write(cursor, &payload).map_err(at_cursor)?;
        tracing::info!(
            "{}: write file_off=0x{:X} .. 0x{:X} (size={} / 0x{:X}), new va 0x{:X}",
            name,
            cursor,
            end,
            size,
            size,
            va
        );

        progress.stage(ProgressStage::PointerPatching);
        let pointer = patch_pointer(image, target.ptr_pool_addr, va)
            .map_err(|e| e.for_target(name, target.ptr_pool_addr))?;

        progress.stage(ProgressStage::InstructionPatching);
        let size_fixup = patch_movw_imm(image, target.size_instr_addr, size as u32)
            .map_err(|e| e.for_target(name, target.size_instr_addr))?;

        progress.stage(ProgressStage::Aligning);
        let aligned = align_up(end, self.config.align);
        if aligned > image_len {
            return Err(Error::InsufficientSpace {
                end: aligned,
                image_len,
            }
            .for_target(name, va));
        }
        let padding = aligned - end;
        image.fill(end, padding, 0).map_err(|e| e.for_target(name, va))?;

        Ok(TargetOutcome::Injected(Injection {
            name: name.to_string(),
            file_offset: cursor,
            va,
            size,
            padding,
            pointer,
            size_fixup,
        }))
    }
}

/// Load `firmware`, patch it, and write the result to `output`.
///
/// `firmware` is never opened for writing, and `output` is only created once
/// every step has succeeded.
pub fn patch_file<S>(
    config: &PatchConfig,
    firmware: &Path,
    output: &Path,
    source: &mut S,
    options: &PatchOptions,
) -> Result<PatchReport>
where
    S: PayloadSource + ?Sized,
{
    if output.exists() && std::fs::canonicalize(firmware)? == std::fs::canonicalize(output)? {
        return Err(Error::Config(format!(
            "output {} would overwrite the input firmware",
            output.display()
        )));
    }

    let image = FirmwareImage::load(firmware, config.translator())?;
    tracing::info!("loading {} ({} bytes)", firmware.display(), image.len());

    let patched = Patcher::new(config).apply(image, source, options)?;
    patched.commit(output)?;
    Ok(patched.report().clone())
}
