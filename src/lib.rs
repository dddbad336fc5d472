//! # qorepatch
//!
//! A firmware patcher that replaces the audio prompts of a flat ARM Thumb-2
//! firmware image with custom SBC-encoded sounds.
//!
//! ## Overview
//!
//! Each prompt in the firmware is reached through two places in the code:
//! a literal-pool pointer to the prompt data and a `MOVW` instruction that
//! loads its byte length. For every prompt we have a replacement for, this
//! crate:
//!
//! 1. Finds a large run of unused (`0x00`/`0xFF`) bytes in the image
//! 2. Writes the encoded payload there, 4-byte aligned
//! 3. Points the literal-pool entry at the new payload
//! 4. Rewrites the `MOVW` immediate with the new length
//!
//! A small set of fixed patches (such as the prompt sample rate) is applied
//! afterwards, each guarded by a check of the bytes it replaces.
//!
//! Nothing is written to disk unless every step succeeds.

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod address;
pub mod image;
pub mod scanner;
pub mod movw;
pub mod fixup;
pub mod plan;
pub mod config;
pub mod encoder;
pub mod patcher;

pub use error::{Error, Result};
pub use address::AddressTranslator;
pub use config::PatchConfig;
pub use encoder::{FfmpegEncoder, PayloadSource, RawFileSource};
pub use image::{FirmwareImage, PatchedImage};
pub use patcher::{
    patch_file, PatchOptions, PatchReport, Patcher, ProgressCallback, ProgressInfo, ProgressStage,
};
pub use plan::{PatchPlan, PatchTarget};
