//! In-place rewrites of existing firmware bytes.
//!
//! Three kinds of rewrite touch bytes outside the injected region:
//! - literal-pool pointers retargeted at a payload ([`PointerFixup`]),
//! - `MOVW` size instructions given a new immediate ([`SizeFixup`]),
//! - fixed verification patches ([`BytePatch`]) that only apply when the
//!   bytes already in place match a known baseline.

use crate::error::{hex_bytes, Error, Result};
use crate::image::FirmwareImage;
use crate::movw::{Movw, MOVW_LEN};

use serde::{Deserialize, Serialize};

/// A rewritten literal-pool pointer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PointerFixup {
    /// VA of the pointer slot.
    pub va: u32,
    /// Value found in the slot (diagnostic only, never checked).
    pub old_value: u32,
    /// VA of the injected payload.
    pub new_value: u32,
}

/// A rewritten `MOVW` size instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SizeFixup {
    /// VA of the instruction.
    pub va: u32,
    pub old: Movw,
    pub new: Movw,
}

/// Overwrite the pointer at `va` with `new_value`.
pub fn patch_pointer(image: &mut FirmwareImage, va: u32, new_value: u32) -> Result<PointerFixup> {
    let offset = image.va_range(va, 4)?.start;
    let old_value = image.read_u32_le(offset)?;
    image.write_u32_le(offset, new_value)?;

    tracing::info!(
        "ptr patch: va 0x{:X} (file_off=0x{:X}) {:#010x} -> {:#010x}",
        va,
        offset,
        old_value,
        new_value
    );

    Ok(PointerFixup {
        va,
        old_value,
        new_value,
    })
}

/// Replace the immediate of the `MOVW` at `va`, keeping its register.
pub fn patch_movw_imm(image: &mut FirmwareImage, va: u32, imm16: u32) -> Result<SizeFixup> {
    let offset = image.va_range(va, MOVW_LEN)?.start;
    let bytes = image.read_array::<MOVW_LEN>(offset)?;

    let old = Movw::decode(bytes).inspect_err(|_| {
        tracing::error!(
            "size_instr_addr 0x{:X} is not movw, bytes there: {}",
            va,
            hex_bytes(&bytes)
        );
    })?;
    let new = old.with_imm(imm16)?;
    image.write(offset, &new.encode())?;

    tracing::info!(
        "size patch: va 0x{:X} (file_off=0x{:X}) rd=r{} imm 0x{:X} -> 0x{:X}",
        va,
        offset,
        new.rd(),
        old.imm16(),
        new.imm16()
    );

    Ok(SizeFixup { va, old, new })
}

/// Verify-then-write: replace `expected` at `va` with `replacement`.
///
/// Fails with [`Error::VerificationMismatch`] if the image does not hold
/// `expected` there, which usually means a different firmware version.
pub fn poke(
    image: &mut FirmwareImage,
    name: &str,
    va: u32,
    expected: &[u8],
    replacement: &[u8],
) -> Result<()> {
    let offset = image.va_range(va, expected.len())?.start;
    let found = image.read(offset, expected.len())?;

    if found != expected {
        return Err(Error::VerificationMismatch {
            name: name.to_string(),
            va,
            expected: expected.to_vec(),
            found: found.to_vec(),
        });
    }

    if replacement.len() != expected.len() {
        tracing::warn!(
            "{}: replacing {} bytes with {} at 0x{:X}",
            name,
            expected.len(),
            replacement.len(),
            va
        );
    }
    image.write(offset, replacement)?;

    tracing::info!(
        "[PATCH] {} @0x{:X}: {} -> {}",
        name,
        va,
        hex_bytes(expected),
        hex_bytes(replacement)
    );
    Ok(())
}

/// A named verify-then-write patch, as stored in the patch table.
///
/// Byte strings are hex, spaces allowed (`"4F F4 7A 52"`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BytePatch {
    pub name: String,
    pub va: u32,
    pub old: String,
    pub new: String,
}

impl BytePatch {
    /// Create a patch from hex byte strings.
    pub fn new(name: &str, va: u32, old: &str, new: &str) -> Self {
        Self {
            name: name.to_string(),
            va,
            old: old.to_string(),
            new: new.to_string(),
        }
    }

    /// The baseline bytes.
    pub fn expected(&self) -> Result<Vec<u8>> {
        parse_hex(&self.old)
    }

    /// The bytes written on a match.
    pub fn replacement(&self) -> Result<Vec<u8>> {
        parse_hex(&self.new)
    }

    /// Check that both byte strings parse and that the patch window and the
    /// replacement both lie inside the image.
    pub fn validate(&self, image: &FirmwareImage) -> Result<()> {
        let expected = self.expected()?;
        let replacement = self.replacement()?;
        image.va_range(self.va, expected.len().max(replacement.len()))?;
        Ok(())
    }

    /// Verify the baseline bytes and write the replacement; see [`poke`].
    pub fn apply(&self, image: &mut FirmwareImage) -> Result<()> {
        poke(image, &self.name, self.va, &self.expected()?, &self.replacement()?)
    }
}

/// Set the prompt sample rate to 48000 Hz: `mov.w r2, #16000` becomes
/// `movw r2, #48000`.
pub fn prompt_sample_rate_patch() -> BytePatch {
    BytePatch::new(
        "prompt sample_rate=48000",
        0x3C0D_21C4,
        "4F F4 7A 52",
        "4B F6 80 32",
    )
}

/// Decode a hex string, ignoring whitespace.
pub fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let compact: String = s.split_whitespace().collect();
    Ok(hex::decode(compact)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressTranslator;
    use crate::movw;

    const BASE: u32 = 0x3C00_0000;

    fn image(len: usize) -> FirmwareImage {
        FirmwareImage::from_bytes(vec![0xA5; len], AddressTranslator::new(BASE))
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("4F F4 7A 52").unwrap(), vec![0x4F, 0xF4, 0x7A, 0x52]);
        assert_eq!(parse_hex("4ff4").unwrap(), vec![0x4F, 0xF4]);
        assert!(matches!(parse_hex("4F F"), Err(Error::Hex(_))));
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_poke_match() {
        let mut img = image(0x40);
        img.write(0x10, &[1, 2, 3, 4]).unwrap();

        poke(&mut img, "t", BASE + 0x10, &[1, 2, 3, 4], &[9, 8, 7, 6]).unwrap();
        assert_eq!(img.read(0x10, 4).unwrap(), &[9, 8, 7, 6]);
    }

    #[test]
    fn test_poke_mismatch_leaves_bytes() {
        let mut img = image(0x40);
        let err = poke(&mut img, "rate", BASE + 0x10, &[1, 2, 3, 4], &[9, 8, 7, 6]).unwrap_err();

        match err {
            Error::VerificationMismatch { name, va, found, .. } => {
                assert_eq!(name, "rate");
                assert_eq!(va, BASE + 0x10);
                assert_eq!(found, vec![0xA5; 4]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(img.read(0x10, 4).unwrap(), &[0xA5; 4]);
    }

    #[test]
    fn test_poke_below_base() {
        let mut img = image(0x40);
        assert!(matches!(
            poke(&mut img, "t", BASE - 4, &[0xA5], &[0]),
            Err(Error::AddressRange { .. })
        ));
    }

    #[test]
    fn test_sample_rate_patch() {
        let patch = prompt_sample_rate_patch();
        let off = (patch.va - BASE) as usize;
        let mut img = image(off + 0x10);
        img.write(off, &[0x4F, 0xF4, 0x7A, 0x52]).unwrap();

        patch.validate(&img).unwrap();
        patch.apply(&mut img).unwrap();

        let new = img.read(off, 4).unwrap();
        assert_eq!(new, movw::encode(2, 48000).unwrap());
    }

    #[test]
    fn test_validate_out_of_image() {
        let img = image(0x100);
        assert!(matches!(
            prompt_sample_rate_patch().validate(&img),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_patch_pointer() {
        let mut img = image(0x40);
        img.write_u32_le(0x20, 0x3C0A_0000).unwrap();

        let fix = patch_pointer(&mut img, BASE + 0x20, 0x3C10_0018).unwrap();
        assert_eq!(fix.old_value, 0x3C0A_0000);
        assert_eq!(fix.new_value, 0x3C10_0018);
        assert_eq!(img.read_u32_le(0x20).unwrap(), 0x3C10_0018);
    }

    #[test]
    fn test_patch_movw_imm() {
        let mut img = image(0x40);
        img.write(0x8, &movw::encode(3, 0x1000).unwrap()).unwrap();

        let fix = patch_movw_imm(&mut img, BASE + 0x8, 0x2A1).unwrap();
        assert_eq!(fix.old.imm16(), 0x1000);
        assert_eq!(fix.new.rd(), 3);

        let decoded = movw::decode(img.read(0x8, 4).unwrap()).unwrap();
        assert_eq!((decoded.rd(), decoded.imm16()), (3, 0x2A1));
    }

    #[test]
    fn test_patch_movw_rejects_other_encoding() {
        let mut img = image(0x40);
        let err = patch_movw_imm(&mut img, BASE + 0x8, 1).unwrap_err();
        assert!(matches!(err, Error::NotThisEncoding { hw1: 0xA5A5, hw2: 0xA5A5 }));
        assert_eq!(img.read(0x8, 4).unwrap(), &[0xA5; 4]);
    }
}
