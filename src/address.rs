//! Virtual address / file offset translation.
//!
//! The firmware image is a flat dump loaded at a fixed base, so the mapping is
//! a single subtraction. There are no sections to consult.

use crate::error::{Error, Result};

/// Maps between firmware virtual addresses and file offsets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressTranslator {
    base: u32,
}

impl AddressTranslator {
    /// Create a translator for an image loaded at `base`.
    pub const fn new(base: u32) -> Self {
        Self { base }
    }

    /// The virtual address of file offset 0.
    #[inline]
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Convert a virtual address to a file offset.
    #[inline]
    pub fn to_offset(&self, va: u32) -> Result<usize> {
        va.checked_sub(self.base)
            .map(|off| off as usize)
            .ok_or(Error::AddressRange { va, base: self.base })
    }

    /// Convert a file offset to a virtual address.
    #[inline]
    pub fn to_virtual(&self, offset: usize) -> Result<u32> {
        u32::try_from(offset)
            .ok()
            .and_then(|off| off.checked_add(self.base))
            .ok_or(Error::OffsetOutOfRange(offset))
    }
}

/// Align a value up to the given power-of-two alignment.
#[inline]
pub fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u32 = 0x3C00_0000;

    #[test]
    fn test_to_offset() {
        let t = AddressTranslator::new(BASE);
        assert_eq!(t.to_offset(BASE).unwrap(), 0);
        assert_eq!(t.to_offset(0x3C0D_1A8C).unwrap(), 0xD_1A8C);
    }

    #[test]
    fn test_below_base() {
        let t = AddressTranslator::new(BASE);
        let err = t.to_offset(BASE - 1).unwrap_err();
        assert!(matches!(err, Error::AddressRange { va, base } if va == BASE - 1 && base == BASE));
    }

    #[test]
    fn test_symmetry() {
        let t = AddressTranslator::new(BASE);
        for off in [0usize, 1, 0x10_0018, 0x1FF_FFFF] {
            let va = t.to_virtual(off).unwrap();
            assert_eq!(t.to_offset(va).unwrap(), off);
        }
    }

    #[test]
    fn test_to_virtual_overflow() {
        let t = AddressTranslator::new(BASE);
        let too_far = (u32::MAX - BASE) as usize + 1;
        assert!(matches!(t.to_virtual(too_far), Err(Error::OffsetOutOfRange(o)) if o == too_far));
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(10, 4), 12);
        assert_eq!(align_up(12, 4), 12);
        assert_eq!(align_up(4097, 4096), 8192);
    }
}
