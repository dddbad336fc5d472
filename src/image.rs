//! The firmware buffer and its committed form.
//!
//! A [`FirmwareImage`] is owned by exactly one patch run and has no way to
//! write itself to disk. Only a [`PatchedImage`], which the patcher hands out
//! after every step has succeeded, can be committed. Dropping an image at any
//! earlier point discards all in-memory changes.

use crate::address::AddressTranslator;
use crate::error::{Error, Result};
use crate::patcher::PatchReport;

use std::io::Write;
use std::ops::Range;
use std::path::Path;

/// A flat firmware image loaded at a fixed virtual base.
#[derive(Clone, Debug)]
pub struct FirmwareImage {
    data: Vec<u8>,
    translator: AddressTranslator,
}

impl FirmwareImage {
    /// Wrap raw bytes.
    pub fn from_bytes(data: Vec<u8>, translator: AddressTranslator) -> Self {
        Self { data, translator }
    }

    /// Read an image from disk. The file is only ever opened for reading.
    pub fn load<P: AsRef<Path>>(path: P, translator: AddressTranslator) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        Ok(Self::from_bytes(data, translator))
    }

    /// Image length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for a zero-length image.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The raw image bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// The address mapping this image was loaded with.
    pub fn translator(&self) -> AddressTranslator {
        self.translator
    }

    /// Bounds-check `[offset, offset + len)`.
    pub fn range(&self, offset: usize, len: usize) -> Result<Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(offset..end),
            _ => Err(Error::OutOfBounds {
                offset,
                len,
                image_len: self.data.len(),
            }),
        }
    }

    /// Translate `va` and bounds-check a `len`-byte window there.
    pub fn va_range(&self, va: u32, len: usize) -> Result<Range<usize>> {
        let offset = self.translator.to_offset(va)?;
        self.range(offset, len)
    }

    /// Borrow `len` bytes at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let r = self.range(offset, len)?;
        Ok(&self.data[r])
    }

    /// Copy `N` bytes at `offset` into an array.
    pub fn read_array<const N: usize>(&self, offset: usize) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read(offset, N)?);
        Ok(out)
    }

    /// Overwrite bytes at `offset`. Fails without writing if the range is
    /// out of bounds.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let r = self.range(offset, bytes.len())?;
        self.data[r].copy_from_slice(bytes);
        Ok(())
    }

    /// Set `len` bytes at `offset` to `value`.
    pub fn fill(&mut self, offset: usize, len: usize, value: u8) -> Result<()> {
        let r = self.range(offset, len)?;
        self.data[r].fill(value);
        Ok(())
    }

    /// Read a little-endian word.
    pub fn read_u32_le(&self, offset: usize) -> Result<u32> {
        self.read_array::<4>(offset).map(u32::from_le_bytes)
    }

    /// Write a little-endian word.
    pub fn write_u32_le(&mut self, offset: usize, value: u32) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Seal a fully patched image. Only the patcher may do this.
    pub(crate) fn into_patched(self, report: PatchReport) -> PatchedImage {
        PatchedImage { image: self, report }
    }
}

/// An image on which every planned patch succeeded.
#[derive(Debug)]
pub struct PatchedImage {
    image: FirmwareImage,
    report: PatchReport,
}

impl PatchedImage {
    /// The patched bytes, as they will be committed.
    pub fn as_bytes(&self) -> &[u8] {
        self.image.as_bytes()
    }

    /// What the run changed.
    pub fn report(&self) -> &PatchReport {
        &self.report
    }

    /// Write the image to `path`.
    ///
    /// The bytes go to a temporary file in the destination directory which
    /// is then renamed over `path`, so a failed commit never leaves a
    /// truncated output behind.
    pub fn commit<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(self.image.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;

        tracing::info!("saved: {} ({} bytes)", path.display(), self.image.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(len: usize) -> FirmwareImage {
        FirmwareImage::from_bytes(vec![0u8; len], AddressTranslator::new(0x1000))
    }

    #[test]
    fn test_u32_access() {
        let mut img = image(16);
        img.write_u32_le(4, 0x3C10_0018).unwrap();
        assert_eq!(img.read(4, 4).unwrap(), &[0x18, 0x00, 0x10, 0x3C]);
        assert_eq!(img.read_u32_le(4).unwrap(), 0x3C10_0018);
    }

    #[test]
    fn test_bounds() {
        let mut img = image(16);
        assert!(img.read(12, 4).is_ok());
        assert!(matches!(img.read(13, 4), Err(Error::OutOfBounds { offset: 13, len: 4, image_len: 16 })));
        assert!(img.write(16, &[1]).is_err());
        assert!(img.range(usize::MAX, 2).is_err());
        assert!(img.write(16, &[]).is_ok());
    }

    #[test]
    fn test_va_range() {
        let img = image(16);
        assert_eq!(img.va_range(0x1004, 4).unwrap(), 4..8);
        assert!(matches!(img.va_range(0x0FFF, 1), Err(Error::AddressRange { .. })));
        assert!(matches!(img.va_range(0x100E, 4), Err(Error::OutOfBounds { .. })));
    }

    #[test]
    fn test_fill() {
        let mut img = image(8);
        img.fill(2, 3, 0xAA).unwrap();
        assert_eq!(img.as_bytes(), &[0, 0, 0xAA, 0xAA, 0xAA, 0, 0, 0]);
    }

    #[test]
    fn test_commit_writes_whole_image() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.bin");

        let mut img = image(32);
        img.write(0, b"qore").unwrap();
        let patched = img.into_patched(PatchReport::default());
        patched.commit(&out).unwrap();

        let written = std::fs::read(&out).unwrap();
        assert_eq!(written.len(), 32);
        assert_eq!(&written[..4], b"qore");
    }
}
