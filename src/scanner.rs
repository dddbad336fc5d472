//! Free space discovery.
//!
//! Flash images leave unprogrammed areas as runs of `0xFF` (erased) or
//! `0x00` (zero-filled by the build). This module finds the first such run
//! large enough to hold every payload.

use crate::error::{Error, Result};

/// Bytes treated as unused space. Runs may mix them freely.
pub const EMPTY_SENTINELS: [u8; 2] = [0x00, 0xFF];

/// Configuration for the empty space scanner.
#[derive(Clone, Debug)]
pub struct ScannerConfig {
    /// Minimum number of consecutive empty bytes required.
    pub min_len: usize,
    /// Offset added to the start of the run before it is used.
    pub safety_margin: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            min_len: 1024 * 1024,
            safety_margin: 24,
        }
    }
}

/// A run of empty bytes, `[start, start + len)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmptyRun {
    pub start: usize,
    pub len: usize,
}

impl EmptyRun {
    /// Offset one past the last byte of the run.
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Result of a scan: the qualifying run and where payloads start inside it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScannedRun {
    pub run: EmptyRun,
    /// `run.start` plus the safety margin.
    pub injection_offset: usize,
}

impl ScannedRun {
    /// Bytes between the injection offset and the end of the run.
    pub fn available(&self) -> usize {
        self.run.end().saturating_sub(self.injection_offset)
    }
}

/// First-fit scanner for runs of empty bytes.
///
/// The first run that reaches `min_len` wins, even if a larger run follows it.
pub struct EmptySpaceScanner {
    config: ScannerConfig,
}

impl EmptySpaceScanner {
    /// Create a new scanner with the given configuration.
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    /// Check whether a byte counts as unused space.
    #[inline(always)]
    pub fn is_empty(byte: u8) -> bool {
        EMPTY_SENTINELS.contains(&byte)
    }

    /// Find the first run of at least `min_len` empty bytes.
    ///
    /// The returned length covers the whole run, not just the first
    /// `min_len` bytes of it.
    pub fn find_run(&self, buffer: &[u8]) -> Option<EmptyRun> {
        let mut run_start = 0;
        let mut run_len = 0;

        for (i, &byte) in buffer.iter().enumerate() {
            if !Self::is_empty(byte) {
                run_len = 0;
                continue;
            }

            if run_len == 0 {
                run_start = i;
            }
            run_len += 1;

            if run_len >= self.config.min_len {
                let tail = buffer[i + 1..]
                    .iter()
                    .take_while(|&&b| Self::is_empty(b))
                    .count();
                return Some(EmptyRun {
                    start: run_start,
                    len: run_len + tail,
                });
            }
        }

        None
    }

    /// Locate the first qualifying run and the injection offset inside it.
    pub fn scan(&self, buffer: &[u8]) -> Result<ScannedRun> {
        let run = self.find_run(buffer).ok_or(Error::NoSpaceFound {
            min_len: self.config.min_len,
        })?;

        let injection_offset = run.start + self.config.safety_margin;
        tracing::info!(
            "found {} bytes of empty space at 0x{:X}, using injection offset 0x{:X}",
            run.len,
            run.start,
            injection_offset
        );
        Ok(ScannedRun {
            run,
            injection_offset,
        })
    }

    /// Find the injection offset: the start of the first qualifying run plus
    /// the safety margin.
    pub fn find_injection_offset(&self, buffer: &[u8]) -> Result<usize> {
        self.scan(buffer).map(|s| s.injection_offset)
    }
}

/// Find the injection offset in a buffer (convenience function).
pub fn find_injection_offset(buffer: &[u8], config: &ScannerConfig) -> Result<usize> {
    EmptySpaceScanner::new(config.clone()).find_injection_offset(buffer)
}
