//! Thumb-2 `MOVW Rd, #imm16` (encoding T3).
//!
//! ```text
//! hw1:  15..11  10  9..4    3..0
//!       11110   i   100100  imm4
//!
//! hw2:  15  14..12  11..8  7..0
//!       0   imm3    Rd     imm8
//!
//! imm16 = imm4:i:imm3:imm8
//! ```
//!
//! Both halfwords are stored little-endian, `hw1` first. The firmware loads
//! each prompt's byte length with one of these, so rewriting the immediate
//! is how a new payload size reaches the code.

use crate::error::{Error, Result};
use std::fmt;

/// Size of the encoded instruction in bytes.
pub const MOVW_LEN: usize = 4;

/// Fixed bits of `hw1` (everything except `i` and `imm4`).
const HW1_FIXED_MASK: u16 = 0xFBF0;
const HW1_FIXED_BITS: u16 = 0xF240;
/// `hw2` bit 15 must be clear.
const HW2_FIXED_MASK: u16 = 0x8000;

/// A decoded `MOVW` instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Movw {
    rd: u8,
    imm16: u16,
}

impl Movw {
    /// Build an instruction, checking operand ranges.
    pub fn new(rd: u32, imm16: u32) -> Result<Self> {
        if rd > 15 || imm16 > 0xFFFF {
            return Err(Error::InvalidOperand { rd, imm: imm16 });
        }
        Ok(Self {
            rd: rd as u8,
            imm16: imm16 as u16,
        })
    }

    /// Destination register index.
    pub fn rd(&self) -> u8 {
        self.rd
    }

    /// The 16-bit immediate.
    pub fn imm16(&self) -> u16 {
        self.imm16
    }

    /// Same register, new immediate.
    pub fn with_imm(self, imm16: u32) -> Result<Self> {
        Self::new(self.rd as u32, imm16)
    }

    /// Decode 4 bytes as `MOVW` (T3).
    pub fn decode(bytes: [u8; MOVW_LEN]) -> Result<Self> {
        let hw1 = u16::from_le_bytes([bytes[0], bytes[1]]);
        let hw2 = u16::from_le_bytes([bytes[2], bytes[3]]);

        if hw1 & HW1_FIXED_MASK != HW1_FIXED_BITS || hw2 & HW2_FIXED_MASK != 0 {
            return Err(Error::NotThisEncoding { hw1, hw2 });
        }

        let i = (hw1 >> 10) & 0x1;
        let imm4 = hw1 & 0xF;
        let imm3 = (hw2 >> 12) & 0x7;
        let rd = ((hw2 >> 8) & 0xF) as u8;
        let imm8 = hw2 & 0xFF;

        Ok(Self {
            rd,
            imm16: (imm4 << 12) | (i << 11) | (imm3 << 8) | imm8,
        })
    }

    /// Encode to 4 bytes. Always emits the fixed T3 bits.
    pub fn encode(&self) -> [u8; MOVW_LEN] {
        let imm = self.imm16;
        let imm4 = (imm >> 12) & 0xF;
        let i = (imm >> 11) & 0x1;
        let imm3 = (imm >> 8) & 0x7;
        let imm8 = imm & 0xFF;

        let hw1 = HW1_FIXED_BITS | (i << 10) | imm4;
        let hw2 = (imm3 << 12) | ((self.rd as u16) << 8) | imm8;

        let mut out = [0u8; MOVW_LEN];
        out[..2].copy_from_slice(&hw1.to_le_bytes());
        out[2..].copy_from_slice(&hw2.to_le_bytes());
        out
    }
}

impl fmt::Display for Movw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "movw r{}, #0x{:X}", self.rd, self.imm16)
    }
}

/// Decode `MOVW` from the start of a byte slice.
pub fn decode(bytes: &[u8]) -> Result<Movw> {
    let window: [u8; MOVW_LEN] = bytes
        .get(..MOVW_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or(Error::OutOfBounds {
            offset: 0,
            len: MOVW_LEN,
            image_len: bytes.len(),
        })?;
    Movw::decode(window)
}

/// Encode `MOVW rd, #imm16`.
pub fn encode(rd: u32, imm16: u32) -> Result<[u8; MOVW_LEN]> {
    Movw::new(rd, imm16).map(|m| m.encode())
}
