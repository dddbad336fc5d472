//! Error types for qorepatch.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while planning or applying a firmware patch.
///
/// Every variant aborts the whole run. An encoder that has nothing to offer
/// for a target is not an error; sources report that as `Ok(None)`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("va 0x{va:08X} < base_address 0x{base:08X}")]
    AddressRange { va: u32, base: u32 },

    #[error("file offset 0x{0:X} has no 32-bit virtual address")]
    OffsetOutOfRange(usize),

    #[error("range 0x{offset:X}+{len} is outside the image (len 0x{image_len:X})")]
    OutOfBounds {
        offset: usize,
        len: usize,
        image_len: usize,
    },

    #[error("could not find {min_len} bytes of continuous empty space in firmware")]
    NoSpaceFound { min_len: usize },

    #[error("payload size 0x{size:X} > 0xffff, movw cannot fit")]
    PayloadTooLarge { size: usize },

    #[error("not enough space in firmware: need end=0x{end:X}, fw_len=0x{image_len:X}")]
    InsufficientSpace { end: usize, image_len: usize },

    #[error("not movw(t3): hw1=0x{hw1:04X} hw2=0x{hw2:04X}")]
    NotThisEncoding { hw1: u16, hw2: u16 },

    #[error("invalid movw operand: rd={rd}, imm16=0x{imm:X}")]
    InvalidOperand { rd: u32, imm: u32 },

    #[error("{name}: unexpected bytes @0x{va:08X}: {} expected {}", hex_bytes(.found), hex_bytes(.expected))]
    VerificationMismatch {
        name: String,
        va: u32,
        expected: Vec<u8>,
        found: Vec<u8>,
    },

    #[error("payload does not start with sync byte 0x{expected:02X} (first byte: {})", first_byte(.first))]
    MalformedPayload { expected: u8, first: Option<u8> },

    #[error("encoder failed for {name}: {message}")]
    Encoder { name: String, message: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("{target} @0x{va:08X}: {source}")]
    Target {
        target: String,
        va: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("patch table parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid hex string: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap an error with the target and address it was raised for.
    pub fn for_target(self, target: &str, va: u32) -> Self {
        Self::Target {
            target: target.to_string(),
            va,
            source: Box::new(self),
        }
    }

    /// The underlying error, with any target context stripped.
    pub fn innermost(&self) -> &Error {
        match self {
            Self::Target { source, .. } => source.innermost(),
            other => other,
        }
    }

    /// Process exit code for this error's category.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Target { source, .. } => source.exit_code(),
            Self::Io(_) => 2,
            Self::Config(_) | Self::Json(_) | Self::Hex(_) => 3,
            Self::AddressRange { .. } | Self::OffsetOutOfRange(_) | Self::OutOfBounds { .. } => 4,
            Self::NoSpaceFound { .. } => 5,
            Self::PayloadTooLarge { .. } => 6,
            Self::InsufficientSpace { .. } => 7,
            Self::NotThisEncoding { .. } => 8,
            Self::InvalidOperand { .. } => 9,
            Self::VerificationMismatch { .. } => 10,
            Self::MalformedPayload { .. } => 11,
            Self::Encoder { .. } => 12,
            Self::Cancelled => 13,
        }
    }
}

/// Format bytes as space-separated lowercase hex, e.g. `4f f4 7a 52`.
pub fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_byte(first: &Option<u8>) -> String {
    match first {
        Some(b) => format!("0x{b:02X}"),
        None => "none".to_string(),
    }
}
