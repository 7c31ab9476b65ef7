use thiserror::Error;

/// Failures while decoding a segment. Every variant is fatal for the segment
/// being read; nothing is ever substituted with partial data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("segment truncated: needed {needed} bytes, found {found}")]
    Truncated { needed: usize, found: usize },

    #[error("bad segment magic {found:02x?}")]
    BadMagic { found: [u8; 4] },

    #[error("unsupported segment version {0}")]
    UnsupportedVersion(u8),

    #[error("compressed length mismatch: header says {expected}, found {found}")]
    CompressedLengthMismatch { expected: usize, found: usize },

    #[error("checksum mismatch: header {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("payload compression failed: {0}")]
    Compression(String),

    #[error("payload decompression failed: {0}")]
    Decompression(String),

    #[error("decompressed length mismatch: header says {expected}, found {found}")]
    DecompressedLengthMismatch { expected: usize, found: usize },

    #[error("payload of {0} bytes exceeds the segment size cap")]
    PayloadTooLarge(usize),

    #[error("{field} timestamp mismatch: header says {expected}, decoded {found}")]
    TimestampMismatch {
        field: &'static str,
        expected: i64,
        found: i64,
    },

    #[error("frame count mismatch: header says {expected}, decoded {found}")]
    FrameCountMismatch { expected: usize, found: usize },

    #[error("unknown stance value {0}")]
    InvalidStance(u8),

    #[error("unknown delta flags {0:#06x}")]
    InvalidFlags(u16),

    #[error("varint overflows 64 bits")]
    VarintOverflow,

    #[error("{0} trailing bytes after last delta")]
    TrailingBytes(usize),

    #[error("segment must contain at least one frame")]
    Empty,
}
