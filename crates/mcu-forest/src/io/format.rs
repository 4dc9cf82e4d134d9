//! Binary format primitives shared by every on-flash file.
//!
//! All integers are little-endian. Each file type starts with a 4-byte magic:
//!
//! ```text
//! File               Magic    Followed by
//! ----               -----    -----------
//! tree               "TREE"   node_count:u32, layout:4×u8, packed records
//! unified forest     "FRC3"   tree_count:u32, layout, trees..., crc32
//! node predictor     "NODE"   trained, accuracy, peak, n_coeff, f32s, samples
//! inference log      "INFL"   count:u32, (predicted:u8, actual:u8)*
//! ```
//!
//! The sample-store file has no magic (header is `num_samples:u32,
//! num_features:u16`), see [`crate::data::store`].

use thiserror::Error;

use super::storage::StorageError;

// ============================================================================
// Constants
// ============================================================================

/// Magic for a single tree file. Reads as `0x54524545` in little-endian.
pub const TREE_MAGIC: &[u8; 4] = b"EERT";

/// Magic for a unified forest file.
pub const FOREST_MAGIC: &[u8; 4] = b"FRC3";

/// Magic for the node predictor file. Reads as `0x4E4F4445` in little-endian.
pub const NODE_PREDICTOR_MAGIC: &[u8; 4] = b"EDON";

/// Magic for the inference log.
pub const INFER_LOG_MAGIC: &[u8; 4] = b"INFL";

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while decoding a persisted file.
#[derive(Debug, Error)]
pub enum FormatError {
    /// Magic bytes did not match the expected file type.
    #[error("bad magic: expected {expected:?}, found {found:?}")]
    BadMagic { expected: [u8; 4], found: [u8; 4] },

    /// File ended before a complete structure could be read.
    #[error("file truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Node count of zero or beyond the layout's budget.
    #[error("invalid node count {count} (max {max})")]
    InvalidNodeCount { count: u32, max: u32 },

    /// On-disk bit widths disagree with the active layout.
    #[error("layout mismatch: file has {found}, active layout is {expected}")]
    LayoutMismatch { expected: String, found: String },

    /// Checksum trailer does not match the payload.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Structure decoded but its contents are not usable.
    #[error("corrupt payload: {0}")]
    CorruptPayload(String),

    /// Node predictor file with a coefficient count this build cannot use.
    #[error("unsupported coefficient count {found} (expected {expected})")]
    UnsupportedCoefficients { expected: u8, found: u8 },

    /// Storage backend failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Compute the CRC32 used for file trailers.
#[inline]
pub fn compute_checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

// ============================================================================
// ByteReader
// ============================================================================

/// Cursor over a byte slice with bounds-checked little-endian reads.
#[derive(Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current offset.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Take the next `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], FormatError> {
        if self.remaining() < n {
            return Err(FormatError::Truncated {
                expected: self.pos + n,
                actual: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Check a 4-byte magic.
    pub fn expect_magic(&mut self, magic: &[u8; 4]) -> Result<(), FormatError> {
        let found = self.take(4)?;
        if found != magic {
            let mut f = [0u8; 4];
            f.copy_from_slice(found);
            return Err(FormatError::BadMagic {
                expected: *magic,
                found: f,
            });
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, FormatError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, FormatError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn f32(&mut self) -> Result<f32, FormatError> {
        Ok(f32::from_bits(self.u32()?))
    }
}

// =============================================================================
// Tests
// =============================================================================
