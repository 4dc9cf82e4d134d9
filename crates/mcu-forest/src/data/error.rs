//! Errors raised by the sample store and chunk accessor.

use thiserror::Error;

use crate::io::{FormatError, StorageError};

/// Errors from sample-store and accessor operations.
#[derive(Debug, Error)]
pub enum DataError {
    /// Incoming data disagrees with the store's feature count.
    #[error("feature count mismatch: store has {expected}, got {actual}")]
    FeatureCountMismatch { expected: usize, actual: usize },

    /// More features than a packed tree node can address.
    #[error("{count} features exceed the supported maximum of {max}")]
    TooManyFeatures { count: usize, max: usize },

    /// Store used before `init` (or with zero features).
    #[error("sample store is not initialized")]
    NotInitialized,

    /// Quantization width outside 1..=8 bits.
    #[error("invalid quantization width {0} (expected 1..=8 bits)")]
    InvalidQuantBits(u8),

    /// A file or caller disagrees with the store's quantization width.
    #[error("quantization width mismatch: expected {expected} bits, got {actual}")]
    QuantBitsMismatch { expected: u8, actual: u8 },

    /// Label does not fit the store's label width.
    #[error("label {label} does not fit in {bits} bits")]
    LabelOutOfRange { label: u8, bits: u8 },

    /// A feature value exceeds `2^bits - 1`.
    #[error("feature {feature} value {value} exceeds {max}")]
    ValueOutOfRange { feature: usize, value: u8, max: u8 },

    /// Backing file could not be opened by the chunk accessor.
    #[error("chunk accessor could not open {path}: {source}")]
    AccessorOpen {
        path: String,
        #[source]
        source: StorageError,
    },

    /// Malformed or unreadable backing file.
    #[error(transparent)]
    Format(#[from] FormatError),

    /// Storage backend failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}
