//! Quantized sample storage and access.
//!
//! # Overview
//!
//! Training data lives on the persistent store as fixed-size records of a
//! label byte plus bit-packed feature values. Two access paths exist:
//!
//! - [`SampleStore`]: chunked, resident samples with load/release semantics
//! - [`ChunkAccessor`]: paged reads with a chunk cache, for data that does
//!   not fit in memory
//!
//! Both implement [`SampleSource`], which is what the tree builder consumes.
//!
//! # Quantization
//!
//! Feature values are integers in `[0, 2^bits - 1]` for a width of 1..=8
//! bits, produced upstream by a [`Quantizer`].

pub mod accessor;
mod error;
pub mod packing;
mod quantizer;
mod sample;
mod source;
pub mod store;

pub use accessor::{AccessorStats, ChunkAccessor};
pub use error::DataError;
pub use packing::PackedArray;
pub use quantizer::{Quantizer, UniformQuantizer};
pub use sample::Sample;
pub use source::SampleSource;
pub use store::SampleStore;

/// Label value meaning "unknown" or "no prediction".
pub const ERROR_LABEL: u8 = 255;

/// Byte budget for one chunk of packed features.
pub const MAX_CHUNK_BYTES: usize = 8192;
