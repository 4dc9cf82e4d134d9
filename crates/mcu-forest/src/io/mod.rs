//! Persistence: the storage collaborator, file formats and file naming.
//!
//! - [`Storage`] / [`FsStorage`] / [`MemStorage`]: byte-level file operations
//! - [`format`]: magics, [`FormatError`], bounds-checked [`ByteReader`]
//! - [`ModelPaths`]: per-model file names
//! - [`InferenceLog`]: `(predicted, actual)` pair log

pub mod format;
pub mod infer_log;
pub mod paths;
pub mod storage;

pub use format::{
    compute_checksum, ByteReader, FormatError, FOREST_MAGIC, INFER_LOG_MAGIC,
    NODE_PREDICTOR_MAGIC, TREE_MAGIC,
};
pub use infer_log::{InferenceLog, DEFAULT_MAX_INFER_LOG_BYTES};
pub use paths::ModelPaths;
pub use storage::{FsStorage, MemStorage, SharedStorage, Storage, StorageError};
