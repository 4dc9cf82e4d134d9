//! mcu-forest: random-forest classification for memory-constrained devices.
//!
//! Training data is stored quantized and bit-packed, trees are packed at the
//! narrowest node layout the dataset allows, and every file goes through a
//! small [`Storage`](io::Storage) trait so the same code runs on a flash
//! filesystem, a host directory or in memory.
//!
//! # Key Types
//!
//! - [`SampleStore`] / [`ChunkAccessor`] - quantized sample storage and paged reads
//! - [`Forest`] / [`Tree`] - packed trees with majority-vote prediction
//! - [`RfConfig`] / [`Trainer`] - configuration and the training orchestrator
//!
//! # Training
//!
//! ```ignore
//! use mcu_forest::{RfConfig, SampleStore, Trainer};
//! use mcu_forest::io::{MemStorage, ModelPaths};
//!
//! let storage = MemStorage::shared();
//! let paths = ModelPaths::new("model");
//! let base = SampleStore::new(storage, paths.base_data());
//! // ... push samples and release the store ...
//! let mut trainer = Trainer::new(base, paths, RfConfig::default())?;
//! let report = trainer.build_model()?;
//! ```
//!
//! # Feature flags
//!
//! - `training` (default): tree induction, bootstrap, scoring and grid
//!   search. Without it only [`data`], [`repr`] and [`io`] are built, which
//!   is enough to load a forest and predict.

pub mod data;
pub mod io;
pub mod repr;
#[cfg(feature = "training")]
pub mod training;
pub mod utils;

// =============================================================================
// Convenience Re-exports
// =============================================================================

pub use data::{ChunkAccessor, Quantizer, Sample, SampleSource, SampleStore, UniformQuantizer, ERROR_LABEL};
pub use io::{FsStorage, MemStorage, ModelPaths, Storage};
pub use repr::{Forest, NodeLayout, Tree};

#[cfg(feature = "training")]
pub use training::{MetricMask, RfConfig, TrainError, Trainer, TrainingReport, TrainingScore};
