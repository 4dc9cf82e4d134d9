//! Random-forest training.
//!
//! ## Building blocks
//!
//! - [`RfConfig`]: hyperparameters, JSON load/save and dataset heuristics
//! - [`BootstrapEngine`]: reproducible per-tree sample subsets
//! - [`TreeBuilder`]: breadth-first tree construction over a [`SampleSource`]
//! - [`NodePredictor`]: node-count estimates that size layouts and queues
//! - [`ConfusionScore`]: accuracy, precision, recall and F1
//! - [`TrainingLogger`], [`Verbosity`]: progress reporting
//!
//! ## Orchestration
//!
//! [`Trainer`] ties these together: sessions, data splits, forest builds,
//! out-of-bag / validation / k-fold scoring and grid search, plus the
//! feedback loop through [`PendingData`].
//!
//! [`SampleSource`]: crate::data::SampleSource

pub mod bootstrap;
pub mod builder;
mod config;
pub mod impurity;
mod logger;
mod pending;
pub mod predictor;
mod score;
pub mod split;
mod trainer;

pub use bootstrap::{in_bag_mask, BootstrapEngine};
pub use builder::{BuildStats, TreeBuilder, TreeParams};
pub use config::{
    ConfigError, DatasetParams, GridAxis, ImpurityCriterion, MetricMask, RfConfig, SearchRanges,
    TrainingScore,
};
pub use logger::{TrainingLogger, Verbosity};
pub use pending::{FlushReport, PendingData, DEFAULT_MAX_PENDING};
pub use predictor::{DatasetShape, NodeLogRow, NodePredictor};
pub use score::ConfusionScore;
pub use trainer::{TrainError, Trainer, TrainingReport, UNTRAINED_NODE_BUDGET};
