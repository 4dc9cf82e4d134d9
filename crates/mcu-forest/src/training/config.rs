//! Random-forest training configuration with builder pattern.
//!
//! [`RfConfig`] holds every hyperparameter the trainer reads. It is built with
//! `bon` and validated at build time, and round-trips through JSON so a device
//! can keep its tuned configuration next to the model files.
//!
//! # Example
//!
//! ```ignore
//! use mcu_forest::training::{RfConfig, ImpurityCriterion, TrainingScore};
//!
//! // All defaults
//! let config = RfConfig::builder().build()?;
//!
//! let config = RfConfig::builder()
//!     .num_trees(10)
//!     .criterion(ImpurityCriterion::Gini)
//!     .training_score(TrainingScore::KFold)
//!     .k_folds(5)
//!     .build()?;
//! ```
//!
//! Dataset-driven defaults come from [`DatasetParams`]: see
//! [`RfConfig::auto_config`] and [`RfConfig::generate_ranges`].

use std::fmt;

use bon::Builder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::{DataError, SampleStore, ERROR_LABEL};

use super::logger::Verbosity;

// =============================================================================
// ConfigError
// =============================================================================

/// Errors raised while validating a configuration or driving a session.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Train/test/validation ratios out of range or summing above 1.
    #[error("invalid split ratios: train={train}, test={test}, valid={valid}")]
    InvalidRatios { train: f32, test: f32, valid: f32 },

    #[error("bootstrap_ratio must be in (0, 1], got {0}")]
    InvalidBootstrapRatio(f32),

    #[error("k_folds must be in [2, 10], got {0}")]
    InvalidKFolds(u8),

    #[error("k-fold scoring needs at least {k} samples, got {samples}")]
    TooFewSamplesForKFold { samples: usize, k: u8 },

    #[error("num_trees must be at least 1")]
    InvalidNumTrees,

    #[error("quant_bits must be in [1, 8], got {0}")]
    InvalidQuantBits(u8),

    /// The configured width differs from the width the data was stored at.
    #[error("config quant_bits {config} does not match the base store's {data}")]
    QuantBitsMismatch { config: u8, data: u8 },

    #[error("{count} features exceed the supported maximum of {max}")]
    TooManyFeatures { count: usize, max: usize },

    #[error("min_split must be at least 2 and min_leaf at least 1, got {min_split}/{min_leaf}")]
    InvalidLeafParams { min_split: u8, min_leaf: u8 },

    #[error("max_depth must be at least 1")]
    InvalidMaxDepth,

    #[error("a training session is already open")]
    SessionAlreadyOpen,

    #[error("no training session is open")]
    NoSession,

    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// Enums
// =============================================================================

/// Node impurity measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpurityCriterion {
    /// `1 - Σp²`
    Gini,
    /// `-Σ p log2 p`
    #[default]
    Entropy,
}

/// How a candidate forest is scored during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingScore {
    /// Out-of-bag votes on the training split.
    #[default]
    Oob,
    /// Held-out validation split.
    Validation,
    /// k-fold cross validation over the non-test samples.
    KFold,
}

/// Which hyperparameter the grid pairs with `min_split`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridAxis {
    #[default]
    MinLeaf,
    MaxDepth,
}

/// Bitmask of metrics averaged into a score.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricMask(u8);

impl MetricMask {
    pub const ACCURACY: Self = Self(0x01);
    pub const PRECISION: Self = Self(0x02);
    pub const RECALL: Self = Self(0x04);
    pub const F1: Self = Self(0x08);

    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x0F)
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for MetricMask {
    fn default() -> Self {
        Self::ACCURACY
    }
}

impl std::ops::BitOr for MetricMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for MetricMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Self::ACCURACY, "ACCURACY"),
            (Self::PRECISION, "PRECISION"),
            (Self::RECALL, "RECALL"),
            (Self::F1, "F1"),
        ]
        .iter()
        .filter(|(m, _)| self.contains(*m))
        .map(|&(_, n)| n)
        .collect();
        write!(f, "MetricMask({})", names.join(" | "))
    }
}

// =============================================================================
// SearchRanges
// =============================================================================

/// Inclusive grid-search bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRanges {
    pub min_split: (u8, u8),
    pub min_leaf: (u8, u8),
    pub max_depth: (u16, u16),
}

impl Default for SearchRanges {
    fn default() -> Self {
        Self {
            min_split: (2, 6),
            min_leaf: (1, 2),
            max_depth: (4, 8),
        }
    }
}

// =============================================================================
// DatasetParams
// =============================================================================

/// Shape and label distribution of a sample store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DatasetParams {
    pub num_samples: usize,
    pub num_features: usize,
    pub num_labels: usize,
    pub label_counts: Vec<u32>,
    /// Share of the rarest present label, in percent.
    pub lowest_distribution: f32,
}

impl DatasetParams {
    /// Scan a store. A released store is read chunk by chunk from storage.
    pub fn scan(store: &SampleStore) -> Result<Self, DataError> {
        let mut counts: Vec<u32> = Vec::new();
        let mut count = |label: u8| {
            if label == ERROR_LABEL {
                return;
            }
            let l = label as usize;
            if counts.len() <= l {
                counts.resize(l + 1, 0);
            }
            counts[l] += 1;
        };

        let mut num_samples = 0usize;
        if store.is_loaded() {
            for i in 0..store.len() {
                count(store.label(i));
            }
            num_samples = store.len();
        } else if store.has_file() {
            let mut chunk = 0usize;
            loop {
                let samples = store.read_chunk(chunk)?;
                if samples.is_empty() {
                    break;
                }
                num_samples += samples.len();
                for s in &samples {
                    count(s.label);
                }
                chunk += 1;
            }
        }
        Ok(Self::from_counts(num_samples, store.num_features(), counts))
    }

    /// Build from explicit label counts.
    pub fn from_counts(num_samples: usize, num_features: usize, label_counts: Vec<u32>) -> Self {
        let labelled: u32 = label_counts.iter().sum();
        let lowest = label_counts
            .iter()
            .filter(|&&c| c > 0)
            .min()
            .map_or(100.0, |&c| 100.0 * c as f32 / labelled.max(1) as f32);
        Self {
            num_samples,
            num_features,
            num_labels: label_counts.len(),
            label_counts,
            lowest_distribution: lowest,
        }
    }

    pub fn samples_per_label(&self) -> f32 {
        self.num_samples as f32 / self.num_labels.max(1) as f32
    }

    /// Shortfall of the rarest label relative to a uniform share, in `[0, 1]`.
    fn imbalance(&self, num_labels: usize) -> f32 {
        let expected = 100.0 / num_labels.max(1) as f32;
        let deficit = (expected - self.lowest_distribution).max(0.0);
        if expected > 0.0 {
            (deficit / expected).min(1.0)
        } else {
            0.0
        }
    }
}

// =============================================================================
// RfConfig
// =============================================================================

/// Hyperparameters for random-forest training.
///
/// Defaults mirror the device firmware: 20 trees, seed 37, entropy, OOB
/// scoring on accuracy, 2-bit quantization.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(derive(Clone, Debug), finish_fn(vis = "", name = __build_internal))]
#[serde(default)]
pub struct RfConfig {
    // === Forest shape ===
    /// Number of trees. Default: 20.
    #[builder(default = 20)]
    pub num_trees: u16,

    /// Minimum samples for a node to be split. Default: 2.
    #[builder(default = 2)]
    pub min_split: u8,

    /// Minimum samples on each side of a split. Default: 1.
    #[builder(default = 1)]
    pub min_leaf: u8,

    /// Maximum tree depth in levels. Default: 250.
    #[builder(default = 250)]
    pub max_depth: u16,

    // === Sampling ===
    /// Sample with replacement per tree. Default: true.
    #[builder(default = true)]
    pub bootstrap: bool,

    /// Subset share when sampling without replacement. Default: 0.632.
    #[builder(default = 0.632)]
    pub bootstrap_ratio: f32,

    // === Split search ===
    #[builder(default)]
    pub criterion: ImpurityCriterion,

    /// Base minimum gain; scaled down with node size. Default: 0.
    #[builder(default = 0.0)]
    pub impurity_threshold: f32,

    // === Data split ===
    #[builder(default = 0.8)]
    pub train_ratio: f32,

    #[builder(default = 0.0)]
    pub test_ratio: f32,

    #[builder(default = 0.0)]
    pub valid_ratio: f32,

    /// Keep at most this many samples in the base store (0 = unlimited).
    #[builder(default = 0)]
    pub max_samples: u32,

    // === Scoring ===
    #[builder(default)]
    pub training_score: TrainingScore,

    #[builder(default)]
    pub metric: MetricMask,

    /// Folds for k-fold scoring. Default: 4.
    #[builder(default = 4)]
    pub k_folds: u8,

    // === Grid search ===
    #[builder(default)]
    pub grid_axis: GridAxis,

    /// Step between grid values on both axes. Default: 1.
    #[builder(default = 1)]
    pub grid_step: u8,

    #[builder(default)]
    pub ranges: SearchRanges,

    // === Data ===
    /// Bits per quantized feature value. Default: 2.
    #[builder(default = 2)]
    pub quant_bits: u8,

    // === Node predictor ===
    /// Retrain the node-count predictor after each session. Default: true.
    #[builder(default = true)]
    pub enable_retrain: bool,

    // === Resources ===
    /// Resident-bytes budget for training data before switching to paged
    /// reads (0 = unlimited).
    #[builder(default = 0)]
    pub memory_budget: usize,

    // === Reproducibility ===
    /// Random seed. Default: 37.
    #[builder(default = 37)]
    pub seed: u64,

    // === Logging ===
    /// Verbosity level. Default: `Silent`.
    #[builder(default)]
    #[serde(skip)]
    pub verbosity: Verbosity,
}

/// Custom finishing function that validates the config.
impl<S: rf_config_builder::IsComplete> RfConfigBuilder<S> {
    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any parameter is invalid:
    /// - `num_trees == 0`
    /// - split ratios out of range or summing above 1
    /// - `k_folds` outside `[2, 10]`
    /// - `quant_bits` outside `[1, 8]`
    pub fn build(self) -> Result<RfConfig, ConfigError> {
        let config = self.__build_internal();
        config.validate()?;
        Ok(config)
    }
}

impl Default for RfConfig {
    fn default() -> Self {
        Self::builder().__build_internal()
    }
}

impl RfConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_trees == 0 {
            return Err(ConfigError::InvalidNumTrees);
        }
        if !(1..=8).contains(&self.quant_bits) {
            return Err(ConfigError::InvalidQuantBits(self.quant_bits));
        }
        if self.min_split < 2 || self.min_leaf < 1 {
            return Err(ConfigError::InvalidLeafParams {
                min_split: self.min_split,
                min_leaf: self.min_leaf,
            });
        }
        if self.max_depth == 0 {
            return Err(ConfigError::InvalidMaxDepth);
        }
        if !(self.bootstrap_ratio > 0.0 && self.bootstrap_ratio <= 1.0) {
            return Err(ConfigError::InvalidBootstrapRatio(self.bootstrap_ratio));
        }
        if !(2..=10).contains(&self.k_folds) {
            return Err(ConfigError::InvalidKFolds(self.k_folds));
        }
        self.validate_ratios()
    }

    /// Train ratio in `(0, 1]`, test and valid in `[0, 1]`, sum at most 1.
    pub fn validate_ratios(&self) -> Result<(), ConfigError> {
        let (train, test, valid) = (self.train_ratio, self.test_ratio, self.valid_ratio);
        let in_unit = |r: f32| (0.0..=1.0).contains(&r);
        let ok = train > 0.0
            && in_unit(train)
            && in_unit(test)
            && in_unit(valid)
            && train + test + valid <= 1.0 + 1e-6;
        if ok {
            Ok(())
        } else {
            Err(ConfigError::InvalidRatios { train, test, valid })
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    // =========================================================================
    // Dataset heuristics
    // =========================================================================

    /// Derive grid-search ranges from the dataset.
    ///
    /// With `force`, the current `min_split`, `min_leaf` and `max_depth` are
    /// reset to the low/low/high ends of the ranges.
    pub fn generate_ranges(&mut self, params: &DatasetParams, force: bool) {
        let ns = params.num_samples.max(1) as f32;
        let nf = params.num_features.max(1) as f32;

        let min_min_split: u8 = 2;
        let dynamic = (ns.log2() / 4.0 + nf / 25.0) as i32;
        let mut max_min_split = dynamic.min(min_min_split as i32 + 6).clamp(0, 16) as u8;
        if max_min_split <= min_min_split {
            max_min_split = min_min_split + 4;
        }

        let density = (params.samples_per_label() / 600.0).clamp(0.3, 3.0);
        let imbalance_factor = 1.0 - params.imbalance(params.num_labels).min(0.5);

        let min_ratio = (0.12 + 0.05 * density * imbalance_factor).clamp(0.1, 0.35);
        let max_ratio = (min_ratio + 0.12 + 0.04 * density)
            .max(min_ratio + 0.1)
            .min(0.6);

        let max_cap = max_min_split.saturating_sub(1).max(1);
        let min_min_leaf = ((min_min_split as f32 * min_ratio).floor() as u8).clamp(1, max_cap);
        let max_min_leaf = ((max_min_split as f32 * max_ratio).ceil() as u8)
            .min(max_cap)
            .max(min_min_leaf);

        let base_depth = (ns.log2() + nf.log2()) as i32 + 1;
        let max_max_depth = base_depth.max(8) as u16;
        let min_max_depth = match max_max_depth {
            d if d > 18 => d - 6,
            d if d > 12 => d - 4,
            d if d > 8 => d - 2,
            _ => 4,
        };

        if force || self.min_split == 0 {
            self.min_split = min_min_split;
        }
        if force || self.min_leaf == 0 {
            self.min_leaf = min_min_leaf;
        }
        if force || self.max_depth == 0 {
            self.max_depth = max_max_depth;
        }
        self.ranges = SearchRanges {
            min_split: (min_min_split, max_min_split),
            min_leaf: (min_min_leaf, max_min_leaf),
            max_depth: (min_max_depth, max_max_depth),
        };
        tracing::debug!(ranges = ?self.ranges, "generated search ranges");
    }

    /// Minimum-gain threshold suited to the dataset and criterion.
    pub fn auto_impurity_threshold(&self, params: &DatasetParams) -> f32 {
        if params.label_counts.is_empty() {
            return 0.0;
        }
        let k = params.num_labels.max(2);
        let imbalance = params.imbalance(k);

        let log_samples = (params.num_samples.max(2) as f64).log2();
        let adjusted = (log_samples - 10.0).max(0.0);
        let sample_factor = ((1.0 / (1.0 + adjusted / 2.5)) as f32).clamp(0.25, 1.15);
        let imbalance_factor = 1.0 - 0.5 * imbalance;
        let feature_factor =
            0.9 + 0.1 * ((params.num_features.max(2) as f32).log2() / 8.0).min(1.0);
        let scale = sample_factor * imbalance_factor * feature_factor;

        match self.criterion {
            ImpurityCriterion::Gini => {
                let max_gini = 1.0 - 1.0 / k as f32;
                (0.003 * max_gini * scale).clamp(0.0003, 0.02)
            }
            ImpurityCriterion::Entropy => {
                let max_entropy = (k as f32).log2();
                let base = 0.02 * if max_entropy > 0.0 { max_entropy } else { 1.0 };
                (base * scale).clamp(0.002, 0.2)
            }
        }
    }

    /// Metric suited to the dataset's class balance, judged by the
    /// majority-to-minority count ratio over present labels.
    pub fn auto_metric(params: &DatasetParams) -> MetricMask {
        let present = params.label_counts.iter().copied().filter(|&c| c > 0);
        let (min, max) = present.fold((u32::MAX, 0u32), |(lo, hi), c| (lo.min(c), hi.max(c)));
        if max == 0 {
            return MetricMask::ACCURACY;
        }
        let ratio = max as f32 / min as f32;
        if ratio > 10.0 {
            MetricMask::RECALL
        } else if ratio > 3.0 {
            MetricMask::F1
        } else if ratio > 1.5 {
            MetricMask::PRECISION
        } else {
            MetricMask::ACCURACY
        }
    }

    /// Scoring mode suited to the samples available per label.
    pub fn auto_training_score(params: &DatasetParams) -> TrainingScore {
        let per_label = params.num_samples / params.num_labels.max(1);
        if per_label < 200 {
            TrainingScore::KFold
        } else if per_label < 500 {
            TrainingScore::Oob
        } else {
            TrainingScore::Validation
        }
    }

    /// Configure metric, scoring mode, ranges and impurity threshold from the
    /// dataset.
    pub fn auto_config(&mut self, params: &DatasetParams) {
        if !params.label_counts.is_empty() {
            self.metric = Self::auto_metric(params);
        }
        self.training_score = Self::auto_training_score(params);
        if self.training_score == TrainingScore::Validation && self.valid_ratio == 0.0 {
            self.train_ratio = self.train_ratio.min(0.7);
            self.valid_ratio = 0.15;
        }
        self.generate_ranges(params, true);
        self.impurity_threshold = self.auto_impurity_threshold(params);
        tracing::info!(
            metric = ?self.metric,
            training_score = ?self.training_score,
            impurity_threshold = self.impurity_threshold,
            "auto-configured from dataset"
        );
    }
}

// =============================================================================
// Tests
// =============================================================================
