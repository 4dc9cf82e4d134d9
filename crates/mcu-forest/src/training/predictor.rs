//! Node-count predictor.
//!
//! Estimates how many nodes a tree will have for a given `(min_split,
//! min_leaf, max_depth)` so the node layout and build queue can be sized
//! before the build starts. The model is linear:
//!
//! ```text
//! nodes = bias + c_split * min_split + c_leaf * min_leaf      (floored at 10)
//! ```
//!
//! It is refit from a rolling CSV log of past builds (newest rows first,
//! at most [`MAX_LOG_ROWS`]). Until it has been fit, a heuristic over the
//! dataset shape is used instead.
//!
//! # Files
//!
//! ```text
//! node_pred.bin:  "NODE" | trained:u8 | accuracy:u8 | peak_percent:u8 | n_coeff:u8
//!                 | n_coeff × f32 | trained_sample_count:u32
//! node_log.csv:   min_split,min_leaf,max_depth,total_nodes
//! ```
//!
//! Older predictor files end after the coefficients; they load with a
//! trained sample count of 0, which disables drift scaling.

use std::fmt::Write as _;

use crate::io::{ByteReader, FormatError, ModelPaths, SharedStorage, StorageError, NODE_PREDICTOR_MAGIC};
use crate::repr::MAX_NODES;

// =============================================================================
// Constants
// =============================================================================

/// Rows kept in the CSV log.
pub const MAX_LOG_ROWS: usize = 50;

/// Observations buffered in memory before the oldest are dropped.
pub const MAX_BUFFERED_ROWS: usize = 100;

/// Share of a tree's nodes assumed to sit in the queue at its widest level.
pub const DEFAULT_PEAK_PERCENT: u8 = 30;

/// Log rows required (strictly more than this) to refit.
const MIN_TRAINING_ROWS: usize = 3;

const COEFF_COUNT: u8 = 3;
const MIN_ESTIMATE: f32 = 10.0;
const MIN_QUEUE: usize = 30;

const LOG_HEADER: &str = "min_split,min_leaf,max_depth,total_nodes";

// =============================================================================
// Types
// =============================================================================

/// One observed build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLogRow {
    pub min_split: u8,
    pub min_leaf: u8,
    pub max_depth: u16,
    pub total_nodes: u32,
}

impl NodeLogRow {
    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split(',').map(str::trim);
        let row = Self {
            min_split: parts.next()?.parse().ok()?,
            min_leaf: parts.next()?.parse().ok()?,
            max_depth: parts.next()?.parse().ok()?,
            total_nodes: parts.next()?.parse().ok()?,
        };
        (row.min_split > 0 && row.total_nodes > 0).then_some(row)
    }
}

/// Dataset shape the heuristic estimate and the safe budgets scale with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DatasetShape {
    pub num_samples: usize,
    pub num_features: usize,
    pub num_labels: usize,
}

/// Linear node-count estimator backed by a rolling build log.
pub struct NodePredictor {
    storage: SharedStorage,
    predictor_path: String,
    log_path: String,
    coefficients: [f32; 3],
    trained: bool,
    accuracy: u8,
    peak_percent: u8,
    trained_sample_count: u32,
    shape: DatasetShape,
    buffer: Vec<NodeLogRow>,
}

impl std::fmt::Debug for NodePredictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodePredictor")
            .field("predictor_path", &self.predictor_path)
            .field("coefficients", &self.coefficients)
            .field("trained", &self.trained)
            .field("accuracy", &self.accuracy)
            .field("peak_percent", &self.peak_percent)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl NodePredictor {
    pub fn new(storage: SharedStorage, paths: &ModelPaths) -> Self {
        Self {
            storage,
            predictor_path: paths.node_predictor(),
            log_path: paths.node_log(),
            coefficients: [0.0; 3],
            trained: false,
            accuracy: 0,
            peak_percent: DEFAULT_PEAK_PERCENT,
            trained_sample_count: 0,
            shape: DatasetShape::default(),
            buffer: Vec::new(),
        }
    }

    /// Set the dataset shape used by estimates.
    pub fn set_shape(&mut self, shape: DatasetShape) {
        self.shape = shape;
    }

    #[inline]
    pub fn shape(&self) -> DatasetShape {
        self.shape
    }

    #[inline]
    pub fn is_trained(&self) -> bool {
        self.trained
    }

    /// Fit accuracy in percent.
    #[inline]
    pub fn accuracy(&self) -> u8 {
        self.accuracy
    }

    #[inline]
    pub fn peak_percent(&self) -> u8 {
        self.peak_percent
    }

    /// `[bias, min_split, min_leaf]`
    #[inline]
    pub fn coefficients(&self) -> [f32; 3] {
        self.coefficients
    }

    #[inline]
    pub fn trained_sample_count(&self) -> u32 {
        self.trained_sample_count
    }

    #[inline]
    pub fn buffered(&self) -> &[NodeLogRow] {
        &self.buffer
    }

    // =========================================================================
    // Estimation
    // =========================================================================

    /// Fitted formula, floored at 10.
    pub fn evaluate_formula(&self, min_split: u8, min_leaf: u8) -> f32 {
        let [bias, c_split, c_leaf] = self.coefficients;
        (bias + c_split * min_split as f32 + c_leaf * min_leaf as f32).max(MIN_ESTIMATE)
    }

    /// Heuristic used before the predictor has been fit.
    pub fn manual_estimate(&self, min_split: u8, min_leaf: u8, max_depth: u16) -> f32 {
        if min_split == 0 {
            return 100.0;
        }
        let depth = max_depth.min(250) as f32;
        let base = 120.0 - 10.0 * min_split as f32
            + 60.0 / min_leaf.max(1) as f32
            + depth / 50.0 * 15.0;

        let DatasetShape {
            num_samples: ns,
            num_features: nf,
            num_labels: nl,
        } = self.shape;
        let sample_factor = if ns > 100 {
            (1.0 + 0.5 * (ns as f32 / 100.0).log2()).min(2.5)
        } else {
            1.0
        };
        let feature_factor = if nf > 10 {
            (1.0 + 0.3 * (nf as f32 / 10.0).log2()).min(2.0)
        } else {
            1.0
        };
        let label_factor = if nl > 2 {
            (0.8 + 0.2 * nl as f32 / 10.0).min(1.5)
        } else {
            1.0
        };
        (base * sample_factor * feature_factor * label_factor).max(MIN_ESTIMATE)
    }

    /// Formula output with sample-count drift applied, or the heuristic when
    /// untrained or the dataset has drifted too far from the fit.
    fn raw_estimate(&self, min_split: u8, min_leaf: u8, max_depth: u16) -> f32 {
        if !self.trained {
            return self.manual_estimate(min_split, min_leaf, max_depth);
        }
        let fitted = self.evaluate_formula(min_split, min_leaf);
        if self.trained_sample_count == 0 || self.shape.num_samples == 0 {
            return fitted;
        }
        let ratio = self.shape.num_samples as f32 / self.trained_sample_count as f32;
        if !(0.5..=1.75).contains(&ratio) {
            tracing::debug!(ratio, "sample count drifted from fit, using heuristic");
            return self.manual_estimate(min_split, min_leaf, max_depth);
        }
        fitted * ratio.clamp(0.75, 1.35)
    }

    fn safe_budget(&self, min_leaf: u8) -> usize {
        (self.shape.num_samples / min_leaf.max(1) as usize).max(MAX_NODES)
    }

    /// Expected node count, inflated by the fit's error margin.
    pub fn estimate_nodes(&self, min_split: u8, min_leaf: u8, max_depth: u16) -> usize {
        let raw = self.raw_estimate(min_split, min_leaf, max_depth);
        let estimate = raw * 100.0 / self.accuracy.max(90) as f32;
        if estimate >= MAX_NODES as f32 {
            if self.shape.num_samples < 2024 {
                512
            } else {
                self.safe_budget(min_leaf)
            }
        } else {
            estimate as usize
        }
    }

    /// Build-queue capacity: the estimate's widest level.
    ///
    /// `k_folds` shrinks the estimate to the `k-1` of `k` folds each
    /// k-fold build trains on.
    pub fn queue_peak_size(
        &self,
        min_split: u8,
        min_leaf: u8,
        max_depth: u16,
        k_folds: Option<u8>,
    ) -> usize {
        let mut peak = self.estimate_nodes(min_split, min_leaf, max_depth) as f32
            * self.peak_percent as f32
            / 100.0;
        if let Some(k) = k_folds.filter(|&k| k > 0) {
            peak *= k as f32 / (k as f32 + 1.0);
        }
        let cap = ((self.safe_budget(min_leaf) as f32 * 0.3) as usize).max(MIN_QUEUE);
        (peak as usize).clamp(MIN_QUEUE, cap)
    }

    // =========================================================================
    // Build log
    // =========================================================================

    /// Buffer one observed build. Rows with `min_split == 0` are ignored.
    pub fn add_new_samples(&mut self, min_split: u8, min_leaf: u8, max_depth: u16, total_nodes: u32) {
        if min_split == 0 || total_nodes == 0 {
            return;
        }
        if self.buffer.len() >= MAX_BUFFERED_ROWS {
            self.buffer.remove(0);
        }
        self.buffer.push(NodeLogRow {
            min_split,
            min_leaf,
            max_depth,
            total_nodes,
        });
    }

    /// Rows currently in the CSV log, newest first.
    pub fn read_log(&self) -> Result<Vec<NodeLogRow>, StorageError> {
        if !self.storage.exists(&self.log_path) {
            return Ok(Vec::new());
        }
        let bytes = self.storage.read(&self.log_path)?;
        let text = String::from_utf8_lossy(&bytes);
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with(|c: char| c.is_ascii_digit()))
            .filter_map(NodeLogRow::parse)
            .collect())
    }

    /// Prepend buffered rows to the CSV log, keeping the newest
    /// [`MAX_LOG_ROWS`]. Returns the number of rows written.
    pub fn flush_buffer(&mut self) -> Result<usize, StorageError> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        let mut rows = std::mem::take(&mut self.buffer);
        rows.extend(self.read_log()?);
        rows.truncate(MAX_LOG_ROWS);

        let mut csv = String::with_capacity(LOG_HEADER.len() + 16 * rows.len());
        csv.push_str(LOG_HEADER);
        csv.push('\n');
        for r in &rows {
            let _ = writeln!(
                csv,
                "{},{},{},{}",
                r.min_split, r.min_leaf, r.max_depth, r.total_nodes
            );
        }
        self.storage.write_atomic(&self.log_path, csv.as_bytes())?;
        Ok(rows.len())
    }

    /// Whether log plus buffer hold enough rows to refit.
    pub fn can_retrain(&self) -> bool {
        let logged = self.read_log().map(|r| r.len()).unwrap_or(0);
        (logged + self.buffer.len()).min(MAX_LOG_ROWS) > MIN_TRAINING_ROWS
    }

    /// Refit from the log (after flushing the buffer).
    ///
    /// Returns `Ok(false)` without touching the fit when there are too few rows.
    pub fn re_train(&mut self) -> Result<bool, StorageError> {
        self.flush_buffer()?;
        let rows = self.read_log()?;
        if rows.len() <= MIN_TRAINING_ROWS {
            tracing::debug!(rows = rows.len(), "not enough build log rows to refit");
            return Ok(false);
        }

        let (split_effect, first_split) = trend(&rows, |r| r.min_split as u16);
        let (leaf_effect, first_leaf) = trend(&rows, |r| r.min_leaf as u16);
        let mean = rows.iter().map(|r| r.total_nodes as f32).sum::<f32>() / rows.len() as f32;
        let first_split = first_split.map_or(3.0, f32::from);
        let first_leaf = first_leaf.map_or(2.0, f32::from);
        self.coefficients = [
            mean - split_effect * first_split - leaf_effect * first_leaf,
            split_effect,
            leaf_effect,
        ];

        let (err, actual) = rows.iter().fold((0.0f32, 0.0f32), |(e, a), r| {
            let predicted = self.evaluate_formula(r.min_split, r.min_leaf);
            let nodes = r.total_nodes as f32;
            (e + (predicted - nodes).abs(), a + nodes)
        });
        let mape = if actual > 0.0 { err / actual * 100.0 } else { 100.0 };
        self.accuracy = (100.0 - mape).clamp(0.0, 100.0) as u8;
        self.peak_percent = DEFAULT_PEAK_PERCENT;
        self.trained = true;
        self.trained_sample_count = self.shape.num_samples as u32;

        tracing::debug!(
            rows = rows.len(),
            bias = self.coefficients[0],
            split = split_effect,
            leaf = leaf_effect,
            accuracy = self.accuracy,
            "node predictor refit"
        );
        Ok(true)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        out.extend_from_slice(NODE_PREDICTOR_MAGIC);
        out.push(self.trained as u8);
        out.push(self.accuracy);
        out.push(self.peak_percent);
        out.push(COEFF_COUNT);
        for c in self.coefficients {
            out.extend_from_slice(&c.to_le_bytes());
        }
        out.extend_from_slice(&self.trained_sample_count.to_le_bytes());
        out
    }

    /// Decode a predictor file into this predictor.
    pub fn read_bytes(&mut self, bytes: &[u8]) -> Result<(), FormatError> {
        let mut r = ByteReader::new(bytes);
        r.expect_magic(NODE_PREDICTOR_MAGIC)?;
        let trained = r.u8()? != 0;
        let accuracy = r.u8()?;
        let peak_percent = r.u8()?;
        let n = r.u8()?;
        if n != COEFF_COUNT {
            return Err(FormatError::UnsupportedCoefficients {
                expected: COEFF_COUNT,
                found: n,
            });
        }
        let coefficients = [r.f32()?, r.f32()?, r.f32()?];
        let trained_sample_count = if r.remaining() >= 4 { r.u32()? } else { 0 };

        self.trained = trained;
        self.accuracy = accuracy;
        self.peak_percent = if peak_percent == 0 {
            DEFAULT_PEAK_PERCENT
        } else {
            peak_percent
        };
        self.coefficients = coefficients;
        self.trained_sample_count = trained_sample_count;
        Ok(())
    }

    /// Write the fit. An untrained predictor is not saved.
    pub fn save(&self) -> Result<bool, StorageError> {
        if !self.trained {
            return Ok(false);
        }
        self.storage.write_atomic(&self.predictor_path, &self.to_bytes())?;
        Ok(true)
    }

    /// Load a saved fit. Returns whether a trained fit is now active; a
    /// missing file is not an error.
    pub fn load(&mut self) -> Result<bool, FormatError> {
        if !self.storage.exists(&self.predictor_path) {
            return Ok(false);
        }
        let bytes = self.storage.read(&self.predictor_path)?;
        self.read_bytes(&bytes)?;
        Ok(self.trained)
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.buffer.capacity() * std::mem::size_of::<NodeLogRow>()
    }
}

/// Slope between the mean node counts at the smallest and largest value of
/// `key`, plus the smallest value. Zero slope when the range is degenerate.
fn trend(rows: &[NodeLogRow], key: impl Fn(&NodeLogRow) -> u16) -> (f32, Option<u16>) {
    let Some(first) = rows.iter().map(&key).min() else {
        return (0.0, None);
    };
    let last = rows.iter().map(&key).max().unwrap_or(first);
    let mean_at = |v: u16| {
        let (sum, n) = rows
            .iter()
            .filter(|&r| key(r) == v)
            .fold((0.0f32, 0u32), |(s, n), r| (s + r.total_nodes as f32, n + 1));
        sum / n.max(1) as f32
    };
    let range = (last - first) as f32;
    if range > 0.01 {
        ((mean_at(last) - mean_at(first)) / range, Some(first))
    } else {
        (0.0, Some(first))
    }
}
