//! Random-forest training orchestrator.
//!
//! [`Trainer`] owns the base sample store, the forest, the configuration and
//! the storage handle. A training session splits the base store into
//! train/test/validation files, draws bootstrap subsets, builds the forest
//! and scores it:
//!
//! ```text
//! Idle -> SessionOpen -> ForestBuilt -> Evaluated -> Idle
//! ```
//!
//! [`Trainer::build_model`] runs one build and evaluation;
//! [`Trainer::training`] grid-searches `min_split` against `min_leaf` or
//! `max_depth`, restores the best point and rebuilds. Both close their
//! session on every exit path, and dropping the trainer closes any session
//! still open.
//!
//! # Example
//!
//! ```ignore
//! use mcu_forest::io::{MemStorage, ModelPaths};
//! use mcu_forest::data::SampleStore;
//! use mcu_forest::training::{RfConfig, Trainer};
//!
//! let storage = MemStorage::shared();
//! let paths = ModelPaths::new("gesture");
//! let base = SampleStore::new(storage.clone(), paths.base_data());
//! // ... fill and release `base` ...
//! let mut trainer = Trainer::new(base, paths, RfConfig::default())?;
//! let report = trainer.training(20)?;
//! let label = trainer.predict(&[0, 3, 1, 2]);
//! ```

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::data::{ChunkAccessor, DataError, Sample, SampleSource, SampleStore};
use crate::io::{FormatError, InferenceLog, ModelPaths, SharedStorage, Storage, StorageError};
use crate::repr::forest::majority;
use crate::repr::{Forest, NodeLayout, MAX_FEATURES};

use super::bootstrap::{derive_rng, in_bag_mask, BootstrapEngine};
use super::builder::{BuildStats, TreeBuilder, TreeParams};
use super::config::{ConfigError, DatasetParams, GridAxis, RfConfig, TrainingScore};
use super::logger::TrainingLogger;
use super::pending::{FlushReport, PendingData};
use super::predictor::{DatasetShape, NodePredictor};
use super::score::ConfusionScore;

/// Node budget per tree while the node predictor has no fit.
pub const UNTRAINED_NODE_BUDGET: usize = 2046;

/// RNG stream for the train/test/validation split.
const SPLIT_STREAM: u64 = 2 << 32;

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while training or persisting a model.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The base store holds no samples.
    #[error("base sample store is empty")]
    NoData,
}

// =============================================================================
// Reports
// =============================================================================

/// Outcome of [`Trainer::build_model`] or [`Trainer::training`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    /// Score of the kept configuration, by the configured training score.
    pub score: f32,
    /// Score on the held-out test split, if it has any samples.
    pub test_score: Option<f32>,
    pub min_split: u8,
    pub min_leaf: u8,
    pub max_depth: u16,
    /// Grid points evaluated (0 for a single build).
    pub points: usize,
    pub total_nodes: usize,
    pub forced_leaves: usize,
}

/// What [`Trainer::save_model`] writes next to the forest file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SavedModel {
    config: RfConfig,
    dataset: DatasetParams,
    layout: [u8; 4],
}

#[derive(Debug, Clone, Copy)]
struct GridPoint {
    min_split: u8,
    second: u16,
    score: f32,
}

/// Resources that live only while a training session is open.
#[derive(Debug)]
struct Session {
    train: SampleStore,
    test: SampleStore,
    valid: SampleStore,
    /// Base ids of each split, sorted.
    train_ids: Vec<u32>,
    valid_ids: Vec<u32>,
    subsets: Vec<Vec<u32>>,
    dataset: DatasetParams,
    /// Refit the node predictor when the session closes.
    retrain: bool,
}

// =============================================================================
// Trainer
// =============================================================================

/// Owns everything a random forest needs to train, persist and predict.
pub struct Trainer {
    storage: SharedStorage,
    paths: ModelPaths,
    config: RfConfig,
    base: SampleStore,
    forest: Forest,
    predictor: NodePredictor,
    logger: TrainingLogger,
    pending: PendingData,
    infer_log: InferenceLog,
    num_labels: usize,
    session: Option<Session>,
    last_stats: BuildStats,
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("model", &self.paths.name())
            .field("base", &self.base)
            .field("num_trees", &self.forest.num_trees())
            .field("session_open", &self.session.is_some())
            .finish()
    }
}

impl Trainer {
    /// Create a trainer over `base`, using the base store's storage backend.
    ///
    /// A saved node-predictor fit is loaded if one exists.
    pub fn new(base: SampleStore, paths: ModelPaths, config: RfConfig) -> Result<Self, TrainError> {
        config.validate()?;
        let storage = base.storage().clone();
        let mut predictor = NodePredictor::new(storage.clone(), &paths);
        if let Err(e) = predictor.load() {
            warn!(error = %e, "ignoring unreadable node predictor file");
        }
        let forest = Forest::new(
            config.num_trees as usize,
            NodeLayout::default(),
            config.quant_bits,
            0,
        );
        Ok(Self {
            infer_log: InferenceLog::new(storage.clone(), paths.infer_log()),
            logger: TrainingLogger::new(config.verbosity),
            storage,
            paths,
            base,
            forest,
            predictor,
            pending: PendingData::default(),
            num_labels: 0,
            session: None,
            last_stats: BuildStats::default(),
            config,
        })
    }

    /// Reopen a model written by [`save_model`](Self::save_model).
    pub fn load_model(base: SampleStore, paths: ModelPaths) -> Result<Self, TrainError> {
        let storage = base.storage().clone();
        let bytes = storage.read(&paths.config())?;
        let saved: SavedModel = serde_json::from_slice(&bytes).map_err(ConfigError::from)?;
        let layout = NodeLayout::from_bytes(saved.layout).ok_or_else(|| {
            FormatError::CorruptPayload(format!("invalid saved layout {:?}", saved.layout))
        })?;

        let mut trainer = Self::new(base, paths, saved.config)?;
        trainer.num_labels = saved.dataset.num_labels;
        let mut forest = Forest::new(
            trainer.config.num_trees as usize,
            layout,
            trainer.config.quant_bits,
            trainer.num_labels,
        );
        forest.load_unified(trainer.storage.as_ref(), &trainer.paths)?;
        forest
            .validate(saved.dataset.num_features)
            .map_err(|e| FormatError::CorruptPayload(format!("{e:?}")))?;
        info!(
            model = trainer.paths.name(),
            trees = forest.num_trees(),
            nodes = forest.total_nodes(),
            "model loaded"
        );
        trainer.forest = forest;
        Ok(trainer)
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    #[inline]
    pub fn config(&self) -> &RfConfig {
        &self.config
    }

    /// Replace the configuration. Refused while a session is open.
    pub fn set_config(&mut self, config: RfConfig) -> Result<(), ConfigError> {
        if self.session.is_some() {
            return Err(ConfigError::SessionAlreadyOpen);
        }
        config.validate()?;
        self.logger = TrainingLogger::new(config.verbosity);
        self.config = config;
        Ok(())
    }

    #[inline]
    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    #[inline]
    pub fn base(&self) -> &SampleStore {
        &self.base
    }

    /// Mutable base store, e.g. to add samples between sessions.
    #[inline]
    pub fn base_mut(&mut self) -> &mut SampleStore {
        &mut self.base
    }

    #[inline]
    pub fn paths(&self) -> &ModelPaths {
        &self.paths
    }

    #[inline]
    pub fn predictor(&self) -> &NodePredictor {
        &self.predictor
    }

    #[inline]
    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    #[inline]
    pub fn is_session_open(&self) -> bool {
        self.session.is_some()
    }

    /// Counters of the last forest build.
    #[inline]
    pub fn last_build_stats(&self) -> BuildStats {
        self.last_stats
    }

    /// Bootstrap subsets of the open session.
    pub fn subsets(&self) -> Option<&[Vec<u32>]> {
        self.session.as_ref().map(|s| s.subsets.as_slice())
    }

    /// Training split of the open session.
    pub fn train_store(&self) -> Option<&SampleStore> {
        self.session.as_ref().map(|s| &s.train)
    }

    /// Dataset scan taken when the session opened.
    pub fn dataset(&self) -> Option<&DatasetParams> {
        self.session.as_ref().map(|s| &s.dataset)
    }

    pub fn memory_usage(&self) -> usize {
        let session = self.session.as_ref().map_or(0, |s| {
            s.train.memory_usage()
                + s.test.memory_usage()
                + s.valid.memory_usage()
                + s.subsets.iter().map(|v| v.capacity() * 4).sum::<usize>()
        });
        std::mem::size_of::<Self>()
            + self.base.memory_usage()
            + self.forest.memory_usage()
            + self.predictor.memory_usage()
            + self.pending.memory_usage()
            + session
    }

    /// Scan the base store and tune metric, scoring mode, search ranges and
    /// impurity threshold to it. Refused while a session is open.
    pub fn auto_configure(&mut self) -> Result<DatasetParams, TrainError> {
        if self.session.is_some() {
            return Err(ConfigError::SessionAlreadyOpen.into());
        }
        self.prepare_base()?;
        let params = DatasetParams::scan(&self.base)?;
        if params.num_samples == 0 {
            return Err(TrainError::NoData);
        }
        self.config.quant_bits = self.base.quant_bits();
        self.config.auto_config(&params);
        self.config.validate()?;
        Ok(params)
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Open a session: scan the base store, split it and draw subsets.
    ///
    /// Only one session may be open at a time.
    pub fn begin_training_session(&mut self) -> Result<&DatasetParams, TrainError> {
        if self.session.is_some() {
            warn!("refusing to open a second training session");
            return Err(ConfigError::SessionAlreadyOpen.into());
        }
        self.config.validate()?;
        self.prepare_base()?;

        let dataset = DatasetParams::scan(&self.base)?;
        if dataset.num_samples == 0 || dataset.num_features == 0 {
            return Err(TrainError::NoData);
        }
        self.check_data_shape(dataset.num_features)?;
        self.num_labels = dataset.num_labels;
        self.predictor.set_shape(DatasetShape {
            num_samples: dataset.num_samples,
            num_features: dataset.num_features,
            num_labels: dataset.num_labels,
        });

        let num_labels = dataset.num_labels;
        let store = |path: String| {
            SampleStore::new(self.storage.clone(), path).with_num_labels(num_labels)
        };
        let session = Session {
            train: store(self.paths.train_data()),
            test: store(self.paths.test_data()),
            valid: store(self.paths.valid_data()),
            train_ids: Vec::new(),
            valid_ids: Vec::new(),
            subsets: Vec::new(),
            dataset,
            retrain: false,
        };
        debug!(
            model = self.paths.name(),
            samples = session.dataset.num_samples,
            labels = session.dataset.num_labels,
            "training session opened"
        );
        self.session = Some(session);

        if let Err(e) = self.split_data().and_then(|()| self.make_subsets()) {
            self.close_session();
            return Err(e);
        }
        Ok(&self.session_ref()?.dataset)
    }

    /// Close the open session: delete the split files and update the node
    /// predictor. Cleanup failures are logged, not returned.
    pub fn end_training_session(&mut self) -> Result<(), ConfigError> {
        if self.session.is_none() {
            return Err(ConfigError::NoSession);
        }
        self.close_session();
        Ok(())
    }

    fn close_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        for store in [&mut session.train, &mut session.test, &mut session.valid] {
            if let Err(e) = store.purge() {
                warn!(path = store.path(), error = %e, "failed to remove split file");
            }
        }

        if session.retrain && self.config.enable_retrain {
            match self.predictor.re_train() {
                Ok(true) => {
                    if let Err(e) = self.predictor.save() {
                        warn!(error = %e, "failed to save node predictor");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "node predictor refit failed"),
            }
        } else if let Err(e) = self.predictor.flush_buffer() {
            warn!(error = %e, "failed to flush node log");
        }
        debug!(model = self.paths.name(), "training session closed");
    }

    fn session_ref(&self) -> Result<&Session, ConfigError> {
        self.session.as_ref().ok_or(ConfigError::NoSession)
    }

    /// Make sure the base store's shape is known and its file is current.
    /// Refuse data the configuration or the node layout cannot represent.
    fn check_data_shape(&self, num_features: usize) -> Result<(), ConfigError> {
        if num_features > MAX_FEATURES {
            warn!(num_features, max = MAX_FEATURES, "too many features for packed nodes");
            return Err(ConfigError::TooManyFeatures {
                count: num_features,
                max: MAX_FEATURES,
            });
        }
        let data_bits = self.base.quant_bits();
        if data_bits != self.config.quant_bits {
            warn!(
                config = self.config.quant_bits,
                data = data_bits,
                "quantization width differs from the base store"
            );
            return Err(ConfigError::QuantBitsMismatch {
                config: self.config.quant_bits,
                data: data_bits,
            });
        }
        Ok(())
    }

    fn prepare_base(&mut self) -> Result<(), TrainError> {
        if !self.base.is_loaded() && !self.base.has_file() {
            return Err(TrainError::NoData);
        }
        if !self.base.is_loaded() && self.base.num_features() == 0 {
            self.base.load()?;
        }
        if self.base.is_loaded() {
            self.base.release(true)?;
        }
        Ok(())
    }

    // =========================================================================
    // Data split
    // =========================================================================

    /// Fill the train/test/validation files with disjoint random ids from
    /// the base store. The train split always gets at least one sample.
    pub fn split_data(&mut self) -> Result<(), TrainError> {
        self.config.validate_ratios()?;
        let session = self.session.as_mut().ok_or(ConfigError::NoSession)?;
        let n = session.dataset.num_samples;

        let mut ids: Vec<u32> = (0..n as u32).collect();
        let mut rng = derive_rng(self.config.seed, SPLIT_STREAM, 0);
        ids.shuffle(&mut rng);

        let take = |ratio: f32, left: usize| ((n as f32 * ratio) as usize).min(left);
        let n_train = take(self.config.train_ratio, n).max(1);
        let n_test = take(self.config.test_ratio, n - n_train);
        let n_valid = take(self.config.valid_ratio, n - n_train - n_test);

        let sorted = |slice: &[u32]| {
            let mut v = slice.to_vec();
            v.sort_unstable();
            v
        };
        session.train_ids = sorted(&ids[..n_train]);
        let test_ids = sorted(&ids[n_train..n_train + n_test]);
        session.valid_ids = sorted(&ids[n_train + n_test..n_train + n_test + n_valid]);

        fill_split(&self.base, &mut session.train, &session.train_ids)?;
        fill_split(&self.base, &mut session.test, &test_ids)?;
        fill_split(&self.base, &mut session.valid, &session.valid_ids)?;
        debug!(
            train = n_train,
            test = n_test,
            valid = n_valid,
            "data split"
        );
        Ok(())
    }

    /// Draw one bootstrap subset per tree over the training split.
    fn make_subsets(&mut self) -> Result<(), TrainError> {
        let session = self.session.as_mut().ok_or(ConfigError::NoSession)?;
        let mut engine = BootstrapEngine::from_config(&self.config);
        session.subsets = engine.build_all(self.config.num_trees as usize, session.train.len());
        Ok(())
    }

    // =========================================================================
    // Forest build
    // =========================================================================

    /// Build every tree from its bootstrap subset of the training split.
    ///
    /// The training split is read through a [`ChunkAccessor`] when loading
    /// it would exceed the memory budget.
    pub fn build_forest(&mut self) -> Result<BuildStats, TrainError> {
        let session = self.session.as_mut().ok_or(ConfigError::NoSession)?;
        let config = &self.config;
        let (nl, nf) = (session.dataset.num_labels, session.dataset.num_features);
        let (ms, ml, depth) = (config.min_split, config.min_leaf, config.max_depth);

        let budget = if self.predictor.is_trained() {
            self.predictor.estimate_nodes(ms, ml, depth)
        } else {
            UNTRAINED_NODE_BUDGET
        };
        let layout = Forest::calculate_layout(nl, nf, budget, config.quant_bits);
        let mut forest = Forest::new(config.num_trees as usize, layout, config.quant_bits, nl);

        let k_folds = (config.training_score == TrainingScore::KFold).then_some(config.k_folds);
        let queue = self.predictor.queue_peak_size(ms, ml, depth, k_folds);
        let mut builder = TreeBuilder::new(
            TreeParams::from_config(config, nl, nf),
            layout,
            *forest.thresholds(),
            config.seed,
        )
        .with_queue_capacity(queue);

        let train = &mut session.train;
        let paged = config.memory_budget > 0 && train.estimated_resident_bytes() > config.memory_budget;
        let mut accessor = None;
        if paged {
            match ChunkAccessor::init(
                self.storage.clone(),
                train.path(),
                train.len(),
                nf,
                train.quant_bits(),
                train.samples_per_chunk(),
            ) {
                Ok(a) => accessor = Some(a),
                Err(e) => warn!(error = %e, "chunk accessor unavailable, loading training split"),
            }
        }
        let stats = match accessor.as_mut() {
            Some(accessor) => build_trees(&mut builder, accessor, &session.subsets, &mut forest),
            None => {
                train.load()?;
                let stats = build_trees(&mut builder, train, &session.subsets, &mut forest);
                train.release(false)?;
                stats
            }
        };

        let avg_nodes = stats.nodes / forest.num_trees().max(1);
        self.predictor.add_new_samples(ms, ml, depth, avg_nodes as u32);
        debug!(
            trees = forest.num_trees(),
            nodes = stats.nodes,
            forced_leaves = stats.forced_leaves,
            layout = %layout,
            paged = accessor.is_some(),
            "forest built"
        );
        self.forest = forest;
        self.num_labels = nl;
        self.last_stats = stats;
        Ok(stats)
    }

    // =========================================================================
    // Scoring
    // =========================================================================

    /// Out-of-bag score on the training split.
    ///
    /// Each sample is voted on only by trees whose subset excludes it;
    /// samples with no such tree are skipped.
    pub fn oob_score(&self) -> Result<f32, TrainError> {
        let session = self.session_ref()?;
        let n = session.train.len();
        let masks: Vec<Vec<bool>> = session.subsets.iter().map(|s| in_bag_mask(s, n)).collect();
        let nl = self.num_labels;
        let mut scorer = ConfusionScore::new(nl, self.config.metric);
        let mut votes = vec![0u16; nl];

        for_each_sample(&session.train, |i, sample| {
            votes.iter_mut().for_each(|v| *v = 0);
            for (t, tree) in self.forest.trees().enumerate() {
                if masks.get(t).map_or(true, |m| m.get(i).copied().unwrap_or(false)) {
                    continue;
                }
                let p = tree.predict(&sample.features) as usize;
                if p < nl {
                    votes[p] += 1;
                }
            }
            if votes.iter().any(|&v| v > 0) {
                scorer.update_prediction(sample.label, majority(&votes));
            }
        })?;
        debug!(evaluated = scorer.total(), samples = n, "oob scored");
        Ok(scorer.calculate_score())
    }

    /// Score on the validation split, falling back to out-of-bag when the
    /// split is empty.
    pub fn validation_score(&self) -> Result<f32, TrainError> {
        let session = self.session_ref()?;
        match self.score_store(&session.valid)? {
            Some(score) => Ok(score),
            None => {
                self.logger
                    .log_warning("validation split is empty, scoring out-of-bag");
                self.oob_score()
            }
        }
    }

    /// Score on the held-out test split, `None` if it has no samples.
    pub fn evaluate_test(&self) -> Result<Option<f32>, TrainError> {
        let session = self.session_ref()?;
        self.score_store(&session.test)
    }

    /// Mean validation score over `k_folds` folds of the non-test samples.
    ///
    /// Each fold is a contiguous block of the pool; the rest trains a fresh
    /// forest. The session's splits and subsets are restored afterwards, but
    /// the forest is the last fold's.
    pub fn kfold_score(&mut self) -> Result<f32, TrainError> {
        let k = self.config.k_folds;
        let (pool, train_ids, valid_ids) = {
            let session = self.session_ref()?;
            let mut pool = session.train_ids.clone();
            pool.extend_from_slice(&session.valid_ids);
            let mut rng = derive_rng(self.config.seed, SPLIT_STREAM, 1);
            pool.shuffle(&mut rng);
            (pool, session.train_ids.clone(), session.valid_ids.clone())
        };
        if pool.len() < 2 * k as usize {
            return Err(ConfigError::TooFewSamplesForKFold {
                samples: pool.len(),
                k,
            }
            .into());
        }

        let fold_size = pool.len() / k as usize;
        let mut total = 0.0f32;
        for fold in 0..k as usize {
            let (lo, hi) = (fold * fold_size, (fold + 1) * fold_size);
            let mut fold_valid = pool[lo..hi].to_vec();
            let mut fold_train: Vec<u32> = pool[..lo].iter().chain(&pool[hi..]).copied().collect();
            fold_valid.sort_unstable();
            fold_train.sort_unstable();

            self.refill_splits(&fold_train, &fold_valid)?;
            self.make_subsets()?;
            self.build_forest()?;
            let score = self.score_store(&self.session_ref()?.valid)?.unwrap_or(0.0);
            debug!(fold, score, "fold scored");
            total += score;
        }

        self.refill_splits(&train_ids, &valid_ids)?;
        self.make_subsets()?;
        Ok(total / k as f32)
    }

    fn refill_splits(&mut self, train_ids: &[u32], valid_ids: &[u32]) -> Result<(), TrainError> {
        let session = self.session.as_mut().ok_or(ConfigError::NoSession)?;
        fill_split(&self.base, &mut session.train, train_ids)?;
        fill_split(&self.base, &mut session.valid, valid_ids)?;
        Ok(())
    }

    /// Forest score on every sample of `store`; `None` if the store is empty.
    fn score_store(&self, store: &SampleStore) -> Result<Option<f32>, TrainError> {
        if store.is_empty() {
            return Ok(None);
        }
        let mut scorer = ConfusionScore::new(self.num_labels, self.config.metric);
        for_each_sample(store, |_, sample| {
            scorer.update_prediction(sample.label, self.forest.predict(&sample.features));
        })?;
        Ok(Some(scorer.calculate_score()))
    }

    /// Build (for k-fold: build per fold) and score the current config.
    fn score_current(&mut self) -> Result<f32, TrainError> {
        match self.config.training_score {
            TrainingScore::Oob => {
                self.build_forest()?;
                self.oob_score()
            }
            TrainingScore::Validation => {
                self.build_forest()?;
                self.validation_score()
            }
            TrainingScore::KFold => self.kfold_score(),
        }
    }

    // =========================================================================
    // Top-level operations
    // =========================================================================

    /// One build and evaluation with the current config, then save.
    pub fn build_model(&mut self) -> Result<TrainingReport, TrainError> {
        self.begin_training_session()?;
        let result = self.build_model_inner();
        self.end_training_session()?;
        result
    }

    fn build_model_inner(&mut self) -> Result<TrainingReport, TrainError> {
        let score = self.score_current()?;
        if self.config.training_score == TrainingScore::KFold {
            self.build_forest()?;
        }
        self.finish(score, 0)
    }

    /// Grid search over `min_split` and the configured second axis.
    ///
    /// Each point consumes one epoch; the best point (strictly greater
    /// score wins) is restored and rebuilt, and the model saved.
    pub fn training(&mut self, epochs: usize) -> Result<TrainingReport, TrainError> {
        self.begin_training_session()?;
        if let Some(session) = self.session.as_mut() {
            session.retrain = true;
        }
        let result = self.run_grid(epochs);
        self.end_training_session()?;
        result
    }

    fn run_grid(&mut self, epochs: usize) -> Result<TrainingReport, TrainError> {
        let step = self.config.grid_step.max(1) as usize;
        let ranges = self.config.ranges;
        let axis = self.config.grid_axis;
        let (lo, hi) = match axis {
            GridAxis::MinLeaf => (ranges.min_leaf.0 as u16, ranges.min_leaf.1 as u16),
            GridAxis::MaxDepth => ranges.max_depth,
        };
        let original = self.config.clone();
        self.logger
            .start_training(self.config.num_trees as usize, epochs);

        let mut best: Option<GridPoint> = None;
        let mut remaining = epochs;
        'grid: for min_split in (ranges.min_split.0..=ranges.min_split.1).step_by(step) {
            for second in (lo..=hi).step_by(step) {
                if remaining == 0 {
                    break 'grid;
                }
                remaining -= 1;
                self.apply_point(axis, min_split, second);
                if let Err(e) = self.config.validate() {
                    self.logger.log_warning(&format!("skipping grid point: {e}"));
                    continue;
                }
                let score = self.score_current()?;
                self.logger
                    .log_grid_point(min_split, second, score, self.forest.total_nodes());
                if best.map_or(true, |b| score > b.score) {
                    self.logger.log_best(min_split, second, score);
                    best = Some(GridPoint {
                        min_split,
                        second,
                        score,
                    });
                }
            }
        }

        let points = self.logger.points();
        let score = match best {
            Some(point) => {
                self.apply_point(axis, point.min_split, point.second);
                self.build_forest()?;
                point.score
            }
            None => {
                self.config = original;
                let score = self.score_current()?;
                if self.config.training_score == TrainingScore::KFold {
                    self.build_forest()?;
                }
                score
            }
        };
        self.logger.finish_training(score);
        self.finish(score, points)
    }

    fn apply_point(&mut self, axis: GridAxis, min_split: u8, second: u16) {
        self.config.min_split = min_split;
        match axis {
            GridAxis::MinLeaf => self.config.min_leaf = second.min(u8::MAX as u16) as u8,
            GridAxis::MaxDepth => self.config.max_depth = second,
        }
    }

    fn finish(&mut self, score: f32, points: usize) -> Result<TrainingReport, TrainError> {
        let test_score = self.evaluate_test()?;
        self.save_model()?;
        let report = TrainingReport {
            score,
            test_score,
            min_split: self.config.min_split,
            min_leaf: self.config.min_leaf,
            max_depth: self.config.max_depth,
            points,
            total_nodes: self.forest.total_nodes(),
            forced_leaves: self.last_stats.forced_leaves,
        };
        info!(
            model = self.paths.name(),
            score,
            test_score = ?test_score,
            nodes = report.total_nodes,
            "model trained"
        );
        Ok(report)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Write the unified forest file, the config and the predictor fit.
    pub fn save_model(&self) -> Result<(), TrainError> {
        self.forest.save_unified(self.storage.as_ref(), &self.paths)?;
        let dataset = match &self.session {
            Some(s) => s.dataset.clone(),
            None => DatasetParams::scan(&self.base)?,
        };
        let saved = SavedModel {
            config: self.config.clone(),
            dataset,
            layout: self.forest.layout().to_bytes(),
        };
        let json = serde_json::to_vec_pretty(&saved).map_err(ConfigError::from)?;
        self.storage.write_atomic(&self.paths.config(), &json)?;
        self.predictor.save()?;
        debug!(model = self.paths.name(), "model saved");
        Ok(())
    }

    /// Write every tree to its own file and free the node arrays.
    pub fn release_forest(&mut self) -> Result<(), TrainError> {
        self.forest
            .release_forest(self.storage.as_ref(), &self.paths, true)?;
        Ok(())
    }

    /// Reload trees written by [`release_forest`](Self::release_forest).
    pub fn load_forest(&mut self) -> Result<(), TrainError> {
        self.forest.load_forest(self.storage.as_ref(), &self.paths)?;
        Ok(())
    }

    /// Drop the forest and delete its files. Returns the files removed.
    pub fn clear_forest(&mut self) -> Result<usize, TrainError> {
        Ok(self.forest.clear(self.storage.as_ref(), &self.paths)?)
    }

    // =========================================================================
    // Inference and feedback
    // =========================================================================

    /// Predict a quantized sample. With retraining enabled the sample is
    /// buffered until its actual label arrives.
    pub fn predict(&mut self, features: &[u8]) -> u8 {
        let label = self.forest.predict(features);
        if self.config.enable_retrain && self.pending.add_pending_sample(features.to_vec(), label) {
            debug!(pending = self.pending.len(), "pending buffer is full");
        }
        label
    }

    /// Actual label for the oldest unanswered prediction.
    pub fn add_actual_label(&mut self, label: u8) {
        self.pending.add_actual_label(label);
    }

    #[inline]
    pub fn pending(&self) -> &PendingData {
        &self.pending
    }

    /// Append labelled feedback to the base store and the inference log.
    pub fn flush_pending(&mut self) -> Result<FlushReport, TrainError> {
        if self.session.is_some() {
            return Err(ConfigError::SessionAlreadyOpen.into());
        }
        let max = self.config.max_samples as usize;
        Ok(self.pending.flush(&mut self.base, &self.infer_log, max)?)
    }

    /// Accuracy of logged predictions against their feedback.
    pub fn inference_accuracy(&self) -> Result<Option<f32>, TrainError> {
        Ok(self.infer_log.accuracy()?)
    }

    /// Configured metric over the last `n` logged predictions.
    pub fn recent_inference_score(&self, n: usize) -> Result<Option<f32>, TrainError> {
        let pairs = self.infer_log.read_pairs()?;
        if pairs.is_empty() || self.num_labels == 0 {
            return Ok(None);
        }
        let mut scorer = ConfusionScore::new(self.num_labels, self.config.metric);
        for &(predicted, actual) in pairs.iter().rev().take(n) {
            scorer.update_prediction(actual, predicted);
        }
        Ok(Some(scorer.calculate_score()))
    }
}

impl Drop for Trainer {
    fn drop(&mut self) {
        if self.session.is_some() {
            self.close_session();
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Load `ids` of `base` into `dest`, persist it and free it.
fn fill_split(base: &SampleStore, dest: &mut SampleStore, ids: &[u32]) -> Result<(), DataError> {
    dest.load_subset(base, ids)?;
    dest.release(true)
}

fn build_trees<S: SampleSource + ?Sized>(
    builder: &mut TreeBuilder,
    source: &mut S,
    subsets: &[Vec<u32>],
    forest: &mut Forest,
) -> BuildStats {
    let mut total = BuildStats::default();
    let mut ids = Vec::new();
    for (i, subset) in subsets.iter().enumerate() {
        ids.clear();
        ids.extend_from_slice(subset);
        let (tree, stats) = builder.build(source, i, &mut ids);
        forest.add_tree(tree);
        total.nodes += stats.nodes;
        total.leaves += stats.leaves;
        total.depth = total.depth.max(stats.depth);
        total.forced_leaves += stats.forced_leaves;
        total.peak_queue = total.peak_queue.max(stats.peak_queue);
    }
    total
}

/// Visit every sample of `store` with its index, chunk by chunk when the
/// store is released.
fn for_each_sample<F: FnMut(usize, &Sample)>(store: &SampleStore, mut f: F) -> Result<(), DataError> {
    if store.is_loaded() {
        for (i, sample) in store.iter().enumerate() {
            f(i, &sample);
        }
        return Ok(());
    }
    let mut index = 0usize;
    for chunk in 0..store.num_chunks() {
        for sample in store.read_chunk(chunk)? {
            f(index, &sample);
            index += 1;
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ERROR_LABEL;
    use crate::io::{MemStorage, Storage};
    use crate::training::config::MetricMask;

    /// Two features decide the label; the rest is noise.
    fn base_store(storage: &SharedStorage, paths: &ModelPaths, n: usize) -> SampleStore {
        let mut base = SampleStore::new(storage.clone(), paths.base_data());
        base.init(n, 4, 2).unwrap();
        for i in 0..n {
            let a = (i % 4) as u8;
            let b = ((i / 4) % 4) as u8;
            let label = if a >= 2 { 1 } else if b >= 2 { 2 } else { 0 };
            base.push(&Sample::new(vec![a, b, (i % 3) as u8, ((i * 7) % 4) as u8], label))
                .unwrap();
        }
        base.release(true).unwrap();
        base
    }

    fn trainer(n: usize, config: RfConfig) -> Trainer {
        let storage = MemStorage::shared();
        let paths = ModelPaths::new("t");
        let base = base_store(&storage, &paths, n);
        Trainer::new(base, paths, config).unwrap()
    }

    fn small_config() -> RfConfig {
        RfConfig::builder()
            .num_trees(5)
            .max_depth(8)
            .enable_retrain(false)
            .build()
            .unwrap()
    }

    #[test]
    fn second_session_is_refused() {
        let mut t = trainer(40, small_config());
        t.begin_training_session().unwrap();
        assert!(matches!(
            t.begin_training_session(),
            Err(TrainError::Config(ConfigError::SessionAlreadyOpen))
        ));
        t.end_training_session().unwrap();
        assert!(matches!(
            t.end_training_session(),
            Err(ConfigError::NoSession)
        ));
    }

    #[test]
    fn split_is_disjoint_and_sized() {
        let config = RfConfig::builder()
            .num_trees(3)
            .train_ratio(0.6)
            .test_ratio(0.2)
            .valid_ratio(0.2)
            .build()
            .unwrap();
        let mut t = trainer(50, config);
        t.begin_training_session().unwrap();
        let session = t.session.as_ref().unwrap();
        assert_eq!(session.train.len(), 30);
        assert_eq!(session.test.len(), 10);
        assert_eq!(session.valid.len(), 10);
        let mut all = session.train_ids.clone();
        all.extend_from_slice(&session.valid_ids);
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 40);
        t.end_training_session().unwrap();
    }

    #[test]
    fn session_close_removes_split_files() {
        let mut t = trainer(30, small_config());
        t.begin_training_session().unwrap();
        let train_path = t.paths().train_data();
        assert!(t.storage.exists(&train_path));
        t.end_training_session().unwrap();
        assert!(!t.storage.exists(&train_path));
    }

    #[test]
    fn drop_closes_open_session() {
        let storage = MemStorage::shared();
        let paths = ModelPaths::new("d");
        let base = base_store(&storage, &paths, 30);
        {
            let mut t = Trainer::new(base, paths.clone(), small_config()).unwrap();
            t.begin_training_session().unwrap();
        }
        assert!(!storage.exists(&paths.train_data()));
    }

    #[test]
    fn operations_need_a_session() {
        let mut t = trainer(30, small_config());
        assert!(matches!(
            t.build_forest(),
            Err(TrainError::Config(ConfigError::NoSession))
        ));
        assert!(t.oob_score().is_err());
        assert!(t.evaluate_test().is_err());
    }

    #[test]
    fn empty_base_is_rejected() {
        let storage = MemStorage::shared();
        let paths = ModelPaths::new("e");
        let base = SampleStore::new(storage, paths.base_data());
        let mut t = Trainer::new(base, paths, small_config()).unwrap();
        assert!(matches!(t.build_model(), Err(TrainError::NoData)));
        assert!(!t.is_session_open());
    }

    #[test]
    fn quant_width_must_match_base_store() {
        let config = RfConfig::builder()
            .num_trees(3)
            .quant_bits(4)
            .enable_retrain(false)
            .build()
            .unwrap();
        let mut t = trainer(40, config);
        assert!(matches!(
            t.begin_training_session(),
            Err(TrainError::Config(ConfigError::QuantBitsMismatch { config: 4, data: 2 }))
        ));
        assert!(!t.is_session_open());

        t.auto_configure().unwrap();
        assert_eq!(t.config().quant_bits, 2);
        t.begin_training_session().unwrap();
    }

    #[test]
    fn feature_count_is_capped_by_node_layout() {
        let t = trainer(20, small_config());
        assert!(t.check_data_shape(MAX_FEATURES).is_ok());
        assert!(matches!(
            t.check_data_shape(MAX_FEATURES + 1),
            Err(ConfigError::TooManyFeatures { count: 1025, max: 1024 })
        ));
    }

    #[test]
    fn build_model_learns_the_rule() {
        let mut t = trainer(96, small_config());
        let report = t.build_model().unwrap();
        assert!(report.score > 0.8, "score {}", report.score);
        assert!(!t.is_session_open());
        assert_eq!(t.predict(&[3, 0, 0, 0]), 1);
        assert_eq!(t.predict(&[0, 3, 0, 0]), 2);
        assert_eq!(t.predict(&[0, 0, 0, 0]), 0);
    }

    #[test]
    fn kfold_needs_enough_samples() {
        let config = RfConfig::builder()
            .num_trees(2)
            .training_score(TrainingScore::KFold)
            .k_folds(10)
            .build()
            .unwrap();
        let mut t = trainer(12, config);
        assert!(matches!(
            t.build_model(),
            Err(TrainError::Config(ConfigError::TooFewSamplesForKFold { k: 10, .. }))
        ));
        assert!(!t.is_session_open());
    }

    #[test]
    fn kfold_scores_and_restores_split() {
        let config = RfConfig::builder()
            .num_trees(3)
            .training_score(TrainingScore::KFold)
            .k_folds(3)
            .build()
            .unwrap();
        let mut t = trainer(60, config);
        t.begin_training_session().unwrap();
        let before = t.session.as_ref().unwrap().train_ids.clone();
        let score = t.kfold_score().unwrap();
        assert!((0.0..=1.0).contains(&score));
        let session = t.session.as_ref().unwrap();
        assert_eq!(session.train_ids, before);
        assert_eq!(session.train.len(), before.len());
        t.end_training_session().unwrap();
    }

    #[test]
    fn empty_validation_split_falls_back_to_oob() {
        let config = RfConfig::builder()
            .num_trees(4)
            .training_score(TrainingScore::Validation)
            .build()
            .unwrap();
        let mut t = trainer(40, config);
        t.begin_training_session().unwrap();
        t.build_forest().unwrap();
        let oob = t.oob_score().unwrap();
        assert_eq!(t.validation_score().unwrap(), oob);
        t.end_training_session().unwrap();
    }

    #[test]
    fn grid_stops_when_epochs_run_out() {
        let mut config = small_config();
        config.ranges.min_split = (2, 6);
        config.ranges.min_leaf = (1, 2);
        let mut t = trainer(48, config);
        let report = t.training(3).unwrap();
        assert_eq!(report.points, 3);
    }

    #[test]
    fn saved_model_reloads() {
        let mut t = trainer(64, small_config());
        t.build_model().unwrap();
        let queries = [[3u8, 1, 0, 2], [0, 3, 1, 1], [1, 1, 2, 0]];
        let expected: Vec<u8> = queries.iter().map(|p| t.forest().predict(p)).collect();

        let storage = t.storage.clone();
        let paths = t.paths().clone();
        drop(t);
        let base = SampleStore::new(storage, paths.base_data());
        let reloaded = Trainer::load_model(base, paths).unwrap();
        let got: Vec<u8> = queries.iter().map(|p| reloaded.forest().predict(p)).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn feedback_flows_into_base_and_log() {
        let mut config = small_config();
        config.enable_retrain = true;
        let mut t = trainer(40, config);
        t.build_model().unwrap();
        let before = t.base().len();

        let p = t.predict(&[3, 0, 0, 0]);
        assert_ne!(p, ERROR_LABEL);
        t.add_actual_label(1);
        t.predict(&[0, 0, 0, 0]);
        t.add_actual_label(0);
        let report = t.flush_pending().unwrap();
        assert_eq!(report.written, 2);
        assert_eq!(t.base().len(), before + 2);
        assert!(t.inference_accuracy().unwrap().is_some());
        assert!(t.recent_inference_score(1).unwrap().is_some());
    }

    #[test]
    fn metric_mask_reaches_the_scorer() {
        let config = RfConfig::builder()
            .num_trees(4)
            .metric(MetricMask::ACCURACY | MetricMask::F1)
            .build()
            .unwrap();
        let mut t = trainer(40, config);
        let report = t.build_model().unwrap();
        assert!((0.0..=1.0).contains(&report.score));
    }
}
