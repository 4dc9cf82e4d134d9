//! Breadth-first tree induction.
//!
//! The builder owns one shared index array per tree. Each queued
//! [`NodeToBuild`] covers a `[begin, end)` range of it; splitting a node
//! partitions its range in place, stably, with `value <= threshold` first,
//! and queues the two halves. Nodes are processed strictly FIFO, so the node
//! array comes out in breadth-first order with siblings adjacent.
//!
//! The builder never fails. Budget or range problems turn the node into a
//! leaf.
//!
//! # Example
//!
//! ```ignore
//! let mut builder = TreeBuilder::new(params, layout, thresholds, config.seed);
//! let mut ids = engine.subset(0, store.len());
//! let (tree, stats) = builder.build(&mut store, 0, &mut ids);
//! ```

use std::collections::VecDeque;

use rand_xoshiro::Xoshiro256PlusPlus;

use crate::data::SampleSource;
use crate::repr::{NodeLayout, PackedNode, ThresholdTable, Tree};

use super::bootstrap::{derive_rng, FEATURE_STREAM};
use super::config::{ImpurityCriterion, RfConfig};
use super::split::{features_per_node, min_gain, select_features, SplitCandidate, SplitSearch};

/// Stopping and split parameters for one build.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeParams {
    pub min_split: u8,
    pub min_leaf: u8,
    pub max_depth: u16,
    pub criterion: ImpurityCriterion,
    pub impurity_threshold: f32,
    pub num_labels: usize,
    pub num_features: usize,
}

impl TreeParams {
    pub fn from_config(config: &RfConfig, num_labels: usize, num_features: usize) -> Self {
        Self {
            min_split: config.min_split,
            min_leaf: config.min_leaf,
            max_depth: config.max_depth,
            criterion: config.criterion,
            impurity_threshold: config.impurity_threshold,
            num_labels,
            num_features,
        }
    }
}

/// A node waiting in the build queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeToBuild {
    pub node: u32,
    pub begin: usize,
    pub end: usize,
    pub depth: u16,
}

/// Counters from one build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub nodes: usize,
    pub leaves: usize,
    pub depth: u16,
    /// Leaves forced because the node budget ran out.
    pub forced_leaves: usize,
    pub peak_queue: usize,
}

/// Reusable breadth-first builder.
#[derive(Debug)]
pub struct TreeBuilder {
    params: TreeParams,
    layout: NodeLayout,
    thresholds: ThresholdTable,
    seed: u64,
    search: SplitSearch,
    queue: VecDeque<NodeToBuild>,
    labels: Vec<u8>,
    values: Vec<u8>,
    best_values: Vec<u8>,
    right: Vec<u32>,
    counts: Vec<u32>,
    features: Vec<u16>,
}

impl TreeBuilder {
    pub fn new(params: TreeParams, layout: NodeLayout, thresholds: ThresholdTable, seed: u64) -> Self {
        let search = SplitSearch::new(
            params.criterion,
            params.min_leaf,
            params.num_labels,
            thresholds,
        );
        Self {
            params,
            layout,
            thresholds,
            seed,
            search,
            queue: VecDeque::new(),
            labels: Vec::new(),
            values: Vec::new(),
            best_values: Vec::new(),
            right: Vec::new(),
            counts: vec![0; params.num_labels],
            features: Vec::new(),
        }
    }

    /// Pre-size the node queue, e.g. from the node predictor's peak estimate.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue.reserve(capacity);
        self
    }

    #[inline]
    pub fn params(&self) -> &TreeParams {
        &self.params
    }

    /// Majority label (lowest wins ties) and number of distinct labels of
    /// `self.labels`, filling `self.counts`.
    fn analyze_labels(&mut self) -> (u8, usize) {
        self.counts.iter_mut().for_each(|c| *c = 0);
        for &l in &self.labels {
            if let Some(c) = self.counts.get_mut(l as usize) {
                *c += 1;
            }
        }
        let mut majority = 0u8;
        let mut best = 0u32;
        let mut distinct = 0usize;
        for (label, &c) in self.counts.iter().enumerate() {
            if c > 0 {
                distinct += 1;
            }
            if c > best {
                best = c;
                majority = label as u8;
            }
        }
        (majority, distinct)
    }

    /// Evaluate the sampled features on `range`, keeping the winning
    /// feature's values in `best_values`.
    fn evaluate_features<S: SampleSource + ?Sized>(
        &mut self,
        source: &mut S,
        range: &[u32],
        parent_impurity: f32,
        best: &mut Option<SplitCandidate>,
    ) {
        for i in 0..self.features.len() {
            let f = self.features[i];
            source.extract_feature(range, f as usize, &mut self.values);
            let before = *best;
            self.search.evaluate_feature(
                f,
                &self.values,
                &self.labels,
                &self.counts,
                parent_impurity,
                best,
            );
            if *best != before {
                std::mem::swap(&mut self.best_values, &mut self.values);
            }
        }
    }

    /// Build tree `tree_index` over the samples `indices` of `source`.
    ///
    /// `indices` is reordered in place. An empty slice yields an empty tree.
    pub fn build<S: SampleSource + ?Sized>(
        &mut self,
        source: &mut S,
        tree_index: usize,
        indices: &mut [u32],
    ) -> (Tree, BuildStats) {
        let mut tree = Tree::new(tree_index, self.layout, self.thresholds);
        let mut stats = BuildStats::default();
        if indices.is_empty() {
            tracing::warn!(tree = tree_index, "empty training subset, tree left empty");
            return (tree, stats);
        }

        let layout = self.layout;
        let max_nodes = layout.max_nodes();
        let k = features_per_node(self.params.num_features);
        let mut rng: Xoshiro256PlusPlus =
            derive_rng(self.seed, FEATURE_STREAM + tree_index as u64, 0);

        // Placeholder root.
        let _ = tree.push(PackedNode::leaf(&layout, 0));
        self.queue.clear();
        self.queue.push_back(NodeToBuild {
            node: 0,
            begin: 0,
            end: indices.len(),
            depth: 0,
        });

        while let Some(item) = self.queue.pop_front() {
            stats.depth = stats.depth.max(item.depth + 1);
            let range = &mut indices[item.begin..item.end];
            if source.is_paged() {
                // Ascending ids visit chunks in order.
                range.sort_unstable();
            }
            source.extract_labels(range, &mut self.labels);
            let (majority, distinct) = self.analyze_labels();
            let n = range.len();

            let stop = distinct <= 1
                || n < self.params.min_split as usize
                || item.depth as u32 + 1 >= self.params.max_depth as u32;
            if stop {
                tree.set(item.node, PackedNode::leaf(&layout, majority));
                continue;
            }
            if tree.node_count() + 2 > max_nodes {
                tracing::warn!(
                    tree = tree_index,
                    node = item.node,
                    max_nodes,
                    "node budget exhausted, forcing leaf"
                );
                stats.forced_leaves += 1;
                tree.set(item.node, PackedNode::leaf(&layout, majority));
                continue;
            }

            // Split search over a random feature subset.
            let total: u32 = self.counts.iter().sum();
            let parent_impurity = self.search.criterion().impurity(&self.counts, total);
            select_features(&mut rng, self.params.num_features, k, &mut self.features);
            let mut best: Option<SplitCandidate> = None;
            self.evaluate_features(source, range, parent_impurity, &mut best);

            let threshold_gain = min_gain(self.params.impurity_threshold, n);
            let Some(split) = best.filter(|b| b.gain > threshold_gain) else {
                tree.set(item.node, PackedNode::leaf(&layout, majority));
                continue;
            };

            // Stable in-place partition, `<=` first.
            let threshold = self.thresholds.value(split.slot);
            self.right.clear();
            let mut mid = 0usize;
            for i in 0..n {
                let id = range[i];
                if self.best_values[i] <= threshold {
                    range[mid] = id;
                    mid += 1;
                } else {
                    self.right.push(id);
                }
            }
            range[mid..].copy_from_slice(&self.right);
            if mid == 0 || mid == n {
                tree.set(item.node, PackedNode::leaf(&layout, majority));
                continue;
            }

            let (Some(left), Some(_)) = (
                tree.push(PackedNode::leaf(&layout, majority)),
                tree.push(PackedNode::leaf(&layout, majority)),
            ) else {
                // Unreachable with the budget check above.
                stats.forced_leaves += 1;
                tree.set(item.node, PackedNode::leaf(&layout, majority));
                continue;
            };
            tree.set(
                item.node,
                PackedNode::split(&layout, split.feature, split.slot, left as u16, majority),
            );
            self.queue.push_back(NodeToBuild {
                node: left,
                begin: item.begin,
                end: item.begin + mid,
                depth: item.depth + 1,
            });
            self.queue.push_back(NodeToBuild {
                node: left + 1,
                begin: item.begin + mid,
                end: item.end,
                depth: item.depth + 1,
            });
            stats.peak_queue = stats.peak_queue.max(self.queue.len());
        }

        tree.set_depth(stats.depth);
        stats.nodes = tree.node_count();
        stats.leaves = tree.count_leaves();
        tracing::debug!(
            tree = tree_index,
            nodes = stats.nodes,
            leaves = stats.leaves,
            depth = stats.depth,
            "tree built"
        );
        (tree, stats)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Sample, SampleStore};
    use crate::io::MemStorage;

    fn store_from(rows: &[(Vec<u8>, u8)], nf: usize, bits: u8) -> SampleStore {
        let mut store = SampleStore::new(MemStorage::shared(), "/b.bin");
        store.init(rows.len(), nf, bits).unwrap();
        for (features, label) in rows {
            store.push(&Sample::new(features.clone(), *label)).unwrap();
        }
        store
    }

    /// Single-feature rows.
    fn rows(values: &[u8], labels: &[u8]) -> Vec<(Vec<u8>, u8)> {
        values.iter().zip(labels).map(|(&v, &l)| (vec![v], l)).collect()
    }

    fn params(num_labels: usize, num_features: usize) -> TreeParams {
        TreeParams {
            min_split: 2,
            min_leaf: 1,
            max_depth: 250,
            criterion: ImpurityCriterion::Gini,
            impurity_threshold: 0.0,
            num_labels,
            num_features,
        }
    }

    fn builder(p: TreeParams, max_nodes: usize) -> TreeBuilder {
        let layout = NodeLayout::calculate(p.num_labels, p.num_features, max_nodes, 2);
        TreeBuilder::new(p, layout, ThresholdTable::for_layout(&layout, 2), 37)
    }

    #[test]
    fn separable_data_gives_pure_leaves() {
        let rows = rows(&[0, 0, 1, 1, 3, 3], &[0, 0, 1, 1, 2, 2]);
        let mut store = store_from(&rows, 1, 2);
        let mut ids: Vec<u32> = (0..6).collect();
        let (tree, stats) = builder(params(3, 1), 64).build(&mut store, 0, &mut ids);

        assert_eq!(tree.validate(3, 1), Ok(()));
        for (features, label) in &rows {
            assert_eq!(tree.predict(features), *label);
        }
        assert_eq!(stats.nodes, 5);
        assert_eq!(stats.leaves, 3);
        assert_eq!(stats.depth, 3);
        assert_eq!(stats.forced_leaves, 0);
    }

    #[test]
    fn single_label_range_is_a_leaf() {
        let rows = vec![(vec![0, 1], 1), (vec![3, 2], 1), (vec![2, 0], 1)];
        let mut store = store_from(&rows, 2, 2);
        let mut ids: Vec<u32> = (0..3).collect();
        let (tree, _) = builder(params(2, 2), 64).build(&mut store, 0, &mut ids);
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.predict(&[0, 0]), 1);
    }

    #[test]
    fn max_depth_limits_levels() {
        let rows = rows(&[0, 1, 2, 3], &[0, 1, 0, 1]);
        let mut store = store_from(&rows, 1, 2);
        let mut ids: Vec<u32> = (0..4).collect();
        let mut p = params(2, 1);
        p.max_depth = 2;
        let (tree, stats) = builder(p, 64).build(&mut store, 0, &mut ids);
        assert!(stats.depth <= 2);
        assert_eq!(tree.compute_depth(), stats.depth);
    }

    #[test]
    fn node_budget_forces_leaves_without_children() {
        let rows = rows(&[0, 1, 2, 3], &[0, 1, 0, 1]);
        let mut store = store_from(&rows, 1, 2);
        let mut ids: Vec<u32> = (0..4).collect();
        // Budget of 4 nodes: root split, then one child may not split.
        let (tree, stats) = builder(params(2, 1), 4).build(&mut store, 0, &mut ids);
        assert!(tree.node_count() <= 4);
        assert!(stats.forced_leaves >= 1);
        assert_eq!(tree.validate(2, 1), Ok(()));
    }

    #[test]
    fn empty_subset_gives_empty_tree() {
        let mut store = store_from(&rows(&[0], &[0]), 1, 2);
        let (tree, stats) = builder(params(2, 1), 64).build(&mut store, 0, &mut []);
        assert!(tree.is_empty());
        assert_eq!(stats, BuildStats::default());
    }

    #[test]
    fn unsampled_feature_never_splits() {
        // Only feature 3 carries the label; the others are constant.
        let rows: Vec<(Vec<u8>, u8)> = (0..8u8)
            .map(|i| (vec![1, 2, 0, (i % 2) * 3], i % 2))
            .collect();
        let mut store = store_from(&rows, 4, 2);
        let p = params(2, 4);
        let k = features_per_node(4);

        let (mut splits, mut leaves) = (0, 0);
        for t in 0..20 {
            let mut sampled = Vec::new();
            select_features(&mut derive_rng(37, FEATURE_STREAM + t as u64, 0), 4, k, &mut sampled);
            let mut ids: Vec<u32> = (0..8).collect();
            let (tree, _) = builder(p, 64).build(&mut store, t, &mut ids);
            let root = tree.get(0).unwrap();
            if sampled.contains(&3) {
                assert!(!root.is_leaf(tree.layout()), "tree {t} sampled {sampled:?}");
                assert_eq!(root.feature(tree.layout()), 3);
                splits += 1;
            } else {
                assert_eq!(tree.node_count(), 1, "tree {t} sampled {sampled:?}");
                leaves += 1;
            }
        }
        assert!(splits > 0 && leaves > 0);
    }

    #[test]
    fn partition_is_stable() {
        let rows = rows(&[3, 0, 2, 1], &[1, 0, 1, 0]);
        let mut store = store_from(&rows, 1, 2);
        let mut ids: Vec<u32> = vec![0, 1, 2, 3];
        builder(params(2, 1), 64).build(&mut store, 0, &mut ids);
        assert_eq!(ids, vec![1, 3, 0, 2]);
    }
}
