//! Best-split search over quantized features.
//!
//! For one node and one candidate feature, samples are counted into a
//! `(value, label)` histogram. Threshold slots are then swept in ascending
//! order with running left-side counts, so every candidate costs
//! `O(num_labels)` after an `O(n)` pass.
//!
//! A candidate sends `value <= threshold` left. Candidates leaving fewer
//! than `min_leaf` samples on either side are skipped, and a later candidate
//! must have strictly greater gain to replace the current best.

use rand::Rng;

use crate::repr::ThresholdTable;

use super::config::ImpurityCriterion;

/// Chosen split of a node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitCandidate {
    pub feature: u16,
    pub slot: u8,
    pub gain: f32,
    pub left_count: u32,
}

/// Minimum gain a split must exceed at a node of `n` samples.
///
/// Larger nodes get a lower bar.
#[inline]
pub fn min_gain(impurity_threshold: f32, n: usize) -> f32 {
    let scaled = impurity_threshold / (1.0 + ((n + 1) as f32).log2());
    scaled.max(1e-6)
}

/// Pick `k` distinct features out of `0..num_features` with Floyd's
/// algorithm, returned in ascending order.
pub fn select_features<R: Rng>(rng: &mut R, num_features: usize, k: usize, out: &mut Vec<u16>) {
    out.clear();
    let k = k.min(num_features);
    for j in (num_features - k)..num_features {
        let t = rng.gen_range(0..=j) as u16;
        if out.contains(&t) {
            out.push(j as u16);
        } else {
            out.push(t);
        }
    }
    out.sort_unstable();
}

/// Candidate features per node: `max(1, floor(sqrt(num_features)))`.
#[inline]
pub fn features_per_node(num_features: usize) -> usize {
    ((num_features as f64).sqrt().floor() as usize).max(1)
}

/// Reusable split evaluator for one tree build.
#[derive(Debug)]
pub struct SplitSearch {
    criterion: ImpurityCriterion,
    min_leaf: u32,
    num_labels: usize,
    thresholds: ThresholdTable,
    levels: usize,
    hist: Vec<u32>,
    left: Vec<u32>,
    right: Vec<u32>,
}

impl SplitSearch {
    pub fn new(
        criterion: ImpurityCriterion,
        min_leaf: u8,
        num_labels: usize,
        thresholds: ThresholdTable,
    ) -> Self {
        let levels = 1usize << thresholds.quant_bits();
        Self {
            criterion,
            min_leaf: min_leaf.max(1) as u32,
            num_labels,
            thresholds,
            levels,
            hist: vec![0; levels * num_labels],
            left: vec![0; num_labels],
            right: vec![0; num_labels],
        }
    }

    #[inline]
    pub fn criterion(&self) -> ImpurityCriterion {
        self.criterion
    }

    /// Evaluate every threshold of `feature` and update `best`.
    ///
    /// `values` and `labels` are aligned per sample; labels outside
    /// `0..num_labels` are ignored. `parent` holds the node's label counts.
    pub fn evaluate_feature(
        &mut self,
        feature: u16,
        values: &[u8],
        labels: &[u8],
        parent: &[u32],
        parent_impurity: f32,
        best: &mut Option<SplitCandidate>,
    ) {
        let nl = self.num_labels;
        self.hist.iter_mut().for_each(|h| *h = 0);
        for (&v, &l) in values.iter().zip(labels) {
            let l = l as usize;
            if l < nl {
                let v = (v as usize).min(self.levels - 1);
                self.hist[v * nl + l] += 1;
            }
        }

        let total: u32 = parent.iter().sum();
        self.left.iter_mut().for_each(|c| *c = 0);
        let mut left_total = 0u32;
        let mut next_value = 0usize;

        for (slot, threshold) in self.thresholds.candidates() {
            let threshold = threshold as usize;
            while next_value <= threshold && next_value < self.levels {
                let row = &self.hist[next_value * nl..(next_value + 1) * nl];
                for (acc, &c) in self.left.iter_mut().zip(row) {
                    *acc += c;
                    left_total += c;
                }
                next_value += 1;
            }
            let right_total = total - left_total;
            if left_total < self.min_leaf || right_total < self.min_leaf {
                continue;
            }
            for ((r, &p), &l) in self.right.iter_mut().zip(parent).zip(&self.left) {
                *r = p - l;
            }
            let n = total as f32;
            let weighted = (left_total as f32 / n)
                * self.criterion.impurity(&self.left, left_total)
                + (right_total as f32 / n) * self.criterion.impurity(&self.right, right_total);
            let gain = parent_impurity - weighted;
            if best.map_or(true, |b| gain > b.gain) {
                *best = Some(SplitCandidate {
                    feature,
                    slot,
                    gain,
                    left_count: left_total,
                });
            }
        }
    }
}
