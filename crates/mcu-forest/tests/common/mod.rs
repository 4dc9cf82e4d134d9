//! Shared fixtures for integration tests.

#![allow(dead_code)]

use mcu_forest::io::{ModelPaths, SharedStorage};
use mcu_forest::training::RfConfig;
use mcu_forest::{Sample, SampleStore};

/// Label of the "threshold on feature 0" rule used across tests:
/// values 0, 1, 2+ map to labels 0, 1, 2.
pub fn rule_label(features: &[u8]) -> u8 {
    features[0].min(2)
}

/// Deterministic pseudo-random 2-bit feature rows (4 features).
///
/// Every feature is a permutation of feature 0, so whichever feature a node
/// samples separates its labels.
pub fn rows(n: usize) -> Vec<Vec<u8>> {
    let mut state = 0x2545_f491_4f6c_dd1du64;
    (0..n)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let v = (state % 4) as u8;
            vec![v, (v + 1) % 4, 3 - v, v ^ 2]
        })
        .collect()
}

/// Base store of `n` rule-labelled samples, released to storage.
pub fn rule_store(storage: &SharedStorage, paths: &ModelPaths, n: usize) -> SampleStore {
    let mut base = SampleStore::new(storage.clone(), paths.base_data());
    base.init(n, 4, 2).unwrap();
    for features in rows(n) {
        let label = rule_label(&features);
        base.push(&Sample::new(features, label)).unwrap();
    }
    base.release(true).unwrap();
    base
}

/// Small forest config with predictor refits off, so repeated builds see
/// the same node budget.
pub fn config(num_trees: u16) -> RfConfig {
    RfConfig::builder()
        .num_trees(num_trees)
        .enable_retrain(false)
        .build()
        .unwrap()
}
