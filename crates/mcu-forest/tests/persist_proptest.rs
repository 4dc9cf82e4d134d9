//! Property-based tests for persisted trees and sample stores.

use std::collections::VecDeque;

use proptest::collection::vec as prop_vec;
use proptest::prelude::*;

use mcu_forest::io::{MemStorage, Storage};
use mcu_forest::repr::{NodeLayout, PackedNode, ThresholdTable, Tree};
use mcu_forest::{Sample, SampleStore};

// =============================================================================
// Arbitrary trees
// =============================================================================

/// Grow a tree breadth-first: each decision expands the next queued leaf
/// (`Some((feature, slot))`) or leaves it alone (`None`).
fn grow_tree(
    layout: NodeLayout,
    num_labels: u8,
    num_features: u16,
    decisions: &[Option<(u16, u8)>],
    labels: &[u8],
) -> Tree {
    let thresholds = ThresholdTable::for_layout(&layout, 2);
    let label_at = |i: usize| labels.get(i % labels.len().max(1)).copied().unwrap_or(0) % num_labels;
    let mut nodes = vec![PackedNode::leaf(&layout, label_at(0))];
    let mut queue = VecDeque::from([0usize]);
    for decision in decisions {
        let Some(idx) = queue.pop_front() else { break };
        let Some((feature, slot)) = decision else { continue };
        if nodes.len() + 2 > layout.max_nodes() {
            break;
        }
        let left = nodes.len();
        nodes[idx] = PackedNode::split(
            &layout,
            feature % num_features,
            (*slot as usize % layout.threshold_slots()) as u8,
            left as u16,
            label_at(idx),
        );
        nodes.push(PackedNode::leaf(&layout, label_at(left)));
        nodes.push(PackedNode::leaf(&layout, label_at(left + 1)));
        queue.push_back(left);
        queue.push_back(left + 1);
    }
    Tree::from_nodes(0, layout, thresholds, nodes)
}

proptest! {
    #[test]
    fn tree_reload_preserves_nodes_and_predictions(
        num_labels in 2u8..6,
        num_features in 1u16..12,
        max_nodes in 8usize..300,
        decisions in prop_vec(proptest::option::weighted(0.7, (any::<u16>(), any::<u8>())), 0..80),
        labels in prop_vec(any::<u8>(), 1..16),
        query in prop_vec(0u8..4, 12),
    ) {
        let layout = NodeLayout::calculate(num_labels as usize, num_features as usize, max_nodes, 2);
        let tree = grow_tree(layout, num_labels, num_features, &decisions, &labels);
        prop_assert_eq!(tree.validate(num_labels as usize, num_features as usize), Ok(()));
        prop_assert!(tree.node_count() <= layout.max_nodes());

        let storage = MemStorage::new();
        let mut released = tree.clone();
        released.release(&storage, "tree.bin", true).unwrap();
        released.load(&storage, "tree.bin").unwrap();

        prop_assert_eq!(released.nodes(), tree.nodes());
        prop_assert_eq!(released.depth(), tree.depth());
        let features = &query[..num_features as usize];
        prop_assert_eq!(released.predict(features), tree.predict(features));
        prop_assert!(tree.predict(features) < num_labels);
    }

    #[test]
    fn store_values_stay_in_range_after_reload(
        bits in 1u8..=8,
        num_features in 1usize..20,
        raw in prop_vec(prop_vec(any::<u8>(), 20), 1..40),
        labels in prop_vec(0u8..10, 40),
    ) {
        let max = ((1u16 << bits) - 1) as u8;
        let storage = MemStorage::shared();
        let mut store = SampleStore::new(storage.clone(), "s.bin").with_num_labels(10);
        store.init(raw.len(), num_features, bits).unwrap();
        let samples: Vec<Sample> = raw
            .iter()
            .zip(&labels)
            .map(|(r, &l)| Sample::new(r[..num_features].iter().map(|v| v & max).collect(), l))
            .collect();
        for s in &samples {
            store.push(s).unwrap();
        }
        store.release(true).unwrap();
        prop_assert!(storage.exists("s.bin"));
        store.load().unwrap();

        prop_assert_eq!(store.len(), samples.len());
        for (i, expected) in samples.iter().enumerate() {
            let got = store.get(i).unwrap();
            prop_assert!(got.features.iter().all(|&v| v <= max));
            prop_assert_eq!(&got, expected);
        }
    }
}
