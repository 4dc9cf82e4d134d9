//! Persistence integration tests: tree files, unified forest files and
//! whole-model save/load on a real directory.

mod common;

use std::sync::Arc;

use mcu_forest::io::{FormatError, FsStorage, MemStorage, ModelPaths, SharedStorage, Storage};
use mcu_forest::repr::{NodeLayout, PackedNode, ThresholdTable, Tree};
use mcu_forest::{Forest, Trainer};

use common::{config, rule_label, rule_store, rows};

/// Depth-3 tree with 7 nodes: three splits, four leaves.
fn seven_node_tree(layout: NodeLayout) -> Tree {
    let thresholds = ThresholdTable::for_layout(&layout, 2);
    let nodes = vec![
        PackedNode::split(&layout, 0, 1, 1, 0),
        PackedNode::split(&layout, 1, 0, 3, 0),
        PackedNode::split(&layout, 2, 2, 5, 2),
        PackedNode::leaf(&layout, 0),
        PackedNode::leaf(&layout, 1),
        PackedNode::leaf(&layout, 2),
        PackedNode::leaf(&layout, 1),
    ];
    Tree::from_nodes(3, layout, thresholds, nodes)
}

#[test]
fn seven_node_tree_survives_release_and_reload() {
    let storage = MemStorage::shared();
    let paths = ModelPaths::new("tree");
    let layout = NodeLayout::calculate(3, 4, 64, 2);
    let mut tree = seven_node_tree(layout);
    assert_eq!(tree.validate(3, 4), Ok(()));
    assert_eq!(tree.depth(), 3);
    let before = tree.to_bytes();

    tree.release(storage.as_ref(), &paths.tree(3), true).unwrap();
    assert!(!tree.is_loaded());
    assert_eq!(tree.predict(&[0, 0, 0, 0]), mcu_forest::ERROR_LABEL);
    assert_eq!(storage.read(&paths.tree(3)).unwrap(), before);

    tree.load(storage.as_ref(), &paths.tree(3)).unwrap();
    assert_eq!(tree.to_bytes(), before);
    assert_eq!(tree.node_count(), 7);
    assert_eq!(tree.depth(), 3);
}

#[test]
fn tree_file_with_other_layout_is_rejected() {
    let storage = MemStorage::shared();
    let layout = NodeLayout::calculate(3, 4, 64, 2);
    let mut tree = seven_node_tree(layout);
    tree.release(storage.as_ref(), "t.bin", true).unwrap();

    let other = NodeLayout::calculate(3, 4, 4096, 2);
    let mut reader = Tree::new(3, other, ThresholdTable::for_layout(&other, 2));
    assert!(matches!(
        reader.load(storage.as_ref(), "t.bin"),
        Err(FormatError::LayoutMismatch { .. })
    ));
}

#[test]
fn unified_file_detects_corruption() {
    let layout = NodeLayout::calculate(3, 4, 64, 2);
    let mut forest = Forest::new(2, layout, 2, 3);
    forest.add_tree(seven_node_tree(layout));
    let mut bytes = forest.to_unified_bytes();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x40;
    assert!(matches!(
        Forest::from_unified_bytes(&bytes, layout, 2, 3, forest.num_trees()),
        Err(FormatError::ChecksumMismatch { .. })
    ));
}

#[test]
fn unified_file_rejects_wrong_tree_count() {
    let layout = NodeLayout::calculate(3, 4, 64, 2);
    let forest = Forest::new(4, layout, 2, 3);
    let bytes = forest.to_unified_bytes();
    assert!(matches!(
        Forest::from_unified_bytes(&bytes, layout, 2, 3, 5),
        Err(FormatError::CorruptPayload(_))
    ));
}

#[test]
fn model_round_trips_through_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let storage: SharedStorage = Arc::new(FsStorage::new(dir.path()).unwrap());
    let paths = ModelPaths::new("disk");
    let base = rule_store(&storage, &paths, 90);
    let mut trainer = Trainer::new(base, paths.clone(), config(4)).unwrap();
    trainer.build_model().unwrap();

    let queries = rows(30);
    let expected: Vec<u8> = queries.iter().map(|p| trainer.forest().predict(p)).collect();
    assert!(queries
        .iter()
        .zip(&expected)
        .filter(|(p, &e)| rule_label(p) == e)
        .count()
        > 25);
    drop(trainer);

    let on_disk = |path: String| dir.path().join(path.trim_start_matches('/')).exists();
    assert!(on_disk(paths.forest()));
    assert!(on_disk(paths.config()));
    assert!(!on_disk(paths.train_data()));

    let reopened_storage: SharedStorage = Arc::new(FsStorage::new(dir.path()).unwrap());
    let base = mcu_forest::SampleStore::new(reopened_storage, paths.base_data());
    let reloaded = Trainer::load_model(base, paths).unwrap();
    let got: Vec<u8> = queries.iter().map(|p| reloaded.forest().predict(p)).collect();
    assert_eq!(got, expected);
}

#[test]
fn per_tree_files_release_and_reload() {
    let storage = MemStorage::shared();
    let paths = ModelPaths::new("pt");
    let base = rule_store(&storage, &paths, 80);
    let mut trainer = Trainer::new(base, paths.clone(), config(3)).unwrap();
    trainer.build_model().unwrap();
    let before = trainer.forest().to_unified_bytes();

    trainer.release_forest().unwrap();
    assert!(!trainer.forest().is_loaded());
    assert!((0..3).all(|i| storage.exists(&paths.tree(i))));

    trainer.load_forest().unwrap();
    assert_eq!(trainer.forest().to_unified_bytes(), before);

    let removed = trainer.clear_forest().unwrap();
    assert_eq!(removed, 4);
    assert!(!storage.exists(&paths.forest()));
}
