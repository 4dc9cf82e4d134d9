//! Forest container: a fixed set of trees sharing one node layout.
//!
//! Trees persist either one file per tree (see [`Tree::release`]) or as a
//! single unified file:
//!
//! ```text
//! "FRC3" | tree_count:u32 | layout:4×u8 | (node_count:u32, records)* | crc32:u32
//! ```
//!
//! The checksum covers every byte before it.

use crate::data::{Quantizer, ERROR_LABEL};
use crate::io::{
    compute_checksum, ByteReader, FormatError, ModelPaths, Storage, FOREST_MAGIC,
};

use super::layout::NodeLayout;
use super::node::PackedNode;
use super::threshold::ThresholdTable;
use super::tree::{check_layout, read_layout, read_records, Tree, TreeValidationError};

/// Files removed between calls to the yield hook in [`Forest::clear_with`].
const YIELD_EVERY: usize = 4;

/// Structural validation errors for [`Forest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForestValidationError {
    /// A tree's index does not match its slot.
    TreeIndexMismatch { slot: usize, index: usize },
    InvalidTree { tree_idx: usize, error: TreeValidationError },
}

/// Bagged forest of packed decision trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forest {
    trees: Vec<Tree>,
    layout: NodeLayout,
    thresholds: ThresholdTable,
    num_labels: usize,
}

impl Forest {
    /// Forest of `num_trees` empty trees.
    pub fn new(num_trees: usize, layout: NodeLayout, quant_bits: u8, num_labels: usize) -> Self {
        let thresholds = ThresholdTable::for_layout(&layout, quant_bits);
        let trees = (0..num_trees)
            .map(|i| Tree::new(i, layout, thresholds))
            .collect();
        Self {
            trees,
            layout,
            thresholds,
            num_labels,
        }
    }

    /// Narrowest node layout for a dataset shape. See [`NodeLayout::calculate`].
    pub fn calculate_layout(
        num_labels: usize,
        num_features: usize,
        max_nodes: usize,
        quant_bits: u8,
    ) -> NodeLayout {
        NodeLayout::calculate(num_labels, num_features, max_nodes, quant_bits)
    }

    #[inline]
    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    #[inline]
    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    #[inline]
    pub fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    #[inline]
    pub fn thresholds(&self) -> &ThresholdTable {
        &self.thresholds
    }

    #[inline]
    pub fn tree(&self, idx: usize) -> Option<&Tree> {
        self.trees.get(idx)
    }

    #[inline]
    pub fn tree_mut(&mut self, idx: usize) -> Option<&mut Tree> {
        self.trees.get_mut(idx)
    }

    pub fn trees(&self) -> impl Iterator<Item = &Tree> {
        self.trees.iter()
    }

    /// Put `tree` in its slot, growing the forest if the index is new.
    pub fn add_tree(&mut self, tree: Tree) {
        let idx = tree.index();
        while self.trees.len() <= idx {
            let i = self.trees.len();
            self.trees.push(Tree::new(i, self.layout, self.thresholds));
        }
        self.trees[idx] = tree;
    }

    #[inline]
    pub fn get_node(&self, tree: usize, node: u32) -> Option<PackedNode> {
        self.trees.get(tree).and_then(|t| t.get(node))
    }

    pub fn set_node(&mut self, tree: usize, node: u32, record: PackedNode) -> bool {
        self.trees
            .get_mut(tree)
            .is_some_and(|t| t.set(node, record))
    }

    // ========================================================================
    // Prediction
    // ========================================================================

    /// Majority vote over loaded trees. Ties go to the lowest label.
    ///
    /// Returns [`ERROR_LABEL`] if no tree casts a valid vote.
    pub fn predict(&self, features: &[u8]) -> u8 {
        let mut votes = vec![0u16; self.num_labels.min(256)];
        for tree in &self.trees {
            let label = tree.predict(features);
            if let Some(v) = votes.get_mut(label as usize) {
                *v += 1;
            }
        }
        majority(&votes)
    }

    /// Quantize a raw feature vector, then predict.
    pub fn predict_raw<Q: Quantizer + ?Sized>(&self, raw: &[f32], quantizer: &Q) -> u8 {
        self.predict(&quantizer.quantize(raw))
    }

    // ========================================================================
    // Aggregates
    // ========================================================================

    pub fn total_nodes(&self) -> usize {
        self.trees.iter().map(Tree::node_count).sum()
    }

    pub fn total_leaves(&self) -> usize {
        self.trees.iter().map(Tree::count_leaves).sum()
    }

    /// Mean depth over non-empty trees.
    pub fn average_depth(&self) -> f32 {
        let (sum, n) = self
            .trees
            .iter()
            .filter(|t| !t.is_empty())
            .fold((0u32, 0u32), |(s, n), t| (s + t.depth() as u32, n + 1));
        if n == 0 {
            0.0
        } else {
            sum as f32 / n as f32
        }
    }

    /// Depth of the deepest tree.
    pub fn max_depth(&self) -> u16 {
        self.trees.iter().map(Tree::depth).max().unwrap_or(0)
    }

    pub fn is_loaded(&self) -> bool {
        !self.trees.is_empty() && self.trees.iter().all(Tree::is_loaded)
    }

    /// Bytes held by packed nodes.
    pub fn memory_usage(&self) -> usize {
        self.total_nodes() * self.layout.bytes_per_node()
    }

    pub fn validate(&self, num_features: usize) -> Result<(), ForestValidationError> {
        for (slot, tree) in self.trees.iter().enumerate() {
            if tree.index() != slot {
                return Err(ForestValidationError::TreeIndexMismatch {
                    slot,
                    index: tree.index(),
                });
            }
            tree.validate(self.num_labels, num_features)
                .map_err(|error| ForestValidationError::InvalidTree {
                    tree_idx: slot,
                    error,
                })?;
        }
        Ok(())
    }

    // ========================================================================
    // Per-tree files
    // ========================================================================

    /// Release every tree to its own file (if `persist`) and free memory.
    pub fn release_forest(
        &mut self,
        storage: &dyn Storage,
        paths: &ModelPaths,
        persist: bool,
    ) -> Result<(), FormatError> {
        for tree in &mut self.trees {
            let path = paths.tree(tree.index());
            tree.release(storage, &path, persist)?;
        }
        tracing::debug!(trees = self.trees.len(), persist, "forest released");
        Ok(())
    }

    /// Load every tree from its own file.
    ///
    /// The first failing tree aborts the load; trees loaded before it stay
    /// resident.
    pub fn load_forest(&mut self, storage: &dyn Storage, paths: &ModelPaths) -> Result<(), FormatError> {
        for tree in &mut self.trees {
            if tree.is_loaded() && !tree.is_empty() {
                continue;
            }
            let path = paths.tree(tree.index());
            if let Err(e) = tree.load(storage, &path) {
                tracing::warn!(tree = tree.index(), path = %path, error = %e, "failed to load tree");
                return Err(e);
            }
        }
        tracing::debug!(
            trees = self.trees.len(),
            nodes = self.total_nodes(),
            "forest loaded"
        );
        Ok(())
    }

    // ========================================================================
    // Unified file
    // ========================================================================

    pub fn to_unified_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.memory_usage() + 4 * self.trees.len());
        out.extend_from_slice(FOREST_MAGIC);
        out.extend_from_slice(&(self.trees.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.layout.to_bytes());
        for tree in &self.trees {
            out.extend_from_slice(&(tree.node_count() as u32).to_le_bytes());
            tree.write_records(&mut out);
        }
        let crc = compute_checksum(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Parse a unified forest file.
    ///
    /// Rejects a tree count other than `expected_trees`, a layout other than
    /// `layout`, and any checksum mismatch.
    pub fn from_unified_bytes(
        bytes: &[u8],
        layout: NodeLayout,
        quant_bits: u8,
        num_labels: usize,
        expected_trees: usize,
    ) -> Result<Self, FormatError> {
        if bytes.len() < 4 {
            return Err(FormatError::Truncated {
                expected: 4,
                actual: bytes.len(),
            });
        }
        let (payload, trailer) = bytes.split_at(bytes.len() - 4);
        let expected_crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual_crc = compute_checksum(payload);
        if expected_crc != actual_crc {
            return Err(FormatError::ChecksumMismatch {
                expected: expected_crc,
                actual: actual_crc,
            });
        }

        let mut r = ByteReader::new(payload);
        r.expect_magic(FOREST_MAGIC)?;
        let tree_count = r.u32()? as usize;
        if tree_count != expected_trees {
            return Err(FormatError::CorruptPayload(format!(
                "forest has {tree_count} trees, expected {expected_trees}"
            )));
        }
        let file_layout = read_layout(&mut r)?;
        check_layout(&layout, &file_layout)?;

        let mut forest = Self::new(0, layout, quant_bits, num_labels);
        for i in 0..tree_count {
            let count = r.u32()?;
            if count as usize > layout.max_nodes() {
                return Err(FormatError::InvalidNodeCount {
                    count,
                    max: layout.max_nodes() as u32,
                });
            }
            let nodes = read_records(&mut r, &layout, count as usize)?;
            forest
                .trees
                .push(Tree::from_nodes(i, layout, forest.thresholds, nodes));
        }
        if r.remaining() != 0 {
            return Err(FormatError::CorruptPayload(format!(
                "{} trailing bytes after last tree",
                r.remaining()
            )));
        }
        Ok(forest)
    }

    pub fn save_unified(&self, storage: &dyn Storage, paths: &ModelPaths) -> Result<(), FormatError> {
        storage.write_atomic(&paths.forest(), &self.to_unified_bytes())?;
        Ok(())
    }

    /// Replace this forest's trees with the unified file's.
    pub fn load_unified(&mut self, storage: &dyn Storage, paths: &ModelPaths) -> Result<(), FormatError> {
        let bytes = storage.read(&paths.forest())?;
        let loaded = Self::from_unified_bytes(
            &bytes,
            self.layout,
            self.thresholds.quant_bits(),
            self.num_labels,
            self.trees.len(),
        )?;
        self.trees = loaded.trees;
        Ok(())
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Drop all trees and delete their files, yielding between batches.
    pub fn clear(&mut self, storage: &dyn Storage, paths: &ModelPaths) -> Result<usize, FormatError> {
        self.clear_with(storage, paths, std::thread::yield_now)
    }

    /// Like [`clear`](Self::clear) with a caller-supplied yield hook, called
    /// every few removed files. Returns the number of files removed.
    pub fn clear_with<F: FnMut()>(
        &mut self,
        storage: &dyn Storage,
        paths: &ModelPaths,
        mut yield_now: F,
    ) -> Result<usize, FormatError> {
        let mut removed = 0usize;
        for tree in &mut self.trees {
            let path = paths.tree(tree.index());
            if storage.exists(&path) {
                storage.remove(&path)?;
                removed += 1;
                if removed % YIELD_EVERY == 0 {
                    yield_now();
                }
            }
            tree.clear();
        }
        let forest_path = paths.forest();
        if storage.exists(&forest_path) {
            storage.remove(&forest_path)?;
            removed += 1;
        }
        tracing::debug!(removed, "forest cleared");
        Ok(removed)
    }
}

/// Index of the highest count, lowest index on ties; [`ERROR_LABEL`] if all
/// counts are zero.
pub(crate) fn majority(votes: &[u16]) -> u8 {
    let mut best = ERROR_LABEL;
    let mut best_count = 0u16;
    for (label, &count) in votes.iter().enumerate() {
        if count > best_count {
            best_count = count;
            best = label as u8;
        }
    }
    best
}

// =============================================================================
// Tests
// =============================================================================
