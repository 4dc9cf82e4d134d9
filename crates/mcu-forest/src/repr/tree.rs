//! Packed decision tree and its file format.
//!
//! A [`Tree`] is an arena of [`PackedNode`]s with integer child links. Node 0
//! is the root, internal nodes point at `left` and `left + 1`, and nodes are
//! appended in breadth-first order while building, then frozen.
//!
//! # File format
//!
//! ```text
//! "TREE" | node_count:u32 | feature_bits, label_bits, threshold_bits, child_bits | records
//! ```
//!
//! Each record is `bytes_per_node` little-endian bytes.

use crate::data::ERROR_LABEL;
use crate::io::{ByteReader, FormatError, Storage, TREE_MAGIC};

use super::layout::NodeLayout;
use super::node::PackedNode;
use super::threshold::ThresholdTable;

/// Size of the fixed tree file header.
pub const TREE_HEADER_SIZE: usize = 12;

// ============================================================================
// TreeValidationError
// ============================================================================

/// Structural validation errors for [`Tree`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeValidationError {
    /// More nodes than the layout can address.
    TooManyNodes { count: usize, max: usize },
    /// An internal node's children lie outside the node array.
    ChildOutOfBounds { node: u32, left: u32, n_nodes: usize },
    /// A child index does not come after its parent.
    BackwardLink { node: u32, left: u32 },
    /// A leaf predicts a label outside `0..num_labels`.
    LabelOutOfRange { node: u32, label: u8, num_labels: usize },
    /// An internal node splits on a feature that does not exist.
    FeatureOutOfRange { node: u32, feature: u16, num_features: usize },
}

// ============================================================================
// Tree
// ============================================================================

/// One decision tree with bit-packed nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    index: usize,
    nodes: Vec<PackedNode>,
    layout: NodeLayout,
    thresholds: ThresholdTable,
    depth: u16,
    loaded: bool,
}

impl Tree {
    /// Empty, loaded tree.
    pub fn new(index: usize, layout: NodeLayout, thresholds: ThresholdTable) -> Self {
        Self {
            index,
            nodes: Vec::new(),
            layout,
            thresholds,
            depth: 0,
            loaded: true,
        }
    }

    /// Build a tree from already packed nodes.
    pub fn from_nodes(
        index: usize,
        layout: NodeLayout,
        thresholds: ThresholdTable,
        nodes: Vec<PackedNode>,
    ) -> Self {
        let mut tree = Self::new(index, layout, thresholds);
        tree.nodes = nodes;
        tree.depth = tree.compute_depth();
        tree
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
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
    pub fn nodes(&self) -> &[PackedNode] {
        &self.nodes
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Depth recorded after the last build or load, in levels.
    #[inline]
    pub fn depth(&self) -> u16 {
        self.depth
    }

    pub(crate) fn set_depth(&mut self, depth: u16) {
        self.depth = depth;
    }

    /// Append a node, returning its index, or `None` once the layout's node
    /// budget is used up.
    pub fn push(&mut self, node: PackedNode) -> Option<u32> {
        if self.nodes.len() >= self.layout.max_nodes() {
            return None;
        }
        self.nodes.push(node);
        Some(self.nodes.len() as u32 - 1)
    }

    #[inline]
    pub fn get(&self, index: u32) -> Option<PackedNode> {
        self.nodes.get(index as usize).copied()
    }

    /// Overwrite a node. Returns `false` if `index` is out of range.
    pub fn set(&mut self, index: u32, node: PackedNode) -> bool {
        match self.nodes.get_mut(index as usize) {
            Some(slot) => {
                *slot = node;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.nodes.shrink_to_fit();
        self.depth = 0;
    }

    // ========================================================================
    // Prediction
    // ========================================================================

    /// Predict the label of a quantized feature vector.
    ///
    /// Returns [`ERROR_LABEL`] for an empty or released tree, or if a link
    /// leads outside the node array.
    pub fn predict(&self, features: &[u8]) -> u8 {
        let layout = &self.layout;
        let mut idx = 0u32;
        // Every step moves to a strictly larger index, so this terminates.
        loop {
            let Some(node) = self.get(idx) else {
                return ERROR_LABEL;
            };
            if node.is_leaf(layout) {
                return node.label(layout);
            }
            let value = features
                .get(node.feature(layout) as usize)
                .copied()
                .unwrap_or(0);
            let left = node.left(layout) as u32;
            if left <= idx {
                return ERROR_LABEL;
            }
            idx = if value <= self.thresholds.value(node.threshold(layout)) {
                left
            } else {
                left + 1
            };
        }
    }

    // ========================================================================
    // Structure queries
    // ========================================================================

    pub fn count_leaves(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf(&self.layout)).count()
    }

    /// Number of levels reachable from the root, using an explicit stack.
    pub fn compute_depth(&self) -> u16 {
        if self.nodes.is_empty() {
            return 0;
        }
        let mut max_depth = 0u16;
        let mut stack: Vec<(u32, u16)> = vec![(0, 1)];
        while let Some((idx, depth)) = stack.pop() {
            max_depth = max_depth.max(depth);
            let Some(node) = self.get(idx) else { continue };
            if node.is_leaf(&self.layout) {
                continue;
            }
            let left = node.left(&self.layout) as u32;
            if left <= idx || left as usize + 1 >= self.nodes.len() {
                continue;
            }
            stack.push((left, depth.saturating_add(1)));
            stack.push((left + 1, depth.saturating_add(1)));
        }
        max_depth
    }

    /// Check the structural invariants of a built tree.
    pub fn validate(
        &self,
        num_labels: usize,
        num_features: usize,
    ) -> Result<(), TreeValidationError> {
        let n = self.nodes.len();
        if n > self.layout.max_nodes() {
            return Err(TreeValidationError::TooManyNodes {
                count: n,
                max: self.layout.max_nodes(),
            });
        }
        for (i, node) in self.nodes.iter().enumerate() {
            let i = i as u32;
            if node.is_leaf(&self.layout) {
                let label = node.label(&self.layout);
                if label as usize >= num_labels {
                    return Err(TreeValidationError::LabelOutOfRange {
                        node: i,
                        label,
                        num_labels,
                    });
                }
                continue;
            }
            let left = node.left(&self.layout) as u32;
            if left <= i {
                return Err(TreeValidationError::BackwardLink { node: i, left });
            }
            if left as usize + 1 >= n {
                return Err(TreeValidationError::ChildOutOfBounds {
                    node: i,
                    left,
                    n_nodes: n,
                });
            }
            let feature = node.feature(&self.layout);
            if feature as usize >= num_features {
                return Err(TreeValidationError::FeatureOutOfRange {
                    node: i,
                    feature,
                    num_features,
                });
            }
        }
        Ok(())
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Serialize to the tree file format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let bpn = self.layout.bytes_per_node();
        let mut out = Vec::with_capacity(TREE_HEADER_SIZE + self.nodes.len() * bpn);
        out.extend_from_slice(TREE_MAGIC);
        out.extend_from_slice(&(self.nodes.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.layout.to_bytes());
        self.write_records(&mut out);
        out
    }

    pub(crate) fn write_records(&self, out: &mut Vec<u8>) {
        for node in &self.nodes {
            node.write_bytes(&self.layout, out);
        }
    }

    /// Parse a tree file written under `layout`.
    ///
    /// Bit widths that differ from `layout` are rejected.
    pub fn from_bytes(
        bytes: &[u8],
        index: usize,
        layout: NodeLayout,
        thresholds: ThresholdTable,
    ) -> Result<Self, FormatError> {
        let mut r = ByteReader::new(bytes);
        r.expect_magic(TREE_MAGIC)?;
        let count = r.u32()?;
        let file_layout = read_layout(&mut r)?;
        check_layout(&layout, &file_layout)?;
        if count == 0 || count as usize > layout.max_nodes() {
            return Err(FormatError::InvalidNodeCount {
                count,
                max: layout.max_nodes() as u32,
            });
        }
        let nodes = read_records(&mut r, &layout, count as usize)?;
        Ok(Self::from_nodes(index, layout, thresholds, nodes))
    }

    /// Write the tree (if `persist`) and free its nodes.
    ///
    /// Empty trees are never written. A stale file at `path` is removed.
    pub fn release(
        &mut self,
        storage: &dyn Storage,
        path: &str,
        persist: bool,
    ) -> Result<(), FormatError> {
        if persist && self.loaded {
            if self.nodes.is_empty() {
                storage.remove(path)?;
            } else {
                storage.write_atomic(path, &self.to_bytes())?;
            }
        }
        self.nodes = Vec::new();
        self.loaded = false;
        Ok(())
    }

    /// Replace the in-memory nodes with the contents of `path`.
    pub fn load(&mut self, storage: &dyn Storage, path: &str) -> Result<(), FormatError> {
        let bytes = storage.read(path)?;
        let loaded = Self::from_bytes(&bytes, self.index, self.layout, self.thresholds)?;
        self.nodes = loaded.nodes;
        self.depth = loaded.depth;
        self.loaded = true;
        Ok(())
    }
}

pub(crate) fn read_layout(r: &mut ByteReader<'_>) -> Result<NodeLayout, FormatError> {
    let raw = r.take(4)?;
    let bytes = [raw[0], raw[1], raw[2], raw[3]];
    NodeLayout::from_bytes(bytes)
        .ok_or_else(|| FormatError::CorruptPayload(format!("invalid node layout {bytes:?}")))
}

pub(crate) fn check_layout(active: &NodeLayout, file: &NodeLayout) -> Result<(), FormatError> {
    if active != file {
        return Err(FormatError::LayoutMismatch {
            expected: active.to_string(),
            found: file.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn read_records(
    r: &mut ByteReader<'_>,
    layout: &NodeLayout,
    count: usize,
) -> Result<Vec<PackedNode>, FormatError> {
    let bpn = layout.bytes_per_node();
    let raw = r.take(count * bpn)?;
    Ok(raw.chunks_exact(bpn).map(PackedNode::read_bytes).collect())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemStorage;

    /// Depth-3 tree over 2 features, 2-bit values:
    ///
    /// ```text
    ///          0: f0 <= 1
    ///        /            \
    ///   1: f1 <= 0      2: leaf 2
    ///    /      \
    /// 3: leaf 0  4: leaf 1
    /// ```
    fn sample_tree() -> Tree {
        let layout = NodeLayout::calculate(3, 2, 16, 2);
        let thresholds = ThresholdTable::for_layout(&layout, 2);
        let nodes = vec![
            PackedNode::split(&layout, 0, 1, 1, 0),
            PackedNode::split(&layout, 1, 0, 3, 0),
            PackedNode::leaf(&layout, 2),
            PackedNode::leaf(&layout, 0),
            PackedNode::leaf(&layout, 1),
        ];
        Tree::from_nodes(0, layout, thresholds, nodes)
    }

    #[test]
    fn predict_follows_thresholds() {
        let tree = sample_tree();
        assert_eq!(tree.predict(&[0, 0]), 0);
        assert_eq!(tree.predict(&[1, 3]), 1);
        assert_eq!(tree.predict(&[2, 0]), 2);
        assert_eq!(tree.predict(&[3, 3]), 2);
    }

    #[test]
    fn structure_queries() {
        let tree = sample_tree();
        assert_eq!(tree.node_count(), 5);
        assert_eq!(tree.count_leaves(), 3);
        assert_eq!(tree.depth(), 3);
        assert_eq!(tree.validate(3, 2), Ok(()));
        assert!(matches!(
            tree.validate(2, 2),
            Err(TreeValidationError::LabelOutOfRange { node: 2, .. })
        ));
    }

    #[test]
    fn empty_tree_predicts_error_label() {
        let layout = NodeLayout::default();
        let tree = Tree::new(0, layout, ThresholdTable::for_layout(&layout, 2));
        assert_eq!(tree.predict(&[0; 4]), ERROR_LABEL);
        assert_eq!(tree.compute_depth(), 0);
    }

    #[test]
    fn push_stops_at_node_budget() {
        let layout = NodeLayout::calculate(2, 2, 4, 1);
        let mut tree = Tree::new(0, layout, ThresholdTable::for_layout(&layout, 1));
        for _ in 0..4 {
            assert!(tree.push(PackedNode::leaf(&layout, 0)).is_some());
        }
        assert_eq!(tree.push(PackedNode::leaf(&layout, 0)), None);
    }

    #[test]
    fn release_and_load_roundtrip() {
        let storage = MemStorage::new();
        let mut tree = sample_tree();
        let original = tree.nodes().to_vec();
        let bytes = tree.to_bytes();

        tree.release(&storage, "/t_tree_0.bin", true).unwrap();
        assert!(!tree.is_loaded());
        assert!(tree.is_empty());

        tree.load(&storage, "/t_tree_0.bin").unwrap();
        assert_eq!(tree.nodes(), original.as_slice());
        assert_eq!(tree.to_bytes(), bytes);
        assert_eq!(tree.depth(), 3);
    }

    #[test]
    fn load_rejects_layout_mismatch() {
        let storage = MemStorage::new();
        let mut tree = sample_tree();
        tree.release(&storage, "/t.bin", true).unwrap();

        let other = NodeLayout::calculate(3, 2, 64, 2);
        let mut wrong = Tree::new(0, other, ThresholdTable::for_layout(&other, 2));
        let err = wrong.load(&storage, "/t.bin").unwrap_err();
        assert!(matches!(err, FormatError::LayoutMismatch { .. }));
        assert!(wrong.is_empty());
    }

    #[test]
    fn from_bytes_rejects_truncation() {
        let tree = sample_tree();
        let bytes = tree.to_bytes();
        let err = Tree::from_bytes(
            &bytes[..bytes.len() - 1],
            0,
            *tree.layout(),
            *tree.thresholds(),
        )
        .unwrap_err();
        assert!(matches!(err, FormatError::Truncated { .. }));
    }
}
