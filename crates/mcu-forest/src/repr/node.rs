//! Packed tree node records.

use super::layout::NodeLayout;

/// One node, packed per a [`NodeLayout`].
///
/// The record is meaningless without its layout; every accessor takes one.
/// Internal nodes store only the left child index. The right child is always
/// `left + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct PackedNode(u32);

/// Unpacked view of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeFields {
    pub feature: u16,
    pub label: u8,
    pub threshold: u8,
    pub is_leaf: bool,
    pub left: u16,
}

#[inline]
fn mask(bits: u8) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

impl PackedNode {
    /// Wrap a raw record.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// A leaf predicting `label`.
    #[inline]
    pub fn leaf(layout: &NodeLayout, label: u8) -> Self {
        layout.pack(NodeFields {
            label,
            is_leaf: true,
            ..NodeFields::default()
        })
    }

    /// An internal node splitting on `feature <= slot`, children at `left`
    /// and `left + 1`. `label` keeps the majority label of the node.
    #[inline]
    pub fn split(layout: &NodeLayout, feature: u16, threshold: u8, left: u16, label: u8) -> Self {
        layout.pack(NodeFields {
            feature,
            label,
            threshold,
            is_leaf: false,
            left,
        })
    }

    #[inline]
    pub fn feature(self, layout: &NodeLayout) -> u16 {
        (self.0 & mask(layout.feature_bits)) as u16
    }

    #[inline]
    pub fn label(self, layout: &NodeLayout) -> u8 {
        ((self.0 >> layout.label_shift()) & mask(layout.label_bits)) as u8
    }

    #[inline]
    pub fn threshold(self, layout: &NodeLayout) -> u8 {
        ((self.0 >> layout.threshold_shift()) & mask(layout.threshold_bits)) as u8
    }

    #[inline]
    pub fn is_leaf(self, layout: &NodeLayout) -> bool {
        (self.0 >> layout.leaf_shift()) & 1 == 1
    }

    #[inline]
    pub fn left(self, layout: &NodeLayout) -> u16 {
        ((self.0 >> layout.child_shift()) & mask(layout.child_bits)) as u16
    }

    #[inline]
    pub fn right(self, layout: &NodeLayout) -> u16 {
        self.left(layout).wrapping_add(1)
    }

    /// Little-endian record of `layout.bytes_per_node()` bytes.
    pub fn write_bytes(self, layout: &NodeLayout, out: &mut Vec<u8>) {
        let bytes = self.0.to_le_bytes();
        out.extend_from_slice(&bytes[..layout.bytes_per_node()]);
    }

    /// Decode a record written by [`write_bytes`](Self::write_bytes).
    pub fn read_bytes(bytes: &[u8]) -> Self {
        let mut word = [0u8; 4];
        let n = bytes.len().min(4);
        word[..n].copy_from_slice(&bytes[..n]);
        Self(u32::from_le_bytes(word))
    }
}

impl NodeLayout {
    /// Pack fields, truncating each to its width.
    pub fn pack(&self, fields: NodeFields) -> PackedNode {
        let raw = (fields.feature as u32 & mask(self.feature_bits))
            | ((fields.label as u32 & mask(self.label_bits)) << self.label_shift())
            | ((fields.threshold as u32 & mask(self.threshold_bits)) << self.threshold_shift())
            | ((fields.is_leaf as u32) << self.leaf_shift())
            | ((fields.left as u32 & mask(self.child_bits)) << self.child_shift());
        PackedNode(raw)
    }

    pub fn unpack(&self, node: PackedNode) -> NodeFields {
        NodeFields {
            feature: node.feature(self),
            label: node.label(self),
            threshold: node.threshold(self),
            is_leaf: node.is_leaf(self),
            left: node.left(self),
        }
    }
}
