//! Bit layout of packed tree nodes.
//!
//! Every tree in a forest packs its nodes with the same [`NodeLayout`],
//! sized once per build from the dataset shape and a node budget:
//!
//! ```text
//! LSB                                                         MSB
//! ┌──────────┬────────┬────────────┬──────┬──────────────┐
//! │ feature  │ label  │ threshold  │ leaf │  left child  │
//! └──────────┴────────┴────────────┴──────┴──────────────┘
//! ```
//!
//! With 10/8/2/11-bit fields this is the historical 32-bit record.

use std::fmt;

use crate::data::packing::bits_required;

/// Widest feature id field.
pub const MAX_FEATURE_BITS: u8 = 10;
/// Most features a packed node can address.
pub const MAX_FEATURES: usize = 1 << MAX_FEATURE_BITS;
/// Widest label field.
pub const MAX_LABEL_BITS: u8 = 8;
/// Widest threshold slot field.
pub const MAX_THRESHOLD_BITS: u8 = 8;
/// Widest child index field.
pub const MAX_CHILD_BITS: u8 = 13;
/// Hard cap on nodes per tree (`2^MAX_CHILD_BITS`).
pub const MAX_NODES: usize = 1 << MAX_CHILD_BITS;
/// Packed nodes never exceed one `u32`.
pub const MAX_NODE_BITS: u8 = 32;

/// Field widths of a packed node record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeLayout {
    pub feature_bits: u8,
    pub label_bits: u8,
    pub threshold_bits: u8,
    pub child_bits: u8,
}

impl Default for NodeLayout {
    /// The historical 10/8/2/11 layout.
    fn default() -> Self {
        Self {
            feature_bits: 10,
            label_bits: 8,
            threshold_bits: 2,
            child_bits: 11,
        }
    }
}

impl fmt::Display for NodeLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "feature={} label={} threshold={} child={}",
            self.feature_bits, self.label_bits, self.threshold_bits, self.child_bits
        )
    }
}

impl NodeLayout {
    /// Compute the narrowest layout for a dataset shape and node budget.
    ///
    /// Each field gets `max(1, bit_length(n - 1))` bits, capped at its
    /// maximum. The threshold slot uses the quantization width. If the record
    /// would exceed 32 bits, the threshold field shrinks first, then the
    /// child field.
    pub fn calculate(
        num_labels: usize,
        num_features: usize,
        max_nodes: usize,
        quant_bits: u8,
    ) -> Self {
        let label_bits = bits_required(num_labels.saturating_sub(1) as u32).min(MAX_LABEL_BITS);
        let feature_bits =
            bits_required(num_features.saturating_sub(1) as u32).min(MAX_FEATURE_BITS);
        let max_index = max_nodes.clamp(1, MAX_NODES) - 1;
        let child_bits = bits_required(max_index as u32).min(MAX_CHILD_BITS);
        let threshold_bits = quant_bits.clamp(1, MAX_THRESHOLD_BITS);

        let mut layout = Self {
            feature_bits,
            label_bits,
            threshold_bits,
            child_bits,
        };
        while layout.bits_per_node() > MAX_NODE_BITS && layout.threshold_bits > 1 {
            layout.threshold_bits -= 1;
        }
        while layout.bits_per_node() > MAX_NODE_BITS && layout.child_bits > 1 {
            layout.child_bits -= 1;
        }
        layout
    }

    /// Total bits per node, leaf flag included.
    #[inline]
    pub fn bits_per_node(&self) -> u8 {
        1 + self.feature_bits + self.label_bits + self.threshold_bits + self.child_bits
    }

    /// Bytes per node in the tree file.
    #[inline]
    pub fn bytes_per_node(&self) -> usize {
        (self.bits_per_node() as usize).div_ceil(8)
    }

    /// Node budget addressable by the child field.
    #[inline]
    pub fn max_nodes(&self) -> usize {
        1usize << self.child_bits
    }

    /// Threshold slots representable.
    #[inline]
    pub fn threshold_slots(&self) -> usize {
        1usize << self.threshold_bits
    }

    #[inline]
    pub fn max_features(&self) -> usize {
        1usize << self.feature_bits
    }

    #[inline]
    pub fn max_labels(&self) -> usize {
        1usize << self.label_bits
    }

    // Bit offsets from the LSB.

    #[inline]
    pub(crate) fn label_shift(&self) -> u8 {
        self.feature_bits
    }

    #[inline]
    pub(crate) fn threshold_shift(&self) -> u8 {
        self.feature_bits + self.label_bits
    }

    #[inline]
    pub(crate) fn leaf_shift(&self) -> u8 {
        self.feature_bits + self.label_bits + self.threshold_bits
    }

    #[inline]
    pub(crate) fn child_shift(&self) -> u8 {
        self.leaf_shift() + 1
    }

    /// 4-byte descriptor written into tree files.
    pub fn to_bytes(&self) -> [u8; 4] {
        [
            self.feature_bits,
            self.label_bits,
            self.threshold_bits,
            self.child_bits,
        ]
    }

    /// Parse a descriptor, rejecting widths no layout can produce.
    pub fn from_bytes(b: [u8; 4]) -> Option<Self> {
        let layout = Self {
            feature_bits: b[0],
            label_bits: b[1],
            threshold_bits: b[2],
            child_bits: b[3],
        };
        let valid = (1..=MAX_FEATURE_BITS).contains(&layout.feature_bits)
            && (1..=MAX_LABEL_BITS).contains(&layout.label_bits)
            && (1..=MAX_THRESHOLD_BITS).contains(&layout.threshold_bits)
            && (1..=MAX_CHILD_BITS).contains(&layout.child_bits)
            && layout.bits_per_node() <= MAX_NODE_BITS;
        valid.then_some(layout)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn historical_shape_gives_historical_layout() {
        let layout = NodeLayout::calculate(256, 1024, 2048, 2);
        assert_eq!(layout, NodeLayout::default());
        assert_eq!(layout.bits_per_node(), 32);
        assert_eq!(layout.bytes_per_node(), 4);
        assert_eq!(layout.max_nodes(), 2048);
    }

    #[rstest]
    #[case(3, 4, 100, 2, NodeLayout { feature_bits: 2, label_bits: 2, threshold_bits: 2, child_bits: 7 })]
    #[case(2, 1, 1, 1, NodeLayout { feature_bits: 1, label_bits: 1, threshold_bits: 1, child_bits: 1 })]
    #[case(2, 2, 2046, 2, NodeLayout { feature_bits: 1, label_bits: 1, threshold_bits: 2, child_bits: 11 })]
    fn minimal_widths(
        #[case] labels: usize,
        #[case] features: usize,
        #[case] nodes: usize,
        #[case] q: u8,
        #[case] expected: NodeLayout,
    ) {
        assert_eq!(NodeLayout::calculate(labels, features, nodes, q), expected);
    }

    #[test]
    fn oversize_layout_shrinks_threshold_then_child() {
        // 1 + 10 + 8 + 8 + 13 = 40 bits before shrinking.
        let layout = NodeLayout::calculate(256, 1024, 100_000, 8);
        assert_eq!(layout.bits_per_node(), 32);
        assert_eq!(layout.threshold_bits, 1);
        assert_eq!(layout.child_bits, 12);
    }

    #[test]
    fn descriptor_roundtrip_and_validation() {
        let layout = NodeLayout::calculate(5, 30, 500, 3);
        assert_eq!(NodeLayout::from_bytes(layout.to_bytes()), Some(layout));
        assert_eq!(NodeLayout::from_bytes([0, 1, 1, 1]), None);
        assert_eq!(NodeLayout::from_bytes([10, 8, 8, 13]), None);
    }

    proptest! {
        #[test]
        fn layout_always_fits_32_bits(
            labels in 1usize..300,
            features in 1usize..3000,
            nodes in 1usize..20_000,
            q in 0u8..12,
        ) {
            let layout = NodeLayout::calculate(labels, features, nodes, q);
            prop_assert!(layout.bits_per_node() <= 32);
            prop_assert!(layout.max_nodes() <= MAX_NODES);
            prop_assert!(layout.max_labels() >= labels.min(256));
        }
    }
}
