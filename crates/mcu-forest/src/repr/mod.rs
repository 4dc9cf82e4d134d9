//! Canonical model representations.
//!
//! - [`NodeLayout`]: bit widths of one packed node record
//! - [`PackedNode`]: a single node packed into a `u32`
//! - [`ThresholdTable`]: threshold slot to quantized value mapping
//! - [`Tree`] / [`Forest`]: node arrays plus persistence
//!
//! These types are independent of training and are all an inference-only
//! build needs.

pub mod forest;
pub mod layout;
pub mod node;
pub mod threshold;
pub mod tree;

pub use forest::{Forest, ForestValidationError};
pub use layout::{
    NodeLayout, MAX_CHILD_BITS, MAX_FEATURES, MAX_FEATURE_BITS, MAX_LABEL_BITS, MAX_NODES,
    MAX_NODE_BITS, MAX_THRESHOLD_BITS,
};
pub use node::{NodeFields, PackedNode};
pub use threshold::ThresholdTable;
pub use tree::{Tree, TreeValidationError, TREE_HEADER_SIZE};
