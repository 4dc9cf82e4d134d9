//! Quantized sample type.

use super::ERROR_LABEL;

/// One labelled, quantized feature vector.
///
/// Every feature value lies in `[0, 2^bits - 1]` for the store's
/// quantization width; the label lies in `0..num_labels`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sample {
    pub label: u8,
    pub features: Vec<u8>,
}

impl Sample {
    pub fn new(features: Vec<u8>, label: u8) -> Self {
        Self { label, features }
    }

    /// A sample whose label is not yet known.
    pub fn unlabelled(features: Vec<u8>) -> Self {
        Self {
            label: ERROR_LABEL,
            features,
        }
    }

    /// All-zero sample, used to fill gaps.
    pub fn zeroed(num_features: usize) -> Self {
        Self {
            label: 0,
            features: vec![0; num_features],
        }
    }

    #[inline]
    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    #[inline]
    pub fn has_label(&self) -> bool {
        self.label != ERROR_LABEL
    }
}
