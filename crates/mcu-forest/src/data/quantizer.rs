//! Quantizer collaborator.
//!
//! Raw sensor/feature values are mapped to small integers before they reach
//! the sample store or the forest. Real deployments ship their own
//! quantization tables; [`UniformQuantizer`] is a minimal min/max binning
//! used for tests and host-side tooling.

use serde::{Deserialize, Serialize};

/// Maps raw feature vectors to quantized values.
pub trait Quantizer {
    /// Bits per quantized value (1..=8).
    fn bits(&self) -> u8;

    /// Number of features expected in a raw vector.
    fn num_features(&self) -> usize;

    /// Quantize `raw` into `out` (cleared first).
    fn quantize_into(&self, raw: &[f32], out: &mut Vec<u8>);

    /// Quantize into a fresh vector.
    fn quantize(&self, raw: &[f32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(raw.len());
        self.quantize_into(raw, &mut out);
        out
    }

    /// Human-readable name for a label id, if known.
    fn original_label(&self, _id: u8) -> Option<&str> {
        None
    }
}

/// Equal-width binning between per-feature min and max.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniformQuantizer {
    bits: u8,
    mins: Vec<f32>,
    maxs: Vec<f32>,
    #[serde(default)]
    label_names: Vec<String>,
}

impl UniformQuantizer {
    /// Quantizer over explicit per-feature ranges.
    pub fn new(bits: u8, mins: Vec<f32>, maxs: Vec<f32>) -> Self {
        Self {
            bits: bits.clamp(1, 8),
            mins,
            maxs,
            label_names: Vec::new(),
        }
    }

    /// Fit ranges to the rows of a raw dataset.
    pub fn fit(bits: u8, rows: &[Vec<f32>]) -> Self {
        let nf = rows.first().map_or(0, Vec::len);
        let mut mins = vec![f32::INFINITY; nf];
        let mut maxs = vec![f32::NEG_INFINITY; nf];
        for row in rows {
            for (f, &v) in row.iter().enumerate().take(nf) {
                if v.is_finite() {
                    mins[f] = mins[f].min(v);
                    maxs[f] = maxs[f].max(v);
                }
            }
        }
        for f in 0..nf {
            if !mins[f].is_finite() {
                mins[f] = 0.0;
                maxs[f] = 0.0;
            }
        }
        Self::new(bits, mins, maxs)
    }

    /// Attach display names for label ids.
    pub fn with_label_names(mut self, names: Vec<String>) -> Self {
        self.label_names = names;
        self
    }
}

impl Quantizer for UniformQuantizer {
    fn bits(&self) -> u8 {
        self.bits
    }

    fn num_features(&self) -> usize {
        self.mins.len()
    }

    fn quantize_into(&self, raw: &[f32], out: &mut Vec<u8>) {
        out.clear();
        let levels = (1u16 << self.bits) as f32;
        let max_level = levels - 1.0;
        for (f, (&lo, &hi)) in self.mins.iter().zip(self.maxs.iter()).enumerate() {
            let v = raw.get(f).copied().unwrap_or(lo);
            let q = if !v.is_finite() || hi <= lo {
                0.0
            } else {
                ((v - lo) / (hi - lo) * levels).floor().clamp(0.0, max_level)
            };
            out.push(q as u8);
        }
    }

    fn original_label(&self, id: u8) -> Option<&str> {
        self.label_names.get(id as usize).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_bins_cover_range() {
        let q = UniformQuantizer::new(2, vec![0.0], vec![4.0]);
        assert_eq!(q.quantize(&[0.0]), vec![0]);
        assert_eq!(q.quantize(&[1.5]), vec![1]);
        assert_eq!(q.quantize(&[3.99]), vec![3]);
        assert_eq!(q.quantize(&[4.0]), vec![3]);
        assert_eq!(q.quantize(&[-10.0]), vec![0]);
        assert_eq!(q.quantize(&[f32::NAN]), vec![0]);
    }

    #[test]
    fn fit_uses_observed_extremes() {
        let rows = vec![vec![1.0, 10.0], vec![3.0, 20.0]];
        let q = UniformQuantizer::fit(1, &rows).with_label_names(vec!["idle".into()]);
        assert_eq!(q.quantize(&[1.0, 20.0]), vec![0, 1]);
        assert_eq!(q.original_label(0), Some("idle"));
        assert_eq!(q.original_label(1), None);
    }
}
