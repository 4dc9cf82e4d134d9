//! Node impurity over per-label counts.

use super::config::ImpurityCriterion;

/// `1 - Σp²`
pub fn gini(counts: &[u32], total: u32) -> f32 {
    if total == 0 {
        return 0.0;
    }
    let n = total as f32;
    1.0 - counts
        .iter()
        .map(|&c| {
            let p = c as f32 / n;
            p * p
        })
        .sum::<f32>()
}

/// `-Σ p log2 p`
pub fn entropy(counts: &[u32], total: u32) -> f32 {
    if total == 0 {
        return 0.0;
    }
    let n = total as f32;
    -counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f32 / n;
            p * p.log2()
        })
        .sum::<f32>()
}

impl ImpurityCriterion {
    #[inline]
    pub fn impurity(self, counts: &[u32], total: u32) -> f32 {
        match self {
            Self::Gini => gini(counts, total),
            Self::Entropy => entropy(counts, total),
        }
    }
}
