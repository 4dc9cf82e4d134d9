//! Confusion-matrix scoring.
//!
//! [`ConfusionScore`] accumulates per-label true positive, false positive and
//! false negative counts, then combines the metrics selected by a
//! [`MetricMask`] into one score in `[0, 1]`.

use super::config::MetricMask;

// =============================================================================
// ConfusionScore
// =============================================================================

/// Per-label confusion counts for one evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionScore {
    num_labels: usize,
    metric: MetricMask,
    tp: Vec<u32>,
    fp: Vec<u32>,
    fn_: Vec<u32>,
    total: u32,
    correct: u32,
}

impl ConfusionScore {
    pub fn new(num_labels: usize, metric: MetricMask) -> Self {
        Self {
            num_labels,
            metric,
            tp: vec![0; num_labels],
            fp: vec![0; num_labels],
            fn_: vec![0; num_labels],
            total: 0,
            correct: 0,
        }
    }

    #[inline]
    pub fn metric(&self) -> MetricMask {
        self.metric
    }

    /// Valid predictions recorded so far.
    #[inline]
    pub fn total(&self) -> u32 {
        self.total
    }

    #[inline]
    pub fn correct(&self) -> u32 {
        self.correct
    }

    pub fn reset(&mut self) {
        self.tp.iter_mut().for_each(|c| *c = 0);
        self.fp.iter_mut().for_each(|c| *c = 0);
        self.fn_.iter_mut().for_each(|c| *c = 0);
        self.total = 0;
        self.correct = 0;
    }

    /// Record one prediction. Pairs with either label outside
    /// `0..num_labels` (including the error label) are ignored.
    pub fn update_prediction(&mut self, actual: u8, predicted: u8) {
        let (a, p) = (actual as usize, predicted as usize);
        if a >= self.num_labels || p >= self.num_labels {
            return;
        }
        self.total += 1;
        if a == p {
            self.correct += 1;
            self.tp[a] += 1;
        } else {
            self.fn_[a] += 1;
            self.fp[p] += 1;
        }
    }

    // =========================================================================
    // Metrics
    // =========================================================================

    pub fn accuracy(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f32 / self.total as f32
        }
    }

    fn label_precision(&self, label: usize) -> Option<f32> {
        let denom = self.tp[label] + self.fp[label];
        (denom > 0).then(|| self.tp[label] as f32 / denom as f32)
    }

    fn label_recall(&self, label: usize) -> Option<f32> {
        let denom = self.tp[label] + self.fn_[label];
        (denom > 0).then(|| self.tp[label] as f32 / denom as f32)
    }

    fn label_f1(&self, label: usize) -> Option<f32> {
        let p = self.label_precision(label)?;
        let r = self.label_recall(label)?;
        (p + r > 0.0).then(|| 2.0 * p * r / (p + r))
    }

    /// Macro precision over labels that were predicted at least once.
    pub fn precision(&self) -> f32 {
        self.macro_average(Self::label_precision)
    }

    /// Macro recall over labels that occur at least once.
    pub fn recall(&self) -> f32 {
        self.macro_average(Self::label_recall)
    }

    /// Macro F1 over labels with defined, non-zero precision and recall.
    pub fn f1(&self) -> f32 {
        self.macro_average(Self::label_f1)
    }

    fn macro_average(&self, per_label: fn(&Self, usize) -> Option<f32>) -> f32 {
        let (sum, n) = (0..self.num_labels)
            .filter_map(|l| per_label(self, l))
            .fold((0.0f32, 0u32), |(s, n), v| (s + v, n + 1));
        if n == 0 {
            0.0
        } else {
            sum / n as f32
        }
    }

    /// Mean of the metrics selected by the mask.
    ///
    /// Returns 0 when nothing was recorded or the mask is empty.
    pub fn calculate_score(&self) -> f32 {
        if self.total == 0 {
            tracing::debug!("no valid predictions to score");
            return 0.0;
        }
        let selected = [
            (MetricMask::ACCURACY, self.accuracy()),
            (MetricMask::PRECISION, self.precision()),
            (MetricMask::RECALL, self.recall()),
            (MetricMask::F1, self.f1()),
        ];
        let (sum, n) = selected
            .iter()
            .filter(|(m, _)| self.metric.contains(*m))
            .fold((0.0f32, 0u32), |(s, n), (_, v)| (s + v, n + 1));
        if n == 0 {
            0.0
        } else {
            sum / n as f32
        }
    }

    /// Heap bytes held by the counters.
    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + 3 * self.num_labels * std::mem::size_of::<u32>()
    }
}
