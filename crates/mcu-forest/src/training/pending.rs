//! Samples waiting for ground-truth feedback.
//!
//! After inference each quantized sample is buffered with its predicted
//! label. Actual labels arrive later, in the same order. A label that does
//! not arrive within the feedback timeout is recorded as [`ERROR_LABEL`]
//! and its sample is skipped on flush.
//!
//! [`PendingData::flush`] appends every labelled sample to the base store
//! file and every `(predicted, actual)` pair to the [`InferenceLog`].

use std::time::{Duration, Instant};

use crate::data::{DataError, Sample, SampleStore, ERROR_LABEL};
use crate::io::InferenceLog;

/// Default number of samples buffered before a flush is due.
pub const DEFAULT_MAX_PENDING: usize = 100;

/// Outcome of one [`PendingData::flush`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Samples appended to the base store.
    pub written: usize,
    /// Labels of the oldest base samples dropped to honour `max_samples`.
    pub removed_labels: Vec<u8>,
    /// Prediction count in the inference log afterwards.
    pub logged: u32,
}

/// Buffer of predicted samples and their late-arriving labels.
#[derive(Debug, Clone)]
pub struct PendingData {
    samples: Vec<Sample>,
    actual: Vec<u8>,
    max_pending: usize,
    timeout: Option<Duration>,
    last_label: Option<Instant>,
}

impl Default for PendingData {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}

impl PendingData {
    pub fn new(max_pending: usize) -> Self {
        Self {
            samples: Vec::new(),
            actual: Vec::new(),
            max_pending: max_pending.max(1),
            timeout: None,
            last_label: None,
        }
    }

    /// Skip a pending sample for every `timeout` that passes without feedback.
    pub fn with_feedback_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Buffered samples that already have an actual label (or a skip).
    #[inline]
    pub fn answered(&self) -> usize {
        self.actual.len()
    }

    /// Whether the buffer has reached its capacity and should be flushed.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.max_pending
    }

    /// Buffer a sample with its predicted label.
    ///
    /// Past capacity the oldest sample is dropped. Returns [`is_full`](Self::is_full).
    pub fn add_pending_sample(&mut self, features: Vec<u8>, predicted: u8) -> bool {
        if self.samples.len() >= self.max_pending {
            self.samples.remove(0);
            if !self.actual.is_empty() {
                self.actual.remove(0);
            }
            tracing::debug!(max = self.max_pending, "pending buffer full, dropped oldest sample");
        }
        self.samples.push(Sample::new(features, predicted));
        self.is_full()
    }

    /// Record the actual label of the oldest unanswered sample.
    pub fn add_actual_label(&mut self, label: u8) {
        self.add_actual_label_at(label, Instant::now());
    }

    /// [`add_actual_label`](Self::add_actual_label) with an explicit clock.
    pub fn add_actual_label_at(&mut self, label: u8, now: Instant) {
        if let (Some(timeout), Some(last)) = (self.timeout, self.last_label) {
            let missed = now.saturating_duration_since(last).as_nanos() / timeout.as_nanos();
            for _ in 0..missed {
                if self.actual.len() >= self.samples.len() {
                    break;
                }
                self.actual.push(ERROR_LABEL);
            }
        }
        if self.actual.len() >= self.samples.len() {
            return;
        }
        self.actual.push(label);
        self.last_label = Some(now);
    }

    /// `(predicted, actual)` pairs of answered samples with a real label.
    pub fn labelled_pairs(&self) -> Vec<(u8, u8)> {
        self.samples
            .iter()
            .zip(&self.actual)
            .filter(|(_, &a)| a != ERROR_LABEL)
            .map(|(s, &a)| (s.label, a))
            .collect()
    }

    fn labelled_samples(&self) -> Vec<Sample> {
        self.samples
            .iter()
            .zip(&self.actual)
            .filter(|(_, &a)| a != ERROR_LABEL)
            .map(|(s, &a)| Sample::new(s.features.clone(), a))
            .collect()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.actual.clear();
    }

    /// Write labelled samples to `base` (keeping at most `max_samples`, 0
    /// for unbounded) and their predictions to `log`, then empty the buffer.
    pub fn flush(
        &mut self,
        base: &mut SampleStore,
        log: &InferenceLog,
        max_samples: usize,
    ) -> Result<FlushReport, DataError> {
        let samples = self.labelled_samples();
        let pairs = self.labelled_pairs();
        let mut report = FlushReport::default();
        if !samples.is_empty() {
            report.removed_labels = base.append_to_file(&samples, max_samples)?;
            report.written = samples.len();
            report.logged = log.append(&pairs)?;
        } else {
            report.logged = log.count()?;
        }
        tracing::debug!(
            pending = self.samples.len(),
            written = report.written,
            dropped = report.removed_labels.len(),
            "pending data flushed"
        );
        self.clear();
        Ok(report)
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self
                .samples
                .iter()
                .map(|s| std::mem::size_of::<Sample>() + s.features.capacity())
                .sum::<usize>()
            + self.actual.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MemStorage, ModelPaths};

    #[test]
    fn labels_fill_oldest_first_and_extra_labels_are_ignored() {
        let mut pending = PendingData::new(10);
        pending.add_pending_sample(vec![0, 1], 1);
        pending.add_pending_sample(vec![2, 3], 0);
        pending.add_actual_label(1);
        pending.add_actual_label(1);
        pending.add_actual_label(0);
        assert_eq!(pending.answered(), 2);
        assert_eq!(pending.labelled_pairs(), vec![(1, 1), (0, 1)]);
    }

    #[test]
    fn timeout_skips_missed_samples() {
        let mut pending = PendingData::new(10).with_feedback_timeout(Duration::from_millis(100));
        for i in 0..4 {
            pending.add_pending_sample(vec![i], 0);
        }
        let t0 = Instant::now();
        pending.add_actual_label_at(0, t0);
        // Two timeouts elapse: samples 1 and 2 are skipped.
        pending.add_actual_label_at(1, t0 + Duration::from_millis(250));
        assert_eq!(pending.answered(), 4);
        assert_eq!(pending.labelled_pairs(), vec![(0, 0), (0, 1)]);
    }

    #[test]
    fn capacity_drops_oldest() {
        let mut pending = PendingData::new(2);
        assert!(!pending.add_pending_sample(vec![0], 0));
        assert!(pending.add_pending_sample(vec![1], 1));
        pending.add_pending_sample(vec![2], 2);
        assert_eq!(pending.len(), 2);
        pending.add_actual_label(1);
        assert_eq!(pending.labelled_pairs(), vec![(1, 1)]);
    }

    #[test]
    fn flush_writes_store_and_log() {
        let storage = MemStorage::shared();
        let paths = ModelPaths::new("m");
        let mut base = SampleStore::new(storage.clone(), paths.base_data());
        base.init(4, 2, 2).unwrap();
        base.push(&Sample::new(vec![3, 3], 0)).unwrap();
        base.release(true).unwrap();
        let log = InferenceLog::new(storage.clone(), paths.infer_log());

        let mut pending = PendingData::default();
        pending.add_pending_sample(vec![1, 2], 1);
        pending.add_pending_sample(vec![0, 0], 0);
        pending.add_pending_sample(vec![2, 2], 1);
        pending.add_actual_label(1);
        pending.add_actual_label(ERROR_LABEL);
        pending.add_actual_label(0);

        let report = pending.flush(&mut base, &log, 2).unwrap();
        assert_eq!(report.written, 2);
        assert_eq!(report.removed_labels, vec![0]);
        assert_eq!(report.logged, 2);
        assert!(pending.is_empty());

        base.load().unwrap();
        assert_eq!(base.len(), 2);
        assert_eq!(base.get(0), Some(Sample::new(vec![1, 2], 1)));
        assert_eq!(base.get(1), Some(Sample::new(vec![2, 2], 0)));
        assert_eq!(log.read_pairs().unwrap(), vec![(1, 1), (1, 0)]);
    }
}
