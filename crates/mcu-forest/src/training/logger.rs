//! Training progress logging.
//!
//! [`TrainingLogger`] filters progress events by [`Verbosity`] and forwards
//! them to `tracing`. Hosts choose where the events go by installing a
//! subscriber; on a bare device the events are simply dropped.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// How much training progress to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    #[default]
    Silent,
    Warning,
    Info,
    Debug,
}

/// Grid-search progress reporter.
#[derive(Debug)]
pub struct TrainingLogger {
    verbosity: Verbosity,
    started: Option<Instant>,
    points: usize,
}

impl TrainingLogger {
    pub fn new(verbosity: Verbosity) -> Self {
        Self {
            verbosity,
            started: None,
            points: 0,
        }
    }

    #[inline]
    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    /// Grid points evaluated since [`start_training`](Self::start_training).
    #[inline]
    pub fn points(&self) -> usize {
        self.points
    }

    pub fn start_training(&mut self, num_trees: usize, epochs: usize) {
        self.started = Some(Instant::now());
        self.points = 0;
        if self.verbosity >= Verbosity::Info {
            tracing::info!(num_trees, epochs, "training started");
        }
    }

    /// One evaluated `(min_split, second)` grid point.
    pub fn log_grid_point(&mut self, min_split: u8, second: u16, score: f32, nodes: usize) {
        self.points += 1;
        if self.verbosity >= Verbosity::Debug {
            tracing::debug!(point = self.points, min_split, second, score, nodes, "grid point");
        }
    }

    pub fn log_best(&self, min_split: u8, second: u16, score: f32) {
        if self.verbosity >= Verbosity::Info {
            tracing::info!(min_split, second, score, "new best configuration");
        }
    }

    pub fn log_warning(&self, message: &str) {
        if self.verbosity >= Verbosity::Warning {
            tracing::warn!("{message}");
        }
    }

    pub fn finish_training(&self, best_score: f32) {
        if self.verbosity >= Verbosity::Info {
            let elapsed_ms = self
                .started
                .map_or(0, |t| t.elapsed().as_millis() as u64);
            tracing::info!(best_score, points = self.points, elapsed_ms, "training finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_orders_by_detail() {
        assert!(Verbosity::Silent < Verbosity::Warning);
        assert!(Verbosity::Info < Verbosity::Debug);
        assert_eq!(Verbosity::default(), Verbosity::Silent);
    }

    #[test]
    fn counts_grid_points() {
        let mut logger = TrainingLogger::new(Verbosity::Silent);
        logger.start_training(5, 3);
        logger.log_grid_point(2, 1, 0.5, 10);
        logger.log_grid_point(3, 1, 0.6, 12);
        assert_eq!(logger.points(), 2);
        logger.finish_training(0.6);
    }
}
