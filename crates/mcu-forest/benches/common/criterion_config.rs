use std::time::Duration;

use criterion::Criterion;

/// Criterion settings shared by the forest benchmarks.
///
/// Whole-model builds take tens of milliseconds, so a short window with a
/// small sample count is enough.
pub fn default_criterion() -> Criterion {
    Criterion::default()
        .configure_from_args()
        .warm_up_time(Duration::from_secs(2))
        .measurement_time(Duration::from_secs(8))
        .sample_size(20)
}

/// Smoke-run settings for checking that a bench still executes.
pub fn fast_criterion() -> Criterion {
    Criterion::default()
        .configure_from_args()
        .warm_up_time(Duration::from_millis(500))
        .measurement_time(Duration::from_secs(2))
        .sample_size(10)
}
