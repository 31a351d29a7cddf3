//! Counter stress runs.

use std::sync::Arc;

use foundation_synckit::{AtomicCounter, LossyCounter};

use crate::stress::{StressConfig, StressError, StressHarness, StressResult};

/// Outcome of a counter run: how many increments were issued versus how
/// many the counter kept.
#[derive(Debug, Clone)]
pub struct CounterReport {
    pub result: StressResult,
    pub expected: u64,
    pub observed: u64,
}

impl CounterReport {
    /// Increments that vanished under contention.
    #[must_use]
    pub fn lost_updates(&self) -> u64 {
        self.expected.saturating_sub(self.observed)
    }
}

fn expected_total(result: &StressResult) -> u64 {
    u64::try_from(result.successes).unwrap_or(u64::MAX)
}

/// Hammers one [`AtomicCounter`] from every worker.
///
/// # Examples
///
/// ```
/// use foundation_testing::stress::{StressConfig, sync::run_counter_stress};
///
/// let report = run_counter_stress(StressConfig::new().threads(8).iterations(500)).unwrap();
/// assert_eq!(report.observed, 4000);
/// assert_eq!(report.lost_updates(), 0);
/// ```
///
/// # Errors
///
/// See [`StressHarness::run`].
pub fn run_counter_stress(config: StressConfig) -> Result<CounterReport, StressError> {
    let counter = Arc::new(AtomicCounter::new(0));
    let shared = Arc::clone(&counter);

    let result = StressHarness::new(config).run(move |_, _| shared.increment() > 0)?;
    Ok(CounterReport {
        expected: expected_total(&result),
        observed: counter.read(),
        result,
    })
}

/// Same run against the non-atomic [`LossyCounter`]; `observed` may fall
/// short of `expected` but never exceeds it.
///
/// # Errors
///
/// See [`StressHarness::run`].
pub fn run_lossy_counter_stress(config: StressConfig) -> Result<CounterReport, StressError> {
    let counter = Arc::new(LossyCounter::new(0));
    let shared = Arc::clone(&counter);

    let result = StressHarness::new(config).run(move |_, _| {
        shared.increment();
        true
    })?;
    Ok(CounterReport {
        expected: expected_total(&result),
        observed: counter.read(),
        result,
    })
}
