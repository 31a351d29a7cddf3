//! `ExclusiveLock` stress runs.

use std::sync::Arc;

use foundation_synckit::ExclusiveLock;

use super::CounterReport;
use crate::stress::{StressConfig, StressError, StressHarness};

/// Every operation takes the lock and bumps a plain `u64` behind it.
///
/// A failed acquisition counts as a failed operation, so `observed` must
/// equal `expected` exactly.
///
/// # Examples
///
/// ```
/// use foundation_testing::stress::{StressConfig, sync::run_lock_stress};
///
/// let report = run_lock_stress(StressConfig::new().threads(4).iterations(250)).unwrap();
/// assert_eq!(report.observed, 1000);
/// assert_eq!(report.result.failures, 0);
/// ```
///
/// # Errors
///
/// See [`StressHarness::run`].
pub fn run_lock_stress(config: StressConfig) -> Result<CounterReport, StressError> {
    let lock = Arc::new(ExclusiveLock::new(0u64));
    let shared = Arc::clone(&lock);

    let result = StressHarness::new(config).run(move |_, _| match shared.acquire() {
        Ok(mut guard) => {
            *guard += 1;
            true
        }
        Err(err) => {
            tracing::error!("lock stress: acquire failed: {err}");
            false
        }
    })?;

    let observed = lock.with(|value| *value)?;
    Ok(CounterReport {
        expected: u64::try_from(result.successes).unwrap_or(u64::MAX),
        observed,
        result,
    })
}
