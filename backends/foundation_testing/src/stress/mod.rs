//! Stress test framework for the synckit primitives.
//!
//! A [`StressHarness`] runs one operation closure on many workers at once,
//! counting successes and failures. Workers are spawned through
//! `foundation_synckit::spawn_all`, so a panicking operation is reported
//! instead of tearing down the run, and an optional time limit cancels the
//! workers cooperatively.

use core::convert::Infallible;
use core::time::Duration;
use std::sync::Arc;
use std::time::Instant;

use derive_more::From;
use foundation_synckit::{
    join_all, spawn_all, CancelToken, Rendezvous, SyncError, WorkerBuilder, WorkerContext,
};

pub mod config;
pub mod sync;

pub use config::StressConfig;

/// Why a stress run produced no result.
#[derive(Debug, From)]
pub enum StressError {
    /// A worker could not be started or a primitive reported misuse.
    Sync(SyncError),

    /// One or more workers panicked; carries the aggregated report.
    #[from(ignore)]
    Workers(String),
}

impl std::error::Error for StressError {}

impl core::fmt::Display for StressError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Sync(err) => write!(f, "StressError::Sync({err})"),
            Self::Workers(report) => write!(f, "StressError::Workers({report})"),
        }
    }
}

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressResult {
    /// Operations that returned `true`.
    pub successes: usize,
    /// Operations that returned `false`.
    pub failures: usize,
    pub duration: Duration,
    pub thread_count: usize,
    /// Whether the time limit cancelled the workers before they finished.
    pub stopped_early: bool,
}

impl StressResult {
    #[must_use]
    pub const fn total_operations(&self) -> usize {
        self.successes + self.failures
    }

    /// Success rate between 0.0 and 1.0.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_operations() == 0 {
            0.0
        } else {
            self.successes as f64 / self.total_operations() as f64
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn operations_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.total_operations() as f64 / secs
        }
    }
}

/// Runs an operation on several workers until every worker has done its
/// iterations or the time limit cancels them.
pub struct StressHarness {
    config: StressConfig,
}

impl StressHarness {
    #[must_use]
    pub const fn new(config: StressConfig) -> Self {
        Self { config }
    }

    /// Runs `operation(worker_index, iteration)` on every worker.
    ///
    /// # Examples
    ///
    /// ```
    /// use foundation_synckit::AtomicCounter;
    /// use foundation_testing::stress::{StressConfig, StressHarness};
    /// use std::sync::Arc;
    ///
    /// let counter = Arc::new(AtomicCounter::new(0));
    /// let harness = StressHarness::new(StressConfig::new().threads(4).iterations(100));
    ///
    /// let shared = Arc::clone(&counter);
    /// let result = harness
    ///     .run(move |_worker, _iteration| shared.increment() > 0)
    ///     .unwrap();
    ///
    /// assert_eq!(counter.read(), 400);
    /// assert_eq!(result.successes, 400);
    /// ```
    ///
    /// # Errors
    ///
    /// - [`StressError::Sync`] if a worker thread could not be created.
    /// - [`StressError::Workers`] if any worker panicked.
    pub fn run<F>(self, operation: F) -> Result<StressResult, StressError>
    where
        F: Fn(usize, usize) -> bool + Send + Sync + 'static,
    {
        let start = Instant::now();
        let stop = CancelToken::new();
        let finished = Arc::new(Rendezvous::new());

        let deadline = match self.config.get_duration() {
            Some(limit) => {
                let (stop, finished) = (stop.clone(), Arc::clone(&finished));
                let watchdog = WorkerBuilder::new()
                    .name("stress-deadline")
                    .spawn((), move |_, ()| {
                        if !finished.wait_timeout(limit) {
                            tracing::debug!("stress run reached its {limit:?} limit");
                            stop.cancel();
                        }
                        Ok::<_, Infallible>(())
                    })?;
                Some(watchdog)
            }
            None => None,
        };

        let iterations = self.config.get_iterations();
        let worker_stop = stop.clone();
        let body = move |ctx: &WorkerContext, worker: usize| {
            let (mut successes, mut failures) = (0usize, 0usize);
            for iteration in 0..iterations {
                if worker_stop.is_cancelled() || ctx.cancel_token().is_cancelled() {
                    break;
                }
                if operation(worker, iteration) {
                    successes += 1;
                } else {
                    failures += 1;
                }
            }
            Ok::<_, Infallible>((successes, failures))
        };

        let thread_count = self.config.get_thread_count();
        let joined = spawn_all(self.config.get_workers(), 0..thread_count, body).map(join_all);

        finished.signal_ready();
        if let Some(watchdog) = deadline {
            let _ = watchdog.join();
        }

        let tallies = joined?.map_err(|failure| StressError::Workers(failure.to_string()))?;
        let (successes, failures) = tallies
            .into_iter()
            .fold((0, 0), |(ok, bad), (s, f)| (ok + s, bad + f));

        Ok(StressResult {
            successes,
            failures,
            duration: start.elapsed(),
            thread_count,
            stopped_early: stop.is_requested(),
        })
    }
}
