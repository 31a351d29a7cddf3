//! A crowd of workers meeting at one rendezvous gate.

use core::convert::Infallible;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use foundation_synckit::{
    join_all, spawn_all, AggregateFailure, AtomicCounter, Rendezvous, WorkerConfig,
};

use crate::stress::StressError;

/// Early waiters block on a gate, several signallers race to open it, and
/// then late arrivals check that the open gate never blocks again.
///
/// # Examples
///
/// ```
/// use foundation_testing::scenarios::RendezvousCrowd;
///
/// let report = RendezvousCrowd::new(16).signallers(4).late_arrivals(100).run().unwrap();
/// assert_eq!(report.released, 16);
/// assert_eq!(report.winning_signals, 1);
/// ```
#[derive(Debug, Clone)]
pub struct RendezvousCrowd {
    waiters: usize,
    signallers: usize,
    late_arrivals: usize,
}

#[derive(Debug, Clone)]
pub struct CrowdReport {
    /// Early waiters that returned from the gate.
    pub released: usize,

    /// Signal calls that reported performing the flip; exactly one.
    pub winning_signals: usize,

    pub late_arrivals: usize,

    /// Slowest single pass of a late arrival through the open gate.
    pub slowest_late_pass: Duration,
}

impl RendezvousCrowd {
    #[must_use]
    pub fn new(waiters: usize) -> Self {
        Self {
            waiters,
            signallers: 1,
            late_arrivals: 1000,
        }
    }

    #[must_use]
    pub fn signallers(mut self, signallers: usize) -> Self {
        self.signallers = signallers;
        self
    }

    #[must_use]
    pub fn late_arrivals(mut self, late_arrivals: usize) -> Self {
        self.late_arrivals = late_arrivals;
        self
    }

    /// Runs the scenario to completion.
    ///
    /// # Errors
    ///
    /// [`StressError::Sync`] if a worker could not be spawned,
    /// [`StressError::Workers`] if one panicked.
    pub fn run(&self) -> Result<CrowdReport, StressError> {
        let gate = Arc::new(Rendezvous::new());
        let arrived = Arc::new(AtomicCounter::new(0));

        let waiter_config = WorkerConfig {
            name_prefix: String::from("crowd-waiter"),
            stack_size: None,
        };
        let waiters = {
            let (gate, arrived) = (Arc::clone(&gate), Arc::clone(&arrived));
            spawn_all(&waiter_config, 0..self.waiters, move |_, _: usize| {
                arrived.increment();
                gate.wait_until_ready();
                Ok::<_, Infallible>(gate.is_ready())
            })?
        };

        let expected = u64::try_from(self.waiters).unwrap_or(u64::MAX);
        while arrived.read() < expected {
            thread::yield_now();
        }

        let signal_config = WorkerConfig {
            name_prefix: String::from("crowd-signaller"),
            stack_size: None,
        };
        let signallers = {
            let gate = Arc::clone(&gate);
            spawn_all(&signal_config, 0..self.signallers, move |_, _: usize| {
                Ok::<_, Infallible>(gate.signal_ready())
            })?
        };

        let failed = |failure: AggregateFailure<bool, Infallible>| {
            StressError::Workers(failure.to_string())
        };
        let winning_signals = join_all(signallers)
            .map_err(failed)?
            .into_iter()
            .filter(|won| *won)
            .count();
        let released = join_all(waiters)
            .map_err(failed)?
            .into_iter()
            .filter(|ready| *ready)
            .count();

        let mut slowest_late_pass = Duration::ZERO;
        for _ in 0..self.late_arrivals {
            let started = Instant::now();
            gate.wait_until_ready();
            slowest_late_pass = slowest_late_pass.max(started.elapsed());
        }

        tracing::debug!(
            "rendezvous crowd: {released} released, {winning_signals} winning signal(s)"
        );
        Ok(CrowdReport {
            released,
            winning_signals,
            late_arrivals: self.late_arrivals,
            slowest_late_pass,
        })
    }
}
