//! A one-shot broadcast gate built on a mutex and condition variable.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// `GateState` is the state of a [`Rendezvous`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateState {
    NotReady,
    Ready,
}

/// `Rendezvous` holds workers back until some worker declares the shared
/// state ready, then lets every one of them through.
///
/// Once ready it stays ready: later arrivals pass straight through without
/// touching the condition variable.
pub struct Rendezvous {
    /// Fast-path mirror of `state`, only ever flips false -> true.
    ready: AtomicBool,

    state: Mutex<GateState>,

    /// Woken with `notify_all` on the single flip.
    event: Condvar,
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Rendezvous {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Rendezvous")
            .field("state", &self.probe())
            .finish()
    }
}

impl Rendezvous {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            state: Mutex::new(GateState::NotReady),
            event: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn probe(&self) -> GateState {
        *self.state()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Flips the gate to ready and wakes every waiter.
    ///
    /// Returns `true` for the call that performed the flip and `false`
    /// for every later call, which changes nothing.
    pub fn signal_ready(&self) -> bool {
        let mut state = self.state();
        if *state == GateState::Ready {
            return false;
        }
        *state = GateState::Ready;
        self.ready.store(true, Ordering::Release);
        drop(state);

        tracing::debug!("Rendezvous: gate flipped to ready, waking waiters");
        self.event.notify_all();
        true
    }

    /// Blocks until the gate is ready.
    pub fn wait_until_ready(&self) {
        if self.is_ready() {
            return;
        }

        let mut state = self.state();
        while *state == GateState::NotReady {
            state = self
                .event
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`Self::wait_until_ready`] but gives up after `timeout`.
    ///
    /// Returns whether the gate was ready when the call returned.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_ready() {
            return true;
        }

        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        while *state == GateState::NotReady {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .event
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}
