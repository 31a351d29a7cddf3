//! Cooperative cancellation with deferrable critical regions.
//!
//! A [`CancelToken`] is shared between a worker and whoever may cancel it.
//! The worker polls it at safe points via [`CancelToken::checkpoint`].
//! Regions that must not be interrupted half way hold a [`DeferCancel`]
//! guard. Deferral belongs to the worker that took the guard: while any of
//! its guards is alive the token reports "not cancelled" on that worker
//! only, and the request becomes observable there again once the last guard
//! drops. Other workers sharing the token see the request immediately.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, Ordering};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{SyncError, SyncResult};

thread_local! {
    /// Defer depth of every token deferred on this worker, keyed by the
    /// address of the token's shared state.
    static DEFER_DEPTHS: RefCell<HashMap<usize, u32>> = RefCell::new(HashMap::new());
}

#[derive(Debug, Default)]
struct CancelState {
    requested: AtomicBool,
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.state).addr()
    }

    /// Requests cancellation. Returns `false` if it was already requested.
    pub fn cancel(&self) -> bool {
        let first = !self.state.requested.swap(true, Ordering::AcqRel);
        if first {
            tracing::debug!("CancelToken: cancellation requested");
        }
        first
    }

    /// True once [`Self::cancel`] was called, regardless of deferral.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.state.requested.load(Ordering::Acquire)
    }

    /// True while the calling worker holds a [`DeferCancel`] for this token.
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        let key = self.key();
        DEFER_DEPTHS
            .try_with(|depths| depths.borrow().get(&key).is_some_and(|depth| *depth > 0))
            .unwrap_or(false)
    }

    /// True when cancellation was requested and the calling worker does
    /// not defer it.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.is_requested() && !self.is_deferred()
    }

    /// Returns `Err(SyncError::Aborted)` when cancellation is observable.
    ///
    /// # Errors
    ///
    /// Fails with [`SyncError::Aborted`] if the token was cancelled outside
    /// of any deferred region of the calling worker.
    pub fn checkpoint(&self) -> SyncResult<()> {
        if self.is_cancelled() {
            return Err(SyncError::Aborted);
        }
        Ok(())
    }

    /// Defers cancellation on the calling worker until the returned guard
    /// drops.
    ///
    /// Guards nest; dropping one undoes only its own deferral.
    #[must_use = "cancellation is only deferred while the guard is alive"]
    pub fn defer(&self) -> DeferCancel<'_> {
        let key = self.key();
        let previous = DEFER_DEPTHS
            .try_with(|depths| {
                let mut depths = depths.borrow_mut();
                let depth = depths.entry(key).or_insert(0);
                let previous = *depth;
                *depth = depth.saturating_add(1);
                previous
            })
            .unwrap_or(0);
        DeferCancel {
            token: self,
            previous,
            _not_send: PhantomData,
        }
    }

    /// Runs `f` with cancellation deferred.
    pub fn deferred<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = self.defer();
        f()
    }
}

/// Scoped guard returned by [`CancelToken::defer`].
///
/// Tied to the worker that created it.
#[derive(Debug)]
pub struct DeferCancel<'a> {
    token: &'a CancelToken,
    previous: u32,
    _not_send: PhantomData<*const ()>,
}

impl DeferCancel<'_> {
    /// The defer depth that was in effect before this guard.
    #[must_use]
    pub fn previous_depth(&self) -> u32 {
        self.previous
    }
}

impl Drop for DeferCancel<'_> {
    fn drop(&mut self) {
        let key = self.token.key();
        let _ = DEFER_DEPTHS.try_with(|depths| {
            let mut depths = depths.borrow_mut();
            if let Some(depth) = depths.get_mut(&key) {
                *depth = depth.saturating_sub(1);
                if *depth == 0 {
                    depths.remove(&key);
                }
            }
        });
    }
}
