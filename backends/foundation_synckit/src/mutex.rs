//! An owner-tracking mutual exclusion lock.
//!
//! [`ExclusiveLock`] records which worker holds it, which lets it refuse a
//! release from anyone else ([`SyncError::NotOwner`]) and refuse to
//! self-deadlock on reentrant acquisition ([`SyncError::Reentrant`]).
//! Blocked acquirers are served in ticket (FIFO) order. A cancellable
//! acquirer ([`ExclusiveLock::acquire_cancellable`]) waits in the same queue
//! and withdraws its ticket if it gives up.
//!
//! The lock can be held in two ways:
//!
//! - scoped, through [`ExclusiveLock::acquire`], whose guard releases on
//!   every exit path;
//! - unscoped, through [`ExclusiveLock::lock`] and
//!   [`ExclusiveLock::release`], for callers that pair the two manually.
//!   [`ExclusiveLock::adopt`] turns an unscoped hold into a guard.
//!
//! A hold is represented by at most one guard. While that guard lives,
//! [`ExclusiveLock::release`] and a second [`ExclusiveLock::adopt`] fail
//! with [`SyncError::GuardOutstanding`].

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::errors::{SyncError, SyncResult};

/// How often a cancellable waiter re-checks its token.
const CANCEL_POLL: Duration = Duration::from_millis(1);

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Stable, process-unique identity of a lock.
///
/// Identities are handed out in construction order and never reused,
/// which gives every pair of locks a consistent acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockId(u64);

impl LockId {
    fn next() -> Self {
        Self(NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock#{}", self.0)
    }
}

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    next_ticket: u64,
    serving: u64,
    /// Tickets given up by cancelled waiters, skipped when their turn comes.
    withdrawn: BTreeSet<u64>,
    /// Set while an [`ExclusiveGuard`] stands for the current hold.
    guarded: bool,
    poisoned: bool,
}

impl LockState {
    fn is_free_for(&self, ticket: u64) -> bool {
        self.owner.is_none() && self.serving == ticket
    }

    fn advance(&mut self) {
        self.serving += 1;
        while self.withdrawn.remove(&self.serving) {
            self.serving += 1;
        }
    }

    fn waiting(&self) -> u64 {
        let withdrawn = u64::try_from(self.withdrawn.len()).unwrap_or(u64::MAX);
        self.next_ticket
            .saturating_sub(self.serving)
            .saturating_sub(withdrawn)
            .saturating_sub(u64::from(self.owner.is_some()))
    }
}

pub struct ExclusiveLock<T: ?Sized> {
    id: LockId,
    state: Mutex<LockState>,
    released: Condvar,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for ExclusiveLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for ExclusiveLock<T> {}

impl<T> ExclusiveLock<T> {
    #[must_use]
    pub fn new(data: T) -> Self {
        Self {
            id: LockId::next(),
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> ExclusiveLock<T> {
    #[must_use]
    pub fn id(&self) -> LockId {
        self.id
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        // LockState is only touched by code in this module that never panics
        // while holding it, so a poisoned inner mutex still holds valid state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the lock is free, then holds it until the guard drops.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Reentrant`] if the calling worker already holds
    /// this lock.
    pub fn acquire(&self) -> SyncResult<ExclusiveGuard<'_, T>> {
        let mut state = self.take_turn(None)?;
        state.guarded = true;
        drop(state);
        Ok(ExclusiveGuard::new(self))
    }

    /// Queues for the lock like [`Self::acquire`], but gives up its place
    /// once `cancel` fires.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Aborted`] if `cancel` fires before the lock is held.
    /// - [`SyncError::Reentrant`] if the calling worker already holds this
    ///   lock.
    pub fn acquire_cancellable(&self, cancel: &CancelToken) -> SyncResult<ExclusiveGuard<'_, T>> {
        let mut state = self.take_turn(Some(cancel))?;
        state.guarded = true;
        drop(state);
        Ok(ExclusiveGuard::new(self))
    }

    /// Takes the lock only if it is free and nobody is queued for it.
    #[must_use]
    pub fn try_acquire(&self) -> Option<ExclusiveGuard<'_, T>> {
        let me = thread::current().id();
        let mut state = self.state();
        if !state.is_free_for(state.next_ticket) {
            return None;
        }
        state.next_ticket += 1;
        state.owner = Some(me);
        state.guarded = true;
        drop(state);
        Some(ExclusiveGuard::new(self))
    }

    /// Unscoped acquisition; pair with [`Self::release`] or [`Self::adopt`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Reentrant`] if the calling worker already holds
    /// this lock.
    pub fn lock(&self) -> SyncResult<()> {
        self.take_turn(None).map(drop)
    }

    fn take_turn(&self, cancel: Option<&CancelToken>) -> SyncResult<MutexGuard<'_, LockState>> {
        let me = thread::current().id();
        let mut state = self.state();

        if state.owner == Some(me) {
            tracing::error!("ExclusiveLock: reentrant acquisition of {}", self.id);
            return Err(SyncError::Reentrant { lock: self.id });
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;

        if !state.is_free_for(ticket) {
            tracing::debug!("ExclusiveLock: {} contended, waiting on ticket {ticket}", self.id);
        }
        while !state.is_free_for(ticket) {
            state = match cancel {
                None => self
                    .released
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(cancel) if cancel.is_cancelled() => {
                    tracing::debug!("ExclusiveLock: ticket {ticket} for {} withdrawn", self.id);
                    self.withdraw(state, ticket);
                    return Err(SyncError::Aborted);
                }
                Some(_) => {
                    self.released
                        .wait_timeout(state, CANCEL_POLL)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }

        state.owner = Some(me);
        Ok(state)
    }

    fn withdraw(&self, mut state: MutexGuard<'_, LockState>, ticket: u64) {
        if state.serving == ticket {
            // Our turn already came: pass it on as if we had held and released.
            state.advance();
            drop(state);
            self.released.notify_all();
        } else {
            state.withdrawn.insert(ticket);
        }
    }

    /// Releases an unscoped hold.
    ///
    /// # Errors
    ///
    /// - [`SyncError::NotOwner`] if the calling worker does not hold this
    ///   lock.
    /// - [`SyncError::GuardOutstanding`] if the hold belongs to a live guard.
    ///
    /// The lock state is left untouched on error.
    pub fn release(&self) -> SyncResult<()> {
        let me = thread::current().id();
        let state = self.state();
        if state.owner != Some(me) {
            tracing::error!("ExclusiveLock: release of {} by a non-owner", self.id);
            return Err(SyncError::NotOwner { lock: self.id });
        }
        if state.guarded {
            tracing::error!("ExclusiveLock: release of {} while its guard is alive", self.id);
            return Err(SyncError::GuardOutstanding { lock: self.id });
        }
        self.release_locked(state);
        Ok(())
    }

    /// Wraps a hold taken with [`Self::lock`] into a scoped guard.
    ///
    /// # Errors
    ///
    /// - [`SyncError::NotOwner`] if the calling worker does not hold this
    ///   lock.
    /// - [`SyncError::GuardOutstanding`] if the hold already has a guard.
    pub fn adopt(&self) -> SyncResult<ExclusiveGuard<'_, T>> {
        let mut state = self.state();
        if state.owner != Some(thread::current().id()) {
            return Err(SyncError::NotOwner { lock: self.id });
        }
        if state.guarded {
            tracing::error!("ExclusiveLock: {} adopted twice", self.id);
            return Err(SyncError::GuardOutstanding { lock: self.id });
        }
        state.guarded = true;
        drop(state);
        Ok(ExclusiveGuard::new(self))
    }

    /// Runs `f` with the lock held.
    ///
    /// # Errors
    ///
    /// Same as [`Self::acquire`].
    pub fn with<F, R>(&self, f: F) -> SyncResult<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut guard = self.acquire()?;
        Ok(f(&mut guard))
    }

    fn release_locked(&self, mut state: MutexGuard<'_, LockState>) {
        state.owner = None;
        state.guarded = false;
        state.advance();
        drop(state);
        self.released.notify_all();
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state().owner.is_some()
    }

    #[must_use]
    pub fn is_held_by_current(&self) -> bool {
        self.state().owner == Some(thread::current().id())
    }

    /// True if a scoped hold ended in a panic.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.state().poisoned
    }

    /// Number of workers blocked waiting for this lock.
    #[must_use]
    pub fn queued(&self) -> u64 {
        self.state().waiting()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for ExclusiveLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> From<T> for ExclusiveLock<T> {
    fn from(data: T) -> Self {
        Self::new(data)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for ExclusiveLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("ExclusiveLock");
        d.field("id", &self.id);
        match self.try_acquire() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &format_args!("<locked>")),
        };
        d.finish_non_exhaustive()
    }
}

/// RAII guard for [`ExclusiveLock`].
///
/// The guard is tied to the worker that acquired it and cannot be sent
/// to another thread.
pub struct ExclusiveGuard<'a, T: ?Sized + 'a> {
    lock: &'a ExclusiveLock<T>,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for ExclusiveGuard<'_, T> {}

impl<'a, T: ?Sized> ExclusiveGuard<'a, T> {
    fn new(lock: &'a ExclusiveLock<T>) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }

    #[must_use]
    pub fn lock(&self) -> &'a ExclusiveLock<T> {
        self.lock
    }
}

impl<T: ?Sized> Deref for ExclusiveGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for ExclusiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for ExclusiveGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state();
        if state.owner != Some(thread::current().id()) || !state.guarded {
            tracing::error!("ExclusiveGuard: {} is no longer held by this guard", self.lock.id);
            return;
        }
        if thread::panicking() {
            state.poisoned = true;
        }
        self.lock.release_locked(state);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for ExclusiveGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized + fmt::Display> fmt::Display for ExclusiveGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::Arc;
    use std::time::Duration;

    /// WHY: the scoped form is the everyday way to use the lock
    /// WHAT: writes through a guard are visible to the next holder
    #[test]
    fn test_acquire_and_modify() {
        let lock = ExclusiveLock::new(0);
        {
            let mut guard = lock.acquire().unwrap();
            *guard = 42;
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.acquire().unwrap(), 42);
    }

    /// WHY: release by a non-holder is a programmer error that must surface
    /// WHAT: releasing a lock held by another thread fails with NotOwner
    #[test]
    fn test_release_by_non_owner_fails() {
        let lock = Arc::new(ExclusiveLock::new(()));
        lock.lock().unwrap();

        let other = Arc::clone(&lock);
        let result = thread::spawn(move || other.release()).join().unwrap();
        assert!(matches!(result, Err(SyncError::NotOwner { lock: id }) if id == lock.id()));

        assert!(lock.is_held_by_current());
        lock.release().unwrap();
        assert!(matches!(lock.release(), Err(SyncError::NotOwner { .. })));
    }

    /// WHY: nested acquisition on one worker would otherwise hang forever
    /// WHAT: a second acquire from the holder fails with Reentrant
    #[test]
    fn test_reentrant_acquire_fails_loudly() {
        let lock = ExclusiveLock::new(1);
        let _guard = lock.acquire().unwrap();
        assert!(matches!(lock.acquire(), Err(SyncError::Reentrant { .. })));
        assert!(lock.try_acquire().is_none());
    }

    /// WHY: the scoped form must release on failure paths too
    /// WHAT: a panic while holding the guard releases and poisons
    #[test]
    fn test_guard_releases_on_panic() {
        let lock = ExclusiveLock::new(0);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut guard = lock.acquire().unwrap();
            *guard += 1;
            panic!("failure inside critical section");
        }));
        assert!(result.is_err());
        assert!(!lock.is_locked());
        assert!(lock.is_poisoned());
        assert_eq!(*lock.acquire().unwrap(), 1);
    }

    #[test]
    fn test_adopt_wraps_unscoped_hold() {
        let lock = ExclusiveLock::new(String::from("a"));
        assert!(lock.adopt().is_err());

        lock.lock().unwrap();
        {
            let mut guard = lock.adopt().unwrap();
            guard.push('b');
        }
        assert!(!lock.is_locked());
        assert_eq!(lock.into_inner(), "ab");
    }

    /// WHY: one hold must never be reachable through two guards
    /// WHAT: a second adopt fails and the ticket counters stay consistent
    #[test]
    fn test_adopt_twice_is_rejected() {
        let lock = ExclusiveLock::new(0);
        lock.lock().unwrap();

        let mut guard = lock.adopt().unwrap();
        assert!(matches!(
            lock.adopt(),
            Err(SyncError::GuardOutstanding { lock: id }) if id == lock.id()
        ));
        *guard += 1;
        drop(guard);

        assert!(!lock.is_locked());
        assert_eq!(lock.queued(), 0);
        assert_eq!(*lock.acquire().unwrap(), 1);
        assert!(lock.try_acquire().is_some());
    }

    /// WHY: a manual release under a live guard would let the guard free a
    /// lock someone else holds by then
    /// WHAT: release fails while the guard lives and the lock stays exclusive
    #[test]
    fn test_release_under_live_guard_is_rejected() {
        let lock = Arc::new(ExclusiveLock::new(0));
        let guard = lock.acquire().unwrap();
        assert!(matches!(
            lock.release(),
            Err(SyncError::GuardOutstanding { .. })
        ));
        assert!(lock.is_held_by_current());

        let contender = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.try_acquire().is_some())
        };
        assert!(!contender.join().unwrap());

        drop(guard);
        assert!(!lock.is_locked());
        assert!(matches!(lock.release(), Err(SyncError::NotOwner { .. })));
    }

    /// WHY: a cancelled waiter must not leave a hole in the FIFO queue
    /// WHAT: the waiter behind a withdrawn ticket still gets the lock
    #[test]
    fn test_withdrawn_ticket_is_skipped() {
        let lock = Arc::new(ExclusiveLock::new(Vec::new()));
        let held = lock.acquire().unwrap();
        let cancel = CancelToken::new();

        let quitter = {
            let (lock, cancel) = (Arc::clone(&lock), cancel.clone());
            thread::spawn(move || lock.acquire_cancellable(&cancel).map(|_| ()))
        };
        while lock.queued() < 1 {
            thread::sleep(Duration::from_millis(1));
        }
        let patient = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.with(|order| order.push("patient")))
        };
        while lock.queued() < 2 {
            thread::sleep(Duration::from_millis(1));
        }

        cancel.cancel();
        assert!(quitter.join().unwrap().unwrap_err().is_aborted());
        assert_eq!(lock.queued(), 1);

        drop(held);
        patient.join().unwrap().unwrap();
        assert_eq!(lock.queued(), 0);
        assert_eq!(*lock.acquire().unwrap(), vec!["patient"]);
    }

    /// WHY: a cancellable acquirer is an ordinary FIFO waiter until it quits
    /// WHAT: it gets the lock as soon as the holder releases
    #[test]
    fn test_cancellable_acquire_gets_its_turn() {
        let lock = Arc::new(ExclusiveLock::new(0));
        let held = lock.acquire().unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let mut guard = lock.acquire_cancellable(&CancelToken::new())?;
                *guard += 1;
                Ok::<_, SyncError>(())
            })
        };
        while lock.queued() < 1 {
            thread::sleep(Duration::from_millis(1));
        }
        drop(held);

        waiter.join().unwrap().unwrap();
        assert_eq!(*lock.acquire().unwrap(), 1);
    }

    /// WHY: mutual exclusion is the whole point of the lock
    /// WHAT: unsynchronized read-modify-write under the lock loses nothing
    #[test]
    fn test_contended_increments() {
        let lock = Arc::new(ExclusiveLock::new(0u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        lock.with(|value| *value += 1).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.acquire().unwrap(), 8000);
    }

    /// WHY: blocked acquirers must be served fairly over time
    /// WHAT: waiters queued in order A then B acquire in that order
    #[test]
    fn test_waiters_served_in_arrival_order() {
        let lock = Arc::new(ExclusiveLock::new(Vec::new()));
        let held = lock.acquire().unwrap();

        let mut handles = vec![];
        for name in ["a", "b", "c"] {
            let lock_clone = Arc::clone(&lock);
            let expected = handles.len() as u64 + 1;
            handles.push(thread::spawn(move || {
                lock_clone.with(|order| order.push(name)).unwrap();
            }));
            while lock.queued() < expected {
                thread::sleep(Duration::from_millis(1));
            }
        }

        drop(held);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.acquire().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_lock_ids_are_ordered_and_unique() {
        let first = ExclusiveLock::new(());
        let second = ExclusiveLock::new(());
        assert!(first.id() < second.id());
        assert_eq!(format!("{}", first.id()), format!("lock#{}", first.id().as_u64()));
    }
}
