//! Deadlock-free acquisition of two locks, and the transfer built on it.
//!
//! [`acquire_both`] always takes the lock with the lower [`LockId`] first,
//! whatever order the caller names them in. Two workers locking the same
//! pair in opposite roles therefore queue on the same first lock and no
//! waiting cycle can form. Each lock is first tried briefly with backoff,
//! then the caller joins its FIFO queue like any blocking acquirer, so a
//! steady stream of single-lock users cannot starve it. While waiting, the
//! caller's [`CancelToken`] is polled; cancellation withdraws from the queue,
//! drops whatever is already held and fails with [`SyncError::Aborted`], so
//! a caller ends up holding both locks or none.

use core::fmt;
use std::thread;

use crate::cancel::CancelToken;
use crate::config::DualLockConfig;
use crate::errors::{SyncError, SyncResult};
use crate::mutex::{ExclusiveGuard, ExclusiveLock, LockId};

/// Rounds of `yield_now` after spinning, before joining the lock's queue.
const YIELD_ROUNDS: u32 = 16;

/// Backoff used between acquisition attempts.
struct Backoff {
    counter: u32,
    spin_limit: u32,
}

impl Backoff {
    fn new(spin_limit: u32) -> Self {
        Self {
            counter: 0,
            spin_limit,
        }
    }

    fn snooze(&mut self) {
        if self.counter < self.spin_limit {
            for _ in 0..(1u32 << self.counter.min(16)) {
                core::hint::spin_loop();
            }
        } else {
            thread::yield_now();
        }
        self.counter = self.counter.saturating_add(1);
    }

    fn is_completed(&self) -> bool {
        self.counter >= self.spin_limit.saturating_add(YIELD_ROUNDS)
    }
}

/// Holds two locks at once. Both are released when the guard drops.
pub struct DualGuard<'a, A: ?Sized, B: ?Sized> {
    a: ExclusiveGuard<'a, A>,
    b: ExclusiveGuard<'a, B>,
}

impl<A: ?Sized, B: ?Sized> DualGuard<'_, A, B> {
    #[must_use]
    pub fn a(&self) -> &A {
        &self.a
    }

    #[must_use]
    pub fn b(&self) -> &B {
        &self.b
    }

    /// Mutable access to both protected values at once.
    pub fn split(&mut self) -> (&mut A, &mut B) {
        (&mut *self.a, &mut *self.b)
    }

    #[must_use]
    pub fn ids(&self) -> (LockId, LockId) {
        (self.a.lock().id(), self.b.lock().id())
    }
}

impl<A: ?Sized + fmt::Debug, B: ?Sized + fmt::Debug> fmt::Debug for DualGuard<'_, A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DualGuard")
            .field("a", &self.a())
            .field("b", &self.b())
            .finish()
    }
}

/// Acquires `a` and `b` together with the default backoff.
///
/// # Errors
///
/// - [`SyncError::Aborted`] if `cancel` fires before both are held.
/// - [`SyncError::Reentrant`] if `a` and `b` are the same lock or the
///   caller already holds one of them.
pub fn acquire_both<'a, A: ?Sized, B: ?Sized>(
    a: &'a ExclusiveLock<A>,
    b: &'a ExclusiveLock<B>,
    cancel: &CancelToken,
) -> SyncResult<DualGuard<'a, A, B>> {
    acquire_both_with(a, b, cancel, &DualLockConfig::default())
}

/// Same as [`acquire_both`] with an explicit backoff configuration.
///
/// # Errors
///
/// See [`acquire_both`].
pub fn acquire_both_with<'a, A: ?Sized, B: ?Sized>(
    a: &'a ExclusiveLock<A>,
    b: &'a ExclusiveLock<B>,
    cancel: &CancelToken,
    config: &DualLockConfig,
) -> SyncResult<DualGuard<'a, A, B>> {
    if a.id() == b.id() {
        tracing::error!("acquire_both: {} named twice", a.id());
        return Err(SyncError::Reentrant { lock: a.id() });
    }

    if a.id() < b.id() {
        let a = wait_for(a, cancel, config)?;
        let b = wait_for(b, cancel, config)?;
        Ok(DualGuard { a, b })
    } else {
        let b = wait_for(b, cancel, config)?;
        let a = wait_for(a, cancel, config)?;
        Ok(DualGuard { a, b })
    }
}

fn wait_for<'a, T: ?Sized>(
    lock: &'a ExclusiveLock<T>,
    cancel: &CancelToken,
    config: &DualLockConfig,
) -> SyncResult<ExclusiveGuard<'a, T>> {
    if lock.is_held_by_current() {
        tracing::error!("acquire_both: caller already holds {}", lock.id());
        return Err(SyncError::Reentrant { lock: lock.id() });
    }

    let mut backoff = Backoff::new(config.spin_limit);
    while !backoff.is_completed() {
        if cancel.is_cancelled() {
            tracing::debug!("acquire_both: cancelled while waiting for {}", lock.id());
            return Err(SyncError::Aborted);
        }
        if let Some(guard) = lock.try_acquire() {
            return Ok(guard);
        }
        backoff.snooze();
    }
    lock.acquire_cancellable(cancel)
}

/// An entity whose balance is only reachable through its lock.
///
/// Balances are integer minor units, so conservation checks are exact.
#[derive(Debug)]
pub struct Account {
    balance: ExclusiveLock<i64>,
}

impl Account {
    #[must_use]
    pub fn new(balance: i64) -> Self {
        Self {
            balance: ExclusiveLock::new(balance),
        }
    }

    #[must_use]
    pub fn id(&self) -> LockId {
        self.balance.id()
    }

    /// Reads the balance under the account's lock.
    ///
    /// # Errors
    ///
    /// [`SyncError::Reentrant`] if the caller already holds this account.
    pub fn balance(&self) -> SyncResult<i64> {
        self.balance.with(|balance| *balance)
    }

    /// Adds `amount` under the account's lock.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Reentrant`] if the caller already holds this account.
    /// - [`SyncError::Overflow`] if the balance would leave the `i64` range.
    pub fn earn(&self, amount: i64) -> SyncResult<()> {
        self.apply(amount, i64::checked_add)
    }

    /// Subtracts `amount` under the account's lock.
    ///
    /// # Errors
    ///
    /// Same as [`Self::earn`].
    pub fn pay(&self, amount: i64) -> SyncResult<()> {
        self.apply(amount, i64::checked_sub)
    }

    fn apply(&self, amount: i64, op: fn(i64, i64) -> Option<i64>) -> SyncResult<()> {
        let mut balance = self.balance.acquire()?;
        *balance = op(*balance, amount).ok_or(SyncError::Overflow { amount })?;
        Ok(())
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.balance.is_locked()
    }

    pub(crate) fn lock(&self) -> &ExclusiveLock<i64> {
        &self.balance
    }
}

/// Moves `amount` from `from` to `to` while holding both accounts.
///
/// The debit and credit run with cancellation deferred, so a cancel that
/// arrives once both locks are held never splits the pair of updates.
///
/// # Errors
///
/// - [`SyncError::Aborted`] if `cancel` fires before both accounts are held;
///   no balance changes in that case.
/// - [`SyncError::Reentrant`] if `from` and `to` are the same account.
/// - [`SyncError::Overflow`] if either balance would leave the `i64` range;
///   neither balance changes.
pub fn transfer(from: &Account, to: &Account, amount: i64, cancel: &CancelToken) -> SyncResult<()> {
    transfer_with(from, to, amount, cancel, &DualLockConfig::default())
}

/// [`transfer`] with an explicit backoff configuration.
///
/// # Errors
///
/// See [`transfer`].
pub fn transfer_with(
    from: &Account,
    to: &Account,
    amount: i64,
    cancel: &CancelToken,
    config: &DualLockConfig,
) -> SyncResult<()> {
    let mut both = acquire_both_with(from.lock(), to.lock(), cancel, config)?;

    let _deferred = cancel.defer();
    let (source, target) = both.split();
    let (Some(debited), Some(credited)) = (source.checked_sub(amount), target.checked_add(amount))
    else {
        tracing::error!("transfer: {amount} overflows {} or {}", from.id(), to.id());
        return Err(SyncError::Overflow { amount });
    };
    *source = debited;
    *target = credited;

    tracing::trace!("transfer: moved {amount} from {} to {}", from.id(), to.id());
    Ok(())
}
