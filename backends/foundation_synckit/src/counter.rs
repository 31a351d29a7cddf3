//! Shared counters.
//!
//! [`AtomicCounter`] never loses an update. [`LossyCounter`] is the
//! contrast case: it reads and writes atomically but increments as two
//! separate steps, so concurrent writers overwrite each other.

use core::sync::atomic::{AtomicU64, Ordering};

/// A lock-free counter whose increments are indivisible and totally ordered.
///
/// # Examples
///
/// ```
/// use foundation_synckit::counter::AtomicCounter;
/// use std::sync::Arc;
/// use std::thread;
///
/// let counter = Arc::new(AtomicCounter::new(0));
/// let handles: Vec<_> = (0..4)
///     .map(|_| {
///         let counter = Arc::clone(&counter);
///         thread::spawn(move || {
///             for _ in 0..100 {
///                 counter.increment();
///             }
///         })
///     })
///     .collect();
///
/// for handle in handles {
///     handle.join().unwrap();
/// }
/// assert_eq!(counter.read(), 400);
/// ```
#[derive(Debug, Default)]
pub struct AtomicCounter {
    value: AtomicU64,
}

impl AtomicCounter {
    #[must_use]
    pub const fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
        }
    }

    /// Adds one and returns the value this increment produced.
    #[inline]
    pub fn increment(&self) -> u64 {
        self.add(1)
    }

    /// Adds `amount` and returns the value this addition produced.
    ///
    /// Wraps around at `u64::MAX`, like the underlying atomic.
    #[inline]
    pub fn add(&self, amount: u64) -> u64 {
        self.value
            .fetch_add(amount, Ordering::AcqRel)
            .wrapping_add(amount)
    }

    #[inline]
    pub fn read(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}

/// A counter that increments with a separate load and store.
///
/// Memory safe, but two workers that load the same value both store
/// `value + 1` and one update is lost. The final value is therefore
/// always at most the number of increments performed.
#[derive(Debug, Default)]
pub struct LossyCounter {
    value: AtomicU64,
}

impl LossyCounter {
    #[must_use]
    pub const fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
        }
    }

    #[inline]
    pub fn increment(&self) {
        let current = self.value.load(Ordering::Relaxed);
        core::hint::spin_loop();
        self.value.store(current.wrapping_add(1), Ordering::Relaxed);
    }

    #[inline]
    pub fn read(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    /// WHY: increments from many workers must all be counted
    /// WHAT: 8 workers x 5000 increments land exactly on 40000
    #[test]
    fn test_atomic_counter_no_lost_updates() {
        let counter = Arc::new(AtomicCounter::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..5000 {
                        counter.increment();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.read(), 40_000);
    }

    #[test]
    fn test_increment_returns_new_value() {
        let counter = AtomicCounter::new(10);
        assert_eq!(counter.increment(), 11);
        assert_eq!(counter.add(4), 15);
        assert_eq!(counter.read(), 15);
    }

    /// WHY: the counter range is finite and hitting its end must not panic
    /// WHAT: adding past u64::MAX wraps, matching the stored value
    #[test]
    fn test_add_wraps_at_range_end() {
        let counter = AtomicCounter::new(u64::MAX - 1);
        assert_eq!(counter.add(3), 1);
        assert_eq!(counter.read(), 1);

        let lossy = LossyCounter::new(u64::MAX);
        lossy.increment();
        assert_eq!(lossy.read(), 0);
    }

    /// WHY: the lossy baseline must never over-count
    /// WHAT: concurrent lossy increments end at or below N*M
    #[test]
    fn test_lossy_counter_never_over_counts() {
        let counter = Arc::new(LossyCounter::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..5000 {
                        counter.increment();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        let total = counter.read();
        assert!(total <= 40_000);
        assert!(total > 0);
    }
}
