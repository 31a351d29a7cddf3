//! Per-worker storage slots with guaranteed cleanup.
//!
//! A [`WorkerKey`] maps each worker thread to its own value. The cleanup
//! callback given at creation receives every value exactly once: when the
//! owning thread exits, when the key is retired with
//! [`WorkerKey::delete_key`], or when the last handle to the key is dropped,
//! whichever comes first. Values replaced through
//! [`WorkerKey::set`] or removed through [`WorkerKey::take`] are handed back
//! to the caller and never reach the cleanup.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

use crate::errors::{SyncError, SyncResult};

/// Lets a thread's exit hooks reclaim slots without knowing `T`.
trait ReclaimSlot: Send + Sync {
    fn reclaim(&self, thread: ThreadId);
}

struct ExitHooks {
    thread: ThreadId,
    hooks: Vec<Weak<dyn ReclaimSlot>>,
}

impl ExitHooks {
    fn register(&mut self, key: Weak<dyn ReclaimSlot>) {
        self.hooks.retain(|hook| hook.strong_count() > 0);
        let target = key.as_ptr().cast::<()>();
        if !self
            .hooks
            .iter()
            .any(|hook| hook.as_ptr().cast::<()>() == target)
        {
            self.hooks.push(key);
        }
    }
}

impl Drop for ExitHooks {
    fn drop(&mut self) {
        for hook in self.hooks.drain(..) {
            if let Some(key) = hook.upgrade() {
                key.reclaim(self.thread);
            }
        }
    }
}

thread_local! {
    static EXIT_HOOKS: RefCell<ExitHooks> = RefCell::new(ExitHooks {
        thread: thread::current().id(),
        hooks: Vec::new(),
    });
}

type Cleanup<T> = Box<dyn Fn(T) + Send + Sync>;

struct KeyInner<T> {
    cleanup: Cleanup<T>,
    slots: Mutex<HashMap<ThreadId, T>>,
    retired: AtomicBool,
}

impl<T> KeyInner<T> {
    fn slots(&self) -> MutexGuard<'_, HashMap<ThreadId, T>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Drop for KeyInner<T> {
    // The last handle is gone, so exit hooks can no longer reach these slots.
    fn drop(&mut self) {
        let slots = self.slots.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !slots.is_empty() {
            tracing::debug!("WorkerKey: last handle dropped with {} live slot(s)", slots.len());
        }
        for (_, value) in slots.drain() {
            (self.cleanup)(value);
        }
    }
}

impl<T: Send> ReclaimSlot for KeyInner<T> {
    fn reclaim(&self, thread: ThreadId) {
        let value = self.slots().remove(&thread);
        if let Some(value) = value {
            tracing::debug!("WorkerKey: cleaning slot of exiting {thread:?}");
            (self.cleanup)(value);
        }
    }
}

/// Handle to one worker-local key. Clones share the same key.
pub struct WorkerKey<T: Send + 'static> {
    inner: Arc<KeyInner<T>>,
}

impl<T: Send + 'static> Clone for WorkerKey<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> core::fmt::Debug for WorkerKey<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerKey")
            .field("live_slots", &self.inner.slots().len())
            .field("retired", &self.is_retired())
            .finish()
    }
}

impl<T: Send + 'static> WorkerKey<T> {
    /// Creates a key whose slots are handed to `cleanup` at thread exit or
    /// key retirement.
    pub fn create<F>(cleanup: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(KeyInner {
                cleanup: Box::new(cleanup),
                slots: Mutex::new(HashMap::new()),
                retired: AtomicBool::new(false),
            }),
        }
    }

    /// Creates a key whose values are simply dropped.
    #[must_use]
    pub fn without_cleanup() -> Self {
        Self::create(drop)
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.inner.retired.load(Ordering::Acquire)
    }

    fn check_live(&self) -> SyncResult<()> {
        if self.is_retired() {
            tracing::error!("WorkerKey: used after delete_key");
            return Err(SyncError::NotFound("retired worker key".into()));
        }
        Ok(())
    }

    fn watch_current_thread(&self) {
        let weak: Weak<dyn ReclaimSlot> = Arc::downgrade(&self.inner) as Weak<dyn ReclaimSlot>;
        let registered = EXIT_HOOKS.try_with(|hooks| hooks.borrow_mut().register(weak));
        if registered.is_err() {
            tracing::warn!("WorkerKey: slot set during thread teardown, reclaimed at delete_key");
        }
    }

    /// Stores `value` in the calling worker's slot.
    ///
    /// Returns the value it replaced, which the caller now owns.
    ///
    /// # Errors
    ///
    /// [`SyncError::NotFound`] if the key was retired.
    pub fn set(&self, value: T) -> SyncResult<Option<T>> {
        self.check_live()?;
        let previous = self.inner.slots().insert(thread::current().id(), value);
        if previous.is_none() {
            self.watch_current_thread();
        }
        Ok(previous)
    }

    /// Runs `f` against the calling worker's slot.
    ///
    /// `f` runs while the key's slot table is locked and must not use this
    /// key again.
    ///
    /// # Errors
    ///
    /// [`SyncError::NotFound`] if the key was retired.
    pub fn with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> SyncResult<R> {
        self.check_live()?;
        let slots = self.inner.slots();
        Ok(f(slots.get(&thread::current().id())))
    }

    /// Removes the calling worker's value and hands it back without
    /// running cleanup.
    ///
    /// # Errors
    ///
    /// [`SyncError::NotFound`] if the key was retired.
    pub fn take(&self) -> SyncResult<Option<T>> {
        self.check_live()?;
        Ok(self.inner.slots().remove(&thread::current().id()))
    }

    /// Retires the key and runs cleanup on every live slot.
    ///
    /// # Errors
    ///
    /// [`SyncError::NotFound`] if another handle already retired it.
    pub fn delete_key(self) -> SyncResult<()> {
        if self.inner.retired.swap(true, Ordering::AcqRel) {
            return Err(SyncError::NotFound("retired worker key".into()));
        }

        let live: Vec<T> = self.inner.slots().drain().map(|(_, value)| value).collect();
        tracing::debug!("WorkerKey: retired with {} live slot(s)", live.len());
        for value in live {
            (self.inner.cleanup)(value);
        }
        Ok(())
    }
}

impl<T: Send + Clone + 'static> WorkerKey<T> {
    /// Copy of the calling worker's value.
    ///
    /// # Errors
    ///
    /// [`SyncError::NotFound`] if the key was retired.
    pub fn get(&self) -> SyncResult<Option<T>> {
        self.with(|slot| slot.cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_key() -> (WorkerKey<usize>, Arc<Mutex<Vec<usize>>>) {
        let cleaned = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&cleaned);
        let key = WorkerKey::create(move |value| sink.lock().unwrap().push(value));
        (key, cleaned)
    }

    /// WHY: each worker must only ever see its own slot
    /// WHAT: four threads set distinct values and read back their own
    #[test]
    fn test_slots_are_isolated_per_worker() {
        let (key, _cleaned) = counting_key();
        key.set(1000).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|index| {
                let key = key.clone();
                thread::spawn(move || {
                    assert_eq!(key.get().unwrap(), None);
                    key.set(index).unwrap();
                    thread::yield_now();
                    key.get().unwrap()
                })
            })
            .collect();

        for (index, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().unwrap(), Some(index));
        }
        assert_eq!(key.get().unwrap(), Some(1000));
    }

    /// WHY: exiting workers must not leak their resources
    /// WHAT: cleanup runs at thread exit, before join returns
    #[test]
    fn test_cleanup_runs_at_worker_exit() {
        let (key, cleaned) = counting_key();

        let worker = {
            let key = key.clone();
            thread::spawn(move || {
                key.set(7).unwrap();
            })
        };
        worker.join().unwrap();

        assert_eq!(*cleaned.lock().unwrap(), vec![7]);
        key.delete_key().unwrap();
        assert_eq!(*cleaned.lock().unwrap(), vec![7]);
    }

    /// WHY: a worker often owns the last handle, which drops before its
    /// thread-local teardown runs
    /// WHAT: every slot is still cleaned exactly once when that handle goes
    #[test]
    fn test_cleanup_runs_when_last_handle_leaves_with_worker() {
        let (key, cleaned) = counting_key();
        key.set(1).unwrap();

        let worker = {
            let key = key.clone();
            thread::spawn(move || {
                key.set(5).unwrap();
            })
        };
        drop(key);
        worker.join().unwrap();

        let mut values = cleaned.lock().unwrap().clone();
        values.sort_unstable();
        assert_eq!(values, vec![1, 5]);

        let (key, cleaned) = counting_key();
        thread::spawn(move || {
            key.set(9).unwrap();
        })
        .join()
        .unwrap();
        assert_eq!(*cleaned.lock().unwrap(), vec![9]);
    }

    /// WHY: cleanup must happen exactly once per slot
    /// WHAT: delete_key cleans live slots; replaced and taken values skip it
    #[test]
    fn test_delete_key_cleans_live_slots_once() {
        let (key, cleaned) = counting_key();

        assert_eq!(key.set(1).unwrap(), None);
        assert_eq!(key.set(2).unwrap(), Some(1));

        let other = key.clone();
        other.delete_key().unwrap();
        assert_eq!(*cleaned.lock().unwrap(), vec![2]);

        assert!(key.set(3).unwrap_err().is_not_found());
        assert!(key.get().unwrap_err().is_not_found());
        assert!(key.take().unwrap_err().is_not_found());
        assert!(key.clone().delete_key().unwrap_err().is_not_found());
        assert_eq!(*cleaned.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_take_returns_value_without_cleanup() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let key = WorkerKey::create(move |_: String| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        key.set("conn".to_string()).unwrap();
        assert_eq!(key.with(|slot| slot.map(String::len)).unwrap(), Some(4));
        assert_eq!(key.take().unwrap().as_deref(), Some("conn"));
        assert_eq!(key.take().unwrap(), None);

        key.delete_key().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    /// WHY: a slot reclaimed at exit must not be cleaned again at retirement
    /// WHAT: many workers exit, then the key is deleted; each value cleaned once
    #[test]
    fn test_no_double_cleanup_across_exit_and_delete() {
        let (key, cleaned) = counting_key();

        let handles: Vec<_> = (0..16)
            .map(|index| {
                let key = key.clone();
                thread::spawn(move || {
                    key.set(index).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        key.set(99).unwrap();
        key.delete_key().unwrap();

        let mut cleaned = cleaned.lock().unwrap().clone();
        cleaned.sort_unstable();
        let mut expected: Vec<usize> = (0..16).collect();
        expected.push(99);
        assert_eq!(cleaned, expected);
    }
}
