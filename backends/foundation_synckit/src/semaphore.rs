//! Counting semaphores shared between processes (System V IPC).
//!
//! A [`CrossProcessSemaphore`] is a set of counters identified by a
//! kernel-visible key. Any process that resolves the same key, or that was
//! forked after a private set was created, operates on the same counters.
//! That makes it the handoff mechanism between a producer and a consumer
//! living in separate processes, where in-process mutexes and condition
//! variables are invisible.
//!
//! The set outlives every process using it and must be removed explicitly
//! ([`CrossProcessSemaphore::remove`] / [`CrossProcessSemaphore::destroy`]).
//!
//! Units held by a process that dies are handled per [`UndoPolicy`]:
//! `RollbackOnExit` lets the kernel give them back, `Persist` leaves them
//! taken, and any process waiting for them may then block forever. Undo
//! only covers units a process took; an increment is never rolled back.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use crate::config::{SemaphoreConfig, UndoPolicy};
use crate::errors::{SyncError, SyncResult};

/// Kernel-visible identity of a semaphore set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SemaphoreKey {
    /// A fresh set nobody else can resolve; shared by handing the handle
    /// to forked children.
    Private,

    Numeric(i32),

    /// A key derived from an existing file path and a project byte.
    Path { path: PathBuf, project: u8 },
}

impl SemaphoreKey {
    fn resolve(&self) -> SyncResult<libc::key_t> {
        match self {
            Self::Private => Ok(libc::IPC_PRIVATE),
            Self::Numeric(key) => Ok(*key),
            Self::Path { path, project } => {
                let raw_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
                    SyncError::NotFound(format!("semaphore path {}", path.display()))
                })?;
                let key = unsafe { libc::ftok(raw_path.as_ptr(), libc::c_int::from(*project)) };
                if key == -1 {
                    return Err(SyncError::NotFound(format!(
                        "semaphore path {}",
                        path.display()
                    )));
                }
                Ok(key)
            }
        }
    }
}

impl core::fmt::Display for SemaphoreKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Private => write!(f, "semaphore(private)"),
            Self::Numeric(key) => write!(f, "semaphore(key={key})"),
            Self::Path { path, project } => {
                write!(f, "semaphore(path={}, project={project})", path.display())
            }
        }
    }
}

/// Kernel identifier of an existing set, valid in every process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreId(libc::c_int);

impl SemaphoreId {
    #[must_use]
    pub fn as_raw(&self) -> i32 {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct CrossProcessSemaphore {
    id: SemaphoreId,
    count: usize,
    op_flags: libc::c_short,
}

fn op_flags(undo: UndoPolicy) -> libc::c_short {
    match undo {
        #[allow(clippy::cast_possible_truncation)]
        UndoPolicy::RollbackOnExit => libc::SEM_UNDO as libc::c_short,
        UndoPolicy::Persist => 0,
    }
}

fn os_error(context: impl core::fmt::Display) -> SyncError {
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ENOENT | libc::EIDRM | libc::EINVAL) => {
            SyncError::NotFound(context.to_string())
        }
        _ => SyncError::Os(err),
    }
}

impl CrossProcessSemaphore {
    /// Creates a set with one counter per entry of `initial_counts`.
    ///
    /// Non-private keys must not exist yet.
    ///
    /// # Errors
    ///
    /// - [`SyncError::InvalidIndex`] if `initial_counts` is empty.
    /// - [`SyncError::Os`] if the kernel refuses the set (for example
    ///   `EEXIST` for a key that is already in use).
    pub fn create(
        key: &SemaphoreKey,
        initial_counts: &[u16],
        config: &SemaphoreConfig,
    ) -> SyncResult<Self> {
        if initial_counts.is_empty() {
            return Err(SyncError::InvalidIndex { index: 0, count: 0 });
        }

        let raw_key = key.resolve()?;
        #[allow(clippy::cast_possible_wrap)]
        let mut flags = libc::IPC_CREAT | (config.permissions & 0o777) as libc::c_int;
        if raw_key != libc::IPC_PRIVATE {
            flags |= libc::IPC_EXCL;
        }

        let count = initial_counts.len();
        let nsems = libc::c_int::try_from(count).map_err(|_| SyncError::InvalidIndex {
            index: count,
            count,
        })?;

        let raw_id = unsafe { libc::semget(raw_key, nsems, flags) };
        if raw_id < 0 {
            let err = io::Error::last_os_error();
            tracing::error!("semget failed for {key}: {err}");
            return Err(SyncError::Os(err));
        }

        let semaphore = Self {
            id: SemaphoreId(raw_id),
            count,
            op_flags: op_flags(config.undo),
        };

        if let Err(err) = semaphore.configure(initial_counts) {
            let _ = semaphore.clone().remove();
            return Err(err);
        }

        if config.undo == UndoPolicy::Persist {
            tracing::warn!(
                "{key} created without undo; units held by a crashed process stay lost"
            );
        }
        tracing::debug!("created {key} as id {raw_id} with counts {initial_counts:?}");
        Ok(semaphore)
    }

    /// Resolves an existing set created by another process.
    ///
    /// # Errors
    ///
    /// [`SyncError::NotFound`] if no set exists under `key`.
    pub fn open(key: &SemaphoreKey, count: usize, undo: UndoPolicy) -> SyncResult<Self> {
        if *key == SemaphoreKey::Private {
            return Err(SyncError::NotFound(key.to_string()));
        }
        let raw_key = key.resolve()?;
        let nsems = libc::c_int::try_from(count).map_err(|_| SyncError::InvalidIndex {
            index: count,
            count,
        })?;

        let raw_id = unsafe { libc::semget(raw_key, nsems, 0) };
        if raw_id < 0 {
            return Err(os_error(key));
        }

        Ok(Self {
            id: SemaphoreId(raw_id),
            count,
            op_flags: op_flags(undo),
        })
    }

    /// Removes the set registered under `key`.
    ///
    /// # Errors
    ///
    /// [`SyncError::NotFound`] if no set exists under `key` (private keys
    /// are never resolvable).
    pub fn destroy(key: &SemaphoreKey) -> SyncResult<()> {
        if *key == SemaphoreKey::Private {
            return Err(SyncError::NotFound(key.to_string()));
        }
        let raw_key = key.resolve()?;
        let raw_id = unsafe { libc::semget(raw_key, 0, 0) };
        if raw_id < 0 {
            return Err(os_error(key));
        }
        Self::destroy_id(SemaphoreId(raw_id))
    }

    /// Removes the set with the given kernel id.
    ///
    /// # Errors
    ///
    /// [`SyncError::NotFound`] if the set no longer exists.
    pub fn destroy_id(id: SemaphoreId) -> SyncResult<()> {
        let rc = unsafe { libc::semctl(id.0, 0, libc::IPC_RMID) };
        if rc < 0 {
            return Err(os_error(format!("semaphore(id={})", id.0)));
        }
        tracing::debug!("removed semaphore id {}", id.0);
        Ok(())
    }

    /// Removes this set. Waiters in any process wake with an error.
    ///
    /// # Errors
    ///
    /// [`SyncError::NotFound`] if it was already removed.
    pub fn remove(self) -> SyncResult<()> {
        Self::destroy_id(self.id)
    }

    #[must_use]
    pub fn id(&self) -> SemaphoreId {
        self.id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Overwrites every counter.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidIndex`] if `values` does not have one entry per
    /// counter, [`SyncError::NotFound`] if the set was removed.
    pub fn configure(&self, values: &[u16]) -> SyncResult<()> {
        if values.len() != self.count {
            return Err(SyncError::InvalidIndex {
                index: values.len(),
                count: self.count,
            });
        }
        let mut values = values.to_vec();
        let rc = unsafe { libc::semctl(self.id.0, 0, libc::SETALL, values.as_mut_ptr()) };
        if rc < 0 {
            return Err(os_error(format!("semaphore(id={})", self.id.0)));
        }
        Ok(())
    }

    fn check_index(&self, index: usize) -> SyncResult<libc::c_ushort> {
        if index >= self.count {
            tracing::error!(
                "semaphore id {}: index {index} out of {}",
                self.id.0,
                self.count
            );
            return Err(SyncError::InvalidIndex {
                index,
                count: self.count,
            });
        }
        libc::c_ushort::try_from(index).map_err(|_| SyncError::InvalidIndex {
            index,
            count: self.count,
        })
    }

    /// Applies `delta` to counter `index`; returns `Ok(false)` only for a
    /// non-blocking operation that would have blocked.
    fn apply(
        &self,
        index: usize,
        delta: libc::c_short,
        extra_flags: libc::c_short,
    ) -> SyncResult<bool> {
        let sem_num = self.check_index(index)?;
        // Only units this process takes are recorded for undo. A posted unit
        // belongs to whoever decrements it, even after the poster exits.
        let undo = if delta < 0 { self.op_flags } else { 0 };
        let mut op = libc::sembuf {
            sem_num,
            sem_op: delta,
            sem_flg: undo | extra_flags,
        };

        loop {
            let rc = unsafe { libc::semop(self.id.0, &raw mut op, 1) };
            if rc == 0 {
                return Ok(true);
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EIDRM | libc::EINVAL) => {
                    return Err(SyncError::NotFound(format!("semaphore(id={})", self.id.0)))
                }
                _ => return Err(SyncError::Os(err)),
            }
        }
    }

    /// Blocks until counter `index` is positive, then takes one unit.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidIndex`] for an out-of-range index,
    /// [`SyncError::NotFound`] if the set is removed while waiting.
    pub fn decrement(&self, index: usize) -> SyncResult<()> {
        tracing::trace!("semaphore id {}: decrement {index}", self.id.0);
        self.apply(index, -1, 0).map(|_| ())
    }

    /// Takes one unit from counter `index` only if one is available.
    ///
    /// # Errors
    ///
    /// Same as [`Self::decrement`].
    pub fn try_decrement(&self, index: usize) -> SyncResult<bool> {
        #[allow(clippy::cast_possible_truncation)]
        let nowait = libc::IPC_NOWAIT as libc::c_short;
        self.apply(index, -1, nowait)
    }

    /// Adds one unit to counter `index`, waking at most one decrementer.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidIndex`] for an out-of-range index,
    /// [`SyncError::NotFound`] if the set was removed.
    pub fn increment(&self, index: usize) -> SyncResult<()> {
        tracing::trace!("semaphore id {}: increment {index}", self.id.0);
        self.apply(index, 1, 0).map(|_| ())
    }

    fn query(&self, index: usize, command: libc::c_int) -> SyncResult<u32> {
        let sem_num = libc::c_int::from(self.check_index(index)?);
        let rc = unsafe { libc::semctl(self.id.0, sem_num, command) };
        if rc < 0 {
            return Err(os_error(format!("semaphore(id={})", self.id.0)));
        }
        Ok(rc.unsigned_abs())
    }

    /// Current value of counter `index`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::increment`].
    pub fn value(&self, index: usize) -> SyncResult<u32> {
        self.query(index, libc::GETVAL)
    }

    /// Number of processes/threads blocked decrementing counter `index`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::increment`].
    pub fn waiters(&self, index: usize) -> SyncResult<u32> {
        self.query(index, libc::GETNCNT)
    }
}
