//! Synchronization primitives for coordinating worker threads and processes
//! around shared state.
//!
//! - [`mutex::ExclusiveLock`]: owner-tracking FIFO lock with scoped guards.
//! - [`dual::acquire_both`] / [`dual::transfer`]: deadlock-free acquisition
//!   of two locks by ascending [`LockId`], cancellable while waiting.
//! - [`rendezvous::Rendezvous`]: one-shot gate releasing every waiter.
//! - [`semaphore::CrossProcessSemaphore`] (Linux): counting semaphore shared
//!   with other processes.
//! - [`channel::result_channel`]: single-shot value-or-failure transport.
//! - [`worker::WorkerBuilder`]: typed worker spawn/join over result channels.
//! - [`local::WorkerKey`]: per-worker slots with exactly-once cleanup.
//!
//! # Examples
//!
//! ```rust
//! use foundation_synckit::{transfer, Account, CancelToken};
//! use std::sync::Arc;
//! use std::thread;
//!
//! let a = Arc::new(Account::new(100));
//! let b = Arc::new(Account::new(200));
//!
//! let worker = {
//!     let (a, b) = (Arc::clone(&a), Arc::clone(&b));
//!     thread::spawn(move || transfer(&b, &a, 50, &CancelToken::new()))
//! };
//! transfer(&a, &b, 10, &CancelToken::new()).unwrap();
//! worker.join().unwrap().unwrap();
//!
//! assert_eq!(a.balance().unwrap() + b.balance().unwrap(), 300);
//! ```

#![allow(clippy::module_name_repetitions)]

pub mod cancel;
pub mod channel;
pub mod config;
pub mod counter;
pub mod dual;
pub mod errors;
pub mod local;
pub mod mutex;
pub mod rendezvous;
#[cfg(target_os = "linux")]
pub mod semaphore;
pub mod worker;

pub use cancel::{CancelToken, DeferCancel};
pub use channel::{
    drain_all, result_channel, AggregateFailure, ChannelError, ResultReceiver, ResultSender,
};
pub use config::{
    ConfigError, DualLockConfig, SemaphoreConfig, SyncConfig, UndoPolicy, WorkerConfig,
};
pub use counter::{AtomicCounter, LossyCounter};
pub use dual::{acquire_both, transfer, Account, DualGuard};
pub use errors::{SyncError, SyncResult};
pub use local::WorkerKey;
pub use mutex::{ExclusiveGuard, ExclusiveLock, LockId};
pub use rendezvous::{GateState, Rendezvous};
#[cfg(target_os = "linux")]
pub use semaphore::{CrossProcessSemaphore, SemaphoreId, SemaphoreKey};
pub use worker::{join_all, spawn_all, WorkerBuilder, WorkerContext, WorkerHandle};
#[cfg(target_os = "linux")]
pub use worker::{fork_process, ProcessExit, ProcessHandle};
