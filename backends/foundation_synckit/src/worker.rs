//! Typed worker threads (and, on Linux, forked worker processes).
//!
//! A worker body receives a [`WorkerContext`] and its input, and returns
//! `Result<O, E>`. The outcome travels back through a result channel, so a
//! failing or panicking worker is reported to whoever joins it instead of
//! being lost. Each [`WorkerHandle`] is joined or detached exactly once:
//! explicitly through [`WorkerHandle::join`] / [`WorkerHandle::detach`], or
//! by being joined when dropped.

use core::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::cancel::CancelToken;
use crate::channel::{aggregate, result_channel, AggregateFailure, ChannelError, ResultReceiver};
use crate::config::WorkerConfig;
use crate::errors::{SyncError, SyncResult};

/// What a running worker knows about itself.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    index: usize,
    name: String,
    cancel: CancelToken,
}

impl WorkerContext {
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Token the spawning side cancels through [`WorkerHandle::cancel`].
    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

/// Thread attributes for a worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerBuilder {
    name: Option<String>,
    stack_size: Option<usize>,
    index: usize,
}

impl WorkerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder for the `index`-th worker described by `config`.
    #[must_use]
    pub fn from_config(config: &WorkerConfig, index: usize) -> Self {
        Self {
            name: Some(format!("{}-{index}", config.name_prefix)),
            stack_size: config.stack_size,
            index,
        }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    #[must_use]
    pub fn index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    /// Starts `body(ctx, input)` on a new thread.
    ///
    /// # Errors
    ///
    /// [`SyncError::SpawnFailed`] if the OS refused to create the thread.
    pub fn spawn<I, O, E, F>(self, input: I, body: F) -> SyncResult<WorkerHandle<O, E>>
    where
        I: Send + 'static,
        O: Send + 'static,
        E: Send + 'static,
        F: FnOnce(&WorkerContext, I) -> Result<O, E> + Send + 'static,
    {
        let name = self
            .name
            .unwrap_or_else(|| format!("synckit-worker-{}", self.index));

        let mut builder = thread::Builder::new().name(name.clone());
        if let Some(stack_size) = self.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let cancel = CancelToken::new();
        let context = WorkerContext {
            index: self.index,
            name: name.clone(),
            cancel: cancel.clone(),
        };
        let (sender, receiver) = result_channel();

        let handle = builder
            .spawn(move || {
                let span = tracing::trace_span!("worker", index = context.index, name = %context.name);
                let _enter = span.enter();
                tracing::debug!("worker started");

                match panic::catch_unwind(AssertUnwindSafe(|| body(&context, input))) {
                    Ok(outcome) => {
                        if outcome.is_err() {
                            tracing::debug!("worker finished with a failure");
                        }
                        if sender.complete(outcome).is_err() {
                            tracing::error!("worker outcome was already reported");
                        }
                    }
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        tracing::error!("worker panicked: {message}");
                        let _ = sender.panicked(message);
                    }
                }
            })
            .map_err(SyncError::SpawnFailed)?;

        Ok(WorkerHandle {
            index: self.index,
            name,
            thread: ThreadSlot(Some(handle)),
            receiver,
            cancel,
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("<non-string panic payload>")
    }
}

/// Joins the thread when dropped unless it was already joined or detached.
struct ThreadSlot(Option<JoinHandle<()>>);

impl ThreadSlot {
    fn join(&mut self) {
        if let Some(handle) = self.0.take() {
            // The worker body runs under catch_unwind, so the thread itself
            // only fails if reporting the outcome panicked.
            if handle.join().is_err() {
                tracing::error!("worker thread terminated abnormally");
            }
        }
    }

    fn detach(&mut self) {
        self.0.take();
    }
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        self.join();
    }
}

/// Owned handle to a spawned worker.
pub struct WorkerHandle<O, E> {
    index: usize,
    name: String,
    thread: ThreadSlot,
    receiver: ResultReceiver<O, E>,
    cancel: CancelToken,
}

impl<O, E> WorkerHandle<O, E> {
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests cooperative cancellation of the worker.
    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.0.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// The worker's result channel, for polling without joining.
    #[must_use]
    pub fn receiver(&self) -> &ResultReceiver<O, E> {
        &self.receiver
    }

    /// Waits for the worker to terminate and returns its outcome.
    ///
    /// # Errors
    ///
    /// The worker's own failure as [`ChannelError::Failed`], or
    /// [`ChannelError::Panicked`] if its body panicked.
    pub fn join(self) -> Result<O, ChannelError<E>> {
        let WorkerHandle {
            mut thread,
            receiver,
            ..
        } = self;
        thread.join();
        receiver.into_result()
    }

    /// Lets the worker run on unattended; its outcome can still be read
    /// from the returned receiver.
    pub fn detach(self) -> ResultReceiver<O, E> {
        let WorkerHandle {
            mut thread,
            receiver,
            name,
            ..
        } = self;
        tracing::debug!("detaching worker {name}");
        thread.detach();
        receiver
    }
}

impl<O, E> core::fmt::Debug for WorkerHandle<O, E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Spawns one worker per input, all running the same body.
///
/// Worker `i` gets index `i` and is named after `config.name_prefix`.
///
/// # Errors
///
/// [`SyncError::SpawnFailed`] if any thread cannot be created; workers
/// started before the failure are joined when their handles drop.
pub fn spawn_all<I, O, E, F, It>(
    config: &WorkerConfig,
    inputs: It,
    body: F,
) -> SyncResult<Vec<WorkerHandle<O, E>>>
where
    It: IntoIterator<Item = I>,
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
    F: Fn(&WorkerContext, I) -> Result<O, E> + Send + Sync + 'static,
{
    let body = Arc::new(body);
    inputs
        .into_iter()
        .enumerate()
        .map(|(index, input)| {
            let body = Arc::clone(&body);
            WorkerBuilder::from_config(config, index).spawn(input, move |ctx, input| body(ctx, input))
        })
        .collect()
}

/// Joins every handle in order and collects their values.
///
/// # Errors
///
/// An [`AggregateFailure`] naming every worker that failed; all workers
/// are joined regardless.
pub fn join_all<O, E>(handles: Vec<WorkerHandle<O, E>>) -> Result<Vec<O>, AggregateFailure<O, E>> {
    aggregate(handles.into_iter().map(WorkerHandle::join))
}

#[cfg(target_os = "linux")]
pub use process::{fork_process, ProcessExit, ProcessHandle};

#[cfg(target_os = "linux")]
mod process {
    use std::io;
    use std::panic::{self, AssertUnwindSafe};

    use crate::errors::{SyncError, SyncResult};

    /// How a forked worker process ended.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ProcessExit {
        Exited(i32),
        Signaled(i32),
    }

    impl ProcessExit {
        #[must_use]
        pub fn success(&self) -> bool {
            matches!(self, ProcessExit::Exited(0))
        }
    }

    /// Handle to a forked child. Reaped synchronously through [`Self::wait`],
    /// or on drop if nobody waited.
    #[derive(Debug)]
    pub struct ProcessHandle {
        pid: libc::pid_t,
        exit: Option<ProcessExit>,
    }

    /// Forks the current process and runs `child` in the new one.
    ///
    /// The child exits with the code `child` returns (101 if it panics)
    /// without running the parent's destructors or exit handlers.
    ///
    /// # Safety
    ///
    /// Only the calling thread survives in the child. If any other thread
    /// held a lock (including the allocator's) at the time of the fork, the
    /// child can deadlock touching it. `child` should restrict itself to
    /// simple system calls on state prepared before the fork.
    ///
    /// # Errors
    ///
    /// [`SyncError::SpawnFailed`] if `fork` fails.
    pub unsafe fn fork_process<F>(child: F) -> SyncResult<ProcessHandle>
    where
        F: FnOnce() -> i32,
    {
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(SyncError::SpawnFailed(io::Error::last_os_error())),
            0 => {
                let code = panic::catch_unwind(AssertUnwindSafe(child)).unwrap_or(101);
                unsafe { libc::_exit(code) }
            }
            pid => {
                tracing::debug!("forked worker process {pid}");
                Ok(ProcessHandle { pid, exit: None })
            }
        }
    }

    impl ProcessHandle {
        #[must_use]
        pub fn pid(&self) -> i32 {
            self.pid
        }

        /// Blocks until the child exits and reports how.
        ///
        /// # Errors
        ///
        /// [`SyncError::Os`] if `waitpid` fails for a reason other than
        /// an interrupted call.
        pub fn wait(&mut self) -> SyncResult<ProcessExit> {
            if let Some(exit) = self.exit {
                return Ok(exit);
            }

            let mut status: libc::c_int = 0;
            loop {
                let rc = unsafe { libc::waitpid(self.pid, &raw mut status, 0) };
                if rc == self.pid {
                    break;
                }
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(SyncError::Os(err));
                }
            }

            let exit = if libc::WIFEXITED(status) {
                ProcessExit::Exited(libc::WEXITSTATUS(status))
            } else {
                ProcessExit::Signaled(libc::WTERMSIG(status))
            };
            tracing::debug!("reaped worker process {}: {exit:?}", self.pid);
            self.exit = Some(exit);
            Ok(exit)
        }
    }

    impl Drop for ProcessHandle {
        fn drop(&mut self) {
            if self.exit.is_none() {
                if let Err(err) = self.wait() {
                    tracing::error!("failed to reap worker process {}: {err}", self.pid);
                }
            }
        }
    }
}
