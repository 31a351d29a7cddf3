//! Single-shot result channels.
//!
//! A [`ResultSender`] completes the channel exactly once with a value or a
//! failure; every [`ResultReceiver`] blocks until then and afterwards reads
//! the same stored outcome as often as it likes. Dropping the sender
//! without completing marks the channel abandoned so receivers never wait
//! forever on a producer that is gone.

use core::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::errors::{SyncError, SyncResult};

/// Why a receiver did not get a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError<E> {
    /// The producer failed; carries its original error untouched.
    Failed(E),

    /// The producer panicked; carries the panic message.
    Panicked(String),

    /// The producer went away without completing the channel.
    Abandoned,

    /// The outcome was already moved out with [`ResultReceiver::into_result`].
    Consumed,
}

impl<E> ChannelError<E> {
    /// Returns the producer's error, if that is what this is.
    pub fn into_failure(self) -> Option<E> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for ChannelError<E> {}

impl<E: fmt::Display> fmt::Display for ChannelError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(err) => write!(f, "ChannelError::Failed({err})"),
            Self::Panicked(message) => write!(f, "ChannelError::Panicked({message})"),
            Self::Abandoned => write!(f, "ChannelError::Abandoned"),
            Self::Consumed => write!(f, "ChannelError::Consumed"),
        }
    }
}

enum Slot<T, E> {
    Pending,
    Fulfilled(T),
    Failed(E),
    Panicked(String),
    Abandoned,
    Consumed,
}

impl<T, E> Slot<T, E> {
    fn is_pending(&self) -> bool {
        matches!(self, Slot::Pending)
    }

    fn observe(&self) -> Result<T, ChannelError<E>>
    where
        T: Clone,
        E: Clone,
    {
        match self {
            Slot::Fulfilled(value) => Ok(value.clone()),
            Slot::Failed(err) => Err(ChannelError::Failed(err.clone())),
            Slot::Panicked(message) => Err(ChannelError::Panicked(message.clone())),
            Slot::Abandoned | Slot::Pending => Err(ChannelError::Abandoned),
            Slot::Consumed => Err(ChannelError::Consumed),
        }
    }

    fn take(&mut self) -> Result<T, ChannelError<E>> {
        match core::mem::replace(self, Slot::Consumed) {
            Slot::Fulfilled(value) => Ok(value),
            Slot::Failed(err) => Err(ChannelError::Failed(err)),
            Slot::Panicked(message) => {
                *self = Slot::Panicked(message.clone());
                Err(ChannelError::Panicked(message))
            }
            Slot::Abandoned | Slot::Pending => {
                *self = Slot::Abandoned;
                Err(ChannelError::Abandoned)
            }
            Slot::Consumed => Err(ChannelError::Consumed),
        }
    }
}

struct Shared<T, E> {
    slot: Mutex<Slot<T, E>>,
    event: Condvar,
}

impl<T, E> Shared<T, E> {
    fn slot(&self) -> MutexGuard<'_, Slot<T, E>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_settled(&self) -> MutexGuard<'_, Slot<T, E>> {
        let mut slot = self.slot();
        while slot.is_pending() {
            slot = self
                .event
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
        slot
    }

    fn wait_settled_until(&self, deadline: Instant) -> Option<MutexGuard<'_, Slot<T, E>>> {
        let mut slot = self.slot();
        while slot.is_pending() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = self
                .event
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Some(slot)
    }

    fn settle(&self, next: Slot<T, E>) -> SyncResult<()> {
        let mut slot = self.slot();
        if !slot.is_pending() {
            tracing::debug!("ResultChannel: ignoring second completion");
            return Err(SyncError::AlreadyFulfilled);
        }
        *slot = next;
        drop(slot);
        self.event.notify_all();
        Ok(())
    }
}

/// Creates a connected sender/receiver pair.
#[must_use]
pub fn result_channel<T, E>() -> (ResultSender<T, E>, ResultReceiver<T, E>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot::Pending),
        event: Condvar::new(),
    });
    (
        ResultSender {
            shared: Arc::clone(&shared),
        },
        ResultReceiver { shared },
    )
}

/// Producer half of a result channel.
pub struct ResultSender<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> ResultSender<T, E> {
    /// Stores `value` as the outcome.
    ///
    /// # Errors
    ///
    /// [`SyncError::AlreadyFulfilled`] if the channel was already completed;
    /// the stored outcome is left as it was.
    pub fn fulfill(&self, value: T) -> SyncResult<()> {
        self.shared.settle(Slot::Fulfilled(value))
    }

    /// Stores `error` as the outcome.
    ///
    /// # Errors
    ///
    /// [`SyncError::AlreadyFulfilled`] if the channel was already completed.
    pub fn fail(&self, error: E) -> SyncResult<()> {
        self.shared.settle(Slot::Failed(error))
    }

    /// Stores either side of `outcome`.
    ///
    /// # Errors
    ///
    /// [`SyncError::AlreadyFulfilled`] if the channel was already completed.
    pub fn complete(&self, outcome: Result<T, E>) -> SyncResult<()> {
        match outcome {
            Ok(value) => self.fulfill(value),
            Err(err) => self.fail(err),
        }
    }

    pub(crate) fn panicked(&self, message: String) -> SyncResult<()> {
        self.shared.settle(Slot::Panicked(message))
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        !self.shared.slot().is_pending()
    }
}

impl<T, E> Drop for ResultSender<T, E> {
    fn drop(&mut self) {
        let mut slot = self.shared.slot();
        if slot.is_pending() {
            tracing::warn!("ResultChannel: sender dropped without completing");
            *slot = Slot::Abandoned;
            drop(slot);
            self.shared.event.notify_all();
        }
    }
}

impl<T, E> fmt::Debug for ResultSender<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSender")
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Consumer half of a result channel.
pub struct ResultReceiver<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T: Clone, E: Clone> Clone for ResultReceiver<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, E> ResultReceiver<T, E> {
    /// Blocks until the channel completes and returns a copy of the outcome.
    ///
    /// Repeated calls, from this or any cloned receiver, observe the same
    /// outcome.
    ///
    /// # Errors
    ///
    /// The producer's failure as [`ChannelError::Failed`], or why no outcome
    /// exists.
    pub fn await_result(&self) -> Result<T, ChannelError<E>>
    where
        T: Clone,
        E: Clone,
    {
        self.shared.wait_settled().observe()
    }

    /// Like [`Self::await_result`] but returns `None` after `timeout`.
    pub fn await_timeout(&self, timeout: Duration) -> Option<Result<T, ChannelError<E>>>
    where
        T: Clone,
        E: Clone,
    {
        self.shared
            .wait_settled_until(Instant::now() + timeout)
            .map(|slot| slot.observe())
    }

    /// Non-blocking read; `None` while the channel is pending.
    pub fn try_result(&self) -> Option<Result<T, ChannelError<E>>>
    where
        T: Clone,
        E: Clone,
    {
        let slot = self.shared.slot();
        if slot.is_pending() {
            return None;
        }
        Some(slot.observe())
    }

    /// Blocks until completion and moves the outcome out.
    ///
    /// Receivers cloned from this one see [`ChannelError::Consumed`]
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Same as [`Self::await_result`].
    pub fn into_result(self) -> Result<T, ChannelError<E>> {
        self.shared.wait_settled().take()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        !self.shared.slot().is_pending()
    }
}

impl<T, E> fmt::Debug for ResultReceiver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultReceiver")
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Report produced when at least one of several channels did not yield a
/// value. Lists every failure by position, plus the values that did arrive.
#[derive(Debug)]
pub struct AggregateFailure<T, E> {
    pub values: Vec<(usize, T)>,
    pub failures: Vec<(usize, ChannelError<E>)>,
}

impl<T, E> AggregateFailure<T, E> {
    /// The first failure in drain order.
    #[must_use]
    pub fn first(&self) -> Option<&(usize, ChannelError<E>)> {
        self.failures.first()
    }

    #[must_use]
    pub fn failed_indices(&self) -> Vec<usize> {
        self.failures.iter().map(|(index, _)| *index).collect()
    }
}

impl<T: fmt::Debug, E: fmt::Debug + fmt::Display> std::error::Error for AggregateFailure<T, E> {}

impl<T, E: fmt::Display> fmt::Display for AggregateFailure<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} worker(s) failed:", self.failures.len())?;
        for (index, err) in &self.failures {
            write!(f, " [{index}] {err};")?;
        }
        Ok(())
    }
}

/// Collects a sequence of outcomes, continuing past failures.
///
/// # Errors
///
/// An [`AggregateFailure`] naming every failed position if any outcome
/// was an error.
pub fn aggregate<T, E, I>(outcomes: I) -> Result<Vec<T>, AggregateFailure<T, E>>
where
    I: IntoIterator<Item = Result<T, ChannelError<E>>>,
{
    let mut values = Vec::new();
    let mut failures = Vec::new();

    for (index, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(value) => values.push((index, value)),
            Err(err) => {
                if failures.is_empty() {
                    tracing::error!("aggregate: first failure at position {index}");
                }
                failures.push((index, err));
            }
        }
    }

    if failures.is_empty() {
        Ok(values.into_iter().map(|(_, value)| value).collect())
    } else {
        Err(AggregateFailure { values, failures })
    }
}

/// Awaits every receiver in order and collects the values.
///
/// Every channel is drained even after a failure so no producer is left
/// blocked on an unread channel.
///
/// # Errors
///
/// See [`aggregate`].
pub fn drain_all<T, E, I>(receivers: I) -> Result<Vec<T>, AggregateFailure<T, E>>
where
    I: IntoIterator<Item = ResultReceiver<T, E>>,
{
    aggregate(receivers.into_iter().map(ResultReceiver::into_result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct RangeError(&'static str);

    impl fmt::Display for RangeError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "range error: {}", self.0)
        }
    }

    /// WHY: reads after fulfillment are replayable
    /// WHAT: three awaits return the value; a second fulfill is rejected
    #[test]
    fn test_await_is_idempotent_and_second_fulfill_rejected() {
        let (sender, receiver) = result_channel::<i32, RangeError>();
        sender.fulfill(7).unwrap();

        assert!(matches!(sender.fulfill(8), Err(SyncError::AlreadyFulfilled)));
        assert!(matches!(
            sender.fail(RangeError("late")),
            Err(SyncError::AlreadyFulfilled)
        ));

        for _ in 0..3 {
            assert_eq!(receiver.await_result(), Ok(7));
        }
        let other = receiver.clone();
        assert_eq!(other.await_result(), Ok(7));
    }

    /// WHY: failure information must survive the trip intact
    /// WHAT: the original error value comes back as ChannelError::Failed
    #[test]
    fn test_failure_is_propagated_verbatim() {
        let (sender, receiver) = result_channel::<i32, RangeError>();
        let producer = thread::spawn(move || {
            sender.complete(Err(RangeError("Won't happen."))).unwrap();
        });

        let outcome = receiver.await_result();
        producer.join().unwrap();
        assert_eq!(outcome, Err(ChannelError::Failed(RangeError("Won't happen."))));
        assert_eq!(
            outcome.unwrap_err().to_string(),
            "ChannelError::Failed(range error: Won't happen.)"
        );
    }

    /// WHY: awaiting must suspend until the producer completes
    /// WHAT: the receiver is pending until the producer thread fulfills
    #[test]
    fn test_await_blocks_until_fulfilled() {
        let (sender, receiver) = result_channel::<String, RangeError>();
        assert!(receiver.try_result().is_none());
        assert!(receiver.await_timeout(Duration::from_millis(10)).is_none());

        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sender.fulfill(String::from("done")).unwrap();
        });

        assert_eq!(receiver.await_result(), Ok(String::from("done")));
        producer.join().unwrap();
    }

    /// WHY: a vanished producer must not strand its consumer
    /// WHAT: dropping an uncompleted sender yields Abandoned
    #[test]
    fn test_dropped_sender_abandons() {
        let (sender, receiver) = result_channel::<i32, RangeError>();
        drop(sender);
        assert_eq!(receiver.await_result(), Err(ChannelError::Abandoned));
        assert_eq!(receiver.into_result(), Err(ChannelError::Abandoned));
    }

    #[test]
    fn test_into_result_moves_outcome_out() {
        let (sender, receiver) = result_channel::<Vec<u8>, RangeError>();
        let observer = receiver.clone();
        sender.fulfill(vec![1, 2, 3]).unwrap();

        assert_eq!(receiver.into_result(), Ok(vec![1, 2, 3]));
        assert_eq!(observer.await_result(), Err(ChannelError::Consumed));
    }

    /// WHY: every failed worker must be reported, not just the first
    /// WHAT: drain_all lists each failure and keeps successful values
    #[test]
    fn test_drain_all_aggregates_every_failure() {
        let mut receivers = vec![];
        for index in 0..5 {
            let (sender, receiver) = result_channel::<usize, RangeError>();
            if index % 2 == 1 {
                sender.fail(RangeError("odd")).unwrap();
            } else {
                sender.fulfill(index * 10).unwrap();
            }
            receivers.push(receiver);
        }

        let report = drain_all(receivers).unwrap_err();
        assert_eq!(report.failed_indices(), vec![1, 3]);
        assert_eq!(report.first().map(|(index, _)| *index), Some(1));
        assert_eq!(report.values, vec![(0, 0), (2, 20), (4, 40)]);
        assert!(report.to_string().starts_with("2 worker(s) failed:"));
    }

    #[test]
    fn test_drain_all_success_keeps_order() {
        let receivers: Vec<_> = (0..4)
            .map(|index| {
                let (sender, receiver) = result_channel::<usize, RangeError>();
                sender.fulfill(index).unwrap();
                receiver
            })
            .collect();
        assert_eq!(drain_all(receivers).unwrap(), vec![0, 1, 2, 3]);
    }
}
