use derive_more::From;

use std::io;

use crate::config::ConfigError;
use crate::mutex::LockId;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// `SyncError` covers misuse of the primitives and OS-level failures.
///
/// Worker business failures never show up here, they travel through
/// a result channel as [`crate::channel::ChannelError`].
#[derive(From, Debug)]
pub enum SyncError {
    /// release was called by a worker that does not hold the lock.
    #[from(ignore)]
    NotOwner { lock: LockId },

    /// the calling worker already holds the lock it is asking for.
    #[from(ignore)]
    Reentrant { lock: LockId },

    /// the hold belongs to a live scoped guard, which alone may end it.
    #[from(ignore)]
    GuardOutstanding { lock: LockId },

    /// applying an amount would overflow the protected value.
    #[from(ignore)]
    Overflow { amount: i64 },

    /// acquisition was cancelled before it completed.
    Aborted,

    /// the semaphore identity or key no longer exists.
    #[from(ignore)]
    NotFound(String),

    /// the result channel already carries an outcome.
    AlreadyFulfilled,

    #[from(ignore)]
    InvalidIndex { index: usize, count: usize },

    #[from(ignore)]
    SpawnFailed(io::Error),

    #[from(ignore)]
    Os(io::Error),

    Config(ConfigError),
}

impl SyncError {
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self, SyncError::Aborted)
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }
}

impl From<io::Error> for SyncError {
    fn from(value: io::Error) -> Self {
        Self::Os(value)
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SpawnFailed(err) | Self::Os(err) => Some(err),
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl core::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotOwner { lock } => write!(f, "SyncError::NotOwner({lock})"),
            Self::Reentrant { lock } => write!(f, "SyncError::Reentrant({lock})"),
            Self::GuardOutstanding { lock } => write!(f, "SyncError::GuardOutstanding({lock})"),
            Self::Overflow { amount } => write!(f, "SyncError::Overflow({amount})"),
            Self::NotFound(identity) => write!(f, "SyncError::NotFound({identity})"),
            Self::InvalidIndex { index, count } => {
                write!(f, "SyncError::InvalidIndex({index} of {count})")
            }
            Self::SpawnFailed(err) => write!(f, "SyncError::SpawnFailed({err})"),
            Self::Os(err) => write!(f, "SyncError::Os({err})"),
            Self::Config(err) => write!(f, "SyncError::Config({err})"),
            _ => write!(f, "{self:?}"),
        }
    }
}
