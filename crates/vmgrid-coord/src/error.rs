//! Coordination error types.

use thiserror::Error;

/// Errors raised by locks, queues, and caches.
///
/// Lock and queue errors must abort the operation they protect; none of
/// them are safe to ignore.
#[derive(Debug, Error)]
pub enum CoordError {
    #[error("cannot acquire lock {path}, timed out after {waited_secs:.02} seconds")]
    LockTimeout { path: String, waited_secs: f64 },

    #[error("the lock on {0} has expired")]
    LockExpired(String),

    #[error("cannot release lock {0}: it is no longer held by us")]
    LockRelease(String),

    #[error("no unused job name in queue {queue} after {attempts} attempts")]
    JobNameExhausted { queue: String, attempts: u32 },

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("workitem {jobname} is no longer waiting in queue {queue}")]
    WorkitemGone { queue: String, jobname: String },

    #[error("live queue {0} is closed")]
    QueueClosed(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("store error: {0}")]
    Store(#[from] vmgrid_store::StoreError),
}

pub type CoordResult<T> = Result<T, CoordError>;
