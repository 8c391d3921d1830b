//! Error types for pool lifecycle and work execution.

use std::fmt;
use thiserror::Error;

/// Errors raised by the pool itself (never by the work it runs).
#[derive(Debug, Error)]
pub enum PoolError {
    /// A pool needs at least one worker thread.
    #[error("pool must have at least one worker")]
    NoWorkers,

    /// The OS refused to spawn a worker thread.
    #[error("failed to spawn unmarshal worker: {0}")]
    Spawn(#[source] std::io::Error),

    /// The pool has been stopped and accepts no more work.
    #[error("pool has been stopped")]
    Stopped,
}

/// Outcome of a scheduled item that did not finish cleanly.
#[derive(Debug, Error)]
pub enum WorkError<E> {
    /// The item's `unmarshal` returned an error.
    #[error(transparent)]
    Failed(E),

    /// The item's `unmarshal` panicked; the worker survived.
    #[error("unmarshal work panicked: {0}")]
    Panicked(String),

    /// The item was dropped without running.
    #[error("work item dropped before it ran")]
    Dropped,

    /// The item could not be scheduled.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl<E> WorkError<E> {
    /// Returns the error produced by the work item, if that is what failed.
    pub fn into_failure(self) -> Option<E> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Error from [`UnmarshalPool::try_schedule`](crate::UnmarshalPool::try_schedule).
///
/// Both variants hand the unscheduled work back to the caller.
#[derive(Error)]
pub enum TryScheduleError<U> {
    /// Every worker is busy and the queue is full.
    #[error("unmarshal queue is full")]
    Full(U),

    /// The pool has been stopped.
    #[error("pool has been stopped")]
    Stopped(U),
}

impl<U> TryScheduleError<U> {
    /// Recovers the work item that was not scheduled.
    pub fn into_inner(self) -> U {
        match self {
            Self::Full(work) | Self::Stopped(work) => work,
        }
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

impl<U> fmt::Debug for TryScheduleError<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Stopped(_) => f.write_str("Stopped(..)"),
        }
    }
}
