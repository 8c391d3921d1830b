//! Work items and their completion handles.

use crate::error::WorkError;
use crate::pool::PoolMetrics;
use crossbeam_utils::sync::WaitGroup;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

/// A unit of decode work runnable on an [`UnmarshalPool`](crate::UnmarshalPool).
///
/// Implementors bundle their raw input and whatever callback receives the
/// decoded record. The pool only ever calls `unmarshal` once per scheduled
/// item, on one of its worker threads.
pub trait Unmarshal: Send + 'static {
    /// Error recorded on the item when decoding or delivery fails.
    type Error: std::error::Error + Send + 'static;

    /// Decodes the item's input and delivers the result.
    fn unmarshal(&mut self) -> Result<(), Self::Error>;
}

type Slot<E> = Arc<Mutex<Option<Result<(), WorkError<E>>>>>;

/// Type-erased job as stored in the pool queue.
pub(crate) trait Job: Send {
    fn run(self: Box<Self>, metrics: &PoolMetrics);

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// A scheduled item: the work, its error slot and its completion signal.
pub(crate) struct WorkItem<U: Unmarshal> {
    work: U,
    slot: Slot<U::Error>,
    done: WaitGroup,
}

impl<U: Unmarshal> WorkItem<U> {
    /// Wraps `work` and returns the item together with the caller's handle.
    ///
    /// The wait group starts with two members (item and handle); the handle
    /// waits for the item's member to drop, which happens once `run` has
    /// stored the outcome.
    pub(crate) fn new(work: U) -> (Self, WorkHandle<U::Error>) {
        let slot: Slot<U::Error> = Arc::new(Mutex::new(None));
        let done = WaitGroup::new();
        let item = Self {
            work,
            slot: Arc::clone(&slot),
            done: done.clone(),
        };
        (item, WorkHandle { slot, done })
    }

    pub(crate) fn into_work(self) -> U {
        self.work
    }
}

impl<U: Unmarshal> Job for WorkItem<U> {
    fn run(self: Box<Self>, metrics: &PoolMetrics) {
        let WorkItem {
            mut work,
            slot,
            done,
        } = *self;

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| work.unmarshal())) {
            Ok(Ok(())) => {
                metrics.record_completed();
                Ok(())
            }
            Ok(Err(e)) => {
                metrics.record_failed();
                Err(WorkError::Failed(e))
            }
            Err(payload) => {
                metrics.record_panicked();
                let message = panic_message(payload.as_ref());
                tracing::warn!(panic = %message, "unmarshal work panicked");
                Err(WorkError::Panicked(message))
            }
        };

        // The input is released before the waiter wakes.
        drop(work);
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        drop(done);
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Completion handle for one scheduled item.
///
/// Dropping the handle does not cancel the work; it only discards the outcome.
#[must_use = "dropping a WorkHandle discards the decode outcome"]
pub struct WorkHandle<E> {
    slot: Slot<E>,
    done: WaitGroup,
}

impl<E> WorkHandle<E> {
    /// Blocks until the item has run and returns its outcome.
    pub fn wait(self) -> Result<(), WorkError<E>> {
        let WorkHandle { slot, done } = self;
        done.wait();
        let outcome = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        outcome.unwrap_or(Err(WorkError::Dropped))
    }

    /// Returns `true` once the item has run (successfully or not).
    pub fn is_finished(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl<E> fmt::Debug for WorkHandle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkHandle")
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}
