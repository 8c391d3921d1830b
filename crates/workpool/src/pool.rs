use crate::error::{PoolError, TryScheduleError, WorkError};
use crate::work::{Job, Unmarshal, WorkHandle, WorkItem};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Counters for pool activity.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Items accepted by `schedule`/`try_schedule`
    pub scheduled: AtomicU64,
    /// Items whose `unmarshal` returned `Ok`
    pub completed: AtomicU64,
    /// Items whose `unmarshal` returned `Err`
    pub failed: AtomicU64,
    /// Items whose `unmarshal` panicked
    pub panicked: AtomicU64,
}

// Statistical counters only; nothing synchronizes through them, so Relaxed.
impl PoolMetrics {
    pub fn scheduled(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }

    /// Items that have finished running, whatever their outcome.
    pub fn finished(&self) -> u64 {
        self.completed() + self.failed() + self.panicked()
    }

    fn record_scheduled(&self) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_panicked(&self) {
        self.panicked.fetch_add(1, Ordering::Relaxed);
    }
}

/// Fixed-size pool of worker threads draining a bounded work queue.
///
/// The queue capacity equals the worker count, so at most `2 * workers` items
/// are in the pool at once (one running per worker plus a full queue). Beyond
/// that, [`schedule`](Self::schedule) blocks the producer.
pub struct UnmarshalPool {
    sender: Option<Sender<Box<dyn Job>>>,
    workers: Vec<JoinHandle<()>>,
    worker_count: usize,
    metrics: Arc<PoolMetrics>,
}

impl UnmarshalPool {
    /// Starts `workers` threads, each looping over the shared queue until it
    /// is closed by [`stop`](Self::stop).
    pub fn start(workers: usize) -> Result<Self, PoolError> {
        if workers == 0 {
            return Err(PoolError::NoWorkers);
        }

        let (sender, receiver) = crossbeam_channel::bounded::<Box<dyn Job>>(workers);
        let metrics = Arc::new(PoolMetrics::default());
        let mut handles = Vec::with_capacity(workers);

        for id in 0..workers {
            let receiver = receiver.clone();
            let metrics = Arc::clone(&metrics);
            let spawned = thread::Builder::new()
                .name(format!("unmarshal-worker-{id}"))
                .spawn(move || worker_loop(id, &receiver, &metrics));

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Close the queue so the workers already running exit.
                    drop(sender);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(PoolError::Spawn(e));
                }
            }
        }

        tracing::debug!(workers, "unmarshal pool started");

        Ok(Self {
            sender: Some(sender),
            workers: handles,
            worker_count: workers,
            metrics,
        })
    }

    /// Starts one worker per available processor.
    pub fn with_available_parallelism() -> Result<Self, PoolError> {
        Self::start(available_parallelism())
    }

    /// Number of worker threads (and queue slots).
    pub fn workers(&self) -> usize {
        self.worker_count
    }

    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    /// Returns `true` once [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.sender.is_none()
    }

    /// Enqueues `work`, blocking while the queue is full.
    ///
    /// Returns immediately once the item is queued; wait on the returned
    /// handle for the outcome.
    pub fn schedule<U: Unmarshal>(&self, work: U) -> Result<WorkHandle<U::Error>, PoolError> {
        let sender = self.sender.as_ref().ok_or(PoolError::Stopped)?;
        let (item, handle) = WorkItem::new(work);
        sender
            .send(Box::new(item))
            .map_err(|_| PoolError::Stopped)?;
        self.metrics.record_scheduled();
        Ok(handle)
    }

    /// Enqueues `work` without blocking, handing it back if the queue is full.
    pub fn try_schedule<U: Unmarshal>(
        &self,
        work: U,
    ) -> Result<WorkHandle<U::Error>, TryScheduleError<U>> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(TryScheduleError::Stopped(work));
        };
        let (item, handle) = WorkItem::new(work);
        match sender.try_send(Box::new(item)) {
            Ok(()) => {
                self.metrics.record_scheduled();
                Ok(handle)
            }
            Err(TrySendError::Full(job)) => Err(TryScheduleError::Full(recover::<U>(job))),
            Err(TrySendError::Disconnected(job)) => {
                Err(TryScheduleError::Stopped(recover::<U>(job)))
            }
        }
    }

    /// Schedules `work` and blocks until it has run.
    pub fn execute<U: Unmarshal>(&self, work: U) -> Result<(), WorkError<U::Error>> {
        self.schedule(work)?.wait()
    }

    /// Closes the queue and joins every worker.
    ///
    /// Items already queued are still run before the workers exit. Calling
    /// `stop` more than once is a no-op.
    pub fn stop(&mut self) {
        if self.sender.take().is_none() {
            return;
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("unmarshal worker thread terminated abnormally");
            }
        }
        tracing::debug!(
            completed = self.metrics.completed(),
            failed = self.metrics.failed(),
            "unmarshal pool stopped"
        );
    }
}

impl Drop for UnmarshalPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(id: usize, receiver: &Receiver<Box<dyn Job>>, metrics: &PoolMetrics) {
    tracing::trace!(worker = id, "unmarshal worker running");
    // `iter` keeps yielding queued items after the sender is dropped and ends
    // once the queue is both closed and empty.
    for job in receiver.iter() {
        job.run(metrics);
    }
    tracing::trace!(worker = id, "unmarshal worker exiting");
}

fn recover<U: Unmarshal>(job: Box<dyn Job>) -> U {
    match job.into_any().downcast::<WorkItem<U>>() {
        Ok(item) => item.into_work(),
        Err(_) => unreachable!("job was created from WorkItem<U> in this call"),
    }
}

fn available_parallelism() -> usize {
    thread::available_parallelism().map_or(1, NonZeroUsize::get)
}
