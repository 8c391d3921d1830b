//! Bounded Unmarshal Work Pool
//!
//! A fixed set of OS threads draining a bounded queue of decode work items.
//! Decoding wire payloads is CPU-bound; this crate turns a bursty producer into
//! bounded concurrency by making [`UnmarshalPool::schedule`] block whenever
//! every worker is busy and the queue (capacity = worker count) is full.
//!
//! # Call Pattern
//!
//! Each scheduled item carries its own single-count completion signal. The
//! producer that needs the outcome blocks on the returned [`WorkHandle`], so the
//! call site stays sequential while the decode itself runs on a pool thread:
//!
//! ```rust,ignore
//! use workpool::{Unmarshal, UnmarshalPool};
//!
//! let pool = UnmarshalPool::with_available_parallelism()?;
//! let handle = pool.schedule(my_work)?;   // blocks only under backpressure
//! handle.wait()?;                          // blocks until this item finished
//! ```
//!
//! Pools are plain values with an explicit `start`/`stop` lifecycle, so any
//! number of isolated pools can coexist in one process.

mod error;
mod pool;
mod work;

pub use error::{PoolError, TryScheduleError, WorkError};
pub use pool::{PoolMetrics, UnmarshalPool};
pub use work::{Unmarshal, WorkHandle};
