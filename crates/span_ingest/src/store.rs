//! Storage seam for the span tables.
//!
//! [`SpanStore`] hands out worker-local [`RowBatch`] handles: rows are
//! appended in memory and written with one `send`. A failed send keeps the
//! rows buffered so it can be retried; `abort` discards them.
//!
//! [`MemoryStore`] keeps both tables in process. It backs the demo binary and
//! the tests, and can simulate an unprovisioned database, failing sends, and
//! failing appends.

use crate::schema::{MetaRow, SeriesRow, META_TABLE, SERIES_TABLE};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Errors returned by a [`SpanStore`] or its batches.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("table {0} does not exist")]
    TableNotFound(String),

    #[error("database {0} does not exist")]
    DatabaseNotFound(String),

    #[error("failed to append to {table}: {reason}")]
    Append { table: &'static str, reason: String },

    #[error("failed to send batch to {table}: {reason}")]
    Send { table: &'static str, reason: String },

    /// The batch was already sent or aborted.
    #[error("batch for {0} is closed")]
    BatchClosed(&'static str),

    #[error("query failed: {0}")]
    Query(String),
}

impl StoreError {
    /// Returns `true` for errors expected while the cluster is still being
    /// provisioned.
    pub fn is_not_provisioned(&self) -> bool {
        matches!(self, Self::TableNotFound(_) | Self::DatabaseNotFound(_))
    }
}

/// Worker-local batch of rows bound for one table.
#[async_trait]
pub trait RowBatch<R: Send>: Send {
    /// Target table, for logs and errors.
    fn table(&self) -> &'static str;

    fn append(&mut self, row: R) -> Result<(), StoreError>;

    /// Rows buffered and not yet sent.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards buffered rows and closes the batch.
    fn abort(&mut self);

    /// Writes buffered rows. On error the rows stay buffered and the send may
    /// be retried.
    async fn send(&mut self) -> Result<(), StoreError>;
}

pub type MetaBatch = Box<dyn RowBatch<MetaRow>>;
pub type SeriesBatch = Box<dyn RowBatch<SeriesRow>>;

/// Backing columnar store for spans.
#[async_trait]
pub trait SpanStore: Send + Sync + 'static {
    async fn prepare_meta_batch(&self) -> Result<MetaBatch, StoreError>;

    async fn prepare_series_batch(&self) -> Result<SeriesBatch, StoreError>;

    /// Distinct series ids with meta rows created at or after `since_ns`.
    async fn recent_series_ids(&self, since_ns: i64) -> Result<Vec<u64>, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    meta: Vec<MetaRow>,
    series: Vec<SeriesRow>,
    unprovisioned: bool,
    failing_sends: u32,
    meta_append_limit: Option<usize>,
    series_append_limit: Option<usize>,
    send_delay: Duration,
    inflight_sends: usize,
    peak_inflight_sends: usize,
    sends: u64,
    queries: u64,
}

/// Rows the in-memory store knows how to hold.
trait MemoryRow: Send + Sized + 'static {
    const TABLE: &'static str;

    fn append_limit(tables: &Tables) -> Option<usize>;

    fn commit(tables: &mut Tables, rows: Vec<Self>);
}

impl MemoryRow for MetaRow {
    const TABLE: &'static str = META_TABLE;

    fn append_limit(tables: &Tables) -> Option<usize> {
        tables.meta_append_limit
    }

    fn commit(tables: &mut Tables, rows: Vec<Self>) {
        tables.meta.extend(rows);
    }
}

impl MemoryRow for SeriesRow {
    const TABLE: &'static str = SERIES_TABLE;

    fn append_limit(tables: &Tables) -> Option<usize> {
        tables.series_append_limit
    }

    fn commit(tables: &mut Tables, rows: Vec<Self>) {
        tables.series.extend(rows);
    }
}

/// In-process [`SpanStore`]. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every table-touching call fail with
    /// [`StoreError::TableNotFound`] until provisioned again.
    pub fn set_provisioned(&self, provisioned: bool) {
        self.lock().unprovisioned = !provisioned;
    }

    /// Fails the next `count` sends, whatever their table.
    pub fn fail_next_sends(&self, count: u32) {
        self.lock().failing_sends = count;
    }

    /// Rejects appends to a meta batch once it holds `limit` rows.
    pub fn limit_meta_appends(&self, limit: Option<usize>) {
        self.lock().meta_append_limit = limit;
    }

    /// Rejects appends to a series batch once it holds `limit` rows.
    pub fn limit_series_appends(&self, limit: Option<usize>) {
        self.lock().series_append_limit = limit;
    }

    /// Delays every send, keeping it in flight for `delay`.
    pub fn set_send_delay(&self, delay: Duration) {
        self.lock().send_delay = delay;
    }

    /// Inserts meta rows directly, bypassing batches.
    pub fn seed_meta(&self, rows: impl IntoIterator<Item = MetaRow>) {
        self.lock().meta.extend(rows);
    }

    pub fn meta_rows(&self) -> Vec<MetaRow> {
        self.lock().meta.clone()
    }

    pub fn series_rows(&self) -> Vec<SeriesRow> {
        self.lock().series.clone()
    }

    /// Successful and failed send attempts so far.
    pub fn sends(&self) -> u64 {
        self.lock().sends
    }

    /// Calls to [`SpanStore::recent_series_ids`] so far.
    pub fn queries(&self) -> u64 {
        self.lock().queries
    }

    /// Highest number of sends observed in flight at once.
    pub fn peak_inflight_sends(&self) -> usize {
        self.lock().peak_inflight_sends
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        lock_tables(&self.tables)
    }

    fn check_provisioned(&self, table: &str) -> Result<(), StoreError> {
        if self.lock().unprovisioned {
            return Err(StoreError::TableNotFound(table.to_string()));
        }
        Ok(())
    }

    fn batch<R: MemoryRow>(&self) -> Result<Box<dyn RowBatch<R>>, StoreError> {
        self.check_provisioned(R::TABLE)?;
        Ok(Box::new(MemoryBatch {
            rows: Vec::new(),
            closed: false,
            tables: Arc::clone(&self.tables),
        }))
    }
}

fn lock_tables(tables: &Mutex<Tables>) -> MutexGuard<'_, Tables> {
    // Every critical section leaves the tables consistent.
    tables.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl SpanStore for MemoryStore {
    async fn prepare_meta_batch(&self) -> Result<MetaBatch, StoreError> {
        self.batch::<MetaRow>()
    }

    async fn prepare_series_batch(&self) -> Result<SeriesBatch, StoreError> {
        self.batch::<SeriesRow>()
    }

    async fn recent_series_ids(&self, since_ns: i64) -> Result<Vec<u64>, StoreError> {
        let mut tables = self.lock();
        tables.queries += 1;
        if tables.unprovisioned {
            return Err(StoreError::TableNotFound(META_TABLE.to_string()));
        }
        let ids: BTreeSet<u64> = tables
            .meta
            .iter()
            .filter(|row| row.create_at >= since_ns)
            .map(|row| row.series_id)
            .collect();
        Ok(ids.into_iter().collect())
    }
}

struct MemoryBatch<R> {
    rows: Vec<R>,
    closed: bool,
    tables: Arc<Mutex<Tables>>,
}

impl<R: MemoryRow> MemoryBatch<R> {
    fn begin_send(&self) -> Duration {
        let mut tables = lock_tables(&self.tables);
        tables.sends += 1;
        tables.inflight_sends += 1;
        tables.peak_inflight_sends = tables.peak_inflight_sends.max(tables.inflight_sends);
        tables.send_delay
    }

    fn finish_send(&mut self) -> Result<(), StoreError> {
        let mut tables = lock_tables(&self.tables);
        tables.inflight_sends -= 1;
        if tables.unprovisioned {
            return Err(StoreError::TableNotFound(R::TABLE.to_string()));
        }
        if tables.failing_sends > 0 {
            tables.failing_sends -= 1;
            return Err(StoreError::Send {
                table: R::TABLE,
                reason: "injected failure".to_string(),
            });
        }
        R::commit(&mut tables, std::mem::take(&mut self.rows));
        self.closed = true;
        Ok(())
    }
}

#[async_trait]
impl<R: MemoryRow> RowBatch<R> for MemoryBatch<R> {
    fn table(&self) -> &'static str {
        R::TABLE
    }

    fn append(&mut self, row: R) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::BatchClosed(R::TABLE));
        }
        let limit = R::append_limit(&lock_tables(&self.tables));
        if limit.is_some_and(|limit| self.rows.len() >= limit) {
            return Err(StoreError::Append {
                table: R::TABLE,
                reason: "batch row limit reached".to_string(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn abort(&mut self) {
        self.rows.clear();
        self.closed = true;
    }

    async fn send(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::BatchClosed(R::TABLE));
        }
        let delay = self.begin_send();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.finish_send()
    }
}
