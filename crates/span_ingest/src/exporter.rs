//! Columnar span exporter.
//!
//! Spans arrive in slices through [`ColumnarSpanExporter::write_batch`] and are
//! fanned out over a fixed set of writer tasks. Each writer turns one slice
//! into a meta batch and a series batch ([`SpanEnricher`]) and hands both to
//! a background send with bounded concurrency and exponential backoff.
//!
//! # Delivery
//!
//! Writes are best effort. A batch that still fails after the configured
//! retries is logged and dropped. An append failure aborts that table's batch
//! for the whole slice, losing the rows already appended to it.
//!
//! # Shutdown
//!
//! Cancellation is checked once before each send starts. A send already in
//! its retry loop keeps retrying until it succeeds or runs out of attempts,
//! so [`shutdown`](ColumnarSpanExporter::shutdown) can take up to the full
//! backoff schedule to return.

use crate::config::ExporterConfig;
use crate::enrich::{EnrichError, EnrichOutcome, SpanEnricher};
use crate::model::Span;
use crate::retry::RetryConfig;
use crate::schema::{MetaRow, SeriesRow};
use crate::series::SeriesIdCache;
use crate::store::{RowBatch, SpanStore, StoreError};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Error)]
pub enum ExportError {
    /// The exporter has been shut down and accepts no more spans.
    #[error("span exporter is closed")]
    Closed,

    /// Startup was cancelled while waiting for the tables to appear.
    #[error("span exporter startup cancelled")]
    Cancelled,

    /// Loading recent series ids failed with a non-retryable error.
    #[error("failed to load recent series ids: {0}")]
    WarmLoad(#[source] StoreError),
}

/// Exporter counters.
#[derive(Debug, Default)]
pub struct ExportMetrics {
    pub spans_received: AtomicU64,
    pub meta_rows: AtomicU64,
    pub series_rows: AtomicU64,
    pub batches_sent: AtomicU64,
    pub send_retries: AtomicU64,
    /// Batches lost to exhausted retries, cancellation, or failed preparation
    pub batches_dropped: AtomicU64,
    pub append_failures: AtomicU64,
    pub inflight_sends: AtomicUsize,
}

impl ExportMetrics {
    pub fn spans_received(&self) -> u64 {
        self.spans_received.load(Ordering::Relaxed)
    }

    pub fn meta_rows(&self) -> u64 {
        self.meta_rows.load(Ordering::Relaxed)
    }

    pub fn series_rows(&self) -> u64 {
        self.series_rows.load(Ordering::Relaxed)
    }

    pub fn batches_sent(&self) -> u64 {
        self.batches_sent.load(Ordering::Relaxed)
    }

    pub fn send_retries(&self) -> u64 {
        self.send_retries.load(Ordering::Relaxed)
    }

    pub fn batches_dropped(&self) -> u64 {
        self.batches_dropped.load(Ordering::Relaxed)
    }

    pub fn append_failures(&self) -> u64 {
        self.append_failures.load(Ordering::Relaxed)
    }

    pub fn inflight_sends(&self) -> usize {
        self.inflight_sends.load(Ordering::Relaxed)
    }

    fn record_enriched(&self, outcome: EnrichOutcome) {
        self.meta_rows
            .fetch_add(outcome.meta_rows as u64, Ordering::Relaxed);
        self.series_rows
            .fetch_add(outcome.series_rows as u64, Ordering::Relaxed);
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

type SpanReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<Span>>>>;

/// State shared by the writers and their sends.
struct Shared {
    store: Arc<dyn SpanStore>,
    enricher: SpanEnricher,
    retry: RetryConfig,
    send_permits: Arc<Semaphore>,
    metrics: Arc<ExportMetrics>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// Writes spans into the meta and series tables.
pub struct ColumnarSpanExporter {
    shared: Arc<Shared>,
    sender: Mutex<Option<mpsc::Sender<Vec<Span>>>>,
    /// Stops the eviction ticker on shutdown without cancelling sends.
    eviction_stop: CancellationToken,
    workers: usize,
}

impl ColumnarSpanExporter {
    /// Loads recently written series ids into a fresh cache, then starts the
    /// eviction ticker and the writers.
    ///
    /// Must be called from within a Tokio runtime. While the tables are not
    /// provisioned yet the load is retried until `cancel` fires.
    pub async fn start(
        config: ExporterConfig,
        store: Arc<dyn SpanStore>,
        cancel: CancellationToken,
    ) -> Result<Self, ExportError> {
        let cache = Arc::new(SeriesIdCache::new());
        load_series_ids(
            store.as_ref(),
            &cache,
            config.series_lookback(),
            config.provision_retry_delay(),
            &cancel,
        )
        .await?;

        let workers = config.worker_count();
        let shared = Arc::new(Shared {
            store,
            enricher: SpanEnricher::new(Arc::clone(&cache), config.high_cardinality_keys.clone()),
            retry: config.retry_config(),
            send_permits: Arc::new(Semaphore::new(config.send_permits())),
            metrics: Arc::new(ExportMetrics::default()),
            cancel: cancel.clone(),
            tasks: TaskTracker::new(),
        });

        let eviction_stop = cancel.child_token();
        if let Some(interval) = config.series_cleanup_interval() {
            shared
                .tasks
                .spawn(evict_periodically(cache, interval, eviction_stop.clone()));
        }

        let (sender, receiver) = mpsc::channel(workers);
        let receiver: SpanReceiver = Arc::new(tokio::sync::Mutex::new(receiver));
        for id in 0..workers {
            shared
                .tasks
                .spawn(run_writer(id, Arc::clone(&shared), Arc::clone(&receiver)));
        }

        tracing::info!(
            workers,
            max_concurrent_sends = config.send_permits(),
            high_cardinality_keys = ?config.high_cardinality_keys,
            "span exporter started"
        );

        Ok(Self {
            shared,
            sender: Mutex::new(Some(sender)),
            eviction_stop,
            workers,
        })
    }

    /// Queues `spans` for writing, waiting while every writer is busy and the
    /// queue is full.
    pub async fn write_batch(&self, spans: Vec<Span>) -> Result<(), ExportError> {
        if spans.is_empty() {
            return Ok(());
        }
        self.sender()?
            .send(spans)
            .await
            .map_err(|_| ExportError::Closed)
    }

    /// Blocking variant of [`write_batch`](Self::write_batch) for threads
    /// outside the runtime, such as unmarshal pool workers.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn blocking_write_batch(&self, spans: Vec<Span>) -> Result<(), ExportError> {
        if spans.is_empty() {
            return Ok(());
        }
        self.sender()?
            .blocking_send(spans)
            .map_err(|_| ExportError::Closed)
    }

    /// Splits `spans` into the given batches using the exporter's cache and
    /// high-cardinality keys.
    pub fn enrich_batch(
        &self,
        meta: &mut dyn RowBatch<MetaRow>,
        series: &mut dyn RowBatch<SeriesRow>,
        spans: &[Span],
    ) -> Result<EnrichOutcome, EnrichError> {
        self.shared.enricher.enrich_batch(meta, series, spans)
    }

    pub fn cache(&self) -> &Arc<SeriesIdCache> {
        self.shared.enricher.cache()
    }

    pub fn metrics(&self) -> &Arc<ExportMetrics> {
        &self.shared.metrics
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Stops accepting spans, lets the writers drain the queue, and waits for
    /// every in-flight send to finish.
    pub async fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        self.eviction_stop.cancel();

        self.shared.tasks.close();
        self.shared.tasks.wait().await;

        let metrics = &self.shared.metrics;
        tracing::info!(
            spans = metrics.spans_received(),
            batches_sent = metrics.batches_sent(),
            batches_dropped = metrics.batches_dropped(),
            "span exporter stopped"
        );
    }

    fn sender(&self) -> Result<mpsc::Sender<Vec<Span>>, ExportError> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ExportError::Closed)
    }
}

impl Drop for ColumnarSpanExporter {
    fn drop(&mut self) {
        // Writers exit once the queue closes; the ticker has to be told.
        self.eviction_stop.cancel();
    }
}

async fn load_series_ids(
    store: &dyn SpanStore,
    cache: &SeriesIdCache,
    lookback: Duration,
    retry_delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), ExportError> {
    loop {
        let since = unix_nanos(SystemTime::now().checked_sub(lookback).unwrap_or(UNIX_EPOCH));
        match store.recent_series_ids(since).await {
            Ok(ids) => {
                let loaded = ids.len();
                cache.add_batch(ids);
                tracing::info!(loaded, ?lookback, "series cache warmed");
                return Ok(());
            }
            Err(e) if e.is_not_provisioned() => {
                tracing::warn!(error = %e, ?retry_delay, "span tables not provisioned yet, retrying");
                tokio::select! {
                    () = cancel.cancelled() => return Err(ExportError::Cancelled),
                    () = tokio::time::sleep(retry_delay) => {}
                }
            }
            Err(e) => return Err(ExportError::WarmLoad(e)),
        }
    }
}

async fn evict_periodically(cache: Arc<SeriesIdCache>, interval: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = cache.clean_old_part();
                tracing::debug!(evicted, remaining = cache.len(), "evicted old series ids");
            }
        }
    }
}

async fn run_writer(id: usize, shared: Arc<Shared>, receiver: SpanReceiver) {
    tracing::debug!(writer = id, "span writer running");
    loop {
        let next = tokio::select! {
            () = shared.cancel.cancelled() => None,
            spans = async { receiver.lock().await.recv().await } => spans,
        };
        let Some(spans) = next else { break };
        write_spans(&shared, spans).await;
    }
    tracing::debug!(writer = id, "span writer exiting");
}

async fn write_spans(shared: &Arc<Shared>, spans: Vec<Span>) {
    let metrics = &shared.metrics;
    metrics
        .spans_received
        .fetch_add(spans.len() as u64, Ordering::Relaxed);

    let prepared = async {
        let meta = shared.store.prepare_meta_batch().await?;
        let series = shared.store.prepare_series_batch().await?;
        Ok::<_, StoreError>((meta, series))
    };
    let (mut meta, mut series) = match prepared.await {
        Ok(batches) => batches,
        Err(e) => {
            tracing::error!(error = %e, spans = spans.len(), "failed to prepare batches, spans dropped");
            ExportMetrics::incr(&metrics.batches_dropped);
            return;
        }
    };

    match shared
        .enricher
        .enrich_batch(meta.as_mut(), series.as_mut(), &spans)
    {
        Ok(outcome) => metrics.record_enriched(outcome),
        Err(e) => {
            ExportMetrics::incr(&metrics.append_failures);
            tracing::warn!(table = e.table, error = %e, "span batch partially written; data may be lost");
        }
    }

    // Aborted batches are empty and skipped.
    send_batch(shared, meta).await;
    send_batch(shared, series).await;
}

/// Starts a background send of `batch` once a send permit is free.
async fn send_batch<R: Send + 'static>(shared: &Arc<Shared>, batch: Box<dyn RowBatch<R>>) {
    if batch.is_empty() {
        return;
    }
    let table = batch.table();
    if shared.cancel.is_cancelled() {
        tracing::warn!(table, rows = batch.len(), "exporter cancelled, batch not sent");
        ExportMetrics::incr(&shared.metrics.batches_dropped);
        return;
    }

    let permit = match Arc::clone(&shared.send_permits).acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            tracing::error!(table, rows = batch.len(), "send permits closed, batch dropped");
            ExportMetrics::incr(&shared.metrics.batches_dropped);
            return;
        }
    };

    let task_shared = Arc::clone(shared);
    shared.tasks.spawn(async move {
        let _permit = permit;
        let metrics = &task_shared.metrics;
        metrics.inflight_sends.fetch_add(1, Ordering::Relaxed);
        send_with_retry(batch, &task_shared.retry, metrics).await;
        metrics.inflight_sends.fetch_sub(1, Ordering::Relaxed);
    });
}

async fn send_with_retry<R: Send>(
    mut batch: Box<dyn RowBatch<R>>,
    retry: &RetryConfig,
    metrics: &ExportMetrics,
) {
    let table = batch.table();
    let attempts = retry.max_attempts();
    for attempt in 0..attempts {
        let delay = retry.delay_for_attempt(attempt);
        if !delay.is_zero() {
            ExportMetrics::incr(&metrics.send_retries);
            tokio::time::sleep(delay).await;
        }
        match batch.send().await {
            Ok(()) => {
                ExportMetrics::incr(&metrics.batches_sent);
                return;
            }
            Err(e) => {
                tracing::warn!(
                    table,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    error = %e,
                    "batch send failed"
                );
            }
        }
    }

    tracing::error!(
        table,
        rows = batch.len(),
        attempts,
        "batch dropped after exhausting retries; data lost"
    );
    ExportMetrics::incr(&metrics.batches_dropped);
    batch.abort();
}

fn unix_nanos(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX))
}
