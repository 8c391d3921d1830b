//! Splits spans into meta and series rows.

use crate::model::Span;
use crate::schema::{MetaRow, SeriesRow};
use crate::series::{series_id_sorted, SeriesIdCache};
use crate::store::{RowBatch, StoreError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Rows appended by one [`SpanEnricher::enrich_batch`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichOutcome {
    pub meta_rows: usize,
    pub series_rows: usize,
}

/// An append failed and the named table's batch was aborted.
///
/// Rows appended to that batch earlier in the same call are lost with it.
#[derive(Debug, Error)]
#[error("failed to append {table} row for span {span_id}: {source}")]
pub struct EnrichError {
    pub table: &'static str,
    pub span_id: String,
    #[source]
    pub source: StoreError,
}

/// Turns spans into rows, consulting the shared series cache.
#[derive(Debug)]
pub struct SpanEnricher {
    cache: Arc<SeriesIdCache>,
    high_cardinality_keys: HashSet<String>,
}

impl SpanEnricher {
    pub fn new<I, S>(cache: Arc<SeriesIdCache>, high_cardinality_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cache,
            high_cardinality_keys: high_cardinality_keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn cache(&self) -> &Arc<SeriesIdCache> {
        &self.cache
    }

    pub fn is_high_cardinality(&self, key: &str) -> bool {
        self.high_cardinality_keys.contains(key)
    }

    /// Appends the rows for `spans`, in input order.
    ///
    /// Each span yields one series row. A span whose series id is not cached
    /// also yields one meta row per low-cardinality tag, after which the id
    /// is cached. The first failed append aborts that table's batch and ends
    /// the call; the other batch keeps what it already holds.
    pub fn enrich_batch(
        &self,
        meta: &mut dyn RowBatch<MetaRow>,
        series: &mut dyn RowBatch<SeriesRow>,
        spans: &[Span],
    ) -> Result<EnrichOutcome, EnrichError> {
        let mut outcome = EnrichOutcome::default();

        for span in spans {
            let mut low: Vec<(&str, &str)> = Vec::with_capacity(span.tags.len());
            let mut high: HashMap<String, String> = HashMap::new();
            for (key, value) in &span.tags {
                if self.is_high_cardinality(key) {
                    high.insert(key.clone(), value.clone());
                } else {
                    low.push((key.as_str(), value.as_str()));
                }
            }
            low.sort_unstable();
            let series_id = series_id_sorted(&low);

            if !self.cache.has(series_id) {
                for (key, value) in &low {
                    let row = MetaRow {
                        series_id,
                        key: (*key).to_string(),
                        value: (*value).to_string(),
                        org_name: span.org_name.clone(),
                        create_at: span.end_time,
                    };
                    if let Err(source) = meta.append(row) {
                        return Err(abort(meta, span, source));
                    }
                    outcome.meta_rows += 1;
                }
                self.cache.add(series_id);
            }

            let row = SeriesRow {
                series_id,
                org_name: span.org_name.clone(),
                trace_id: span.trace_id.clone(),
                span_id: span.span_id.clone(),
                parent_span_id: span.parent_span_id.clone(),
                start_time: span.start_time,
                end_time: span.end_time,
                tags: if self.high_cardinality_keys.is_empty() {
                    None
                } else {
                    Some(high)
                },
            };
            if let Err(source) = series.append(row) {
                return Err(abort(series, span, source));
            }
            outcome.series_rows += 1;
        }

        Ok(outcome)
    }
}

fn abort<R: Send>(batch: &mut dyn RowBatch<R>, span: &Span, source: StoreError) -> EnrichError {
    let table = batch.table();
    tracing::error!(
        table,
        span_id = %span.span_id,
        error = %source,
        "append failed, aborting batch; data may be lost"
    );
    batch.abort();
    EnrichError {
        table,
        span_id: span.span_id.clone(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{META_TABLE, SERIES_TABLE};
    use crate::store::{MemoryStore, SpanStore};

    fn span(span_id: &str, tags: &[(&str, &str)]) -> Span {
        Span {
            trace_id: "trace".into(),
            span_id: span_id.into(),
            org_name: "erda".into(),
            start_time: 10,
            end_time: 20,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Span::default()
        }
    }

    const TAGS: &[(&str, &str)] = &[
        ("org_name", "erda"),
        ("service_name", "cart"),
        ("terminus_key", "tk-1"),
    ];

    #[tokio::test]
    async fn test_new_series_emits_meta_per_low_cardinality_tag() {
        let store = MemoryStore::new();
        let enricher = SpanEnricher::new(Arc::new(SeriesIdCache::new()), ["terminus_key"]);
        let mut meta = store.prepare_meta_batch().await.unwrap();
        let mut series = store.prepare_series_batch().await.unwrap();

        let outcome = enricher
            .enrich_batch(meta.as_mut(), series.as_mut(), &[span("s1", TAGS)])
            .unwrap();

        assert_eq!(outcome, EnrichOutcome { meta_rows: 2, series_rows: 1 });
        meta.send().await.unwrap();
        series.send().await.unwrap();

        let meta_rows = store.meta_rows();
        let keys: Vec<&str> = meta_rows.iter().map(|row| row.key.as_str()).collect();
        assert_eq!(keys, vec!["org_name", "service_name"]);
        assert!(meta_rows.iter().all(|row| row.create_at == 20 && row.org_name == "erda"));

        let series_rows = store.series_rows();
        let tags = series_rows[0].tags.as_ref().unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags["terminus_key"], "tk-1");
        assert_eq!(series_rows[0].series_id, meta_rows[0].series_id);
    }

    #[tokio::test]
    async fn test_cached_series_emits_no_meta_across_calls() {
        let store = MemoryStore::new();
        let enricher = SpanEnricher::new(Arc::new(SeriesIdCache::new()), ["terminus_key"]);

        let mut totals = Vec::new();
        for (span_id, key) in [("s1", "tk-1"), ("s2", "tk-2")] {
            let mut meta = store.prepare_meta_batch().await.unwrap();
            let mut series = store.prepare_series_batch().await.unwrap();
            let tags = [("service_name", "cart"), ("org_name", "erda"), ("terminus_key", key)];
            totals.push(
                enricher
                    .enrich_batch(meta.as_mut(), series.as_mut(), &[span(span_id, &tags)])
                    .unwrap(),
            );
        }

        assert_eq!(totals[0], EnrichOutcome { meta_rows: 2, series_rows: 1 });
        assert_eq!(totals[1], EnrichOutcome { meta_rows: 0, series_rows: 1 });
    }

    #[tokio::test]
    async fn test_no_high_cardinality_keys_means_null_tags() {
        let store = MemoryStore::new();
        let enricher = SpanEnricher::new(Arc::new(SeriesIdCache::new()), Vec::<String>::new());
        let mut meta = store.prepare_meta_batch().await.unwrap();
        let mut series = store.prepare_series_batch().await.unwrap();

        let outcome = enricher
            .enrich_batch(meta.as_mut(), series.as_mut(), &[span("s1", TAGS)])
            .unwrap();

        assert_eq!(outcome.meta_rows, 3);
        series.send().await.unwrap();
        assert!(store.series_rows()[0].tags.is_none());
    }

    #[tokio::test]
    async fn test_meta_append_failure_aborts_meta_batch() {
        let store = MemoryStore::new();
        store.limit_meta_appends(Some(3));
        let cache = Arc::new(SeriesIdCache::new());
        let enricher = SpanEnricher::new(Arc::clone(&cache), ["terminus_key"]);
        let mut meta = store.prepare_meta_batch().await.unwrap();
        let mut series = store.prepare_series_batch().await.unwrap();

        let spans = [
            span("s1", TAGS),
            span("s2", &[("org_name", "erda"), ("service_name", "orders")]),
            span("s3", TAGS),
        ];
        let err = enricher
            .enrich_batch(meta.as_mut(), series.as_mut(), &spans)
            .unwrap_err();

        assert_eq!(err.table, META_TABLE);
        assert_eq!(err.span_id, "s2");
        // The meta rows of s1 went down with the batch.
        assert!(meta.is_empty());
        assert_eq!(series.len(), 1);
        // The failed series was never cached; s1's was.
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_series_append_failure_aborts_series_batch() {
        let store = MemoryStore::new();
        store.limit_series_appends(Some(0));
        let enricher = SpanEnricher::new(Arc::new(SeriesIdCache::new()), Vec::<String>::new());
        let mut meta = store.prepare_meta_batch().await.unwrap();
        let mut series = store.prepare_series_batch().await.unwrap();

        let err = enricher
            .enrich_batch(meta.as_mut(), series.as_mut(), &[span("s1", TAGS)])
            .unwrap_err();

        assert_eq!(err.table, SERIES_TABLE);
        assert_eq!(meta.len(), 3);
        assert!(matches!(
            series.append(SeriesRow::default()),
            Err(StoreError::BatchClosed(_))
        ));
    }
}
