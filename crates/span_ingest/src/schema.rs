//! Rows of the two span tables read by the query service.
//!
//! Column names are part of the contract with readers; do not rename them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Deduplicated low-cardinality tags, one row per tag of each new series.
pub const META_TABLE: &str = "spans_meta";

/// One row per ingested span.
pub const SERIES_TABLE: &str = "spans_series";

pub mod meta_columns {
    pub const SERIES_ID: &str = "series_id";
    pub const KEY: &str = "key";
    pub const VALUE: &str = "value";
    pub const ORG_NAME: &str = "org_name";
    pub const CREATE_AT: &str = "create_at";

    pub const ALL: [&str; 5] = [SERIES_ID, KEY, VALUE, ORG_NAME, CREATE_AT];
}

pub mod series_columns {
    pub const SERIES_ID: &str = "series_id";
    pub const ORG_NAME: &str = "org_name";
    pub const TRACE_ID: &str = "trace_id";
    pub const SPAN_ID: &str = "span_id";
    pub const PARENT_SPAN_ID: &str = "parent_span_id";
    pub const START_TIME: &str = "start_time";
    pub const END_TIME: &str = "end_time";
    pub const TAGS: &str = "tags";

    pub const ALL: [&str; 8] = [
        SERIES_ID,
        ORG_NAME,
        TRACE_ID,
        SPAN_ID,
        PARENT_SPAN_ID,
        START_TIME,
        END_TIME,
        TAGS,
    ];
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRow {
    pub series_id: u64,
    pub key: String,
    pub value: String,
    pub org_name: String,
    /// Unix nanoseconds; the end time of the span that introduced the series
    pub create_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesRow {
    pub series_id: u64,
    pub org_name: String,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: String,
    pub start_time: i64,
    pub end_time: i64,
    /// High-cardinality tags kept inline; `None` when no keys are configured
    pub tags: Option<HashMap<String, String>>,
}
