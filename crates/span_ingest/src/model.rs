use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tag key every span must carry; its value becomes [`Span::org_name`].
pub const ORG_NAME_TAG: &str = "org_name";

/// Synthetic tag holding the span's operation name.
pub const OPERATION_NAME_TAG: &str = "operation_name";

/// Canonical span produced by every span parser, whatever the wire format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    /// Empty for root spans
    pub parent_span_id: String,
    pub operation_name: String,
    pub org_name: String,
    /// Unix nanoseconds
    pub start_time: i64,
    /// Unix nanoseconds; not validated against `start_time`
    pub end_time: i64,
    pub tags: HashMap<String, String>,
}

impl Span {
    /// Duration in nanoseconds, clamped to zero for inverted timestamps.
    pub fn duration_nanos(&self) -> i64 {
        (self.end_time - self.start_time).max(0)
    }
}

/// Generic metric record; also the wire shape of the legacy span encodings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metric {
    pub name: String,
    /// Unix nanoseconds
    pub timestamp: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub org_name: String,
    pub tags: HashMap<String, String>,
    pub fields: HashMap<String, serde_json::Value>,
}

/// Log line as shipped by log agents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Log {
    pub source: String,
    /// Identity of the emitting container/task
    pub id: String,
    pub stream: String,
    pub content: String,
    pub offset: i64,
    /// Unix nanoseconds
    pub timestamp: i64,
    pub tags: HashMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub unique_id: String,
}

/// Profiling payload; decoded and validated but otherwise passed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub format: String,
    #[serde(default)]
    pub spy_name: String,
    #[serde(default)]
    pub sample_rate: u32,
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub aggregation_type: String,
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub content: String,
}
