//! Telemetry Ingestion Core
//!
//! Turns raw telemetry payloads into canonical records and persists spans into
//! a pair of columnar tables:
//!
//! ```text
//! bytes ──► UnmarshalPool ──► protoparser ──► Span ──► ColumnarSpanExporter
//!                                                         │ SpanEnricher + SeriesIdCache
//!                                                         ▼
//!                                               meta batch, series batch
//!                                                         │ bounded sends, backoff
//!                                                         ▼
//!                                                     SpanStore
//! ```
//!
//! Low-cardinality tags of a span are fingerprinted into a series id and
//! written to the meta table only the first time the id is seen. Every span
//! gets one series row carrying its identity and the configured
//! high-cardinality tags.

pub mod config;
pub mod enrich;
pub mod exporter;
pub mod model;
pub mod protoparser;
pub mod retry;
pub mod schema;
pub mod series;
pub mod store;

// Re-export main types
pub use config::{ConfigError, ExporterConfig, IngestConfig};
pub use enrich::{EnrichError, EnrichOutcome, SpanEnricher};
pub use exporter::{ColumnarSpanExporter, ExportError, ExportMetrics};
pub use model::{Log, Metric, Profile, Span};
pub use protoparser::{BoxError, ParseError, WireFormat};
pub use retry::RetryConfig;
pub use schema::{MetaRow, SeriesRow};
pub use series::{series_id, SeriesIdCache};
pub use store::{MemoryStore, RowBatch, SpanStore, StoreError};
pub use workpool::{UnmarshalPool, WorkError};
