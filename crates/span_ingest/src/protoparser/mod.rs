//! Wire-format parsers.
//!
//! Every format is a zero-sized type implementing [`WireFormat`]: it decodes a
//! raw payload into its canonical record and validates it. [`ParseWork`] turns
//! any format plus a consumer callback into a [`workpool::Unmarshal`] item, so
//! adding a format never touches the pool.
//!
//! Decoding completes before the callback is invoked; a payload that fails to
//! decode or validate is never partially delivered.
//!
//! | Format | Record | Notes |
//! |--------|--------|-------|
//! | [`OapSpanFormat`] | [`Span`] | current span encoding |
//! | [`OapSpanEventFormat`] | `Vec<Metric>` | one metric per attributed span event |
//! | [`SpotSpanFormat`] | [`Span`] | legacy span-as-metric, bookkeeping keys stripped |
//! | [`JsonSpanFormat`] | [`Span`] | legacy metric-shaped JSON span, tags kept |
//! | [`SpotMetricFormat`] | [`Metric`] | metric names canonicalized |
//! | [`SpotLogFormat`] | [`Log`] | normalized log line |
//! | [`ProfileFormat`] | [`Profile`] | passthrough |

mod json_span;
mod oap_span;
mod profile;
mod spot_log;
mod spot_metric;
mod spot_span;

pub use json_span::JsonSpanFormat;
pub use oap_span::{OapSpanEventFormat, OapSpanFormat};
pub use profile::ProfileFormat;
pub use spot_log::{normalize_log, SpotLogFormat, LOG_ID_KEYS};
pub use spot_metric::SpotMetricFormat;
pub use spot_span::SpotSpanFormat;

use crate::model::{Log, Metric, Profile, Span};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use thiserror::Error;
use workpool::{PoolError, Unmarshal, UnmarshalPool, WorkError};

/// Error type callbacks use to reject a delivered record.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced while parsing one payload.
///
/// Decode and validation failures are distinguishable by variant but callers
/// are expected to treat them alike: drop the payload and keep consuming.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Payload is not valid for the format's wire shape.
    #[error("failed to decode {format} payload: {source}")]
    Decode {
        format: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// A required field is absent or empty.
    #[error("{field} cannot be null")]
    MissingField { field: &'static str },

    /// A field is present but unusable.
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// Record failed semantic validation after normalization.
    #[error("invalid record: {0}")]
    Invalid(String),

    /// The consumer callback rejected the record.
    #[error("callback rejected record: {0}")]
    Callback(#[source] BoxError),

    /// The parse panicked on a pool worker.
    #[error("parser panicked: {0}")]
    Panicked(String),

    /// The work could not be scheduled.
    #[error("unmarshal pool unavailable: {0}")]
    Pool(#[from] PoolError),
}

impl From<WorkError<ParseError>> for ParseError {
    fn from(err: WorkError<ParseError>) -> Self {
        match err {
            WorkError::Failed(e) => e,
            WorkError::Panicked(msg) => Self::Panicked(msg),
            WorkError::Dropped => Self::Invalid("parse work dropped before running".into()),
            WorkError::Pool(e) => Self::Pool(e),
        }
    }
}

/// A wire format that decodes raw bytes into a canonical record.
pub trait WireFormat: Send + Sync + 'static {
    /// Record delivered to the callback.
    type Record: Send + 'static;

    /// Short name used in errors and logs.
    const NAME: &'static str;

    /// Decodes and validates one payload.
    fn decode(buf: &[u8]) -> Result<Self::Record, ParseError>;
}

/// One payload of format `F` plus the callback receiving its record.
pub struct ParseWork<F, C> {
    buf: Vec<u8>,
    callback: C,
    _format: PhantomData<fn() -> F>,
}

impl<F, C> ParseWork<F, C>
where
    F: WireFormat,
    C: FnMut(F::Record) -> Result<(), BoxError> + Send + 'static,
{
    pub fn new(buf: impl Into<Vec<u8>>, callback: C) -> Self {
        Self {
            buf: buf.into(),
            callback,
            _format: PhantomData,
        }
    }
}

impl<F, C> Unmarshal for ParseWork<F, C>
where
    F: WireFormat,
    C: FnMut(F::Record) -> Result<(), BoxError> + Send + 'static,
{
    type Error = ParseError;

    fn unmarshal(&mut self) -> Result<(), ParseError> {
        let record = F::decode(&self.buf)?;
        (self.callback)(record).map_err(ParseError::Callback)
    }
}

/// Parses `buf` as format `F` on `pool` and blocks until the callback ran.
pub fn parse<F, C>(pool: &UnmarshalPool, buf: impl Into<Vec<u8>>, callback: C) -> Result<(), ParseError>
where
    F: WireFormat,
    C: FnMut(F::Record) -> Result<(), BoxError> + Send + 'static,
{
    pool.execute(ParseWork::<F, C>::new(buf, callback))
        .map_err(ParseError::from)
}

pub fn parse_oap_span<C>(pool: &UnmarshalPool, buf: impl Into<Vec<u8>>, callback: C) -> Result<(), ParseError>
where
    C: FnMut(Span) -> Result<(), BoxError> + Send + 'static,
{
    parse::<OapSpanFormat, C>(pool, buf, callback)
}

pub fn parse_oap_span_event<C>(
    pool: &UnmarshalPool,
    buf: impl Into<Vec<u8>>,
    callback: C,
) -> Result<(), ParseError>
where
    C: FnMut(Vec<Metric>) -> Result<(), BoxError> + Send + 'static,
{
    parse::<OapSpanEventFormat, C>(pool, buf, callback)
}

pub fn parse_spot_span<C>(pool: &UnmarshalPool, buf: impl Into<Vec<u8>>, callback: C) -> Result<(), ParseError>
where
    C: FnMut(Span) -> Result<(), BoxError> + Send + 'static,
{
    parse::<SpotSpanFormat, C>(pool, buf, callback)
}

pub fn parse_json_span<C>(pool: &UnmarshalPool, buf: impl Into<Vec<u8>>, callback: C) -> Result<(), ParseError>
where
    C: FnMut(Span) -> Result<(), BoxError> + Send + 'static,
{
    parse::<JsonSpanFormat, C>(pool, buf, callback)
}

pub fn parse_spot_metric<C>(pool: &UnmarshalPool, buf: impl Into<Vec<u8>>, callback: C) -> Result<(), ParseError>
where
    C: FnMut(Metric) -> Result<(), BoxError> + Send + 'static,
{
    parse::<SpotMetricFormat, C>(pool, buf, callback)
}

pub fn parse_spot_log<C>(pool: &UnmarshalPool, buf: impl Into<Vec<u8>>, callback: C) -> Result<(), ParseError>
where
    C: FnMut(Log) -> Result<(), BoxError> + Send + 'static,
{
    parse::<SpotLogFormat, C>(pool, buf, callback)
}

pub fn parse_profile<C>(pool: &UnmarshalPool, buf: impl Into<Vec<u8>>, callback: C) -> Result<(), ParseError>
where
    C: FnMut(Profile) -> Result<(), BoxError> + Send + 'static,
{
    parse::<ProfileFormat, C>(pool, buf, callback)
}

pub(crate) fn decode_json<T: DeserializeOwned>(
    format: &'static str,
    buf: &[u8],
) -> Result<T, ParseError> {
    serde_json::from_slice(buf).map_err(|source| ParseError::Decode { format, source })
}
