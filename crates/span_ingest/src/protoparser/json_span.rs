use super::spot_span::span_from_metric;
use super::{decode_json, ParseError, WireFormat};
use crate::model::{Metric, Span};

/// Legacy metric-shaped JSON span.
///
/// Validated like [`SpotSpanFormat`](super::SpotSpanFormat) but the identity
/// tags stay in the span's tag map.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSpanFormat;

impl WireFormat for JsonSpanFormat {
    type Record = Span;
    const NAME: &'static str = "json_span";

    fn decode(buf: &[u8]) -> Result<Span, ParseError> {
        let metric: Metric = decode_json(Self::NAME, buf)?;
        span_from_metric(metric, false)
    }
}
