use super::{decode_json, ParseError, WireFormat};
use crate::model::{Metric, Span, OPERATION_NAME_TAG, ORG_NAME_TAG};
use serde_json::Value;
use std::collections::HashMap;

/// Legacy span-as-metric encoding.
///
/// Span identity lives in the metric's tags and timestamps in its fields.
/// Every consumed bookkeeping key is removed, so the resulting span tags only
/// carry user-level attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpotSpanFormat;

impl WireFormat for SpotSpanFormat {
    type Record = Span;
    const NAME: &'static str = "spot_span";

    fn decode(buf: &[u8]) -> Result<Span, ParseError> {
        let metric: Metric = decode_json(Self::NAME, buf)?;
        span_from_metric(metric, true)
    }
}

/// Builds a span from the generic metric shape shared by both legacy span
/// encodings. With `consume` set, identity tags and time fields are removed
/// from the maps as they are read.
pub(super) fn span_from_metric(mut metric: Metric, consume: bool) -> Result<Span, ParseError> {
    let trace_id = required_tag(&mut metric.tags, "trace_id", consume)?;
    let span_id = required_tag(&mut metric.tags, "span_id", consume)?;
    let parent_span_id = take(&mut metric.tags, "parent_span_id", consume).unwrap_or_default();
    let start_time = required_time(&mut metric.fields, "start_time", consume)?;
    let end_time = required_time(&mut metric.fields, "end_time", consume)?;

    let org_name = match metric.tags.get(ORG_NAME_TAG) {
        Some(org) if !org.is_empty() => org.clone(),
        _ if !metric.org_name.is_empty() => metric.org_name.clone(),
        _ => return Err(ParseError::MissingField { field: ORG_NAME_TAG }),
    };
    let operation_name = metric
        .tags
        .get(OPERATION_NAME_TAG)
        .cloned()
        .unwrap_or_default();

    Ok(Span {
        trace_id,
        span_id,
        parent_span_id,
        operation_name,
        org_name,
        start_time,
        end_time,
        tags: metric.tags,
    })
}

fn take<V: Clone>(map: &mut HashMap<String, V>, key: &str, consume: bool) -> Option<V> {
    if consume {
        map.remove(key)
    } else {
        map.get(key).cloned()
    }
}

fn required_tag(
    tags: &mut HashMap<String, String>,
    key: &'static str,
    consume: bool,
) -> Result<String, ParseError> {
    take(tags, key, consume)
        .filter(|value| !value.is_empty())
        .ok_or(ParseError::MissingField { field: key })
}

fn required_time(
    fields: &mut HashMap<String, Value>,
    key: &'static str,
    consume: bool,
) -> Result<i64, ParseError> {
    match take(fields, key, consume) {
        None | Some(Value::Null) => Err(ParseError::MissingField { field: key }),
        Some(Value::Number(n)) => n
            .as_i64()
            // Producers encoding through float64 lose the integer form.
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| ParseError::InvalidField {
                field: key,
                reason: format!("{n} is not an integer timestamp"),
            }),
        Some(other) => Err(ParseError::InvalidField {
            field: key,
            reason: format!("expected a number, got {other}"),
        }),
    }
}
