use super::{decode_json, ParseError, WireFormat};
use crate::model::{Metric, Span, OPERATION_NAME_TAG, ORG_NAME_TAG};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

/// Current span encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct OapSpanFormat;

/// Timed events nested in the current span encoding, emitted as metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct OapSpanEventFormat;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OapSpan {
    #[serde(rename = "traceID", default)]
    trace_id: String,
    #[serde(rename = "spanID", default)]
    span_id: String,
    #[serde(rename = "parentSpanID", default)]
    parent_span_id: String,
    #[serde(default)]
    start_time_unix_nano: i64,
    #[serde(default)]
    end_time_unix_nano: i64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    attributes: Option<HashMap<String, String>>,
    #[serde(default)]
    events: Option<Vec<OapEvent>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OapEvent {
    #[serde(default)]
    time_unix_nano: i64,
    #[serde(default)]
    name: String,
    // Sorted so the synthesized message is stable.
    #[serde(default)]
    attributes: Option<BTreeMap<String, String>>,
}

fn required(value: &str, field: &'static str) -> Result<(), ParseError> {
    if value.is_empty() {
        return Err(ParseError::MissingField { field });
    }
    Ok(())
}

/// Events share the span's org check, so no event outlives a rejected span.
fn org_name(attributes: &HashMap<String, String>) -> Result<String, ParseError> {
    match attributes.get(ORG_NAME_TAG) {
        Some(org) if !org.is_empty() => Ok(org.clone()),
        _ => Err(ParseError::MissingField { field: ORG_NAME_TAG }),
    }
}

impl WireFormat for OapSpanFormat {
    type Record = Span;
    const NAME: &'static str = "oap_span";

    fn decode(buf: &[u8]) -> Result<Span, ParseError> {
        let raw: OapSpan = decode_json(Self::NAME, buf)?;
        required(&raw.trace_id, "trace_id")?;
        required(&raw.span_id, "span_id")?;

        let mut tags = raw.attributes.unwrap_or_default();
        let org_name = org_name(&tags)?;
        tags.insert(OPERATION_NAME_TAG.to_string(), raw.name.clone());

        Ok(Span {
            trace_id: raw.trace_id,
            span_id: raw.span_id,
            parent_span_id: raw.parent_span_id,
            operation_name: raw.name,
            org_name,
            start_time: raw.start_time_unix_nano,
            end_time: raw.end_time_unix_nano,
            tags,
        })
    }
}

impl WireFormat for OapSpanEventFormat {
    type Record = Vec<Metric>;
    const NAME: &'static str = "oap_span_event";

    fn decode(buf: &[u8]) -> Result<Vec<Metric>, ParseError> {
        let raw: OapSpan = decode_json(Self::NAME, buf)?;
        let span_attributes = raw.attributes.unwrap_or_default();
        let org_name = org_name(&span_attributes)?;

        let mut metrics = Vec::new();
        for event in raw.events.unwrap_or_default() {
            let attributes = match event.attributes {
                Some(attributes) if !attributes.is_empty() => attributes,
                _ => continue,
            };

            let mut tags = span_attributes.clone();
            let mut message = String::new();
            for (key, value) in attributes {
                // Writing into a String cannot fail.
                let _ = write!(message, "{key}={value};");
                tags.insert(key, value);
            }
            tags.insert("trace_id".to_string(), raw.trace_id.clone());
            tags.insert("span_id".to_string(), raw.span_id.clone());
            tags.insert("event".to_string(), event.name.clone());
            tags.insert("message".to_string(), message);

            metrics.push(Metric {
                name: event.name,
                timestamp: event.time_unix_nano,
                org_name: org_name.clone(),
                tags,
                fields: HashMap::new(),
            });
        }
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPAN: &str = r#"{
        "traceID": "0af7651916cd43dd8448eb211c80319c",
        "spanID": "b7ad6b7169203331",
        "parentSpanID": "",
        "startTimeUnixNano": 1652756014793553000,
        "endTimeUnixNano": 1652756014893553000,
        "name": "SELECT orders",
        "relations": null,
        "attributes": {
            "org_name": "erda",
            "db_system": "mysql",
            "settings_max_execution_time": "60"
        },
        "events": [
            {
                "timeUnixNano": 1652756014800000000,
                "name": "slow_query",
                "attributes": {"elapsed": "95ms", "settings.max_execution_time": "60"},
                "droppedAttributesCount": 0
            },
            {
                "timeUnixNano": 1652756014810000000,
                "name": "noop",
                "attributes": {},
                "droppedAttributesCount": 0
            }
        ]
    }"#;

    #[test]
    fn test_span_copies_name_into_operation_tag() {
        let span = OapSpanFormat::decode(SPAN.as_bytes()).unwrap();

        assert_eq!(span.trace_id, "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(span.parent_span_id, "");
        assert_eq!(span.org_name, "erda");
        assert_eq!(span.operation_name, "SELECT orders");
        assert_eq!(span.tags[OPERATION_NAME_TAG], "SELECT orders");
        assert_eq!(span.tags["db_system"], "mysql");
        assert_eq!(span.duration_nanos(), 100_000_000);
    }

    #[test]
    fn test_span_without_org_name_rejected() {
        let buf = br#"{"traceID":"t","spanID":"s","name":"x","attributes":{"db":"redis"}}"#;
        let err = OapSpanFormat::decode(buf).unwrap_err();
        assert_eq!(err.to_string(), "org_name cannot be null");

        let buf = br#"{"traceID":"t","spanID":"s","name":"x","attributes":null}"#;
        assert!(OapSpanFormat::decode(buf).is_err());
    }

    #[test]
    fn test_empty_org_rejects_span_and_events_alike() {
        let buf = br#"{"traceID":"t","spanID":"s","name":"GET /",
            "attributes":{"org_name":"","service_name":"cart"},
            "events":[{"timeUnixNano":1,"name":"retry","attributes":{"attempt":"2"}}]}"#;

        let span_err = OapSpanFormat::decode(buf).unwrap_err();
        let event_err = OapSpanEventFormat::decode(buf).unwrap_err();
        assert!(matches!(span_err, ParseError::MissingField { field: "org_name" }));
        assert!(matches!(event_err, ParseError::MissingField { field: "org_name" }));

        // Event attributes may carry an empty org_name of their own.
        let buf = br#"{"traceID":"t","spanID":"s","attributes":{"org_name":"erda"},
            "events":[{"timeUnixNano":1,"name":"query","attributes":{"org_name":""}}]}"#;
        let metrics = OapSpanEventFormat::decode(buf).unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].org_name, "erda");
        assert_eq!(metrics[0].tags["message"], "org_name=;");
    }

    #[test]
    fn test_span_without_ids_rejected() {
        let buf = br#"{"spanID":"s","attributes":{"org_name":"erda"}}"#;
        let err = OapSpanFormat::decode(buf).unwrap_err();
        assert!(err.to_string().contains("trace_id cannot be null"));
    }

    #[test]
    fn test_events_become_metrics() {
        let metrics = OapSpanEventFormat::decode(SPAN.as_bytes()).unwrap();

        // The attribute-less event is skipped.
        assert_eq!(metrics.len(), 1);
        let metric = &metrics[0];
        assert_eq!(metric.name, "slow_query");
        assert_eq!(metric.timestamp, 1652756014800000000);
        assert_eq!(metric.org_name, "erda");
        assert!(metric.fields.is_empty());

        let tags = &metric.tags;
        assert_eq!(tags["event"], "slow_query");
        assert_eq!(tags["trace_id"], "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(tags["span_id"], "b7ad6b7169203331");
        assert_eq!(tags["db_system"], "mysql");
        assert_eq!(tags["elapsed"], "95ms");
        assert_eq!(tags["settings.max_execution_time"], "60");
        assert_eq!(tags["settings_max_execution_time"], "60");
        assert_eq!(
            tags["message"],
            "elapsed=95ms;settings.max_execution_time=60;"
        );
    }

    #[test]
    fn test_span_without_events_yields_nothing() {
        let buf = br#"{"traceID":"t","spanID":"s","attributes":{"org_name":"erda"},"events":null}"#;
        assert!(OapSpanEventFormat::decode(buf).unwrap().is_empty());
    }

    #[test]
    fn test_event_parse_rejects_invalid_json() {
        let err = OapSpanEventFormat::decode(b"[1, 2").unwrap_err();
        assert!(matches!(
            err,
            ParseError::Decode {
                format: "oap_span_event",
                ..
            }
        ));
    }
}
