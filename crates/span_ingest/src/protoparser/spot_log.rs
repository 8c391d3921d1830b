use super::{decode_json, ParseError, WireFormat};
use crate::model::{Log, ORG_NAME_TAG};
use std::collections::HashMap;

/// Tags consulted, in priority order, for a log's identity when the agent did
/// not set one.
pub const LOG_ID_KEYS: [&str; 4] = [
    "TERMINUS_DEFINE_TAG",
    "terminus_define_tag",
    "MESOS_TASK_ID",
    "mesos_task_id",
];

const LEVEL_TAG: &str = "level";
const DEFAULT_LEVEL: &str = "INFO";
const REQUEST_ID_TAG: &str = "request_id";
const TRACE_ID_TAG: &str = "trace_id";
const LEGACY_REQUEST_ID_TAG: &str = "request-id";
const DICE_ORG_NAME_TAG: &str = "dice_org_name";
const MONITOR_KEY_TAG: &str = "monitor_log_key";
const TERMINUS_KEY_TAG: &str = "terminus_log_key";
const DEFAULT_STREAM: &str = "stdout";

/// Log line encoding shipped by log agents.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpotLogFormat;

impl WireFormat for SpotLogFormat {
    type Record = Log;
    const NAME: &'static str = "spot_log";

    fn decode(buf: &[u8]) -> Result<Log, ParseError> {
        let mut log: Log = decode_json(Self::NAME, buf)?;
        normalize_log(&mut log)?;
        Ok(log)
    }
}

/// Normalizes a decoded log in place.
///
/// Fails when no identity can be derived; the log must then be dropped.
pub fn normalize_log(log: &mut Log) -> Result<(), ParseError> {
    let tags = &mut log.tags;

    // Only an absent level is defaulted; a present one is uppercased as is.
    let level = tags
        .get(LEVEL_TAG)
        .map_or_else(|| DEFAULT_LEVEL.to_string(), |level| level.to_uppercase());
    tags.insert(LEVEL_TAG.to_string(), level);

    let request_id = non_empty(tags, REQUEST_ID_TAG)
        .or_else(|| non_empty(tags, TRACE_ID_TAG))
        .or_else(|| non_empty(tags, LEGACY_REQUEST_ID_TAG))
        .cloned();
    tags.remove(LEGACY_REQUEST_ID_TAG);
    if let Some(request_id) = request_id {
        tags.insert(REQUEST_ID_TAG.to_string(), request_id.clone());
        tags.insert(TRACE_ID_TAG.to_string(), request_id);
    }

    if non_empty(tags, DICE_ORG_NAME_TAG).is_none() {
        if let Some(org) = non_empty(tags, ORG_NAME_TAG).cloned() {
            tags.insert(DICE_ORG_NAME_TAG.to_string(), org);
        }
    }

    if !tags.contains_key(MONITOR_KEY_TAG) {
        if let Some(key) = tags.get(TERMINUS_KEY_TAG).cloned() {
            tags.insert(MONITOR_KEY_TAG.to_string(), key);
        }
    }

    if log.id.is_empty() {
        if let Some(id) = LOG_ID_KEYS.iter().find_map(|key| non_empty(&log.tags, key)) {
            log.id = id.clone();
        }
    }
    if log.id.is_empty() {
        return Err(ParseError::MissingField { field: "id" });
    }

    if log.stream.is_empty() {
        log.stream = DEFAULT_STREAM.to_string();
    }
    Ok(())
}

fn non_empty<'a>(tags: &'a HashMap<String, String>, key: &str) -> Option<&'a String> {
    tags.get(key).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with(tags: &[(&str, &str)]) -> Log {
        Log {
            source: "container".into(),
            content: "hello".into(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Log::default()
        }
    }

    #[test]
    fn test_defaults_applied() {
        let mut log = log_with(&[("MESOS_TASK_ID", "task-1")]);
        normalize_log(&mut log).unwrap();

        assert_eq!(log.tags[LEVEL_TAG], "INFO");
        assert_eq!(log.stream, "stdout");
        assert_eq!(log.id, "task-1");
    }

    #[test]
    fn test_level_uppercased() {
        let mut log = log_with(&[("level", "warn"), ("mesos_task_id", "t")]);
        normalize_log(&mut log).unwrap();
        assert_eq!(log.tags[LEVEL_TAG], "WARN");
    }

    #[test]
    fn test_empty_level_kept_empty() {
        let mut log = log_with(&[("level", ""), ("mesos_task_id", "t")]);
        normalize_log(&mut log).unwrap();
        assert_eq!(log.tags[LEVEL_TAG], "");
    }

    #[test]
    fn test_legacy_request_id_reconciled() {
        let mut log = log_with(&[("request-id", "r-42"), ("mesos_task_id", "t")]);
        normalize_log(&mut log).unwrap();

        assert_eq!(log.tags[REQUEST_ID_TAG], "r-42");
        assert_eq!(log.tags[TRACE_ID_TAG], "r-42");
        assert!(!log.tags.contains_key(LEGACY_REQUEST_ID_TAG));
    }

    #[test]
    fn test_trace_id_fills_request_id() {
        let mut log = log_with(&[("trace_id", "tr-1"), ("mesos_task_id", "t")]);
        normalize_log(&mut log).unwrap();
        assert_eq!(log.tags[REQUEST_ID_TAG], "tr-1");
    }

    #[test]
    fn test_org_and_monitor_key_fallbacks() {
        let mut log = log_with(&[
            ("org_name", "erda"),
            ("terminus_log_key", "lk-1"),
            ("mesos_task_id", "t"),
        ]);
        normalize_log(&mut log).unwrap();

        assert_eq!(log.tags[DICE_ORG_NAME_TAG], "erda");
        assert_eq!(log.tags[MONITOR_KEY_TAG], "lk-1");
    }

    #[test]
    fn test_existing_values_not_overwritten() {
        let mut log = log_with(&[
            ("org_name", "erda"),
            ("dice_org_name", "dice"),
            ("terminus_log_key", "old"),
            ("monitor_log_key", "new"),
        ]);
        log.id = "explicit".into();
        log.stream = "stderr".into();
        normalize_log(&mut log).unwrap();

        assert_eq!(log.tags[DICE_ORG_NAME_TAG], "dice");
        assert_eq!(log.tags[MONITOR_KEY_TAG], "new");
        assert_eq!(log.id, "explicit");
        assert_eq!(log.stream, "stderr");
    }

    #[test]
    fn test_identity_priority_order() {
        let mut log = log_with(&[
            ("mesos_task_id", "low"),
            ("terminus_define_tag", "high"),
            ("TERMINUS_DEFINE_TAG", ""),
        ]);
        normalize_log(&mut log).unwrap();
        assert_eq!(log.id, "high");
    }

    #[test]
    fn test_log_without_identity_rejected() {
        let buf = br#"{"source":"container","content":"x","tags":{"level":"info"}}"#;
        let err = SpotLogFormat::decode(buf).unwrap_err();
        assert_eq!(err.to_string(), "id cannot be null");
    }
}
