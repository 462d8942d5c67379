//! Parsing of wire payloads into store mutations.

use crate::{
    model::{Flag, Segment},
    store::{AllData, DataKind, PatchTarget, StorageItem},
};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum MessageParseError {
    #[error("Unable to parse event payload: {0}")]
    ParsePayload(#[from] serde_json::Error),

    #[error("Update path is not recognized: {0}")]
    UnknownPath(String),
}

/// Parsed message from the stream.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub enum Message {
    /// Full snapshot replacing all stored data.
    Put(AllData),
    /// Single-item update.
    Patch { key: String, item: PatchTarget },
    /// Single-item delete, carried as a tombstone.
    Delete { key: String, item: PatchTarget },
    /// Event type this SDK does not know; skipped.
    Unknown,
}

impl Message {
    /// Parse one SSE event. A payload that does not deserialize is an
    /// error (the stream restarts on it); an unknown event *type* is not.
    pub fn parse(event_type: &str, data: &str) -> Result<Self, MessageParseError> {
        trace!(event_type, "reading stream event");
        match event_type {
            "put" => {
                let payload: PutPayload = serde_json::from_str(data)?;
                let data = payload.data.into_all_data();
                trace!(
                    num_flags = data.flags.len(),
                    num_segments = data.segments.len(),
                    "parsed full dataset"
                );
                Ok(Message::Put(data))
            }
            "patch" => {
                let payload: PatchPayload = serde_json::from_str(data)?;
                let (kind, key) = parse_path(&payload.path)
                    .ok_or_else(|| MessageParseError::UnknownPath(payload.path.clone()))?;
                let item = match kind {
                    DataKind::Flag => {
                        let mut flag: Flag = serde_json::from_value(payload.data)?;
                        flag.preprocess();
                        PatchTarget::Flag(StorageItem::Item(flag))
                    }
                    DataKind::Segment => {
                        let mut segment: Segment = serde_json::from_value(payload.data)?;
                        segment.preprocess();
                        PatchTarget::Segment(StorageItem::Item(segment))
                    }
                };
                trace!(%kind, key, "parsed single-item update");
                Ok(Message::Patch {
                    key: key.to_owned(),
                    item,
                })
            }
            "delete" => {
                let payload: DeletePayload = serde_json::from_str(data)?;
                let (kind, key) = parse_path(&payload.path)
                    .ok_or_else(|| MessageParseError::UnknownPath(payload.path.clone()))?;
                let item = match kind {
                    DataKind::Flag => PatchTarget::Flag(StorageItem::Tombstone(payload.version)),
                    DataKind::Segment => {
                        PatchTarget::Segment(StorageItem::Tombstone(payload.version))
                    }
                };
                trace!(%kind, key, version = payload.version, "parsed delete");
                Ok(Message::Delete {
                    key: key.to_owned(),
                    item,
                })
            }
            other => {
                warn!(event_type = other, "unknown event type");
                Ok(Message::Unknown)
            }
        }
    }
}

/// The `data` object of a `put` event, also the whole body of a polling
/// response.
#[derive(Debug, Default, Deserialize)]
pub struct RawDataSet {
    #[serde(default)]
    flags: HashMap<String, Flag>,
    #[serde(default)]
    segments: HashMap<String, Segment>,
}

impl RawDataSet {
    /// Preprocess every record and wrap into the store's input shape.
    pub fn into_all_data(self) -> AllData {
        AllData {
            flags: self
                .flags
                .into_iter()
                .map(|(key, mut flag)| {
                    flag.preprocess();
                    (key, StorageItem::Item(flag))
                })
                .collect(),
            segments: self
                .segments
                .into_iter()
                .map(|(key, mut segment)| {
                    segment.preprocess();
                    (key, StorageItem::Item(segment))
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PutPayload {
    data: RawDataSet,
}

#[derive(Debug, Deserialize)]
struct PatchPayload {
    path: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct DeletePayload {
    path: String,
    version: u64,
}

fn parse_path(path: &str) -> Option<(DataKind, &str)> {
    if let Some(key) = path.strip_prefix("/flags/") {
        Some((DataKind::Flag, key))
    } else {
        path.strip_prefix("/segments/")
            .map(|key| (DataKind::Segment, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Versioned;

    #[test]
    fn parses_put_with_flags_and_segments() {
        let data = r#"{"data": {
            "flags": {"f1": {"key": "f1", "version": 2}},
            "segments": {"s1": {"key": "s1", "version": 3}}
        }}"#;
        match Message::parse("put", data).unwrap() {
            Message::Put(all) => {
                assert_eq!(2, all.flags["f1"].version());
                assert_eq!(3, all.segments["s1"].version());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn parses_put_with_missing_sections() {
        match Message::parse("put", r#"{"data": {}}"#).unwrap() {
            Message::Put(all) => {
                assert!(all.flags.is_empty());
                assert!(all.segments.is_empty());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn parses_flag_patch() {
        let data = r#"{"path": "/flags/my-flag", "data": {"key": "my-flag", "version": 8, "on": true}}"#;
        match Message::parse("patch", data).unwrap() {
            Message::Patch { key, item } => {
                assert_eq!("my-flag", key);
                match item {
                    PatchTarget::Flag(StorageItem::Item(flag)) => {
                        assert_eq!(8, flag.version);
                        assert!(flag.on);
                    }
                    other => panic!("unexpected item: {:?}", other),
                }
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn parses_segment_delete() {
        let data = r#"{"path": "/segments/old", "version": 11}"#;
        match Message::parse("delete", data).unwrap() {
            Message::Delete { key, item } => {
                assert_eq!("old", key);
                assert!(matches!(
                    item,
                    PatchTarget::Segment(StorageItem::Tombstone(11))
                ));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(Message::parse("put", "not json").is_err());
        assert!(Message::parse("patch", r#"{"path": "/flags/x"}"#).is_err());
        assert!(Message::parse("patch", r#"{"path": "/nowhere/x", "data": {}}"#).is_err());
    }

    #[test]
    fn unknown_event_type_is_skipped_not_failed() {
        assert!(matches!(
            Message::parse("reticulate", "{}").unwrap(),
            Message::Unknown
        ));
    }
}
