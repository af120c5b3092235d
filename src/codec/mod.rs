//! Wire format for everything stored on streams and in buckets.
//!
//! A frame is a 4-byte big-endian body length followed by a JSON body. The
//! body is the record's fields plus `schema_version`:
//!
//! ```text
//! [00 00 00 4f] {"schema_version":2,"run_id":"run-1","organization":"o",...}
//! ```
//!
//! # Versions
//!
//! - 2 (current): snake_case keys, written by [`encode`].
//! - 1: no `schema_version`, PascalCase keys. Read through the shapes in
//!   [`legacy`] and upgraded; never written.
//!
//! Unknown fields are ignored. A known field with the wrong JSON type fails
//! the decode, as does a record without a run id.

pub mod legacy;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::retry::{Classify, ErrorKind};
use crate::types::{RunEvent, RunId, RunMetadata, RunPollingTask};

/// Schema version written by [`encode`].
pub const SCHEMA_VERSION: u64 = 2;

const VERSION_FIELD: &str = "schema_version";
const HEADER_LEN: usize = 4;

/// Errors that can occur while decoding a frame.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame truncated: {0} bytes")]
    Truncated(usize),

    #[error("frame declares {declared} body bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("frame body too large: {0} bytes")]
    TooLarge(usize),

    #[error("malformed body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("body is not a JSON object")]
    NotAnObject,

    #[error("unsupported schema version: {0}")]
    UnsupportedVersion(Value),

    #[error("record has no run id")]
    MissingRunId,
}

impl Classify for CodecError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Permanent
    }
}

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// A record that can travel in a frame.
pub trait WireRecord: Serialize + DeserializeOwned {
    /// The version 1 shape of this record.
    type Legacy: DeserializeOwned + Into<Self>;

    fn wire_run_id(&self) -> &RunId;
}

impl WireRecord for RunMetadata {
    type Legacy = legacy::RunMetadataV1;

    fn wire_run_id(&self) -> &RunId {
        &self.run_id
    }
}

impl WireRecord for RunEvent {
    type Legacy = legacy::RunEventV1;

    fn wire_run_id(&self) -> &RunId {
        &self.run_id
    }
}

impl WireRecord for RunPollingTask {
    type Legacy = legacy::RunPollingTaskV1;

    fn wire_run_id(&self) -> &RunId {
        &self.metadata.run_id
    }
}

/// Encodes `record` as a current-version frame.
pub fn encode<T: WireRecord>(record: &T) -> Result<Vec<u8>> {
    let mut body = match serde_json::to_value(record)? {
        Value::Object(map) => map,
        _ => return Err(CodecError::NotAnObject),
    };
    body.insert(VERSION_FIELD.to_string(), Value::from(SCHEMA_VERSION));
    let body = serde_json::to_vec(&body)?;

    let len = u32::try_from(body.len()).map_err(|_| CodecError::TooLarge(body.len()))?;
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decodes a frame of either schema version.
pub fn decode<T: WireRecord>(frame: &[u8]) -> Result<T> {
    let body = split_frame(frame)?;
    let value: Value = serde_json::from_slice(body)?;
    let Value::Object(map) = &value else {
        return Err(CodecError::NotAnObject);
    };

    let record: T = match map.get(VERSION_FIELD) {
        None => serde_json::from_value::<T::Legacy>(value)?.into(),
        Some(v) if v.as_u64() == Some(SCHEMA_VERSION) => serde_json::from_value(value)?,
        Some(v) => return Err(CodecError::UnsupportedVersion(v.clone())),
    };

    if record.wire_run_id().is_empty() {
        return Err(CodecError::MissingRunId);
    }
    Ok(record)
}

fn split_frame(frame: &[u8]) -> Result<&[u8]> {
    let Some((header, body)) = frame.split_first_chunk::<HEADER_LEN>() else {
        return Err(CodecError::Truncated(frame.len()));
    };
    let declared = u32::from_be_bytes(*header) as usize;
    if declared != body.len() {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{arb_polling_task, arb_run_event, arb_run_metadata};
    use crate::types::RunAction;
    use proptest::prelude::*;

    fn frame(body: &str) -> Vec<u8> {
        let mut out = (body.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(body.as_bytes());
        out
    }

    #[test]
    fn frame_header_is_big_endian_body_length() {
        let event = RunEvent::new("run-1", "o", "w", "planning");
        let bytes = encode(&event).unwrap();
        let declared = u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
        assert_eq!(declared, bytes.len() - 4);

        let body: Value = serde_json::from_slice(&bytes[4..]).unwrap();
        assert_eq!(body["schema_version"], 2);
        assert_eq!(body["run_id"], "run-1");
    }

    #[test]
    fn short_and_mismatched_frames_fail() {
        assert!(matches!(
            decode::<RunEvent>(&[0, 0]),
            Err(CodecError::Truncated(2))
        ));

        let mut bytes = encode(&RunEvent::new("run-1", "o", "w", "applied")).unwrap();
        bytes.push(b' ');
        assert!(matches!(
            decode::<RunEvent>(&bytes),
            Err(CodecError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn version_one_event_is_upgraded() {
        let body = r#"{
            "RunID": "run-legacy",
            "Organization": "o",
            "Workspace": "w",
            "NewStatus": "applied",
            "Carrier": {"traceparent": "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"},
            "Metadata": {"RunID": "run-legacy", "Action": "apply", "MRIID": 7, "AutoMerge": true}
        }"#;
        let event: RunEvent = decode(&frame(body)).unwrap();

        assert_eq!(event.run_id, RunId::new("run-legacy"));
        assert_eq!(event.new_status, "applied");
        assert!(event.carrier.contains_key("traceparent"));
        let meta = event.metadata.unwrap();
        assert_eq!(meta.action, RunAction::Apply);
        assert_eq!(meta.mr_iid, 7);
        assert!(meta.auto_merge);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let body = r#"{"schema_version":2,"run_id":"run-1","new_status":"planning","added_later":{"x":1}}"#;
        let event: RunEvent = decode(&frame(body)).unwrap();
        assert_eq!(event.new_status, "planning");
        assert!(event.carrier.is_empty());
    }

    #[test]
    fn type_mismatch_on_known_field_fails() {
        let body = r#"{"schema_version":2,"run_id":"run-1","new_status":42}"#;
        assert!(matches!(
            decode::<RunEvent>(&frame(body)),
            Err(CodecError::Json(_))
        ));

        let legacy = r#"{"RunID":"run-1","MRIID":"seven"}"#;
        assert!(decode::<RunMetadata>(&frame(legacy)).is_err());
    }

    #[test]
    fn missing_run_id_fails() {
        let body = r#"{"schema_version":2,"organization":"o"}"#;
        assert!(matches!(
            decode::<RunMetadata>(&frame(body)),
            Err(CodecError::MissingRunId)
        ));
        assert!(matches!(
            decode::<RunMetadata>(&frame("{}")),
            Err(CodecError::MissingRunId)
        ));
    }

    #[test]
    fn future_version_is_rejected() {
        let body = r#"{"schema_version":3,"run_id":"run-1"}"#;
        assert!(matches!(
            decode::<RunEvent>(&frame(body)),
            Err(CodecError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn garbage_is_not_a_record() {
        assert!(decode::<RunPollingTask>(&frame("not json")).is_err());
        assert!(matches!(
            decode::<RunPollingTask>(&frame("[1,2]")),
            Err(CodecError::NotAnObject)
        ));
    }

    #[test]
    fn codec_errors_are_permanent() {
        assert_eq!(CodecError::MissingRunId.kind(), ErrorKind::Permanent);
    }

    proptest! {
        #[test]
        fn event_frames_roundtrip(event in arb_run_event()) {
            let decoded: RunEvent = decode(&encode(&event).unwrap()).unwrap();
            prop_assert_eq!(decoded, event);
        }

        #[test]
        fn metadata_frames_roundtrip(meta in arb_run_metadata()) {
            let decoded: RunMetadata = decode(&encode(&meta).unwrap()).unwrap();
            prop_assert_eq!(decoded, meta);
        }

        #[test]
        fn task_frames_roundtrip(task in arb_polling_task()) {
            let decoded: RunPollingTask = decode(&encode(&task).unwrap()).unwrap();
            prop_assert_eq!(decoded, task);
        }

        /// Flipping the length header never panics and never decodes.
        #[test]
        fn corrupted_length_is_detected(event in arb_run_event(), delta in 1u32..1000) {
            let mut bytes = encode(&event).unwrap();
            let declared = u32::from_be_bytes(bytes[..4].try_into().unwrap());
            bytes[..4].copy_from_slice(&declared.wrapping_add(delta).to_be_bytes());
            prop_assert!(decode::<RunEvent>(&bytes).is_err());
        }
    }
}
