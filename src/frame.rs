//! Frame codec: decodes textual, binary, and compressed server payloads
//! into a typed [`Frame`] variant.

use crate::error::LiveStackError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    State,
    Append,
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// View-level ordering supplied by the server on subscription acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortConfig {
    pub field: Vec<String>,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityOp {
    Create,
    Upsert,
    Patch,
    Delete,
}

/// A single mutation addressed to one entity within a view.
#[derive(Debug, Clone)]
pub struct EntityFrame {
    pub mode: Mode,
    pub view: String,
    pub op: EntityOp,
    pub key: String,
    pub data: Value,
    /// Dotted field paths whose array values concatenate during a patch.
    pub append: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntity {
    pub key: String,
    pub data: Value,
}

/// Bulk initial load for a view.
#[derive(Debug, Clone)]
pub struct SnapshotFrame {
    pub mode: Mode,
    pub view: String,
    pub entities: Vec<SnapshotEntity>,
}

/// Server acknowledgement of a subscription, optionally carrying a sort.
#[derive(Debug, Clone)]
pub struct SubscribedFrame {
    pub view: String,
    pub sort: Option<SortConfig>,
}

/// One atomic server-to-client message.
#[derive(Debug, Clone)]
pub enum Frame {
    Entity(EntityFrame),
    Snapshot(SnapshotFrame),
    Subscribed(SubscribedFrame),
}

impl Frame {
    pub fn view(&self) -> &str {
        match self {
            Frame::Entity(f) => &f.view,
            Frame::Snapshot(f) => &f.view,
            Frame::Subscribed(f) => &f.view,
        }
    }
}

/// Wire shape before op-dispatch. The view path travels in the `entity`
/// field for entity and snapshot frames and in `view` for acknowledgements.
#[derive(Deserialize)]
struct RawFrame {
    mode: Option<Mode>,
    entity: Option<String>,
    view: Option<String>,
    op: Option<String>,
    key: Option<Value>,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    append: Vec<String>,
    sort: Option<SortConfig>,
}

#[derive(Deserialize)]
struct CompressedEnvelope {
    compressed: String,
    data: String,
}

/// Gzip magic bytes, used to detect raw-gzip binary frames.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == GZIP_MAGIC[0] && data[1] == GZIP_MAGIC[1]
}

fn gunzip(data: &[u8]) -> Result<String, LiveStackError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = String::new();
    decoder
        .read_to_string(&mut out)
        .map_err(|e| LiveStackError::Decode(format!("gzip inflate failed: {}", e)))?;
    Ok(out)
}

/// Decode a textual payload into a frame.
pub fn decode_text(text: &str) -> Result<Frame, LiveStackError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| LiveStackError::Decode(format!("malformed JSON: {}", e)))?;
    decode_value(value)
}

/// Decode a binary payload. Raw gzip data (magic bytes 0x1f 0x8b) is
/// inflated first; anything else is treated as UTF-8 JSON.
pub fn decode_binary(bytes: &[u8]) -> Result<Frame, LiveStackError> {
    if is_gzip(bytes) {
        return decode_text(&gunzip(bytes)?);
    }
    let text = std::str::from_utf8(bytes)
        .map_err(|e| LiveStackError::Decode(format!("not UTF-8: {}", e)))?;
    decode_text(text)
}

fn decode_value(value: Value) -> Result<Frame, LiveStackError> {
    if let Ok(envelope) = serde_json::from_value::<CompressedEnvelope>(value.clone()) {
        if envelope.compressed == "gzip" {
            let compressed = BASE64
                .decode(&envelope.data)
                .map_err(|e| LiveStackError::Decode(format!("bad base64: {}", e)))?;
            return decode_text(&gunzip(&compressed)?);
        }
        return Err(LiveStackError::Decode(format!(
            "unsupported compression: {}",
            envelope.compressed
        )));
    }

    let raw: RawFrame = serde_json::from_value(value)
        .map_err(|e| LiveStackError::Decode(format!("unrecognized frame shape: {}", e)))?;
    validate(raw)
}

fn validate(raw: RawFrame) -> Result<Frame, LiveStackError> {
    let op = raw
        .op
        .ok_or_else(|| LiveStackError::InvalidFrame("missing op".into()))?;

    if op == "subscribed" {
        let view = raw
            .view
            .or(raw.entity)
            .ok_or_else(|| LiveStackError::InvalidFrame("subscribed frame missing view".into()))?;
        return Ok(Frame::Subscribed(SubscribedFrame {
            view,
            sort: raw.sort,
        }));
    }

    let view = raw
        .entity
        .or(raw.view)
        .ok_or_else(|| LiveStackError::InvalidFrame("missing entity".into()))?;
    let mode = raw
        .mode
        .ok_or_else(|| LiveStackError::InvalidFrame("missing mode".into()))?;

    if op == "snapshot" {
        let Value::Array(items) = raw.data else {
            return Err(LiveStackError::InvalidFrame(
                "snapshot data must be an array".into(),
            ));
        };
        let entities = items
            .into_iter()
            .map(serde_json::from_value::<SnapshotEntity>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| LiveStackError::InvalidFrame(format!("bad snapshot entry: {}", e)))?;
        return Ok(Frame::Snapshot(SnapshotFrame {
            mode,
            view,
            entities,
        }));
    }

    let op = match op.as_str() {
        "create" => EntityOp::Create,
        "upsert" => EntityOp::Upsert,
        "patch" => EntityOp::Patch,
        "delete" => EntityOp::Delete,
        other => {
            return Err(LiveStackError::InvalidFrame(format!(
                "unknown op: {}",
                other
            )))
        }
    };

    let key = match raw.key {
        Some(Value::String(k)) => k,
        Some(_) => {
            return Err(LiveStackError::InvalidFrame(
                "entity frame key must be a string".into(),
            ))
        }
        None => return Err(LiveStackError::InvalidFrame("missing key".into())),
    };

    Ok(Frame::Entity(EntityFrame {
        mode,
        view,
        op,
        key,
        data: raw.data,
        append: raw.append,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn decodes_entity_frame() {
        let json = r#"{"mode":"list","entity":"Round/list","op":"upsert","key":"7","data":{"n":1}}"#;
        let frame = decode_text(json).unwrap();
        match frame {
            Frame::Entity(f) => {
                assert_eq!(f.view, "Round/list");
                assert_eq!(f.op, EntityOp::Upsert);
                assert_eq!(f.key, "7");
                assert!(f.append.is_empty());
            }
            other => panic!("expected entity frame, got {:?}", other),
        }
    }

    #[test]
    fn decodes_snapshot_frame() {
        let json = r#"{"mode":"list","entity":"Round/list","op":"snapshot","data":[{"key":"1","data":{"id":1}},{"key":"2","data":{"id":2}}]}"#;
        match decode_text(json).unwrap() {
            Frame::Snapshot(f) => {
                assert_eq!(f.view, "Round/list");
                assert_eq!(f.entities.len(), 2);
                assert_eq!(f.entities[1].key, "2");
            }
            other => panic!("expected snapshot frame, got {:?}", other),
        }
    }

    #[test]
    fn decodes_subscribed_frame_with_sort() {
        let json = r#"{"op":"subscribed","view":"Round/list","sort":{"field":["t"],"order":"desc"}}"#;
        match decode_text(json).unwrap() {
            Frame::Subscribed(f) => {
                assert_eq!(f.view, "Round/list");
                let sort = f.sort.unwrap();
                assert_eq!(sort.field, vec!["t".to_string()]);
                assert_eq!(sort.order, SortOrder::Desc);
            }
            other => panic!("expected subscribed frame, got {:?}", other),
        }
    }

    #[test]
    fn decodes_base64_gzip_envelope() {
        let original = r#"{"mode":"list","entity":"Round/list","op":"snapshot","data":[{"key":"1","data":{"id":1}}]}"#;
        let envelope = format!(
            r#"{{"compressed":"gzip","data":"{}"}}"#,
            BASE64.encode(gzip(original.as_bytes()))
        );
        match decode_text(&envelope).unwrap() {
            Frame::Snapshot(f) => assert_eq!(f.entities.len(), 1),
            other => panic!("expected snapshot frame, got {:?}", other),
        }
    }

    #[test]
    fn decodes_raw_gzip_binary() {
        let original = r#"{"mode":"state","entity":"Round/state","op":"upsert","key":"a","data":{}}"#;
        let frame = decode_binary(&gzip(original.as_bytes())).unwrap();
        assert_eq!(frame.view(), "Round/state");
    }

    #[test]
    fn rejects_unknown_op() {
        let json = r#"{"mode":"list","entity":"Round/list","op":"merge","key":"a","data":{}}"#;
        assert!(matches!(
            decode_text(json),
            Err(LiveStackError::InvalidFrame(_))
        ));
    }

    #[test]
    fn rejects_missing_mode_and_key() {
        let missing_mode = r#"{"entity":"Round/list","op":"upsert","key":"a","data":{}}"#;
        assert!(matches!(
            decode_text(missing_mode),
            Err(LiveStackError::InvalidFrame(_))
        ));

        let missing_key = r#"{"mode":"list","entity":"Round/list","op":"upsert","data":{}}"#;
        assert!(matches!(
            decode_text(missing_key),
            Err(LiveStackError::InvalidFrame(_))
        ));

        let numeric_key = r#"{"mode":"list","entity":"Round/list","op":"upsert","key":5,"data":{}}"#;
        assert!(matches!(
            decode_text(numeric_key),
            Err(LiveStackError::InvalidFrame(_))
        ));
    }

    #[test]
    fn rejects_non_array_snapshot() {
        let json = r#"{"mode":"list","entity":"Round/list","op":"snapshot","data":{"key":"1"}}"#;
        assert!(matches!(
            decode_text(json),
            Err(LiveStackError::InvalidFrame(_))
        ));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            decode_text("{nope"),
            Err(LiveStackError::Decode(_))
        ));
    }
}
