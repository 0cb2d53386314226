use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::snapshot::escape_segment;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// One RFC 6902 operation restricted to the shapes the stream server emits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Add { path: String, value: Value },
    Replace { path: String, value: Value },
    Remove { path: String },
}

impl PatchOperation {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self::Add {
            path: path.into(),
            value,
        }
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self::Replace {
            path: path.into(),
            value,
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self::Remove { path: path.into() }
    }

    pub fn path(&self) -> &str {
        match self {
            PatchOperation::Add { path, .. }
            | PatchOperation::Replace { path, .. }
            | PatchOperation::Remove { path } => path,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PatchOperation::Add { .. } => "add",
            PatchOperation::Replace { .. } => "replace",
            PatchOperation::Remove { .. } => "remove",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamMsg {
    Patch(Vec<PatchOperation>),
    /// The initial snapshot has been fully delivered.
    Ready,
    /// The server has nothing more to send on this stream.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrameMode {
    #[default]
    JsonPatch,
    /// Every frame is a bare record appended to the collection.
    AppendRecords,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("unsupported frame shape: {0}")]
    UnsupportedShape(String),
    #[error("frame encode failed: {0}")]
    Encode(String),
}

pub struct FrameDecoder {
    mode: FrameMode,
    collection: String,
    max_frame_bytes: usize,
    next_record: u64,
}

impl FrameDecoder {
    pub fn new(mode: FrameMode, collection: impl Into<String>, max_frame_bytes: usize) -> Self {
        Self {
            mode,
            collection: collection.into(),
            max_frame_bytes,
            next_record: 0,
        }
    }

    pub fn decode(&mut self, text: &str) -> Result<StreamMsg, FrameError> {
        if text.len() > self.max_frame_bytes {
            return Err(FrameError::OversizedFrame {
                size: text.len(),
                max: self.max_frame_bytes,
            });
        }
        match self.mode {
            FrameMode::JsonPatch => decode_patch_frame(text),
            FrameMode::AppendRecords => {
                let value: Value =
                    serde_json::from_str(text).map_err(|err| FrameError::Decode(err.to_string()))?;
                if is_finished_marker(&value) {
                    return Ok(StreamMsg::Finished);
                }
                let path = format!(
                    "/{}/{}",
                    escape_segment(&self.collection),
                    self.next_record
                );
                self.next_record += 1;
                Ok(StreamMsg::Patch(vec![PatchOperation::add(path, value)]))
            }
        }
    }
}

pub fn decode_patch_frame(text: &str) -> Result<StreamMsg, FrameError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| FrameError::Decode(err.to_string()))?;
    match value {
        Value::Array(_) => parse_ops(value).map(StreamMsg::Patch),
        Value::Object(mut map) => {
            if let Some(ops) = map.remove("JsonPatch") {
                return parse_ops(ops).map(StreamMsg::Patch);
            }
            if map.get("finished").and_then(Value::as_bool) == Some(true) {
                return Ok(StreamMsg::Finished);
            }
            if map.contains_key("Ready") {
                return Ok(StreamMsg::Ready);
            }
            if map.contains_key("op") {
                let op: PatchOperation = serde_json::from_value(Value::Object(map))
                    .map_err(|err| FrameError::Decode(err.to_string()))?;
                return Ok(StreamMsg::Patch(vec![op]));
            }
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            Err(FrameError::UnsupportedShape(format!(
                "object with keys [{}]",
                keys.join(", ")
            )))
        }
        other => Err(FrameError::UnsupportedShape(json_kind(&other).to_string())),
    }
}

pub fn encode_patch_frame(ops: &[PatchOperation]) -> Result<String, FrameError> {
    serde_json::to_string(&serde_json::json!({ "JsonPatch": ops }))
        .map_err(|err| FrameError::Encode(err.to_string()))
}

pub fn finished_frame() -> String {
    r#"{"finished":true}"#.to_string()
}

pub fn ready_frame() -> String {
    r#"{"Ready":true}"#.to_string()
}

fn parse_ops(value: Value) -> Result<Vec<PatchOperation>, FrameError> {
    serde_json::from_value(value).map_err(|err| FrameError::Decode(err.to_string()))
}

fn is_finished_marker(value: &Value) -> bool {
    value
        .as_object()
        .map(|map| map.len() == 1 && map.get("finished").and_then(Value::as_bool) == Some(true))
        .unwrap_or(false)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
