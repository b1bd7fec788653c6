//! Progress channel payloads and parser.
//!
//! The engine emits bare progress objects
//! `{"fps":..,"frame":..,"totalFrames":..,"eta":..,"status":..}` and
//! control messages tagged with a `"type"` field (`heartbeat`,
//! `auth_required`). Over the event stream, control messages may instead
//! arrive as named SSE events with an empty body.

use reelctl_core::validation::{parse_json_safely, ValidationError, DEFAULT_MAX_JSON_DEPTH};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::transport::Frame;

/// One progress report from the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    /// Processing rate in frames per second.
    #[serde(default)]
    pub fps: f64,
    #[serde(deserialize_with = "frame_count")]
    pub frame: u64,
    #[serde(deserialize_with = "frame_count")]
    pub total_frames: u64,
    /// Estimated seconds remaining.
    #[serde(default)]
    pub eta: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Frame counters arrive as JSON numbers, sometimes with a fractional part
/// (`12.0`). Negative or non-finite values are rejected.
fn frame_count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let raw = f64::deserialize(deserializer)?;
    if !raw.is_finite() || raw < 0.0 {
        return Err(serde::de::Error::custom(format!("invalid frame count {raw}")));
    }
    Ok(raw.floor() as u64)
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Progress(ProgressUpdate),
    Heartbeat,
    AuthRequired,
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Unknown message type '{0}'")]
    UnknownType(String),
}

/// Decode a frame. Every body goes through the depth-bounded parser first.
pub fn parse_frame(frame: &Frame) -> Result<ChannelMessage, MessageError> {
    match frame.event.as_deref() {
        Some("heartbeat") if frame.data.trim().is_empty() => return Ok(ChannelMessage::Heartbeat),
        Some("auth_required") if frame.data.trim().is_empty() => {
            return Ok(ChannelMessage::AuthRequired)
        }
        _ => {}
    }

    let value = parse_json_safely(&frame.data, DEFAULT_MAX_JSON_DEPTH)?;
    let Value::Object(mut object) = value else {
        return Err(MessageError::NotAnObject);
    };

    let kind = match (object.remove("type"), frame.event.as_deref()) {
        (Some(Value::String(kind)), _) => kind,
        (Some(_), _) => return Err(MessageError::UnknownType("<non-string>".to_string())),
        (None, Some(event)) if event != "message" => event.to_string(),
        (None, _) => "progress".to_string(),
    };

    match kind.as_str() {
        "progress" => {
            // Tagged messages may nest the payload under "data".
            let body = match object.remove("data") {
                Some(data @ Value::Object(_)) => data,
                _ => Value::Object(object),
            };
            Ok(ChannelMessage::Progress(serde_json::from_value(body)?))
        }
        "heartbeat" => Ok(ChannelMessage::Heartbeat),
        "auth_required" => Ok(ChannelMessage::AuthRequired),
        other => Err(MessageError::UnknownType(other.to_string())),
    }
}
