//! Wire frames exchanged between the frontend and the backend.
//!
//! Every frame is one JSON object on one line:
//!
//! ```text
//! {"kind":"tool_start","id":"4f1c…/tool-1","payload":{"tool":"list_directory","arguments":{}},"produced_at":"2026-02-04T10:15:30.123Z"}
//! ```
//!
//! Frames are immutable once built. The typed payload structs below describe the
//! `payload` object for each known kind; [`Frame::payload_as`] converts back.

pub mod codec;

pub use codec::{
    decode, encode, CodecError, DecodeFailure, FrameCodec, JsonCodec, LineBuffer, LineCodec,
};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// The kind of a frame.
///
/// Serialized as its snake_case wire name. Kinds this build does not know
/// survive decoding as [`FrameKind::Other`] so they can reach the catch-all sink.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FrameKind {
    Connected,
    Status,
    Message,
    ToolStart,
    ToolResult,
    ToolError,
    Error,
    UserMessage,
    Command,
    StatusRequest,
    Other(String),
}

impl FrameKind {
    pub fn as_str(&self) -> &str {
        match self {
            FrameKind::Connected => "connected",
            FrameKind::Status => "status",
            FrameKind::Message => "message",
            FrameKind::ToolStart => "tool_start",
            FrameKind::ToolResult => "tool_result",
            FrameKind::ToolError => "tool_error",
            FrameKind::Error => "error",
            FrameKind::UserMessage => "user_message",
            FrameKind::Command => "command",
            FrameKind::StatusRequest => "status_request",
            FrameKind::Other(name) => name,
        }
    }

    /// Whether this kind is part of the protocol.
    pub fn is_known(&self) -> bool {
        !matches!(self, FrameKind::Other(_))
    }
}

impl From<String> for FrameKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "connected" => FrameKind::Connected,
            "status" => FrameKind::Status,
            "message" => FrameKind::Message,
            "tool_start" => FrameKind::ToolStart,
            "tool_result" => FrameKind::ToolResult,
            "tool_error" => FrameKind::ToolError,
            "error" => FrameKind::Error,
            "user_message" => FrameKind::UserMessage,
            "command" => FrameKind::Command,
            "status_request" => FrameKind::StatusRequest,
            _ => FrameKind::Other(value),
        }
    }
}

impl From<&str> for FrameKind {
    fn from(value: &str) -> Self {
        FrameKind::from(value.to_string())
    }
}

impl From<FrameKind> for String {
    fn from(kind: FrameKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    kind: FrameKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default)]
    payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    produced_at: Option<DateTime<Utc>>,
}

impl Frame {
    /// Build an unstamped frame. Frontend requests use this.
    pub fn new(kind: FrameKind, id: Option<String>, payload: Value) -> Self {
        Self {
            kind,
            id,
            payload,
            produced_at: None,
        }
    }

    /// Build a frame stamped with the current time. Backend output uses this.
    pub fn stamped(kind: FrameKind, id: Option<String>, payload: Value) -> Self {
        Self {
            kind,
            id,
            payload,
            produced_at: Some(Utc::now()),
        }
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn produced_at(&self) -> Option<DateTime<Utc>> {
        self.produced_at
    }

    /// Deserialize the payload into one of the typed payload structs.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| CodecError::Payload {
            kind: self.kind.to_string(),
            source,
        })
    }

    // ------------------------------------------------------------------
    // Backend → frontend
    // ------------------------------------------------------------------

    /// The handshake frame. Always the first frame a backend writes.
    pub fn connected() -> Self {
        Self::stamped(FrameKind::Connected, None, Value::Null)
    }

    pub fn status(id: Option<&str>, status: &BackendStatus) -> Self {
        Self::stamped(
            FrameKind::Status,
            id.map(str::to_string),
            serde_json::to_value(status).unwrap_or_default(),
        )
    }

    pub fn message(id: Option<&str>, role: MessageRole, content: &str, thinking: bool) -> Self {
        let payload = MessagePayload {
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
            thinking,
        };
        Self::stamped(
            FrameKind::Message,
            id.map(str::to_string),
            serde_json::to_value(payload).unwrap_or_default(),
        )
    }

    pub fn tool_start(id: &str, tool: &str, arguments: &Value) -> Self {
        Self::stamped(
            FrameKind::ToolStart,
            Some(id.to_string()),
            json!({ "tool": tool, "arguments": arguments }),
        )
    }

    pub fn tool_result(id: &str, tool: &str, result: &Value) -> Self {
        Self::stamped(
            FrameKind::ToolResult,
            Some(id.to_string()),
            json!({ "tool": tool, "result": result }),
        )
    }

    pub fn tool_error(id: &str, tool: &str, error: &str) -> Self {
        Self::stamped(
            FrameKind::ToolError,
            Some(id.to_string()),
            json!({ "tool": tool, "error": error }),
        )
    }

    pub fn error(id: Option<&str>, message: &str) -> Self {
        Self::stamped(
            FrameKind::Error,
            id.map(str::to_string),
            json!({ "message": message }),
        )
    }

    // ------------------------------------------------------------------
    // Frontend → backend
    // ------------------------------------------------------------------

    pub fn user_message(id: &str, content: &str) -> Self {
        Self::new(
            FrameKind::UserMessage,
            Some(id.to_string()),
            json!({ "content": content }),
        )
    }

    pub fn command(id: &str, command: &str) -> Self {
        Self::new(
            FrameKind::Command,
            Some(id.to_string()),
            json!({ "command": command }),
        )
    }

    pub fn status_request(id: &str) -> Self {
        Self::new(FrameKind::StatusRequest, Some(id.to_string()), Value::Null)
    }
}

/// Snapshot of backend session state carried by `status` frames.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStatus {
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub busy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_tool: Option<String>,
}

/// Author of a `message` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(rename = "type")]
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Intermediate assistant text produced alongside tool calls.
    #[serde(default)]
    pub thinking: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStartPayload {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultPayload {
    pub tool: String,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolErrorPayload {
    pub tool: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessagePayload {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    mod frame_kind {
        use super::*;

        #[test]
        fn known_kinds_round_trip_through_wire_names() {
            for name in [
                "connected",
                "status",
                "message",
                "tool_start",
                "tool_result",
                "tool_error",
                "error",
                "user_message",
                "command",
                "status_request",
            ] {
                let kind = FrameKind::from(name);
                assert!(kind.is_known(), "{name} should be known");
                assert_eq!(kind.as_str(), name);
            }
        }

        #[test]
        fn unknown_kind_is_preserved() {
            let kind = FrameKind::from("progress");
            assert_eq!(kind, FrameKind::Other("progress".to_string()));
            assert!(!kind.is_known());
            assert_eq!(kind.to_string(), "progress");
        }
    }

    mod constructors {
        use super::*;

        #[test]
        fn backend_frames_are_stamped() {
            assert!(Frame::connected().produced_at().is_some());
            assert!(Frame::error(None, "boom").produced_at().is_some());
        }

        #[test]
        fn frontend_frames_are_not_stamped() {
            let frame = Frame::user_message("abc", "hello");
            assert!(frame.produced_at().is_none());
            assert_eq!(frame.id(), Some("abc"));
            assert_eq!(frame.payload()["content"], "hello");
        }

        #[test]
        fn status_reply_carries_request_id() {
            let status = BackendStatus {
                servers: vec!["filesystem".into()],
                model: "o3-mini".into(),
                busy: true,
                current_tool: Some("read_file".into()),
            };
            let frame = Frame::status(Some("req-1"), &status);
            assert_eq!(frame.kind(), &FrameKind::Status);
            assert_eq!(frame.id(), Some("req-1"));
            assert_eq!(frame.payload_as::<BackendStatus>().unwrap(), status);
        }

        #[test]
        fn message_payload_uses_type_for_role() {
            let frame = Frame::message(Some("m1"), MessageRole::Assistant, "hi", true);
            assert_eq!(frame.payload()["type"], "assistant");
            let payload: MessagePayload = frame.payload_as().unwrap();
            assert!(payload.thinking);
            assert_eq!(payload.content, "hi");
        }

        #[test]
        fn tool_frames_share_the_invocation_id() {
            let args = json!({"path": "."});
            let start = Frame::tool_start("r/tool-1", "list_directory", &args);
            let done = Frame::tool_result("r/tool-1", "list_directory", &json!("a\nb"));
            assert_eq!(start.id(), done.id());
            let payload: ToolStartPayload = start.payload_as().unwrap();
            assert_eq!(payload.arguments, args);
        }

        #[test]
        fn payload_mismatch_is_an_error() {
            let frame = Frame::error(None, "boom");
            let err = frame.payload_as::<ToolErrorPayload>().unwrap_err();
            assert!(err.to_string().contains("error"));
        }
    }
}
