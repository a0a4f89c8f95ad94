//! Plain-text rendering of frames for line-oriented terminals.

use crate::protocol::{
    BackendStatus, ErrorPayload, Frame, FrameKind, MessagePayload, MessageRole, ToolErrorPayload,
    ToolResultPayload, ToolStartPayload,
};
use crate::tools::result_text;
use serde_json::Value;

/// Longest tool result rendered before truncation, in characters.
const RESULT_PREVIEW: usize = 400;

/// Render a frame as one or more lines of text.
///
/// Returns `None` for frames with nothing to show (requests, unknown kinds,
/// the handshake).
pub fn render(frame: &Frame) -> Option<String> {
    match frame.kind() {
        FrameKind::Message => {
            let message: MessagePayload = frame.payload_as().ok()?;
            Some(match (message.role, message.thinking) {
                (MessageRole::Assistant, true) => format!("(thinking) {}", message.content),
                (MessageRole::Assistant, false) => format!("assistant: {}", message.content),
                (MessageRole::User, _) => format!("you: {}", message.content),
                (MessageRole::System, _) => message.content,
            })
        }
        FrameKind::ToolStart => {
            let start: ToolStartPayload = frame.payload_as().ok()?;
            Some(format!("-> {}({})", start.tool, compact(&start.arguments)))
        }
        FrameKind::ToolResult => {
            let result: ToolResultPayload = frame.payload_as().ok()?;
            Some(format!(
                "<- {}: {}",
                result.tool,
                preview(&result_text(&result.result))
            ))
        }
        FrameKind::ToolError => {
            let error: ToolErrorPayload = frame.payload_as().ok()?;
            Some(format!("!! {} failed: {}", error.tool, error.error))
        }
        FrameKind::Error => {
            let error: ErrorPayload = frame.payload_as().ok()?;
            Some(format!("error: {}", error.message))
        }
        FrameKind::Status => {
            let status: BackendStatus = frame.payload_as().ok()?;
            Some(render_status(&status))
        }
        _ => None,
    }
}

/// Multi-line description of a status snapshot.
pub fn render_status(status: &BackendStatus) -> String {
    let servers = if status.servers.is_empty() {
        "none".to_string()
    } else {
        status.servers.join(", ")
    };
    let activity = match (status.busy, status.current_tool.as_deref()) {
        (_, Some(tool)) => format!("running {tool}"),
        (true, None) => "waiting for model".to_string(),
        (false, None) => "idle".to_string(),
    };
    format!("Model: {}\nServers: {}\nActivity: {}", status.model, servers, activity)
}

fn compact(arguments: &Value) -> String {
    match arguments {
        Value::Null => String::new(),
        Value::Object(map) if map.is_empty() => String::new(),
        other => other.to_string(),
    }
}

fn preview(text: &str) -> String {
    let text = text.trim_end();
    match text.char_indices().nth(RESULT_PREVIEW) {
        Some((cut, _)) => format!("{}... ({} chars)", &text[..cut], text.chars().count()),
        None => text.to_string(),
    }
}
