//! A single tool invocation within a turn.
//!
//! An invocation is created when the model asks for a tool, announced with a
//! `tool_start` frame, and finished exactly once with either a `tool_result`
//! or a `tool_error` frame carrying the same id.

use super::message::{ChatMessage, ToolCall};
use crate::protocol::Frame;
use crate::tools::result_text;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationStatus {
    Started,
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    /// Frame correlation id: `<request-id>/tool-<n>`
    pub id: String,
    /// Provider call id from the model's request
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    /// Present once the invocation has finished successfully
    pub result: Option<Value>,
    pub status: InvocationStatus,
}

impl ToolInvocation {
    /// Start the `n`th invocation of the turn started by `request_id`.
    pub fn start(request_id: &str, n: usize, call: &ToolCall) -> Self {
        Self {
            id: format!("{request_id}/tool-{n}"),
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            result: None,
            status: InvocationStatus::Started,
        }
    }

    pub fn succeed(&mut self, result: Value) {
        self.result = Some(result);
        self.status = InvocationStatus::Succeeded;
    }

    pub fn fail(&mut self, detail: impl Into<String>) {
        self.status = InvocationStatus::Failed(detail.into());
    }

    pub fn is_finished(&self) -> bool {
        self.status != InvocationStatus::Started
    }

    /// The frame describing the current status.
    pub fn frame(&self) -> Frame {
        match self.status {
            InvocationStatus::Started => Frame::tool_start(&self.id, &self.tool_name, &self.arguments),
            InvocationStatus::Succeeded => Frame::tool_result(
                &self.id,
                &self.tool_name,
                self.result.as_ref().unwrap_or(&Value::Null),
            ),
            InvocationStatus::Failed(ref detail) => {
                Frame::tool_error(&self.id, &self.tool_name, detail)
            }
        }
    }

    /// Summary for the conversation history, once finished.
    pub fn history_entry(&self) -> Option<ChatMessage> {
        let content = match self.status {
            InvocationStatus::Started => return None,
            InvocationStatus::Succeeded => self.result.as_ref().map(result_text).unwrap_or_default(),
            InvocationStatus::Failed(ref detail) => format!("Error: {detail}"),
        };
        Some(ChatMessage::tool(&self.call_id, content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameKind;
    use serde_json::json;

    fn call() -> ToolCall {
        ToolCall {
            id: "call_9".into(),
            name: "read_file".into(),
            arguments: json!({"path": "README.md"}),
        }
    }

    #[test]
    fn ids_derive_from_request() {
        let inv = ToolInvocation::start("req-1", 2, &call());
        assert_eq!(inv.id, "req-1/tool-2");
        assert_eq!(inv.status, InvocationStatus::Started);
        assert!(inv.history_entry().is_none());
        assert_eq!(inv.frame().kind(), &FrameKind::ToolStart);
    }

    #[test]
    fn success_produces_result_frame_and_text_history() {
        let mut inv = ToolInvocation::start("r", 1, &call());
        inv.succeed(json!({"content": [{"type": "text", "text": "# Title"}]}));
        assert!(inv.is_finished());

        let frame = inv.frame();
        assert_eq!(frame.kind(), &FrameKind::ToolResult);
        assert_eq!(frame.id(), Some("r/tool-1"));

        let entry = inv.history_entry().unwrap();
        assert_eq!(entry.content, "# Title");
        assert_eq!(entry.tool_call_id.as_deref(), Some("call_9"));
    }

    #[test]
    fn failure_produces_error_frame_and_error_history() {
        let mut inv = ToolInvocation::start("r", 1, &call());
        inv.fail("no such file");
        assert!(inv.result.is_none());

        let frame = inv.frame();
        assert_eq!(frame.kind(), &FrameKind::ToolError);
        assert_eq!(frame.payload()["error"], "no such file");
        assert_eq!(inv.history_entry().unwrap().content, "Error: no such file");
    }
}
