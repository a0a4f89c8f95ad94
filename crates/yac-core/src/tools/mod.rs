//! Tool server seam.
//!
//! The orchestrator only sees [`ToolHost`]. The concrete host is a
//! [`ToolRegistry`] of MCP servers reached over stdio.

mod mcp;
mod registry;

pub use mcp::{McpServer, MCP_PROTOCOL_VERSION};
pub use registry::ToolRegistry;

use crate::config::McpServerConfig;
use crate::transport::TransportError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use thiserror::Error;

/// A tool advertised by a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the arguments
    #[serde(default)]
    pub input_schema: Value,
    /// Name of the server that provides the tool
    pub server: String,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("no MCP server named '{0}'")]
    UnknownServer(String),

    #[error("MCP server '{0}' is already connected")]
    AlreadyConnected(String),

    #[error("{0} transport not supported")]
    UnsupportedTransport(String),

    #[error("invalid server config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("{server} did not answer {method} within {secs}s")]
    Timeout {
        server: String,
        method: String,
        secs: u64,
    },

    #[error("MCP server '{0}' closed")]
    ServerClosed(String),

    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    /// Failures another attempt may get past.
    pub fn is_retryable(&self) -> bool {
        match self {
            ToolError::Timeout { .. } => true,
            ToolError::Transport(TransportError::EmbeddedNewline) => false,
            ToolError::Transport(_) => true,
            _ => false,
        }
    }
}

const PERMISSION_MARKERS: &[&str] = &[
    "permission denied",
    "access denied",
    "not permitted",
    "insufficient privileges",
];

const MISSING_PATH_MARKERS: &[&str] = &[
    "directory not found",
    "no such directory",
    "no such file or directory",
    "path does not exist",
];

/// A recovery suggestion for a failed call, judged from its error text.
pub fn recovery_hint(tool: &str, error: &str) -> Option<&'static str> {
    let error = error.to_ascii_lowercase();
    let tool = tool.to_ascii_lowercase();
    if PERMISSION_MARKERS.iter().any(|m| error.contains(m)) {
        if tool.contains("write") || tool.contains("edit") {
            return Some("check the file permissions and that the target location is writable");
        }
        return Some("check the file and directory permissions");
    }
    if MISSING_PATH_MARKERS.iter().any(|m| error.contains(m)) {
        return Some("use list_directory to explore the available paths");
    }
    None
}

/// Access to tools for the orchestrator.
pub trait ToolHost: Send {
    /// Names of connected servers, sorted.
    fn server_names(&self) -> Vec<String>;

    /// Tools from every server, or from one server.
    fn tools(&self, server: Option<&str>) -> Vec<ToolSpec>;

    fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> impl Future<Output = Result<Value, ToolError>> + Send;

    /// Connect a server. Returns the number of tools it exposes.
    fn add_server(
        &mut self,
        name: &str,
        config: McpServerConfig,
    ) -> impl Future<Output = Result<usize, ToolError>> + Send;

    fn remove_server(&mut self, name: &str) -> impl Future<Output = Result<(), ToolError>> + Send;

    fn shutdown(&mut self) -> impl Future<Output = ()> + Send;
}

/// Flatten a tool result to text for the conversation history.
///
/// MCP results carry a `content` array; text parts are joined with newlines
/// and other parts are kept as JSON.
pub fn result_text(result: &Value) -> String {
    match result {
        Value::String(text) => text.clone(),
        Value::Object(map) => match map.get("content").and_then(Value::as_array) {
            Some(parts) => parts
                .iter()
                .map(|part| match part.get("type").and_then(Value::as_str) {
                    Some("text") => part
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    _ => part.to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
            None => result.to_string(),
        },
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn joins_text_parts() {
        let result = json!({"content": [
            {"type": "text", "text": "a.txt"},
            {"type": "text", "text": "b.txt"}
        ]});
        assert_eq!(result_text(&result), "a.txt\nb.txt");
    }

    #[test]
    fn keeps_non_text_parts_as_json() {
        let result = json!({"content": [{"type": "image", "data": "..."}]});
        assert_eq!(result_text(&result), r#"{"data":"...","type":"image"}"#);
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        let timeout = ToolError::Timeout {
            server: "fs".into(),
            method: "tools/call".into(),
            secs: 30,
        };
        assert!(timeout.is_retryable());
        assert!(ToolError::Transport(TransportError::Closed).is_retryable());
        assert!(!ToolError::Transport(TransportError::EmbeddedNewline).is_retryable());
        assert!(!ToolError::Failed("nope".into()).is_retryable());
        assert!(!ToolError::Rpc {
            code: -32602,
            message: "bad params".into()
        }
        .is_retryable());
    }

    #[test]
    fn hints_follow_the_error_text() {
        assert_eq!(
            recovery_hint("read_file", "EACCES: Permission denied"),
            Some("check the file and directory permissions")
        );
        assert!(recovery_hint("write_file", "access denied")
            .unwrap()
            .contains("writable"));
        assert!(recovery_hint("list_directory", "ENOENT: no such file or directory")
            .unwrap()
            .contains("list_directory"));
        assert_eq!(recovery_hint("read_file", "disk on fire"), None);
    }

    #[test]
    fn plain_values() {
        assert_eq!(result_text(&json!("done")), "done");
        assert_eq!(result_text(&Value::Null), "");
        assert_eq!(result_text(&json!({"ok": true})), r#"{"ok":true}"#);
    }
}
