//! MCP client over a stdio channel.
//!
//! Messages are newline-delimited JSON-RPC 2.0. Requests carry numeric ids;
//! a router task matches responses to waiting requests and ignores
//! notifications. Requests from the server are answered: `ping` with an empty
//! result, anything else with "method not found". When the server exits every
//! waiting request fails.

use super::{result_text, ToolError, ToolSpec};
use crate::config::{McpServerConfig, McpTransport};
use crate::protocol::JsonCodec;
use crate::transport::{Channel, ChannelEvent, ChannelEvents, ChannelSpec};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

const CLOSE_GRACE: Duration = Duration::from_secs(2);

const METHOD_NOT_FOUND: i64 = -32601;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

fn lock(pending: &Pending) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Value>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// One connected MCP server.
pub struct McpServer {
    name: String,
    channel: Arc<Channel>,
    pending: Pending,
    next_id: AtomicU64,
    timeout: Duration,
    tools: Vec<ToolSpec>,
    router: JoinHandle<()>,
}

impl McpServer {
    /// Spawn the server described by `config` and complete the MCP handshake.
    pub async fn connect(name: &str, config: &McpServerConfig) -> Result<Self, ToolError> {
        config
            .validate(name)
            .map_err(|e| ToolError::InvalidConfig(e.to_string()))?;
        if config.transport != McpTransport::Stdio {
            return Err(ToolError::UnsupportedTransport(config.transport.to_string()));
        }

        let command = config.full_command();
        let Some((program, args)) = command.split_first() else {
            return Err(ToolError::InvalidConfig(format!("{name}: empty command")));
        };
        let mut spec = ChannelSpec::new(program.clone(), args.to_vec());
        for (key, value) in &config.env {
            spec = spec.env(key, value);
        }

        log::info!("Starting MCP server '{}': {}", name, command.join(" "));
        let (channel, events) = Channel::open(spec, JsonCodec)?;
        Self::handshake(name, channel, events, Duration::from_secs(config.timeout_secs)).await
    }

    /// Complete the MCP handshake over an already-open channel.
    pub async fn handshake(
        name: &str,
        channel: Channel,
        events: ChannelEvents<Value>,
        timeout: Duration,
    ) -> Result<Self, ToolError> {
        let pending: Pending = Arc::default();
        let channel = Arc::new(channel);
        let router = tokio::spawn(route_responses(
            name.to_string(),
            events,
            pending.clone(),
            Arc::downgrade(&channel),
        ));
        let mut server = Self {
            name: name.to_string(),
            channel,
            pending,
            next_id: AtomicU64::new(1),
            timeout,
            tools: Vec::new(),
            router,
        };

        match server.initialize().await {
            Ok(()) => Ok(server),
            Err(e) => {
                log::warn!("MCP server '{}' failed to initialize: {}", name, e);
                server.close().await;
                Err(e)
            }
        }
    }

    async fn initialize(&mut self) -> Result<(), ToolError> {
        let info = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": "yac", "version": env!("CARGO_PKG_VERSION")},
                }),
            )
            .await?;
        log::debug!(
            "MCP server '{}' is {}",
            self.name,
            info.pointer("/serverInfo/name")
                .and_then(Value::as_str)
                .unwrap_or("unnamed")
        );
        self.notify("notifications/initialized", json!({})).await?;

        let listed = self.request("tools/list", json!({})).await?;
        self.tools = listed
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|tool| parse_tool(&self.name, tool))
                    .collect()
            })
            .unwrap_or_default();
        log::info!(
            "MCP server '{}' ready with {} tools",
            self.name,
            self.tools.len()
        );
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tools(&self) -> &[ToolSpec] {
        &self.tools
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }

    /// Call a tool. Results flagged `isError` become [`ToolError::Failed`].
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };
        let result = self
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
            return Err(ToolError::Failed(result_text(&result)));
        }
        Ok(result)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ToolError> {
        if self.channel.exit_status().is_some() {
            return Err(ToolError::ServerClosed(self.name.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        // The router clears pending requests after the exit status is set.
        if self.channel.exit_status().is_some() {
            lock(&self.pending).remove(&id);
            return Err(ToolError::ServerClosed(self.name.clone()));
        }

        let message = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        if let Err(e) = self.channel.write_line(&message.to_string()).await {
            lock(&self.pending).remove(&id);
            return Err(e.into());
        }

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(ToolError::ServerClosed(self.name.clone())),
            Err(_) => {
                lock(&self.pending).remove(&id);
                return Err(ToolError::Timeout {
                    server: self.name.clone(),
                    method: method.to_string(),
                    secs: self.timeout.as_secs(),
                });
            }
        };

        if let Some(error) = response.get("error") {
            return Err(ToolError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), ToolError> {
        let message = json!({"jsonrpc": "2.0", "method": method, "params": params});
        self.channel.write_line(&message.to_string()).await?;
        Ok(())
    }

    /// Close stdin and wait briefly for the server to exit.
    pub async fn close(self) {
        log::debug!("Stopping MCP server '{}'", self.name);
        self.channel.close(CLOSE_GRACE).await;
        self.router.abort();
    }
}

fn parse_tool(server: &str, tool: &Value) -> Option<ToolSpec> {
    Some(ToolSpec {
        name: tool.get("name")?.as_str()?.to_string(),
        description: tool
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        input_schema: tool
            .get("inputSchema")
            .cloned()
            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        server: server.to_string(),
    })
}

async fn route_responses(
    name: String,
    mut events: ChannelEvents<Value>,
    pending: Pending,
    channel: Weak<Channel>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Item(message) => {
                if let (Some(id), Some(method)) = (
                    message.get("id"),
                    message.get("method").and_then(Value::as_str),
                ) {
                    answer_server_request(&name, &channel, id, method).await;
                    continue;
                }
                let id = message.get("id").and_then(Value::as_u64);
                let is_response = message.get("result").is_some() || message.get("error").is_some();
                match id {
                    Some(id) if is_response => {
                        let waiter = lock(&pending).remove(&id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(message);
                            }
                            None => log::debug!("[{}] response to unknown request {}", name, id),
                        }
                    }
                    _ => log::debug!(
                        "[{}] ignoring {}",
                        name,
                        message
                            .get("method")
                            .and_then(Value::as_str)
                            .unwrap_or("message")
                    ),
                }
            }
            ChannelEvent::Diagnostic(text) => log::debug!("[{}] {}", name, text),
            ChannelEvent::TransportError(e) => log::warn!("[{}] transport error: {}", name, e),
            ChannelEvent::Closed(exit) => {
                log::info!("MCP server '{}' exited (code {:?})", name, exit.code);
                break;
            }
        }
    }
    // Dropping the senders fails every outstanding request.
    lock(&pending).clear();
}

async fn answer_server_request(name: &str, channel: &Weak<Channel>, id: &Value, method: &str) {
    let reply = match method {
        "ping" => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
        other => {
            log::debug!("[{}] rejecting server request {}", name, other);
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": METHOD_NOT_FOUND, "message": format!("method not found: {other}")},
            })
        }
    };
    let Some(channel) = channel.upgrade() else {
        return;
    };
    if let Err(e) = channel.write_line(&reply.to_string()).await {
        log::warn!("[{}] failed to answer {}: {}", name, method, e);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::logging::TraceLog;
    use crate::transport::DiagnosticPolicy;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// A scripted MCP server on the far end of a duplex stream.
    ///
    /// Tools: `echo` returns its arguments as text, `fail` returns an
    /// `isError` result, `hang` never answers. The unlisted `ping_me` sends
    /// the client a `ping` and an unsupported request, then returns the two
    /// replies as a JSON array.
    pub(crate) async fn fake_server(stream: DuplexStream) {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(message) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let Some(id) = message.get("id").cloned() else {
                continue;
            };
            let result = match message["method"].as_str() {
                Some("initialize") => json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fake"}
                }),
                Some("tools/list") => json!({"tools": [
                    {"name": "echo", "description": "Echo arguments", "inputSchema": {"type": "object"}},
                    {"name": "fail"},
                    {"name": "hang"}
                ]}),
                Some("tools/call") => match message["params"]["name"].as_str() {
                    Some("echo") => json!({"content": [
                        {"type": "text", "text": message["params"]["arguments"].to_string()}
                    ]}),
                    Some("fail") => json!({"isError": true, "content": [
                        {"type": "text", "text": "permission denied"}
                    ]}),
                    Some("hang") => continue,
                    Some("ping_me") => {
                        for (server_id, method) in [("srv-1", "ping"), ("srv-2", "sampling/createMessage")] {
                            let request = json!({"jsonrpc": "2.0", "id": server_id, "method": method});
                            let _ = write_half.write_all(format!("{request}\n").as_bytes()).await;
                        }
                        let mut replies = Vec::new();
                        while replies.len() < 2 {
                            let Ok(Some(line)) = lines.next_line().await else {
                                return;
                            };
                            replies.push(serde_json::from_str::<Value>(&line).unwrap_or_default());
                        }
                        json!({"content": [{"type": "text", "text": Value::Array(replies).to_string()}]})
                    }
                    _ => {
                        let reply = json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32602, "message": "no such tool"}});
                        let _ = write_half.write_all(format!("{reply}\n").as_bytes()).await;
                        continue;
                    }
                },
                _ => continue,
            };
            // A notification first, to check it is ignored.
            let _ = write_half
                .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n")
                .await;
            let reply = json!({"jsonrpc": "2.0", "id": id, "result": result});
            let _ = write_half.write_all(format!("{reply}\n").as_bytes()).await;
        }
    }

    pub(crate) async fn connect_fake(name: &str, timeout: Duration) -> McpServer {
        let (ours, theirs) = tokio::io::duplex(8192);
        tokio::spawn(fake_server(theirs));
        let (read_half, write_half) = tokio::io::split(ours);
        let (channel, events) = Channel::from_io(
            read_half,
            write_half,
            JsonCodec,
            DiagnosticPolicy::default(),
            TraceLog::disabled(),
        );
        McpServer::handshake(name, channel, events, timeout)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn handshake_lists_tools() {
        let server = connect_fake("fake", Duration::from_secs(5)).await;
        let names: Vec<_> = server.tools().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "fail", "hang"]);
        assert_eq!(server.tools()[0].server, "fake");
        assert_eq!(server.tools()[1].input_schema["type"], "object");
        assert!(server.has_tool("echo"));
    }

    #[tokio::test]
    async fn call_tool_returns_result() {
        let server = connect_fake("fake", Duration::from_secs(5)).await;
        let result = server
            .call_tool("echo", json!({"path": "."}))
            .await
            .unwrap();
        assert_eq!(result_text(&result), r#"{"path":"."}"#);
    }

    #[tokio::test]
    async fn is_error_results_are_failures() {
        let server = connect_fake("fake", Duration::from_secs(5)).await;
        let err = server.call_tool("fail", Value::Null).await.unwrap_err();
        assert!(matches!(err, ToolError::Failed(ref text) if text == "permission denied"));
    }

    #[tokio::test]
    async fn rpc_errors_are_reported() {
        let server = connect_fake("fake", Duration::from_secs(5)).await;
        let err = server.call_tool("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::Rpc { code: -32602, .. }));
    }

    #[tokio::test]
    async fn server_requests_are_answered() {
        let server = connect_fake("fake", Duration::from_secs(5)).await;
        let result = server.call_tool("ping_me", json!({})).await.unwrap();
        let replies: Vec<Value> = serde_json::from_str(&result_text(&result)).unwrap();

        assert_eq!(replies[0]["id"], "srv-1");
        assert_eq!(replies[0]["result"], json!({}));
        assert_eq!(replies[1]["id"], "srv-2");
        assert_eq!(replies[1]["error"]["code"], -32601);
        assert!(replies[1].get("result").is_none());
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let server = connect_fake("fake", Duration::from_millis(200)).await;
        let err = server.call_tool("hang", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout { ref method, .. } if method == "tools/call"));
        // The server is still usable afterwards.
        assert!(server.call_tool("echo", json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn non_stdio_transport_is_rejected() {
        let config = McpServerConfig::remote(McpTransport::Http, "http://localhost:9000/mcp");
        let err = McpServer::connect("remote", &config).await.err().unwrap();
        assert!(err.to_string().contains("http transport not supported"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn server_exit_fails_handshake() {
        let config = McpServerConfig::stdio(vec!["sh".into(), "-c".into(), "exit 1".into()]);
        let err = McpServer::connect("broken", &config).await.err().unwrap();
        assert!(matches!(
            err,
            ToolError::ServerClosed(_) | ToolError::Transport(_)
        ));
    }
}
