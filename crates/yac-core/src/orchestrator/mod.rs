//! Backend session orchestration.
//!
//! The [`Orchestrator`] owns the [`Session`] and turns each inbound frame into
//! outbound frames. A user message starts a turn:
//!
//! ```text
//! Idle -> AwaitingModel -> (ExecutingTool -> AwaitingModel)* -> Idle
//! ```
//!
//! Tool calls run one at a time in the order the model listed them. Every
//! `tool_start` is followed by exactly one `tool_result` or `tool_error` with
//! the same id. Calls that time out or lose their transport are retried with
//! a linear backoff before the outcome is reported. Directives (input starting with `/`) never reach the model and
//! produce exactly one `system` message.

pub mod commands;
mod serve;

pub use commands::{Directive, DirectiveError};
pub use serve::{serve, ServeError};

use crate::config::{McpServerConfig, YacConfig};
use crate::model::{CompletionRequest, ModelClient};
use crate::protocol::{
    BackendStatus, CommandPayload, Frame, FrameKind, MessageRole, UserMessagePayload,
};
use crate::session::{Activity, ChatMessage, Session, ToolCall, ToolInvocation};
use crate::tools::{recovery_hint, ToolHost};
use crate::transcript::render_status;
use commands::HELP_TEXT;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

pub const DEFAULT_TOOL_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant running in a terminal. \
Use the available tools when they help answer the user's request, and answer concisely.";

/// Where the orchestrator writes outbound frames.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::UnboundedSender<Frame>,
}

impl FrameSink {
    /// Queue a frame. Returns false once the writer has gone away.
    pub fn emit(&self, frame: Frame) -> bool {
        if self.tx.send(frame).is_err() {
            log::debug!("Outbound channel closed, dropping frame");
            return false;
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A sink and the receiver the writer drains.
pub fn frame_channel() -> (FrameSink, mpsc::UnboundedReceiver<Frame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FrameSink { tx }, rx)
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Tool invocations allowed in one turn
    pub max_tool_rounds: usize,
    pub system_prompt: Option<String>,
    /// Config file that records servers added or removed with `/mcp`
    pub config_path: Option<PathBuf>,
    /// Extra attempts for a call that timed out or lost its transport
    pub tool_retries: u32,
    /// Retry `n` waits `n * retry_delay`
    pub retry_delay: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            max_tool_rounds: crate::config::DEFAULT_MAX_TOOL_ROUNDS,
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
            config_path: None,
            tool_retries: DEFAULT_TOOL_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl OrchestratorOptions {
    pub fn from_config(config: &YacConfig) -> Self {
        Self {
            max_tool_rounds: config.max_tool_rounds.max(1),
            ..Self::default()
        }
    }

    pub fn persist_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }
}

/// What the serve loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Orchestrator<M, T> {
    session: Session,
    model: M,
    tools: T,
    options: OrchestratorOptions,
    sink: FrameSink,
    status: watch::Sender<BackendStatus>,
}

impl<M: ModelClient, T: ToolHost> Orchestrator<M, T> {
    pub fn new(
        session: Session,
        model: M,
        tools: T,
        options: OrchestratorOptions,
        sink: FrameSink,
    ) -> Self {
        let (status, _) = watch::channel(session.status());
        let mut orchestrator = Self {
            session,
            model,
            tools,
            options,
            sink,
            status,
        };
        orchestrator.sync_servers();
        orchestrator
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn tools(&self) -> &T {
        &self.tools
    }

    pub fn sink(&self) -> &FrameSink {
        &self.sink
    }

    /// Latest status snapshot, updated on every activity change.
    pub fn status_watch(&self) -> watch::Receiver<BackendStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> BackendStatus {
        self.session.status()
    }

    fn publish(&self) {
        self.status.send_replace(self.session.status());
    }

    fn set_activity(&mut self, activity: Activity) {
        self.session.set_activity(activity);
        self.publish();
    }

    fn sync_servers(&mut self) {
        self.session.set_servers(self.tools.server_names());
        self.publish();
    }

    /// Handle one inbound frame.
    pub async fn handle(&mut self, frame: Frame) -> Flow {
        let id = frame
            .id()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        match frame.kind() {
            FrameKind::UserMessage => match frame.payload_as::<UserMessagePayload>() {
                Ok(message) if commands::is_directive(&message.content) => {
                    return self.run_directive(&id, &message.content).await;
                }
                Ok(message) if message.content.trim().is_empty() => {
                    self.sink.emit(Frame::error(Some(&id), "Empty message"));
                }
                Ok(message) => self.run_turn(&id, &message.content).await,
                Err(e) => {
                    self.sink.emit(Frame::error(Some(&id), &e.to_string()));
                }
            },
            FrameKind::Command => match frame.payload_as::<CommandPayload>() {
                Ok(command) => return self.run_directive(&id, &command.command).await,
                Err(e) => {
                    self.sink.emit(Frame::error(Some(&id), &e.to_string()));
                }
            },
            FrameKind::StatusRequest => {
                self.sink.emit(Frame::status(Some(&id), &self.session.status()));
            }
            other => {
                log::warn!("Ignoring unexpected {} frame", other);
                self.sink.emit(Frame::error(
                    frame.id(),
                    &format!("Unexpected frame kind '{other}'"),
                ));
            }
        }
        Flow::Continue
    }

    /// Run one model turn for `content`, correlated by `id`.
    pub async fn run_turn(&mut self, id: &str, content: &str) {
        log::info!("Turn {} started", id);
        self.session.push(ChatMessage::user(content));
        self.set_activity(Activity::AwaitingModel);

        let mut invoked = 0;
        'turn: loop {
            let request = self.completion_request();
            let reply = match self.model.complete(&request).await {
                Ok(reply) => reply,
                Err(e) => {
                    log::warn!("Turn {}: model request failed: {}", id, e);
                    self.sink
                        .emit(Frame::error(Some(id), &format!("Model request failed: {e}")));
                    break;
                }
            };

            if reply.tool_calls.is_empty() {
                self.session
                    .push(ChatMessage::assistant(&reply.content, Vec::new()));
                self.sink.emit(Frame::message(
                    Some(id),
                    MessageRole::Assistant,
                    &reply.content,
                    false,
                ));
                break;
            }

            if !reply.content.trim().is_empty() {
                self.sink.emit(Frame::message(
                    Some(id),
                    MessageRole::Assistant,
                    &reply.content,
                    true,
                ));
            }
            self.session.push(ChatMessage::assistant(
                &reply.content,
                reply.tool_calls.clone(),
            ));

            for (index, call) in reply.tool_calls.iter().enumerate() {
                if invoked >= self.options.max_tool_rounds {
                    // Every call in the assistant entry needs an answer in history.
                    for skipped in &reply.tool_calls[index..] {
                        self.session
                            .push(ChatMessage::tool(&skipped.id, "Error: tool call limit reached"));
                    }
                    log::warn!("Turn {}: stopped after {} tool calls", id, invoked);
                    self.sink.emit(Frame::error(
                        Some(id),
                        &format!("Stopped after {invoked} tool calls"),
                    ));
                    break 'turn;
                }
                invoked += 1;
                self.invoke(id, invoked, call).await;
            }
        }

        self.set_activity(Activity::Idle);
        log::info!("Turn {} finished after {} tool calls", id, invoked);
    }

    async fn invoke(&mut self, request_id: &str, n: usize, call: &ToolCall) {
        let mut invocation = ToolInvocation::start(request_id, n, call);
        self.set_activity(Activity::ExecutingTool(call.name.clone()));
        self.sink.emit(invocation.frame());

        let mut retries = 0;
        let outcome = loop {
            match self
                .tools
                .call_tool(&call.name, call.arguments.clone())
                .await
            {
                Err(e) if e.is_retryable() && retries < self.options.tool_retries => {
                    retries += 1;
                    log::warn!(
                        "Tool {} failed ({}), retry {} of {}",
                        call.name,
                        e,
                        retries,
                        self.options.tool_retries
                    );
                    tokio::time::sleep(self.options.retry_delay * retries).await;
                }
                other => break other,
            }
        };

        match outcome {
            Ok(result) => invocation.succeed(result),
            Err(e) => {
                log::warn!("Tool {} failed: {}", call.name, e);
                let mut text = e.to_string();
                if retries > 0 {
                    let _ = write!(text, " (gave up after {retries} retries)");
                }
                if let Some(hint) = recovery_hint(&call.name, &text) {
                    let _ = write!(text, ". Suggestion: {hint}");
                }
                invocation.fail(text);
            }
        }

        self.sink.emit(invocation.frame());
        if let Some(entry) = invocation.history_entry() {
            self.session.push(entry);
        }
        self.set_activity(Activity::AwaitingModel);
    }

    fn completion_request(&self) -> CompletionRequest {
        let mut messages = Vec::with_capacity(self.session.history().len() + 1);
        if let Some(ref prompt) = self.options.system_prompt {
            messages.push(ChatMessage::system(prompt));
        }
        messages.extend(self.session.history().iter().cloned());
        CompletionRequest {
            model: self.session.active_model().to_string(),
            messages,
            tools: self.tools.tools(None),
        }
    }

    /// Handle a directive and emit its single result message.
    pub async fn run_directive(&mut self, id: &str, input: &str) -> Flow {
        let input = input.trim();
        let input = if commands::is_directive(input) {
            input.to_string()
        } else {
            format!("/{input}")
        };

        let (reply, flow) = match commands::parse(&input) {
            Ok(Directive::Exit) => ("Goodbye.".to_string(), Flow::Exit),
            Ok(directive) => (self.apply(directive).await, Flow::Continue),
            Err(e) => (format!("Invalid command: {e}"), Flow::Continue),
        };
        log::debug!("Directive {} -> {:?}", input, flow);
        self.sink
            .emit(Frame::message(Some(id), MessageRole::System, &reply, false));
        flow
    }

    async fn apply(&mut self, directive: Directive) -> String {
        match directive {
            Directive::Help => HELP_TEXT.to_string(),
            Directive::Clear => {
                let removed = self.session.clear_history();
                format!("Cleared {removed} messages from history")
            }
            Directive::Model(None) => format!("Active model: {}", self.session.active_model()),
            Directive::Model(Some(model)) => {
                let previous = self.session.set_model(&model);
                self.publish();
                log::info!("Model switched from {} to {}", previous, model);
                format!("Switched model from {previous} to {model}")
            }
            Directive::McpAdd { name, config } => {
                let added = self.tools.add_server(&name, config.clone()).await;
                self.sync_servers();
                match added {
                    Ok(count) => {
                        let reply = format!("Connected MCP server '{name}' ({count} tools)");
                        self.persist_server(&name, Some(config), reply)
                    }
                    Err(e) => format!("Failed to add MCP server '{name}': {e}"),
                }
            }
            Directive::McpRemove(name) => {
                let removed = self.tools.remove_server(&name).await;
                self.sync_servers();
                match removed {
                    Ok(()) => {
                        let reply = format!("Removed MCP server '{name}'");
                        self.persist_server(&name, None, reply)
                    }
                    Err(e) => format!("Failed to remove MCP server '{name}': {e}"),
                }
            }
            Directive::McpList => {
                let names = self.tools.server_names();
                if names.is_empty() {
                    "No MCP servers connected".to_string()
                } else {
                    format!("MCP servers: {}", names.join(", "))
                }
            }
            Directive::McpTools(server) => self.describe_tools(server.as_deref()),
            Directive::Status => render_status(&self.session.status()),
            Directive::Exit => "Goodbye.".to_string(),
            Directive::Unknown(text) => {
                format!("Unknown command: {text}. Type /help for a list of commands.")
            }
        }
    }

    /// Record a server change in the config file, if one is configured.
    fn persist_server(
        &self,
        name: &str,
        server: Option<McpServerConfig>,
        reply: String,
    ) -> String {
        let Some(ref path) = self.options.config_path else {
            return reply;
        };
        let result = YacConfig::update(path, |config| match server {
            Some(server) => {
                config.mcp_servers.insert(name.to_string(), server);
                true
            }
            None => config.mcp_servers.remove(name).is_some(),
        });
        match result {
            Ok(true) => {
                log::info!("Saved MCP server change to {}", path.display());
                reply
            }
            Ok(false) => reply,
            Err(e) => {
                log::warn!("Failed to save MCP server change: {}", e);
                format!("{reply} (not saved: {e})")
            }
        }
    }

    fn describe_tools(&self, server: Option<&str>) -> String {
        if let Some(name) = server {
            if !self.tools.server_names().iter().any(|s| s == name) {
                return format!("No MCP server named '{name}'");
            }
        }
        let tools = self.tools.tools(server);
        if tools.is_empty() {
            return "No tools available".to_string();
        }
        let mut text = format!("{} tools:", tools.len());
        for tool in &tools {
            let _ = write!(text, "\n  {} ({})", tool.name, tool.server);
            if !tool.description.is_empty() {
                let _ = write!(text, ": {}", tool.description);
            }
        }
        text
    }

    /// Disconnect tool servers.
    pub async fn shutdown(&mut self) {
        self.tools.shutdown().await;
        self.sync_servers();
    }
}
