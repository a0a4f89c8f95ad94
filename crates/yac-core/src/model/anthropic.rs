//! Anthropic Messages API client.
//!
//! System prompts travel in the top-level `system` field. Tool calls are
//! `tool_use` content blocks on assistant turns and their results are
//! `tool_result` blocks on the following user turn, so consecutive tool
//! results from history are merged into one user message.

use super::{http_agent, CompletionRequest, HttpCall, ModelClient, ModelError, ModelReply};
use crate::session::{ChatMessage, Role, ToolCall};
use crate::tools::ToolSpec;
use serde_json::{json, Map, Value};
use std::future::Future;

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// The Messages API requires `max_tokens`.
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Clone)]
pub struct AnthropicClient {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl std::fmt::Debug for AnthropicClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl AnthropicClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            agent: http_agent(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}/messages", self.base_url.trim_end_matches('/'))
    }

    pub(crate) fn prepare(&self, request: &CompletionRequest) -> HttpCall {
        log::debug!(
            "Messages request with {} messages and {} tools",
            request.messages.len(),
            request.tools.len()
        );
        HttpCall::new(&self.agent, self.endpoint(), self.request_body(request))
            .header("x-api-key", self.api_key.clone())
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    pub fn request_body(&self, request: &CompletionRequest) -> Value {
        let mut body = Map::new();
        body.insert("model".into(), json!(request.model));
        body.insert(
            "max_tokens".into(),
            json!(self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        );

        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        if !system.is_empty() {
            body.insert("system".into(), json!(system.join("\n\n")));
        }
        body.insert("messages".into(), Value::Array(messages_json(&request.messages)));

        if !request.tools.is_empty() {
            body.insert(
                "tools".into(),
                Value::Array(request.tools.iter().map(tool_json).collect()),
            );
        }
        if let Some(temperature) = self.temperature {
            body.insert("temperature".into(), json!(temperature));
        }
        Value::Object(body)
    }
}

impl ModelClient for AnthropicClient {
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl Future<Output = Result<ModelReply, ModelError>> + Send {
        let call = self.prepare(request);
        async move { parse_reply(&call.send().await?) }
    }
}

fn messages_json(messages: &[ChatMessage]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            Role::System => {}
            Role::User => out.push(json!({"role": "user", "content": message.content})),
            Role::Assistant if message.tool_calls.is_empty() => {
                out.push(json!({"role": "assistant", "content": message.content}))
            }
            Role::Assistant => {
                let mut blocks = Vec::with_capacity(message.tool_calls.len() + 1);
                if !message.content.is_empty() {
                    blocks.push(json!({"type": "text", "text": message.content}));
                }
                for call in &message.tool_calls {
                    let input = if call.arguments.is_object() {
                        call.arguments.clone()
                    } else {
                        json!({})
                    };
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": input,
                    }));
                }
                out.push(json!({"role": "assistant", "content": blocks}));
            }
            Role::Tool => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": message.tool_call_id.as_deref().unwrap_or_default(),
                    "content": message.content,
                });
                match out.last_mut().and_then(tool_results) {
                    Some(results) => results.push(block),
                    None => out.push(json!({"role": "user", "content": [block]})),
                }
            }
        }
    }
    out
}

/// The block list of a user message holding tool results.
fn tool_results(message: &mut Value) -> Option<&mut Vec<Value>> {
    if message.get("role").and_then(Value::as_str) != Some("user") {
        return None;
    }
    let blocks = message.get_mut("content")?.as_array_mut()?;
    let all_results = blocks
        .iter()
        .all(|b| b.get("type").and_then(Value::as_str) == Some("tool_result"));
    all_results.then_some(blocks)
}

fn tool_json(tool: &ToolSpec) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.input_schema,
    })
}

/// Join text blocks and collect `tool_use` blocks in order.
pub(crate) fn parse_reply(response: &Value) -> Result<ModelReply, ModelError> {
    let blocks = response
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| ModelError::InvalidResponse("response has no content".into()))?;

    let mut reply = ModelReply::default();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                reply
                    .content
                    .push_str(block.get("text").and_then(Value::as_str).unwrap_or_default());
            }
            Some("tool_use") => {
                let Some(name) = block.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let id = block
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("call_{name}"));
                reply.tool_calls.push(ToolCall {
                    id,
                    name: name.to_string(),
                    arguments: block.get("input").cloned().unwrap_or_else(|| json!({})),
                });
            }
            _ => {}
        }
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> AnthropicClient {
        AnthropicClient::new(ANTHROPIC_BASE_URL, "sk-ant-secret")
    }

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: "list_directory".into(),
            arguments: json!({"path": "."}),
        }
    }

    mod request_body {
        use super::*;

        #[test]
        fn system_prompt_is_lifted_and_max_tokens_defaulted() {
            let body = client().request_body(&CompletionRequest {
                model: "claude-3-5-sonnet-20241022".into(),
                messages: vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
                tools: vec![ToolSpec {
                    name: "list_directory".into(),
                    description: "List a directory".into(),
                    input_schema: json!({"type": "object"}),
                    server: "filesystem".into(),
                }],
            });

            assert_eq!(body["system"], "be brief");
            assert_eq!(body["max_tokens"], 4096);
            assert_eq!(body["messages"].as_array().unwrap().len(), 1);
            assert_eq!(body["messages"][0]["role"], "user");
            assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
            assert!(body.get("temperature").is_none());
        }

        #[test]
        fn tool_round_trip_uses_blocks() {
            let messages = messages_json(&[
                ChatMessage::user("list files"),
                ChatMessage::assistant("Looking.", vec![call("toolu_1"), call("toolu_2")]),
                ChatMessage::tool("toolu_1", "a.txt"),
                ChatMessage::tool("toolu_2", "b.txt"),
            ]);

            assert_eq!(messages.len(), 3);
            let assistant = &messages[1]["content"];
            assert_eq!(assistant[0]["type"], "text");
            assert_eq!(assistant[1]["type"], "tool_use");
            assert_eq!(assistant[1]["input"], json!({"path": "."}));

            let results = messages[2]["content"].as_array().unwrap();
            assert_eq!(messages[2]["role"], "user");
            assert_eq!(results.len(), 2);
            assert_eq!(results[1]["tool_use_id"], "toolu_2");
        }

        #[test]
        fn headers_and_endpoint() {
            let call = client().prepare(&CompletionRequest {
                model: "claude-3-5-sonnet-20241022".into(),
                messages: vec![],
                tools: vec![],
            });
            assert_eq!(call.url, "https://api.anthropic.com/v1/messages");
            assert!(call
                .headers
                .contains(&("x-api-key", "sk-ant-secret".to_string())));
            assert!(call
                .headers
                .contains(&("anthropic-version", ANTHROPIC_VERSION.to_string())));
        }

        #[test]
        fn debug_redacts_key() {
            assert!(!format!("{:?}", client()).contains("sk-ant-secret"));
        }
    }

    mod reply {
        use super::*;

        #[test]
        fn parses_text_and_tool_use() {
            let reply = parse_reply(&json!({
                "role": "assistant",
                "content": [
                    {"type": "text", "text": "Let me check."},
                    {"type": "tool_use", "id": "toolu_1", "name": "list_directory", "input": {"path": "."}}
                ],
                "stop_reason": "tool_use"
            }))
            .unwrap();
            assert_eq!(reply.content, "Let me check.");
            assert_eq!(reply.tool_calls, vec![call("toolu_1")]);
        }

        #[test]
        fn missing_content_is_invalid() {
            assert!(matches!(
                parse_reply(&json!({"type": "error"})),
                Err(ModelError::InvalidResponse(_))
            ));
        }
    }
}
