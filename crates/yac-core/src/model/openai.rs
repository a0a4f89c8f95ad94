//! OpenAI-compatible chat completions client.
//!
//! Works against OpenAI itself and any server exposing the same
//! `/chat/completions` endpoint (Gemini, Ollama, vLLM, LM Studio).

use super::{http_agent, CompletionRequest, HttpCall, ModelClient, ModelError, ModelReply};
use crate::session::{ChatMessage, Role, ToolCall};
use crate::tools::ToolSpec;
use serde_json::{json, Map, Value};
use std::future::Future;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

#[derive(Clone)]
pub struct OpenAiClient {
    agent: ureq::Agent,
    base_url: String,
    api_key: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            agent: http_agent(),
            base_url: base_url.into(),
            api_key: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
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
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    pub(crate) fn prepare(&self, request: &CompletionRequest) -> HttpCall {
        log::debug!(
            "Chat completion with {} messages and {} tools",
            request.messages.len(),
            request.tools.len()
        );
        let call = HttpCall::new(&self.agent, self.endpoint(), self.request_body(request));
        match self.api_key {
            Some(ref key) => call.header("Authorization", format!("Bearer {key}")),
            None => call,
        }
    }

    /// Build the JSON request body.
    pub fn request_body(&self, request: &CompletionRequest) -> Value {
        let mut body = Map::new();
        body.insert("model".into(), json!(request.model));
        body.insert(
            "messages".into(),
            Value::Array(request.messages.iter().map(message_json).collect()),
        );
        if !request.tools.is_empty() {
            body.insert(
                "tools".into(),
                Value::Array(request.tools.iter().map(tool_json).collect()),
            );
            body.insert("tool_choice".into(), json!("auto"));
        }
        if let Some(temperature) = self.temperature {
            body.insert("temperature".into(), json!(temperature));
        }
        if let Some(max_tokens) = self.max_tokens {
            body.insert("max_tokens".into(), json!(max_tokens));
        }
        Value::Object(body)
    }
}

impl ModelClient for OpenAiClient {
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl Future<Output = Result<ModelReply, ModelError>> + Send {
        let call = self.prepare(request);
        async move { parse_reply(&call.send().await?) }
    }
}

fn message_json(message: &ChatMessage) -> Value {
    match message.role {
        Role::System => json!({"role": "system", "content": message.content}),
        Role::User => json!({"role": "user", "content": message.content}),
        Role::Assistant if message.tool_calls.is_empty() => {
            json!({"role": "assistant", "content": message.content})
        }
        Role::Assistant => {
            let calls: Vec<Value> = message
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {"name": call.name, "arguments": call.arguments.to_string()},
                    })
                })
                .collect();
            let content = if message.content.is_empty() {
                Value::Null
            } else {
                json!(message.content)
            };
            json!({"role": "assistant", "content": content, "tool_calls": calls})
        }
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id.as_deref().unwrap_or_default(),
            "content": message.content,
        }),
    }
}

fn tool_json(tool: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.input_schema,
        }
    })
}

/// Extract the first choice's text and tool calls.
pub(crate) fn parse_reply(response: &Value) -> Result<ModelReply, ModelError> {
    let message = response
        .pointer("/choices/0/message")
        .ok_or_else(|| ModelError::InvalidResponse("response has no choices".into()))?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| calls.iter().filter_map(parse_tool_call).collect())
        .unwrap_or_default();

    Ok(ModelReply {
        content,
        tool_calls,
    })
}

fn parse_tool_call(call: &Value) -> Option<ToolCall> {
    let function = call.get("function")?;
    let name = function.get("name")?.as_str()?.to_string();
    // Arguments arrive as a JSON-encoded string; some servers send an object.
    let arguments = match function.get("arguments") {
        Some(Value::String(raw)) if raw.trim().is_empty() => json!({}),
        Some(Value::String(raw)) => {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
        }
        Some(other) => other.clone(),
        None => json!({}),
    };
    let id = call
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("call_{name}"));
    Some(ToolCall {
        id,
        name,
        arguments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> ToolSpec {
        ToolSpec {
            name: "list_directory".into(),
            description: "List a directory".into(),
            input_schema: json!({"type": "object", "properties": {"path": {"type": "string"}}}),
            server: "filesystem".into(),
        }
    }

    mod request_body {
        use super::*;

        #[test]
        fn includes_tools_and_auto_choice() {
            let client = OpenAiClient::new(OPENAI_BASE_URL)
                .temperature(Some(0.7))
                .max_tokens(Some(4096));
            let body = client.request_body(&CompletionRequest {
                model: "o3-mini".into(),
                messages: vec![ChatMessage::user("list files")],
                tools: vec![tool()],
            });

            assert_eq!(body["model"], "o3-mini");
            assert_eq!(body["tool_choice"], "auto");
            assert_eq!(body["tools"][0]["function"]["name"], "list_directory");
            assert_eq!(body["max_tokens"], 4096);
            assert!(body["temperature"].as_f64().is_some());
            assert_eq!(body["messages"][0]["role"], "user");
        }

        #[test]
        fn omits_tools_and_sampling_when_unset() {
            let client = OpenAiClient::new(OLLAMA_BASE_URL);
            let body = client.request_body(&CompletionRequest {
                model: "llama3.1".into(),
                messages: vec![],
                tools: vec![],
            });
            assert!(body.get("tools").is_none());
            assert!(body.get("tool_choice").is_none());
            assert!(body.get("temperature").is_none());
        }

        #[test]
        fn encodes_tool_round_trip_messages() {
            let call = ToolCall {
                id: "call_1".into(),
                name: "list_directory".into(),
                arguments: json!({"path": "."}),
            };
            let assistant = message_json(&ChatMessage::assistant("", vec![call]));
            assert!(assistant["content"].is_null());
            assert_eq!(
                assistant["tool_calls"][0]["function"]["arguments"],
                r#"{"path":"."}"#
            );

            let tool_msg = message_json(&ChatMessage::tool("call_1", "a\nb"));
            assert_eq!(tool_msg["role"], "tool");
            assert_eq!(tool_msg["tool_call_id"], "call_1");
        }

        #[test]
        fn endpoint_tolerates_trailing_slash() {
            let client = OpenAiClient::new("http://localhost:11434/v1/");
            assert_eq!(client.endpoint(), "http://localhost:11434/v1/chat/completions");
        }

        #[test]
        fn key_is_sent_as_bearer_token() {
            let request = CompletionRequest {
                model: "gemini-1.5-flash".into(),
                messages: vec![],
                tools: vec![],
            };
            let call = OpenAiClient::new(GOOGLE_BASE_URL)
                .api_key("g-key")
                .prepare(&request);
            assert_eq!(
                call.url,
                "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions"
            );
            assert_eq!(call.headers, vec![("Authorization", "Bearer g-key".to_string())]);

            let keyless = OpenAiClient::new(OLLAMA_BASE_URL).prepare(&request);
            assert!(keyless.headers.is_empty());
        }

        #[test]
        fn debug_redacts_key() {
            let client = OpenAiClient::new(OPENAI_BASE_URL).api_key("sk-secret");
            assert!(!format!("{client:?}").contains("sk-secret"));
        }
    }

    mod reply {
        use super::*;

        #[test]
        fn parses_text_answer() {
            let reply = parse_reply(&json!({
                "choices": [{"message": {"role": "assistant", "content": "Done."}}]
            }))
            .unwrap();
            assert_eq!(reply.content, "Done.");
            assert!(reply.tool_calls.is_empty());
        }

        #[test]
        fn parses_tool_calls_in_order() {
            let reply = parse_reply(&json!({
                "choices": [{"message": {
                    "content": null,
                    "tool_calls": [
                        {"id": "a", "type": "function", "function": {"name": "list_directory", "arguments": "{\"path\":\".\"}"}},
                        {"id": "b", "type": "function", "function": {"name": "read_file", "arguments": ""}}
                    ]
                }}]
            }))
            .unwrap();
            assert_eq!(reply.content, "");
            let names: Vec<_> = reply.tool_calls.iter().map(|c| c.name.as_str()).collect();
            assert_eq!(names, vec!["list_directory", "read_file"]);
            assert_eq!(reply.tool_calls[0].arguments, json!({"path": "."}));
            assert_eq!(reply.tool_calls[1].arguments, json!({}));
        }

        #[test]
        fn missing_choices_is_invalid() {
            assert!(matches!(
                parse_reply(&json!({"error": "overloaded"})),
                Err(ModelError::InvalidResponse(_))
            ));
        }
    }
}
