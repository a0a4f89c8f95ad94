//! Model provider seam.
//!
//! The orchestrator only sees [`ModelClient`]: a conversation and the
//! available tools go in; text plus zero or more tool calls come out.
//! OpenAI, Google and Ollama share the OpenAI-compatible client; Anthropic
//! has its own Messages API client. Both send a prepared [`HttpCall`] with
//! `ureq` on the blocking pool.

mod anthropic;
mod openai;

pub use anthropic::{AnthropicClient, ANTHROPIC_BASE_URL, ANTHROPIC_VERSION};
pub use openai::{OpenAiClient, GOOGLE_BASE_URL, OLLAMA_BASE_URL, OPENAI_BASE_URL};

use crate::config::YacConfig;
use crate::session::{ChatMessage, ToolCall};
use crate::tools::ToolSpec;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    pub content: String,
    /// Tool calls in the order the model listed them
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("{0} is not set")]
    MissingApiKey(&'static str),

    #[error("request failed: {0}")]
    Request(String),

    #[error("provider returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

pub trait ModelClient: Send + Sync {
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl Future<Output = Result<ModelReply, ModelError>> + Send;
}

fn http_agent() -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build()
}

/// A JSON POST ready to send.
pub(crate) struct HttpCall {
    agent: ureq::Agent,
    url: String,
    headers: Vec<(&'static str, String)>,
    body: Value,
}

impl HttpCall {
    pub(crate) fn new(agent: &ureq::Agent, url: String, body: Value) -> Self {
        Self {
            agent: agent.clone(),
            url,
            headers: Vec::new(),
            body,
        }
    }

    pub(crate) fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub(crate) async fn send(self) -> Result<Value, ModelError> {
        log::debug!("POST {}", self.url);
        tokio::task::spawn_blocking(move || self.post())
            .await
            .map_err(|e| ModelError::Request(e.to_string()))?
    }

    fn post(&self) -> Result<Value, ModelError> {
        let mut request = self
            .agent
            .post(&self.url)
            .set("Content-Type", "application/json");
        for (name, value) in &self.headers {
            request = request.set(name, value);
        }
        match request.send_json(&self.body) {
            Ok(response) => response
                .into_json::<Value>()
                .map_err(|e| ModelError::InvalidResponse(e.to_string())),
            Err(ureq::Error::Status(status, response)) => Err(ModelError::Api {
                status,
                body: response.into_string().unwrap_or_default(),
            }),
            Err(ureq::Error::Transport(e)) => Err(ModelError::Request(e.to_string())),
        }
    }
}

/// The client for whichever provider is configured.
#[derive(Debug, Clone)]
pub enum ProviderClient {
    OpenAi(OpenAiClient),
    Anthropic(AnthropicClient),
}

impl ProviderClient {
    pub fn base_url(&self) -> &str {
        match self {
            ProviderClient::OpenAi(client) => client.base_url(),
            ProviderClient::Anthropic(client) => client.base_url(),
        }
    }
}

type ParseReply = fn(&Value) -> Result<ModelReply, ModelError>;

impl ModelClient for ProviderClient {
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl Future<Output = Result<ModelReply, ModelError>> + Send {
        let (call, parse) = match self {
            ProviderClient::OpenAi(client) => {
                (client.prepare(request), openai::parse_reply as ParseReply)
            }
            ProviderClient::Anthropic(client) => {
                (client.prepare(request), anthropic::parse_reply as ParseReply)
            }
        };
        async move { parse(&call.send().await?) }
    }
}

/// Build the client for the configured provider.
pub fn create_client(config: &YacConfig) -> Result<ProviderClient, ModelError> {
    create_client_with(config, |key| std::env::var(key).ok())
}

pub fn create_client_with<F>(config: &YacConfig, lookup: F) -> Result<ProviderClient, ModelError>
where
    F: Fn(&str) -> Option<String>,
{
    let key = |name: &'static str| {
        lookup(name)
            .filter(|k| !k.trim().is_empty())
            .ok_or(ModelError::MissingApiKey(name))
    };
    let base_url = |default: &str| config.base_url.clone().unwrap_or_else(|| default.to_string());

    let openai = |default: &str| {
        OpenAiClient::new(base_url(default))
            .temperature(config.temperature)
            .max_tokens(config.max_tokens)
    };

    let client = match config.provider.as_str() {
        "openai" => {
            ProviderClient::OpenAi(openai(OPENAI_BASE_URL).api_key(key("OPENAI_API_KEY")?))
        }
        "google" => {
            ProviderClient::OpenAi(openai(GOOGLE_BASE_URL).api_key(key("GOOGLE_API_KEY")?))
        }
        "ollama" => ProviderClient::OpenAi(openai(OLLAMA_BASE_URL)),
        "anthropic" => ProviderClient::Anthropic(
            AnthropicClient::new(base_url(ANTHROPIC_BASE_URL), key("ANTHROPIC_API_KEY")?)
                .temperature(config.temperature)
                .max_tokens(config.max_tokens),
        ),
        other => return Err(ModelError::UnknownProvider(other.to_string())),
    };
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str) -> YacConfig {
        YacConfig {
            provider: provider.into(),
            ..Default::default()
        }
    }

    #[test]
    fn openai_requires_key() {
        let config = YacConfig::default();
        assert!(matches!(
            create_client_with(&config, |_| None),
            Err(ModelError::MissingApiKey("OPENAI_API_KEY"))
        ));
        let client = create_client_with(&config, |_| Some("sk-test".into())).unwrap();
        assert_eq!(client.base_url(), OPENAI_BASE_URL);
    }

    #[test]
    fn google_uses_its_key_and_compatible_endpoint() {
        assert!(matches!(
            create_client_with(&config("google"), |_| None),
            Err(ModelError::MissingApiKey("GOOGLE_API_KEY"))
        ));
        // Another provider's key does not count.
        let only_openai = |k: &str| (k == "OPENAI_API_KEY").then(|| "sk-test".to_string());
        assert!(create_client_with(&config("google"), only_openai).is_err());

        let client = create_client_with(&config("google"), |k: &str| {
            (k == "GOOGLE_API_KEY").then(|| "g-key".to_string())
        })
        .unwrap();
        assert!(matches!(client, ProviderClient::OpenAi(_)));
        assert_eq!(client.base_url(), GOOGLE_BASE_URL);
    }

    #[test]
    fn anthropic_uses_messages_client() {
        assert!(matches!(
            create_client_with(&config("anthropic"), |_| None),
            Err(ModelError::MissingApiKey("ANTHROPIC_API_KEY"))
        ));
        let client = create_client_with(&config("anthropic"), |k: &str| {
            (k == "ANTHROPIC_API_KEY").then(|| "sk-ant".to_string())
        })
        .unwrap();
        assert!(matches!(client, ProviderClient::Anthropic(_)));
        assert_eq!(client.base_url(), ANTHROPIC_BASE_URL);
    }

    #[test]
    fn ollama_needs_no_key_and_honours_base_url() {
        let config = YacConfig {
            provider: "ollama".into(),
            base_url: Some("http://gpu-box:11434/v1".into()),
            ..Default::default()
        };
        let client = create_client_with(&config, |_| None).unwrap();
        assert_eq!(client.base_url(), "http://gpu-box:11434/v1");
    }

    #[test]
    fn unknown_provider_is_rejected() {
        assert!(matches!(
            create_client_with(&config("mystery"), |_| None),
            Err(ModelError::UnknownProvider(_))
        ));
    }
}
