//! Backend configuration.
//!
//! Stored as JSON at `~/.yac/config.json`:
//!
//! ```json
//! {
//!   "provider": "openai",
//!   "model": "o3-mini",
//!   "mcp_servers": {
//!     "filesystem": {
//!       "transport": "stdio",
//!       "command": ["npx", "-y", "@modelcontextprotocol/server-filesystem", "/work"],
//!       "optional": true
//!     }
//!   }
//! }
//! ```
//!
//! A missing file means defaults. `YAC_PROVIDER`, `YAC_MODEL` and `YAC_BASE_URL`
//! override the file.

use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_PROVIDER: &str = "openai";
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 25;
pub const DEFAULT_SERVER_TIMEOUT_SECS: u64 = 30;

/// Providers the backend knows how to talk to.
pub const KNOWN_PROVIDERS: &[&str] = &["openai", "anthropic", "google", "ollama"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("invalid JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("unknown provider '{0}' (expected one of: openai, anthropic, google, ollama)")]
    UnknownProvider(String),

    #[error("invalid MCP server '{name}': {reason}")]
    InvalidServer { name: String, reason: String },

    #[error("max_tool_rounds must be at least 1")]
    InvalidToolRounds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransport {
    Stdio,
    Sse,
    Http,
}

impl std::fmt::Display for McpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            McpTransport::Stdio => "stdio",
            McpTransport::Sse => "sse",
            McpTransport::Http => "http",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for McpTransport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdio" => Ok(McpTransport::Stdio),
            "sse" => Ok(McpTransport::Sse),
            "http" => Ok(McpTransport::Http),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

/// One tool server entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub transport: McpTransport,
    /// Program and leading arguments (stdio)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Endpoint (sse, http)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Extra arguments appended after `command`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Failing to start an optional server is a warning, not a startup error
    #[serde(default)]
    pub optional: bool,
    #[serde(default = "default_server_timeout")]
    pub timeout_secs: u64,
}

fn default_server_timeout() -> u64 {
    DEFAULT_SERVER_TIMEOUT_SECS
}

impl McpServerConfig {
    pub fn stdio(command: Vec<String>) -> Self {
        Self {
            transport: McpTransport::Stdio,
            command,
            url: None,
            env: BTreeMap::new(),
            args: Vec::new(),
            optional: false,
            timeout_secs: DEFAULT_SERVER_TIMEOUT_SECS,
        }
    }

    pub fn remote(transport: McpTransport, url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            transport,
            ..Self::stdio(Vec::new())
        }
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    /// `command` followed by `args`.
    pub fn full_command(&self) -> Vec<String> {
        self.command.iter().chain(&self.args).cloned().collect()
    }

    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidServer {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        if name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        match self.transport {
            McpTransport::Stdio => {
                if self.command.first().map_or(true, |c| c.trim().is_empty()) {
                    return Err(invalid("stdio transport requires a command"));
                }
            }
            McpTransport::Sse | McpTransport::Http => {
                if self.url.as_deref().map_or(true, |u| u.trim().is_empty()) {
                    return Err(invalid(&format!("{} transport requires a url", self.transport)));
                }
            }
        }
        if self.timeout_secs == 0 {
            return Err(invalid("timeout_secs must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct YacConfig {
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub max_tool_rounds: usize,
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
}

impl Default for YacConfig {
    fn default() -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            model: None,
            base_url: None,
            temperature: None,
            max_tokens: None,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            mcp_servers: BTreeMap::new(),
        }
    }
}

impl YacConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, json).map_err(write_err)?;
        fs::rename(&temp_path, path).map_err(write_err)?;
        Ok(())
    }

    /// Load `path`, apply `change` and save if it reports a modification.
    ///
    /// Returns whether the file was written.
    pub fn update<F>(path: &Path, change: F) -> Result<bool, ConfigError>
    where
        F: FnOnce(&mut Self) -> bool,
    {
        let mut config = Self::load(path)?;
        if !change(&mut config) {
            return Ok(false);
        }
        config.save(path)?;
        Ok(true)
    }

    /// Apply `YAC_PROVIDER`, `YAC_MODEL` and `YAC_BASE_URL` from the process
    /// environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(provider) = lookup("YAC_PROVIDER") {
            self.provider = provider.trim().to_ascii_lowercase();
        }
        if let Some(model) = lookup("YAC_MODEL") {
            self.model = Some(model.trim().to_string());
        }
        if let Some(url) = lookup("YAC_BASE_URL") {
            self.base_url = Some(url.trim().to_string());
        }
    }

    /// Insert the default optional filesystem server if no servers are
    /// configured.
    pub fn with_default_servers(mut self, workspace: &Path) -> Self {
        if self.mcp_servers.is_empty() {
            let command = vec![
                "npx".to_string(),
                "-y".to_string(),
                "@modelcontextprotocol/server-filesystem".to_string(),
                workspace.display().to_string(),
            ];
            self.mcp_servers.insert(
                "filesystem".to_string(),
                McpServerConfig::stdio(command).optional(true),
            );
        }
        self
    }

    /// The configured model, or the provider's default.
    pub fn resolved_model(&self) -> String {
        match self.model {
            Some(ref model) if !model.is_empty() => model.clone(),
            _ => default_model(&self.provider).to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !KNOWN_PROVIDERS.contains(&self.provider.as_str()) {
            return Err(ConfigError::UnknownProvider(self.provider.clone()));
        }
        if self.max_tool_rounds == 0 {
            return Err(ConfigError::InvalidToolRounds);
        }
        for (name, server) in &self.mcp_servers {
            server.validate(name)?;
        }
        Ok(())
    }
}

/// Default model per provider.
pub fn default_model(provider: &str) -> &'static str {
    match provider {
        "anthropic" => "claude-3-5-sonnet-20241022",
        "google" => "gemini-1.5-flash",
        "ollama" => "llama3.1",
        _ => "o3-mini",
    }
}

/// `YAC_CONFIG` if set, else `~/.yac/config.json`, else `./.yac/config.json`.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("YAC_CONFIG") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    paths::default_config_path()
        .unwrap_or_else(|| PathBuf::from(paths::STATE_DIR_NAME).join("config.json"))
}
