//! The set of connected MCP servers.

use super::{McpServer, ToolError, ToolHost, ToolSpec};
use crate::config::McpServerConfig;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;

/// Connected servers keyed by name.
///
/// A tool name is routed to the first server, in name order, that exposes it.
#[derive(Default)]
pub struct ToolRegistry {
    servers: BTreeMap<String, McpServer>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect every configured server.
    ///
    /// A failing optional server is logged and skipped. A failing required
    /// server aborts with its error.
    pub async fn connect_all(
        &mut self,
        configs: &BTreeMap<String, McpServerConfig>,
    ) -> Result<(), ToolError> {
        for (name, config) in configs {
            match self.add_server(name, config.clone()).await {
                Ok(count) => log::info!("Connected MCP server '{}' ({} tools)", name, count),
                Err(e) if config.optional => {
                    log::warn!("Skipping optional MCP server '{}': {}", name, e)
                }
                Err(e) => {
                    log::error!("MCP server '{}' failed to start: {}", name, e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Register an already-connected server.
    pub fn insert(&mut self, server: McpServer) -> Result<(), ToolError> {
        if self.servers.contains_key(server.name()) {
            return Err(ToolError::AlreadyConnected(server.name().to_string()));
        }
        self.servers.insert(server.name().to_string(), server);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    fn server_for(&self, tool: &str) -> Option<&McpServer> {
        self.servers.values().find(|server| server.has_tool(tool))
    }
}

impl ToolHost for ToolRegistry {
    fn server_names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    fn tools(&self, server: Option<&str>) -> Vec<ToolSpec> {
        self.servers
            .values()
            .filter(|s| server.map_or(true, |name| s.name() == name))
            .flat_map(|s| s.tools().iter().cloned())
            .collect()
    }

    fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> impl Future<Output = Result<Value, ToolError>> + Send {
        let server = self.server_for(name);
        let name = name.to_string();
        async move {
            match server {
                Some(server) => server.call_tool(&name, arguments).await,
                None => Err(ToolError::UnknownTool(name)),
            }
        }
    }

    fn add_server(
        &mut self,
        name: &str,
        config: McpServerConfig,
    ) -> impl Future<Output = Result<usize, ToolError>> + Send {
        let name = name.to_string();
        async move {
            if self.servers.contains_key(&name) {
                return Err(ToolError::AlreadyConnected(name));
            }
            let server = McpServer::connect(&name, &config).await?;
            let count = server.tools().len();
            self.servers.insert(name, server);
            Ok(count)
        }
    }

    fn remove_server(&mut self, name: &str) -> impl Future<Output = Result<(), ToolError>> + Send {
        let server = self.servers.remove(name);
        let name = name.to_string();
        async move {
            match server {
                Some(server) => {
                    server.close().await;
                    log::info!("Removed MCP server '{}'", name);
                    Ok(())
                }
                None => Err(ToolError::UnknownServer(name)),
            }
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = ()> + Send {
        let servers = std::mem::take(&mut self.servers);
        async move {
            for (_, server) in servers {
                server.close().await;
            }
        }
    }
}
