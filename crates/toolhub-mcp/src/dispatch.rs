//! Tool invocation: the hub's public request path.
//!
//! Every lookup happens before any I/O, so an unknown server or tool fails
//! without touching a subprocess.

use crate::catalog::ToolInfo;
use crate::connection::ServerConnection;
use crate::error::McpError;
use crate::lifecycle::{LifecycleState, McpHub};
use crate::names::QualifiedToolName;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

impl McpHub {
    /// Every tool on every live server, sorted by server then name.
    pub async fn list_tools(&self) -> Vec<ToolInfo> {
        self.catalog.read().await.all_tools()
    }

    /// Call `tool` on `server` and return its raw result.
    pub async fn invoke(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        self.dispatch(server, tool, arguments, None).await
    }

    pub async fn invoke_qualified(
        &self,
        name: &QualifiedToolName,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        self.dispatch(name.server.as_str(), name.tool.as_str(), arguments, None)
            .await
    }

    /// Like [`invoke`](Self::invoke), but gives up as soon as `cancel` fires.
    ///
    /// The server is sent a best-effort `notifications/cancelled`; any late
    /// response is discarded.
    pub async fn invoke_with_cancel(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, McpError> {
        self.dispatch(server, tool, arguments, Some(cancel)).await
    }

    /// Resolve `server.tool` or a bare tool name to its owner.
    ///
    /// A bare name that several servers expose resolves to the first server
    /// in name order.
    pub async fn resolve_tool(&self, name: &str) -> Result<QualifiedToolName, McpError> {
        self.ensure_ready()?;
        let catalog = self.catalog.read().await;
        if let Some((server, descriptor)) = catalog.resolve(name) {
            let owners = catalog.servers_with(descriptor.name.as_str());
            if owners.len() > 1 && descriptor.name.as_str() == name {
                tracing::debug!(
                    tool = name,
                    chosen = %server,
                    candidates = owners.len(),
                    "Ambiguous bare tool name"
                );
            }
            return Ok(QualifiedToolName::new(server, descriptor.name.clone()));
        }

        match name.parse::<QualifiedToolName>() {
            Ok(qualified) if !catalog.contains_server(qualified.server.as_str()) => {
                Err(McpError::UnknownServer {
                    server: qualified.server.to_string(),
                })
            }
            Ok(qualified) => Err(McpError::UnknownTool {
                server: qualified.server.to_string(),
                tool: qualified.tool.to_string(),
            }),
            Err(_) => Err(McpError::UnknownTool {
                server: "*".to_string(),
                tool: name.to_string(),
            }),
        }
    }

    /// Resolve a qualified or bare tool name and invoke it.
    pub async fn call(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let qualified = self.resolve_tool(name).await?;
        self.invoke_qualified(&qualified, arguments).await
    }

    /// Re-run tool discovery on one server.
    pub async fn refresh_tools(&self, server: &str) -> Result<u64, McpError> {
        self.ensure_ready()?;
        self.connection(server).await?.refresh_tools().await
    }

    fn ensure_ready(&self) -> Result<(), McpError> {
        match self.state() {
            LifecycleState::Ready => Ok(()),
            LifecycleState::NotStarted | LifecycleState::Starting => Err(McpError::NotInitialized),
            LifecycleState::ShuttingDown | LifecycleState::Stopped => Err(McpError::ShuttingDown),
        }
    }

    async fn connection(&self, server: &str) -> Result<Arc<ServerConnection>, McpError> {
        let connection = self.connections.read().await.get(server).cloned();
        match connection {
            Some(connection) if connection.is_alive() => Ok(connection),
            _ => Err(McpError::UnknownServer {
                server: server.to_string(),
            }),
        }
    }

    async fn dispatch(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<serde_json::Value, McpError> {
        self.ensure_ready()?;
        let connection = self.connection(server).await?;
        let descriptor = self
            .catalog
            .read()
            .await
            .get(server, tool)
            .ok_or_else(|| McpError::UnknownTool {
                server: server.to_string(),
                tool: tool.to_string(),
            })?;

        tracing::debug!(server, tool, "Invoking MCP tool");
        let started = Instant::now();
        let result = connection
            .call_tool(&descriptor.name, arguments, cancel)
            .await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match &result {
            Ok(_) => tracing::debug!(server, tool, elapsed_ms, "MCP tool returned"),
            Err(e) => tracing::warn!(server, tool, elapsed_ms, "MCP tool call failed: {e}"),
        }
        result
    }
}
