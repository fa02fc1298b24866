//! One live MCP server connection.
//!
//! A [`ServerConnection`] owns a supervised process and runs two background
//! tasks for it: a read loop that frames stdout and routes every message
//! (responses to the correlator, notifications to the event feed, requests
//! back to the server), and a sweeper that expires overdue requests.

use crate::catalog::{ToolCatalog, ToolDescriptor};
use crate::config::{HubSettings, McpServerConfig};
use crate::correlator::{CloseReason, RequestCorrelator};
use crate::error::McpError;
use crate::event::{HubEvent, ServerNotification};
use crate::frame::FrameReader;
use crate::jsonrpc::{
    IncomingMessage, JsonRpcNotification, JsonRpcReply, JsonRpcRequest, METHOD_NOT_FOUND,
    numeric_id,
};
use crate::names::{ServerName, ToolName};
use crate::process::{LaunchSpec, ProcessEvent, ProcessSupervisor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// MCP protocol version we support.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Upper bound on `tools/list` pages followed during one discovery.
const MAX_TOOL_PAGES: usize = 64;

const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(10);
const MAX_SWEEP_PERIOD: Duration = Duration::from_secs(1);

const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

/// State shared by every connection the hub opens.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub catalog: Arc<RwLock<ToolCatalog>>,
    pub events: broadcast::Sender<HubEvent>,
    pub settings: HubSettings,
    pub base_dir: Option<PathBuf>,
}

/// What a server said about itself in its `initialize` result.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
    pub protocol_version: Option<String>,
    pub capabilities: serde_json::Value,
}

#[derive(Deserialize)]
struct InitializeResult {
    #[serde(default, rename = "protocolVersion")]
    protocol_version: Option<String>,
    #[serde(default)]
    capabilities: serde_json::Value,
    #[serde(default, rename = "serverInfo")]
    server_info: Option<Implementation>,
}

#[derive(Deserialize)]
struct Implementation {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

impl ServerInfo {
    fn from_initialize(result: serde_json::Value) -> Self {
        match serde_json::from_value::<InitializeResult>(result) {
            Ok(init) => {
                let (name, version) = init
                    .server_info
                    .map(|info| (info.name, info.version))
                    .unwrap_or_default();
                Self {
                    name,
                    version,
                    protocol_version: init.protocol_version,
                    capabilities: init.capabilities,
                }
            }
            Err(e) => {
                tracing::debug!("Unrecognized initialize result: {e}");
                Self::default()
            }
        }
    }
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub name: ServerName,
    pub pid: Option<u32>,
    pub alive: bool,
    pub tool_count: usize,
    pub catalog_version: Option<u64>,
    pub pending_requests: usize,
    pub bytes_written: u64,
    pub started_at: DateTime<Utc>,
    pub server_info: ServerInfo,
}

#[derive(Deserialize)]
struct ToolsListResult {
    #[serde(default)]
    tools: Vec<ToolEntry>,
    #[serde(default, rename = "nextCursor")]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct ToolEntry {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_schema", rename = "inputSchema")]
    input_schema: serde_json::Value,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Everything the background tasks need, behind one `Arc`.
struct Shared {
    name: ServerName,
    process: ProcessSupervisor,
    correlator: RequestCorrelator,
    catalog: Arc<RwLock<ToolCatalog>>,
    events: broadcast::Sender<HubEvent>,
    request_timeout: Duration,
    refresh_lock: Mutex<()>,
    /// Set once we start tearing the connection down ourselves.
    closing: AtomicBool,
    /// Set once the read loop has seen the process go away.
    lost: AtomicBool,
}

impl Shared {
    /// Send a request and wait for its outcome.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<serde_json::Value, McpError> {
        let mut handle = self.correlator.register(method, timeout).await?;
        let id = handle.id();

        let line = serde_json::to_vec(&JsonRpcRequest::new(id, method, params))?;
        if let Err(e) = self.process.write_line(&line).await {
            self.correlator.discard(id).await;
            return Err(e);
        }

        let Some(cancel) = cancel else {
            return handle.wait().await;
        };

        tokio::select! {
            outcome = handle.wait() => return outcome,
            () = cancel.cancelled() => {}
        }

        let cancelled = McpError::Cancelled {
            server: self.name.to_string(),
            method: method.to_string(),
        };
        if self.correlator.reject(id, cancelled).await {
            tracing::debug!(server = %self.name, id, method, "Cancelled MCP request");
            let params = serde_json::json!({"requestId": id, "reason": "cancelled by caller"});
            if let Err(e) = self.notify("notifications/cancelled", Some(params)).await {
                tracing::debug!(server = %self.name, "Could not send cancellation: {e}");
            }
        }
        // Either our rejection or a response that beat it.
        handle.wait().await
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let line = serde_json::to_vec(&JsonRpcNotification::new(method, params))?;
        self.process.write_line(&line).await
    }

    /// `initialize`, `notifications/initialized`, then tool discovery.
    async fn handshake(&self, timeout: Duration) -> Result<(ServerInfo, Vec<ToolDescriptor>), McpError> {
        let init_params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "toolhub",
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        let result = self
            .request("initialize", Some(init_params), timeout, None)
            .await?;
        let info = ServerInfo::from_initialize(result);

        self.notify("notifications/initialized", None).await?;

        let tools = self.discover_tools(timeout).await?;
        Ok((info, tools))
    }

    /// Run `tools/list`, following `nextCursor` across pages.
    async fn discover_tools(&self, timeout: Duration) -> Result<Vec<ToolDescriptor>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor.take().map(|c| serde_json::json!({"cursor": c}));
            let result = self.request("tools/list", params, timeout, None).await?;
            let page: ToolsListResult = serde_json::from_value(result).map_err(|e| {
                McpError::Protocol(format!("Failed to parse tools/list response: {e}"))
            })?;

            for entry in page.tools {
                match ToolName::new(entry.name) {
                    Ok(name) => tools.push(ToolDescriptor {
                        name,
                        description: entry.description.unwrap_or_default(),
                        input_schema: entry.input_schema,
                    }),
                    Err(e) => tracing::warn!(server = %self.name, "Skipping tool: {e}"),
                }
            }

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        tracing::warn!(
            server = %self.name,
            pages = MAX_TOOL_PAGES,
            "Stopped following tools/list pagination"
        );
        Ok(tools)
    }

    /// Re-run discovery and publish the result as a new catalog version.
    async fn refresh_tools(&self) -> Result<u64, McpError> {
        let _serialized = self.refresh_lock.lock().await;
        let tools = self.discover_tools(self.request_timeout).await?;
        let tool_count = tools.len();

        let version = {
            let mut catalog = self.catalog.write().await;
            if self.lost.load(Ordering::SeqCst) || self.closing.load(Ordering::SeqCst) {
                return Err(McpError::ConnectionLost {
                    server: self.name.to_string(),
                    reason: "connection closed during tool refresh".to_string(),
                });
            }
            catalog.set_tools(&self.name, tools)
        };

        tracing::info!(server = %self.name, version, tool_count, "MCP tool list refreshed");
        let _ = self.events.send(HubEvent::ToolsChanged {
            server: self.name.clone(),
            version,
            tool_count,
        });
        Ok(version)
    }

    async fn handle_message(self: &Arc<Self>, message: IncomingMessage) {
        match message {
            IncomingMessage::Response { id, outcome } => {
                let Some(id) = numeric_id(&id) else {
                    tracing::warn!(server = %self.name, %id, "Response with unrecognized id");
                    return;
                };
                match outcome {
                    Ok(result) => {
                        self.correlator.resolve(id, result).await;
                    }
                    Err(payload) => {
                        tracing::debug!(
                            server = %self.name,
                            id,
                            code = payload.code,
                            "MCP server returned an error: {}",
                            payload.message
                        );
                        let error = McpError::JsonRpc {
                            server: self.name.to_string(),
                            code: payload.code,
                            message: payload.message,
                            data: payload.data,
                        };
                        self.correlator.reject(id, error).await;
                    }
                }
            }
            IncomingMessage::Notification { method, params } => {
                if method == TOOLS_LIST_CHANGED {
                    // Discovery needs this loop to deliver its responses.
                    let shared = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = shared.refresh_tools().await {
                            tracing::warn!(server = %shared.name, "Tool refresh failed: {e}");
                        }
                    });
                }
                let _ = self.events.send(HubEvent::Notification(ServerNotification {
                    server: self.name.clone(),
                    method,
                    params,
                }));
            }
            IncomingMessage::Request { id, method, .. } => {
                let shared = Arc::clone(self);
                tokio::spawn(async move { shared.answer(id, &method).await });
            }
        }
    }

    /// Reply to a server-initiated request.
    async fn answer(&self, id: serde_json::Value, method: &str) {
        let reply = if method == "ping" {
            JsonRpcReply::result(id, serde_json::json!({}))
        } else {
            tracing::debug!(server = %self.name, method, "Rejecting unsupported server request");
            JsonRpcReply::error(id, METHOD_NOT_FOUND, format!("Method not found: {method}"))
        };
        let written = match serde_json::to_vec(&reply) {
            Ok(line) => self.process.write_line(&line).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            tracing::warn!(server = %self.name, "Failed to answer server request: {e}");
        }
    }

    async fn connection_lost(&self, reason: String) {
        self.lost.store(true, Ordering::SeqCst);
        self.correlator
            .close(CloseReason::ConnectionLost(reason.clone()))
            .await;
        if self.closing.load(Ordering::SeqCst) {
            return;
        }

        tracing::warn!(server = %self.name, %reason, "MCP server connection lost");
        self.catalog.write().await.remove_server(self.name.as_str());
        let _ = self.events.send(HubEvent::ServerExited {
            server: self.name.clone(),
            reason,
        });
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut output: mpsc::Receiver<ProcessEvent>,
    max_frame_len: usize,
) {
    let mut reader = FrameReader::new(max_frame_len);

    let reason = 'events: loop {
        match output.recv().await {
            Some(ProcessEvent::Output(chunk)) => {
                reader.extend(&chunk);
                loop {
                    match reader.next_frame() {
                        Ok(Some(message)) => shared.handle_message(message).await,
                        Ok(None) => break,
                        Err(e) => {
                            tracing::error!(server = %shared.name, "{e}, dropping connection");
                            shared.process.kill();
                            break 'events e.to_string();
                        }
                    }
                }
            }
            Some(ProcessEvent::Exited(info)) => break format!("process exited ({info})"),
            None => break "output stream closed".to_string(),
        }
    };

    shared.connection_lost(reason).await;
}

async fn sweep_loop(shared: Arc<Shared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if shared.correlator.is_closed().await {
            break;
        }
        shared.correlator.sweep_expired(Instant::now()).await;
    }
}

/// How often to look for expired requests given the shortest timeout.
pub(crate) fn sweep_period(timeout: Duration) -> Duration {
    (timeout / 10).clamp(MIN_SWEEP_PERIOD, MAX_SWEEP_PERIOD)
}

/// A handshaken connection to one MCP server.
pub struct ServerConnection {
    shared: Arc<Shared>,
    info: OnceLock<ServerInfo>,
    started_at: DateTime<Utc>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerConnection {
    /// Launch the server, complete the handshake and publish its tools.
    pub(crate) async fn connect(
        name: ServerName,
        config: &McpServerConfig,
        ctx: &ConnectionContext,
    ) -> Result<Self, McpError> {
        let spec = LaunchSpec::from_config(config, ctx.base_dir.as_deref());
        let (process, output) = ProcessSupervisor::launch(name.as_str(), &spec)?;

        let request_timeout = Duration::from_millis(config.timeout_ms);
        let startup_timeout = Duration::from_millis(config.startup_timeout_ms);

        let shared = Arc::new(Shared {
            correlator: RequestCorrelator::new(name.as_str()),
            name,
            process,
            catalog: Arc::clone(&ctx.catalog),
            events: ctx.events.clone(),
            request_timeout,
            refresh_lock: Mutex::new(()),
            closing: AtomicBool::new(false),
            lost: AtomicBool::new(false),
        });

        let period = sweep_period(request_timeout.min(startup_timeout));
        let connection = Self {
            tasks: vec![
                tokio::spawn(read_loop(
                    Arc::clone(&shared),
                    output,
                    ctx.settings.max_frame_bytes,
                )),
                tokio::spawn(sweep_loop(Arc::clone(&shared), period)),
            ],
            shared,
            info: OnceLock::new(),
            started_at: Utc::now(),
        };

        let handshake =
            tokio::time::timeout(startup_timeout, connection.shared.handshake(startup_timeout))
                .await;
        let (info, tools) = match handshake {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => return Err(connection.abandon(e.to_string(), ctx).await),
            Err(_) => {
                let reason = format!("no response within {}ms", config.startup_timeout_ms);
                return Err(connection.abandon(reason, ctx).await);
            }
        };

        let tool_count = tools.len();
        let version = ctx
            .catalog
            .write()
            .await
            .set_tools(&connection.shared.name, tools);
        tracing::info!(
            server = %connection.shared.name,
            tool_count,
            version,
            server_name = ?info.name,
            server_version = ?info.version,
            "MCP server ready"
        );
        let _ = connection.info.set(info);
        Ok(connection)
    }

    /// Tear down a connection whose handshake failed.
    async fn abandon(self, reason: String, ctx: &ConnectionContext) -> McpError {
        tracing::warn!(server = %self.shared.name, %reason, "MCP handshake failed");
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.correlator.close(CloseReason::Shutdown).await;
        let grace = Duration::from_millis(ctx.settings.shutdown_grace_ms);
        self.shared.process.terminate(grace).await;
        McpError::HandshakeFailed {
            server: self.shared.name.to_string(),
            reason,
        }
    }

    pub fn name(&self) -> &ServerName {
        &self.shared.name
    }

    pub fn info(&self) -> ServerInfo {
        self.info.get().cloned().unwrap_or_default()
    }

    /// Whether requests can still be sent to this server.
    pub fn is_alive(&self) -> bool {
        !self.shared.process.has_exited()
            && !self.shared.lost.load(Ordering::SeqCst)
            && !self.shared.closing.load(Ordering::SeqCst)
    }

    /// Send `tools/call` and return the raw result.
    pub async fn call_tool(
        &self,
        tool: &ToolName,
        arguments: serde_json::Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<serde_json::Value, McpError> {
        let params = serde_json::json!({
            "name": tool,
            "arguments": arguments,
        });
        self.shared
            .request("tools/call", Some(params), self.shared.request_timeout, cancel)
            .await
    }

    pub async fn refresh_tools(&self) -> Result<u64, McpError> {
        self.shared.refresh_tools().await
    }

    pub async fn status(&self) -> ServerStatus {
        let (tool_count, catalog_version) = {
            let catalog = self.shared.catalog.read().await;
            let name = self.shared.name.as_str();
            (catalog.tool_count(name), catalog.version(name))
        };
        ServerStatus {
            name: self.shared.name.clone(),
            pid: self.shared.process.pid(),
            alive: self.is_alive(),
            tool_count,
            catalog_version,
            pending_requests: self.shared.correlator.pending_count().await,
            bytes_written: self.shared.process.bytes_written(),
            started_at: self.started_at,
            server_info: self.info(),
        }
    }

    /// Reject outstanding requests, ask the server to stop, and make sure it does.
    pub async fn shutdown(&self, grace: Duration) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let rejected = self.shared.correlator.close(CloseReason::Shutdown).await;
        tracing::debug!(server = %self.shared.name, rejected, "Shutting down MCP server");

        if !self.shared.process.has_exited() {
            if let Err(e) = self.shared.notify("shutdown", None).await {
                tracing::debug!(server = %self.shared.name, "Could not send shutdown notice: {e}");
            }
        }
        self.shared.process.terminate(grace).await;
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.shared.process.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sweep_period_is_clamped() {
        assert_eq!(sweep_period(Duration::from_secs(30)), Duration::from_secs(1));
        assert_eq!(sweep_period(Duration::from_secs(2)), Duration::from_millis(200));
        assert_eq!(sweep_period(Duration::from_millis(50)), Duration::from_millis(10));
    }

    #[test]
    fn server_info_from_initialize_result() {
        let info = ServerInfo::from_initialize(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {"listChanged": true}},
            "serverInfo": {"name": "github", "version": "1.2.0"}
        }));
        assert_eq!(info.name.as_deref(), Some("github"));
        assert_eq!(info.version.as_deref(), Some("1.2.0"));
        assert_eq!(info.protocol_version.as_deref(), Some("2024-11-05"));
        assert_eq!(info.capabilities["tools"]["listChanged"], true);
    }

    #[test]
    fn server_info_tolerates_odd_results() {
        let info = ServerInfo::from_initialize(json!("not an object"));
        assert!(info.name.is_none());
        let info = ServerInfo::from_initialize(json!({}));
        assert!(info.protocol_version.is_none());
    }

    #[test]
    fn deserialize_tool_entry() {
        let json = r#"{
            "name": "read_file",
            "description": "Read a file",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "path": {"type": "string"}
                },
                "required": ["path"]
            }
        }"#;
        let entry: ToolEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.name, "read_file");
        assert_eq!(entry.description.as_deref(), Some("Read a file"));
    }

    #[test]
    fn deserialize_tool_entry_without_description_or_schema() {
        let entry: ToolEntry = serde_json::from_str(r#"{"name": "list"}"#).unwrap();
        assert_eq!(entry.name, "list");
        assert!(entry.description.is_none());
        assert_eq!(entry.input_schema["type"], "object");
    }

    #[test]
    fn deserialize_tools_list_page() {
        let json = r#"{
            "tools": [
                {"name": "a", "description": "Tool A", "inputSchema": {"type": "object"}},
                {"name": "b", "inputSchema": {"type": "object"}}
            ],
            "nextCursor": "page-2"
        }"#;
        let result: ToolsListResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.tools.len(), 2);
        assert_eq!(result.tools[0].name, "a");
        assert_eq!(result.next_cursor.as_deref(), Some("page-2"));

        let last: ToolsListResult = serde_json::from_str(r#"{"tools": []}"#).unwrap();
        assert!(last.next_cursor.is_none());
    }
}
