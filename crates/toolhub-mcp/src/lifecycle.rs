//! The hub: starts every configured server, tracks the lifecycle state,
//! and shuts everything down.

use crate::catalog::ToolCatalog;
use crate::config::McpConfig;
use crate::connection::{ConnectionContext, ServerConnection, ServerStatus};
use crate::error::McpError;
use crate::event::HubEvent;
use crate::names::ServerName;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, watch};

/// Where the hub is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    NotStarted,
    Starting,
    Ready,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting down",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A server that could not be brought up.
#[derive(Debug, Clone, Serialize)]
pub struct StartupFailure {
    pub server: String,
    pub error: String,
}

/// Outcome of [`McpHub::initialize`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartupReport {
    /// Servers that completed their handshake, in name order.
    pub ready: Vec<ServerName>,
    pub failed: Vec<StartupFailure>,
    /// Servers skipped because they are disabled.
    pub disabled: Vec<String>,
}

/// Registry of MCP server connections.
///
/// Construct one per service and share it by reference; nothing here is
/// process-global.
pub struct McpHub {
    pub(crate) config: McpConfig,
    pub(crate) state: watch::Sender<LifecycleState>,
    pub(crate) connections: RwLock<BTreeMap<ServerName, Arc<ServerConnection>>>,
    pub(crate) catalog: Arc<RwLock<ToolCatalog>>,
    pub(crate) events: broadcast::Sender<HubEvent>,
    report: OnceLock<StartupReport>,
}

impl McpHub {
    pub fn new(config: McpConfig) -> Self {
        let (events, _) = broadcast::channel(config.settings.event_capacity.max(1));
        let (state, _) = watch::channel(LifecycleState::NotStarted);
        Self {
            config,
            state,
            connections: RwLock::new(BTreeMap::new()),
            catalog: Arc::new(RwLock::new(ToolCatalog::new())),
            events,
            report: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &McpConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Subscribe to server notifications and connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    /// Start every enabled server in parallel and wait for their handshakes.
    ///
    /// Servers that fail to launch or handshake are logged, reported and
    /// left out; the hub becomes ready with whatever came up. Calling this
    /// again, or concurrently, returns the first call's report.
    pub async fn initialize(&self) -> Result<StartupReport, McpError> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == LifecycleState::NotStarted {
                *state = LifecycleState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            let state = self
                .wait_for_state(|state| state != LifecycleState::Starting)
                .await;
            return match state {
                LifecycleState::Ready => Ok(self.report.get().cloned().unwrap_or_default()),
                LifecycleState::ShuttingDown | LifecycleState::Stopped => {
                    Err(McpError::ShuttingDown)
                }
                LifecycleState::NotStarted | LifecycleState::Starting => {
                    Err(McpError::NotInitialized)
                }
            };
        }

        let report = self.start_servers().await;
        tracing::info!(
            ready = report.ready.len(),
            failed = report.failed.len(),
            disabled = report.disabled.len(),
            "MCP hub ready"
        );
        let _ = self.report.set(report.clone());
        self.state.send_replace(LifecycleState::Ready);
        Ok(report)
    }

    async fn start_servers(&self) -> StartupReport {
        let ctx = ConnectionContext {
            catalog: Arc::clone(&self.catalog),
            events: self.events.clone(),
            settings: self.config.settings.clone(),
            base_dir: self.config.base_dir.clone(),
        };

        let mut report = StartupReport::default();
        let mut launches = Vec::new();
        {
            // Ranks follow declaration order, not handshake completion.
            let mut catalog = self.catalog.write().await;
            for (name, server_config) in &self.config.servers {
                if server_config.disabled {
                    tracing::info!(server = %name, "MCP server disabled, skipping");
                    report.disabled.push(name.clone());
                    continue;
                }
                let server = ServerName::new(name.as_str());
                if let Ok(server) = &server {
                    catalog.register_server(server);
                }
                launches.push((name, server_config, server));
            }
        }

        let ctx = &ctx;
        let attempts = launches
            .into_iter()
            .map(|(name, server_config, server)| async move {
                let connection = match server {
                    Ok(server) => ServerConnection::connect(server, server_config, ctx).await,
                    Err(e) => Err(e),
                };
                (name, connection)
            });

        let results = join_all(attempts).await;
        let mut connections = self.connections.write().await;
        for (name, result) in results {
            match result {
                Ok(connection) => {
                    report.ready.push(connection.name().clone());
                    connections.insert(connection.name().clone(), Arc::new(connection));
                }
                Err(e) => {
                    tracing::warn!(server = %name, "Failed to start MCP server: {e}");
                    report.failed.push(StartupFailure {
                        server: name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Stop every server and reject whatever is still outstanding.
    ///
    /// Idempotent: later and concurrent calls wait for the first to finish.
    pub async fn shutdown(&self) {
        loop {
            let current = self.state();
            match current {
                LifecycleState::NotStarted | LifecycleState::Ready => {
                    if self.transition(current, LifecycleState::ShuttingDown) {
                        self.stop_servers().await;
                        self.state.send_replace(LifecycleState::Stopped);
                        tracing::info!("MCP hub stopped");
                        return;
                    }
                }
                LifecycleState::Starting => {
                    self.wait_for_state(|state| state != LifecycleState::Starting)
                        .await;
                }
                LifecycleState::ShuttingDown => {
                    self.wait_for_state(|state| state == LifecycleState::Stopped)
                        .await;
                    return;
                }
                LifecycleState::Stopped => return,
            }
        }
    }

    async fn stop_servers(&self) {
        let connections: Vec<Arc<ServerConnection>> =
            std::mem::take(&mut *self.connections.write().await)
                .into_values()
                .collect();
        let grace = Duration::from_millis(self.config.settings.shutdown_grace_ms);
        tracing::debug!(servers = connections.len(), "Shutting down MCP servers");

        join_all(connections.iter().map(|connection| connection.shutdown(grace))).await;
        self.catalog.write().await.clear();
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    async fn wait_for_state<F>(&self, done: F) -> LifecycleState
    where
        F: Fn(LifecycleState) -> bool,
    {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|state| done(*state)).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Status of every started server, in name order.
    pub async fn server_status(&self) -> Vec<ServerStatus> {
        let connections: Vec<Arc<ServerConnection>> =
            self.connections.read().await.values().cloned().collect();
        let mut statuses = Vec::with_capacity(connections.len());
        for connection in connections {
            statuses.push(connection.status().await);
        }
        statuses
    }

    /// The report of the first [`initialize`](Self::initialize), once it has finished.
    pub fn startup_report(&self) -> Option<&StartupReport> {
        self.report.get()
    }
}
