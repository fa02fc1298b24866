//! Multi-server MCP (Model Context Protocol) client.
//!
//! Each configured server is spawned as a child process speaking
//! newline-delimited JSON-RPC 2.0 over stdio. The [`McpHub`] performs the
//! handshake with every server in parallel, keeps a versioned catalog of
//! the tools they expose, and routes concurrent tool invocations to them,
//! matching responses to requests by id.

pub mod catalog;
pub mod config;
pub mod connection;
pub mod correlator;
mod dispatch;
pub mod error;
pub mod event;
pub mod frame;
pub mod jsonrpc;
pub mod lifecycle;
pub mod names;
pub mod process;

pub use catalog::{ToolCatalog, ToolDescriptor, ToolInfo};
pub use config::{HubSettings, McpConfig, McpServerConfig};
pub use connection::{ServerInfo, ServerStatus};
pub use error::McpError;
pub use event::{HubEvent, ServerNotification};
pub use lifecycle::{LifecycleState, McpHub, StartupFailure, StartupReport};
pub use names::{QualifiedToolName, ServerName, ToolName};
pub use tokio_util::sync::CancellationToken;
