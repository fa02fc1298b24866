//! Error types for MCP operations.

use thiserror::Error;

/// Errors from MCP server communication.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Failed to spawn MCP server '{server}' ({command}): {source}")]
    SpawnFailed {
        server: String,
        command: String,
        source: std::io::Error,
    },

    #[error("MCP server '{server}' failed its handshake: {reason}")]
    HandshakeFailed { server: String, reason: String },

    #[error("Failed to write to MCP server '{server}': {reason}")]
    WriteFailed { server: String, reason: String },

    #[error("MCP request '{method}' to '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    #[error("Lost connection to MCP server '{server}': {reason}")]
    ConnectionLost { server: String, reason: String },

    #[error("JSON-RPC error from '{server}' (code {code}): {message}")]
    JsonRpc {
        server: String,
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Unknown MCP server '{server}'")]
    UnknownServer { server: String },

    #[error("Unknown tool '{tool}' on MCP server '{server}'")]
    UnknownTool { server: String, tool: String },

    #[error("MCP hub is not initialized")]
    NotInitialized,

    #[error("MCP hub is shutting down")]
    ShuttingDown,

    #[error("MCP request '{method}' to '{server}' was cancelled")]
    Cancelled { server: String, method: String },

    #[error("MCP frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Invalid {kind} name '{name}': {reason}")]
    InvalidName {
        kind: &'static str,
        name: String,
        reason: &'static str,
    },

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// The server this error is attributed to, if any.
    pub fn server(&self) -> Option<&str> {
        match self {
            Self::SpawnFailed { server, .. }
            | Self::HandshakeFailed { server, .. }
            | Self::WriteFailed { server, .. }
            | Self::Timeout { server, .. }
            | Self::ConnectionLost { server, .. }
            | Self::JsonRpc { server, .. }
            | Self::UnknownServer { server }
            | Self::UnknownTool { server, .. }
            | Self::Cancelled { server, .. } => Some(server),
            _ => None,
        }
    }
}
