//! Request/response correlation for one server connection.
//!
//! Every outgoing request gets the next id and a [`PendingRequest`] entry.
//! The entry is removed exactly once: by a matching response, by the timeout
//! sweep, by cancellation, or when the connection closes. Removal and
//! completion happen under the same lock, so no request can be completed
//! twice and no id can be reused while it is outstanding.

use crate::error::McpError;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;

type Outcome = Result<serde_json::Value, McpError>;

/// An in-flight request awaiting its response.
#[derive(Debug)]
pub struct PendingRequest {
    pub id: u64,
    pub method: String,
    pub created_at: Instant,
    pub timeout: Duration,
    responder: oneshot::Sender<Outcome>,
}

impl PendingRequest {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.timeout
    }
}

/// Why a correlator stopped accepting requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ConnectionLost(String),
    Shutdown,
}

impl CloseReason {
    fn to_error(&self, server: &str) -> McpError {
        match self {
            Self::ConnectionLost(reason) => McpError::ConnectionLost {
                server: server.to_string(),
                reason: reason.clone(),
            },
            Self::Shutdown => McpError::ShuttingDown,
        }
    }
}

/// The caller's side of a registered request.
#[derive(Debug)]
pub struct PendingHandle {
    id: u64,
    server: String,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the request to be resolved or rejected.
    ///
    /// Safe to call again after the future is dropped; the outcome stays
    /// buffered until it is received.
    pub async fn wait(&mut self) -> Outcome {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            Err(_) => Err(McpError::ConnectionLost {
                server: self.server.clone(),
                reason: "request was dropped without a response".to_string(),
            }),
        }
    }
}

#[derive(Debug)]
struct PendingTable {
    next_id: u64,
    entries: HashMap<u64, PendingRequest>,
    closed: Option<CloseReason>,
}

/// Tracks outstanding requests for one server.
#[derive(Debug)]
pub struct RequestCorrelator {
    server: String,
    table: Mutex<PendingTable>,
}

impl RequestCorrelator {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            table: Mutex::new(PendingTable {
                next_id: 1,
                entries: HashMap::new(),
                closed: None,
            }),
        }
    }

    /// Allocate the next id and start tracking a request.
    pub async fn register(&self, method: &str, timeout: Duration) -> Result<PendingHandle, McpError> {
        let mut table = self.table.lock().await;
        if let Some(reason) = &table.closed {
            return Err(reason.to_error(&self.server));
        }

        let id = table.next_id;
        table.next_id += 1;

        let (tx, rx) = oneshot::channel();
        table.entries.insert(
            id,
            PendingRequest {
                id,
                method: method.to_string(),
                created_at: Instant::now(),
                timeout,
                responder: tx,
            },
        );

        Ok(PendingHandle {
            id,
            server: self.server.clone(),
            rx,
        })
    }

    /// Complete a request successfully. Returns `false` for an unknown id.
    pub async fn resolve(&self, id: u64, result: serde_json::Value) -> bool {
        self.complete(id, Ok(result)).await
    }

    /// Complete a request with an error. Returns `false` for an unknown id.
    pub async fn reject(&self, id: u64, error: McpError) -> bool {
        self.complete(id, Err(error)).await
    }

    /// Stop tracking a request without completing it.
    pub async fn discard(&self, id: u64) -> bool {
        self.table.lock().await.entries.remove(&id).is_some()
    }

    async fn complete(&self, id: u64, outcome: Outcome) -> bool {
        let Some(entry) = self.table.lock().await.entries.remove(&id) else {
            tracing::warn!(
                server = %self.server,
                id,
                "Discarding response for unknown or expired request"
            );
            return false;
        };
        if entry.responder.send(outcome).is_err() {
            tracing::debug!(server = %self.server, id, "Requester went away before its response");
        }
        true
    }

    /// Reject every request that has outlived its timeout as of `now`.
    pub async fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<PendingRequest> = {
            let mut table = self.table.lock().await;
            let ids: Vec<u64> = table
                .entries
                .values()
                .filter(|entry| entry.is_expired(now))
                .map(|entry| entry.id)
                .collect();
            ids.iter()
                .filter_map(|id| table.entries.remove(id))
                .collect()
        };

        for entry in &expired {
            tracing::warn!(
                server = %self.server,
                id = entry.id,
                method = %entry.method,
                "MCP request timed out"
            );
        }
        let count = expired.len();
        for entry in expired {
            let error = McpError::Timeout {
                server: self.server.clone(),
                method: entry.method,
                timeout_ms: u64::try_from(entry.timeout.as_millis()).unwrap_or(u64::MAX),
            };
            let _ = entry.responder.send(Err(error));
        }
        count
    }

    /// Reject everything outstanding and refuse new registrations.
    ///
    /// Only the first close takes effect; later calls return 0.
    pub async fn close(&self, reason: CloseReason) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut table = self.table.lock().await;
            if table.closed.is_some() {
                return 0;
            }
            table.closed = Some(reason.clone());
            table.entries.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        for entry in drained {
            let _ = entry.responder.send(Err(reason.to_error(&self.server)));
        }
        if count > 0 {
            tracing::warn!(server = %self.server, count, ?reason, "Rejected outstanding MCP requests");
        }
        count
    }

    pub async fn is_closed(&self) -> bool {
        self.table.lock().await.closed.is_some()
    }

    pub async fn pending_count(&self) -> usize {
        self.table.lock().await.entries.len()
    }

    /// Outstanding ids in ascending order.
    pub async fn pending_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.table.lock().await.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
