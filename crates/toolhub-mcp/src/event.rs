//! Events published by the hub to its subscribers.

use crate::names::ServerName;
use serde::Serialize;

/// A notification sent by a server, tagged with its origin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerNotification {
    pub server: ServerName,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// Something that happened on one of the hub's connections.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    /// A server-initiated notification, forwarded as-is.
    Notification(ServerNotification),
    /// A server's tool set was replaced.
    ToolsChanged {
        server: ServerName,
        version: u64,
        tool_count: usize,
    },
    /// A server's process went away outside of shutdown.
    ServerExited { server: ServerName, reason: String },
}

impl HubEvent {
    pub fn server(&self) -> &ServerName {
        match self {
            Self::Notification(notification) => &notification.server,
            Self::ToolsChanged { server, .. } | Self::ServerExited { server, .. } => server,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn notification_serializes_with_type_tag() {
        let event = HubEvent::Notification(ServerNotification {
            server: ServerName::new("slack").unwrap(),
            method: "notifications/message".into(),
            params: Some(json!({"level": "info"})),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "notification");
        assert_eq!(value["server"], "slack");
        assert_eq!(value["params"]["level"], "info");
        assert_eq!(event.server().as_str(), "slack");
    }
}
