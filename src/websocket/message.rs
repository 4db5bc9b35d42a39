use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Ping {
        #[serde(default)]
        id: Option<Value>,
        #[serde(default)]
        timestamp: Option<Value>,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unrecognized message type: {0}")]
    UnknownType(String),
}

impl ClientMessage {
    /// Parse a text frame. Unknown `type` values are reported separately from
    /// malformed payloads so the client can be told which one it sent.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing \"type\" field".to_string()))?;

        match kind {
            "ping" | "subscribe" | "unsubscribe" => {
                serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
            }
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// Control messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<Value>,
    },
    Subscribed {
        topic: String,
        timestamp: DateTime<Utc>,
    },
    Unsubscribed {
        topic: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn pong(id: Option<Value>, timestamp: Option<Value>) -> Self {
        Self::Pong { id, timestamp }
    }

    pub fn subscribed(topic: impl Into<String>) -> Self {
        Self::Subscribed {
            topic: topic.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn unsubscribed(topic: impl Into<String>) -> Self {
        Self::Unsubscribed {
            topic: topic.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Dashboard-facing domain event, e.g. `{"type":"agents.connected", ...}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub topic: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// What actually travels through a session's outbound queue.
///
/// Events are shared behind an `Arc` so a tenant-wide broadcast allocates the
/// payload once regardless of the number of sessions.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Control(ServerMessage),
    Event(Arc<DashboardEvent>),
}

impl OutboundMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            OutboundMessage::Control(msg) => serde_json::to_string(msg),
            OutboundMessage::Event(event) => serde_json::to_string(event.as_ref()),
        }
    }
}

impl From<ServerMessage> for OutboundMessage {
    fn from(msg: ServerMessage) -> Self {
        OutboundMessage::Control(msg)
    }
}

impl From<DashboardEvent> for OutboundMessage {
    fn from(event: DashboardEvent) -> Self {
        OutboundMessage::Event(Arc::new(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_ping_keeps_client_fields() {
        let msg = ClientMessage::parse(r#"{"type":"ping","id":"abc","timestamp":1700000000}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Ping {
                id: Some(json!("abc")),
                timestamp: Some(json!(1700000000)),
            }
        );
    }

    #[test]
    fn test_parse_subscribe() {
        let msg = ClientMessage::parse(r#"{"type":"subscribe","topic":"agents.acme.*.*"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                topic: "agents.acme.*.*".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_type_is_distinguished() {
        let err = ClientMessage::parse(r#"{"type":"reboot"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType("reboot".to_string()));
    }

    #[test]
    fn test_malformed_messages() {
        assert!(matches!(
            ClientMessage::parse("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"topic":"x"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"subscribe"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_pong_echoes_fields() {
        let json = serde_json::to_value(ServerMessage::pong(Some(json!(7)), Some(json!("t")))).unwrap();
        assert_eq!(json, json!({"type": "pong", "id": 7, "timestamp": "t"}));

        let bare = serde_json::to_value(ServerMessage::pong(None, None)).unwrap();
        assert_eq!(bare, json!({"type": "pong"}));
    }

    #[test]
    fn test_error_shape() {
        let json = serde_json::to_value(ServerMessage::error("nope")).unwrap();
        assert_eq!(json, json!({"type": "error", "message": "nope"}));
    }

    #[test]
    fn test_event_serialization() {
        let event = DashboardEvent {
            event_type: "agents.connected".to_string(),
            topic: "agents.acme.a1.connected".to_string(),
            data: json!({"host": "edge-1"}),
            timestamp: Utc::now(),
        };
        let text = OutboundMessage::from(event).to_json().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "agents.connected");
        assert_eq!(value["topic"], "agents.acme.a1.connected");
        assert_eq!(value["data"]["host"], "edge-1");
        assert!(value["timestamp"].is_string());
    }
}
