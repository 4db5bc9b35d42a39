//! Decoding of raw broker messages into typed events.

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::broker::BrokerMessage;
use crate::websocket::DashboardEvent;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("subject {0:?} does not have four non-empty segments")]
    Subject(String),

    #[error("payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
}

/// What a lifecycle event says about an agent or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Registered,
    Online,
    Offline,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// A broker message after validation of the 4-segment subject contract.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerEvent {
    pub domain: String,
    pub tenant_id: String,
    pub entity_id: String,
    pub event_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl BrokerEvent {
    /// Decode a broker message.
    ///
    /// A payload object carrying a `data` field is treated as an envelope
    /// (with an optional RFC 3339 `timestamp`); anything else is the data
    /// itself.
    pub fn parse(message: &BrokerMessage) -> Result<Self, DecodeError> {
        let parts: Vec<&str> = message.subject.split('.').collect();
        if parts.len() != 4 || parts.iter().any(|p| p.is_empty()) {
            return Err(DecodeError::Subject(message.subject.clone()));
        }

        let payload: Value = if message.payload.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&message.payload)?
        };

        let (data, timestamp) = match payload {
            Value::Object(mut map) if map.contains_key("data") => {
                let timestamp = map
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc));
                (map.remove("data").unwrap_or(Value::Null), timestamp)
            }
            other => (other, None),
        };

        Ok(Self {
            domain: parts[0].to_string(),
            tenant_id: parts[1].to_string(),
            entity_id: parts[2].to_string(),
            event_type: parts[3].to_string(),
            data,
            timestamp: timestamp.unwrap_or_else(Utc::now),
        })
    }

    pub fn subject(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.domain, self.tenant_id, self.entity_id, self.event_type
        )
    }

    pub fn lifecycle(&self) -> Option<Lifecycle> {
        if self.domain != "agents" && self.domain != "channels" {
            return None;
        }
        match self.event_type.as_str() {
            "created" | "registered" => Some(Lifecycle::Registered),
            "connected" | "online" | "active" | "opened" => Some(Lifecycle::Online),
            "disconnected" | "offline" | "inactive" | "closed" => Some(Lifecycle::Offline),
            "deleted" | "removed" => Some(Lifecycle::Removed),
            _ => None,
        }
    }

    /// Lifecycle events go to every session of the tenant, not only to the
    /// sessions subscribed to the topic.
    pub fn is_tenant_wide(&self) -> bool {
        self.lifecycle().is_some()
    }

    /// For `messages.*` events: direction and message count (`data.count`,
    /// default 1).
    pub fn traffic(&self) -> Option<(Direction, u64)> {
        if self.domain != "messages" {
            return None;
        }
        let direction = match self.event_type.as_str() {
            "in" | "inbound" | "received" => Direction::In,
            "out" | "outbound" | "sent" | "published" => Direction::Out,
            _ => return None,
        };
        let count = self
            .data
            .get("count")
            .and_then(Value::as_u64)
            .unwrap_or(1);
        Some((direction, count))
    }

    /// Dashboard representation: type is `<domain>.<event_type>`.
    pub fn to_dashboard_event(&self) -> DashboardEvent {
        DashboardEvent {
            event_type: format!("{}.{}", self.domain, self.event_type),
            topic: self.subject(),
            data: self.data.clone(),
            timestamp: self.timestamp,
        }
    }
}
