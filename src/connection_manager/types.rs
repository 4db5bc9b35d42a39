//! Session handle and related types

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, Notify, RwLock};
use uuid::Uuid;

use crate::websocket::OutboundMessage;

/// Failure to push a message to a session's transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer's writer is gone; the session is dead.
    #[error("transport closed")]
    Closed,
    /// The outbound queue is full; this message was dropped.
    #[error("outbound queue full")]
    Full,
}

/// One live client connection bound to a (tenant_id, user_id) pair.
pub struct Session {
    pub id: Uuid,
    pub tenant_id: String,
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::Sender<OutboundMessage>,
    subscribed_topics: RwLock<HashSet<String>>,
    closed: Notify,
}

impl Session {
    pub fn new(tenant_id: String, user_id: String, sender: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            user_id,
            connected_at: Utc::now(),
            sender,
            subscribed_topics: RwLock::new(HashSet::new()),
            closed: Notify::new(),
        }
    }

    /// Push a message without waiting. Never blocks the caller, which is
    /// usually a broker callback.
    pub fn push(&self, message: impl Into<OutboundMessage>) -> Result<(), TransportError> {
        self.sender.try_send(message.into()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    pub fn is_transport_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Ask the session's pump to stop. Used when a newer session replaces this one.
    pub fn close(&self) {
        self.closed.notify_one();
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        self.closed.notified().await
    }

    pub async fn add_topic(&self, topic: &str) -> bool {
        self.subscribed_topics.write().await.insert(topic.to_string())
    }

    pub async fn remove_topic(&self, topic: &str) -> bool {
        self.subscribed_topics.write().await.remove(topic)
    }

    pub async fn has_topic(&self, topic: &str) -> bool {
        self.subscribed_topics.read().await.contains(topic)
    }

    pub async fn topics(&self) -> Vec<String> {
        self.subscribed_topics.read().await.iter().cloned().collect()
    }

    /// Remove and return every topic; used during session teardown.
    pub async fn take_topics(&self) -> Vec<String> {
        self.subscribed_topics.write().await.drain().collect()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("user_id", &self.user_id)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

/// Outcome of a single `broadcast` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Dropped because the session's queue was full
    pub dropped: usize,
    /// Sessions removed because their transport was closed
    pub removed: usize,
}
