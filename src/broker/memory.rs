//! In-process broker backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{
    pattern_matches, Broker, BrokerError, BrokerMessage, BrokerSubscription, MessageHandler,
};

type SubscriptionTable = DashMap<u64, (String, MessageHandler)>;

/// Delivers published messages synchronously to every matching handler.
pub struct MemoryBroker {
    subscriptions: Arc<SubscriptionTable>,
    next_id: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            subscriptions: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of subscriptions whose pattern is exactly `pattern`.
    pub fn subscriptions_for(&self, pattern: &str) -> usize {
        self.subscriptions
            .iter()
            .filter(|entry| entry.value().0 == pattern)
            .count()
    }

    fn deliver(&self, subject: &str, payload: &[u8]) -> usize {
        // Collect first so handlers run without holding any shard lock.
        let handlers: Vec<MessageHandler> = self
            .subscriptions
            .iter()
            .filter(|entry| pattern_matches(&entry.value().0, subject))
            .map(|entry| entry.value().1.clone())
            .collect();

        for handler in &handlers {
            handler(BrokerMessage::new(subject, payload.to_vec()));
        }

        handlers.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn BrokerSubscription>, BrokerError> {
        if pattern.is_empty() {
            return Err(BrokerError::InvalidPattern(pattern.to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.insert(id, (pattern.to_string(), handler));

        tracing::debug!(pattern = %pattern, subscription_id = id, "Memory subscription opened");

        Ok(Box::new(MemorySubscription {
            id,
            pattern: pattern.to_string(),
            table: self.subscriptions.clone(),
        }))
    }

    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let receivers = self.deliver(subject, payload);
        tracing::trace!(subject = %subject, receivers = receivers, "Published message");
        Ok(())
    }

    fn active_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }
}

struct MemorySubscription {
    id: u64,
    pattern: String,
    table: Arc<SubscriptionTable>,
}

impl BrokerSubscription for MemorySubscription {
    fn pattern(&self) -> &str {
        &self.pattern
    }

    fn unsubscribe(self: Box<Self>) {
        // Drop does the work.
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.table.remove(&self.id);
        tracing::debug!(pattern = %self.pattern, subscription_id = self.id, "Memory subscription closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_handler() -> (MessageHandler, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: MessageHandler = Arc::new(move |msg: BrokerMessage| {
            sink.lock().unwrap().push(msg.subject);
        });
        (handler, seen)
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let broker = MemoryBroker::new();
        let (handler, seen) = recording_handler();

        let _sub = broker.subscribe("agents.acme.*.*", handler).await.unwrap();

        broker.publish("agents.acme.a1.connected", b"{}").await.unwrap();
        broker.publish("agents.globex.a1.connected", b"{}").await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["agents.acme.a1.connected".to_string()]);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let broker = MemoryBroker::new();
        let (handler, seen) = recording_handler();

        let sub = broker.subscribe("agents.acme.*.*", handler).await.unwrap();
        assert_eq!(broker.active_subscriptions(), 1);
        assert_eq!(sub.pattern(), "agents.acme.*.*");

        sub.unsubscribe();
        assert_eq!(broker.active_subscriptions(), 0);

        broker.publish("agents.acme.a1.connected", b"{}").await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_pattern_rejected() {
        let broker = MemoryBroker::new();
        let (handler, _) = recording_handler();
        assert!(broker.subscribe("", handler).await.is_err());
    }
}
