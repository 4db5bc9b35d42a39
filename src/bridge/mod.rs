//! Event bridge between the broker and dashboard sessions.
//!
//! Each authorized `(tenant, topic)` pair holds one broker subscription,
//! reference-counted by the sessions that asked for it. Inbound broker
//! messages are decoded at this boundary and handed to the connection
//! registry: lifecycle events are broadcast to the whole tenant, everything
//! else goes to the subscribed sessions only.

mod event;
mod presence;
mod topic;

pub use event::{BrokerEvent, DecodeError, Direction, Lifecycle};
pub use presence::PresenceTracker;
pub use topic::{authorize, authorize_subscribe, AuthorizationError, TopicPattern};

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::broker::{Broker, BrokerError, BrokerMessage, BrokerSubscription, MessageHandler};
use crate::connection_manager::{Session, TenantConnectionRegistry};
use crate::metrics::{BROKER_MESSAGES_RECEIVED, BROKER_MESSAGES_REJECTED, SUBSCRIPTIONS_DENIED};
use crate::websocket::{ClientMessage, OutboundMessage, ProtocolError, ServerMessage};

/// Patterns the process-wide presence monitor listens on.
pub const MONITOR_PATTERNS: [&str; 3] = ["agents.*.*.*", "channels.*.*.*", "messages.*.*.*"];

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error("broker subscription failed: {0}")]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    tenant_id: String,
    topic: String,
}

/// session id -> user id
type Subscribers = HashMap<Uuid, String>;

/// The part of the bridge that runs inside broker callbacks. Synchronous and
/// non-blocking: it only touches the registry and the route table.
struct Forwarder {
    registry: Arc<TenantConnectionRegistry>,
    presence: Arc<PresenceTracker>,
    routes: DashMap<RouteKey, Subscribers>,
}

impl Forwarder {
    fn forward(&self, key: &RouteKey, message: BrokerMessage) {
        BROKER_MESSAGES_RECEIVED.inc();

        let event = match BrokerEvent::parse(&message) {
            Ok(event) => event,
            Err(e) => {
                BROKER_MESSAGES_REJECTED.inc();
                tracing::warn!(
                    subject = %message.subject,
                    topic = %key.topic,
                    error = %e,
                    "Dropping undecodable broker message"
                );
                return;
            }
        };

        if event.tenant_id != key.tenant_id {
            BROKER_MESSAGES_REJECTED.inc();
            tracing::warn!(
                subject = %message.subject,
                tenant_id = %key.tenant_id,
                "Dropping broker message for another tenant"
            );
            return;
        }

        let outbound = OutboundMessage::from(event.to_dashboard_event());

        let delivered = if event.is_tenant_wide() {
            self.registry.broadcast(&key.tenant_id, outbound).delivered
        } else {
            let targets: Vec<(Uuid, String)> = self
                .routes
                .get(key)
                .map(|subs| subs.iter().map(|(id, user)| (*id, user.clone())).collect())
                .unwrap_or_default();

            targets
                .into_iter()
                .filter(|(session_id, user_id)| {
                    self.registry
                        .send_to_session(&key.tenant_id, user_id, *session_id, outbound.clone())
                        .is_ok()
                })
                .count()
        };

        self.presence.record_delivered(&key.tenant_id, delivered as u64);

        tracing::trace!(
            subject = %message.subject,
            tenant_id = %key.tenant_id,
            delivered = delivered,
            "Forwarded broker event"
        );
    }
}

pub struct EventBridge {
    broker: Arc<dyn Broker>,
    forwarder: Arc<Forwarder>,
    /// Broker subscriptions per route; the lock serialises open/close.
    handles: Mutex<HashMap<RouteKey, Box<dyn BrokerSubscription>>>,
    monitor: Mutex<Vec<Box<dyn BrokerSubscription>>>,
}

impl EventBridge {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<TenantConnectionRegistry>,
        presence: Arc<PresenceTracker>,
    ) -> Self {
        Self {
            broker,
            forwarder: Arc::new(Forwarder {
                registry,
                presence,
                routes: DashMap::new(),
            }),
            handles: Mutex::new(HashMap::new()),
            monitor: Mutex::new(Vec::new()),
        }
    }

    pub fn presence(&self) -> Arc<PresenceTracker> {
        self.forwarder.presence.clone()
    }

    /// Start feeding the presence tracker from the broker. Idempotent.
    pub async fn start_monitor(&self) -> Result<(), BrokerError> {
        let mut monitor = self.monitor.lock().await;
        if !monitor.is_empty() {
            return Ok(());
        }

        for pattern in MONITOR_PATTERNS {
            let presence = self.forwarder.presence.clone();
            let handler: MessageHandler = Arc::new(move |message: BrokerMessage| {
                match BrokerEvent::parse(&message) {
                    Ok(event) => {
                        presence.apply(&event);
                    }
                    Err(e) => {
                        tracing::debug!(subject = %message.subject, error = %e, "Presence monitor skipped message");
                    }
                }
            });
            monitor.push(self.broker.subscribe(pattern, handler).await?);
        }

        tracing::info!(patterns = ?MONITOR_PATTERNS, "Presence monitor started");
        Ok(())
    }

    pub async fn stop_monitor(&self) {
        let mut monitor = self.monitor.lock().await;
        for subscription in monitor.drain(..) {
            subscription.unsubscribe();
        }
    }

    /// Authorize `topic` for the session and attach it to the shared broker
    /// subscription, opening one if this is the first subscriber.
    #[tracing::instrument(skip(self, session), fields(session_id = %session.id, tenant_id = %session.tenant_id))]
    pub async fn subscribe(&self, session: &Session, topic: &str) -> Result<(), BridgeError> {
        if let Err(e) = authorize(&session.tenant_id, topic) {
            SUBSCRIPTIONS_DENIED.inc();
            tracing::warn!(user_id = %session.user_id, error = %e, "Topic subscription denied");
            return Err(e.into());
        }

        if !session.add_topic(topic).await {
            return Ok(());
        }

        let key = RouteKey {
            tenant_id: session.tenant_id.clone(),
            topic: topic.to_string(),
        };

        let mut handles = self.handles.lock().await;

        self.forwarder
            .routes
            .entry(key.clone())
            .or_default()
            .insert(session.id, session.user_id.clone());

        if handles.contains_key(&key) {
            return Ok(());
        }

        let forwarder = self.forwarder.clone();
        let route = key.clone();
        let handler: MessageHandler =
            Arc::new(move |message: BrokerMessage| forwarder.forward(&route, message));

        match self.broker.subscribe(topic, handler).await {
            Ok(handle) => {
                handles.insert(key, handle);
                tracing::info!("Broker subscription opened");
                Ok(())
            }
            Err(e) => {
                self.detach(&key, session.id);
                session.remove_topic(topic).await;
                tracing::error!(error = %e, "Broker subscription failed");
                Err(e.into())
            }
        }
    }

    /// Detach the session from `topic`, closing the broker subscription when
    /// no session of the tenant needs it any more.
    #[tracing::instrument(skip(self, session), fields(session_id = %session.id, tenant_id = %session.tenant_id))]
    pub async fn unsubscribe(&self, session: &Session, topic: &str) -> Result<(), BridgeError> {
        authorize(&session.tenant_id, topic)?;

        if session.remove_topic(topic).await {
            self.release(session.id, &session.tenant_id, topic).await;
        }
        Ok(())
    }

    /// Drop every subscription the session holds. Safe to call more than once.
    pub async fn release_session(&self, session: &Session) {
        let topics = session.take_topics().await;
        for topic in &topics {
            self.release(session.id, &session.tenant_id, topic).await;
        }
        if !topics.is_empty() {
            tracing::debug!(
                session_id = %session.id,
                tenant_id = %session.tenant_id,
                topics = topics.len(),
                "Released session subscriptions"
            );
        }
    }

    async fn release(&self, session_id: Uuid, tenant_id: &str, topic: &str) {
        let key = RouteKey {
            tenant_id: tenant_id.to_string(),
            topic: topic.to_string(),
        };

        let mut handles = self.handles.lock().await;
        if !self.detach(&key, session_id) {
            return;
        }

        if let Some(handle) = handles.remove(&key) {
            handle.unsubscribe();
            tracing::info!(tenant_id = %tenant_id, topic = %topic, "Broker subscription closed");
        }
    }

    /// Remove one subscriber; true if the route is now unused.
    fn detach(&self, key: &RouteKey, session_id: Uuid) -> bool {
        if let Some(mut subscribers) = self.forwarder.routes.get_mut(key) {
            subscribers.remove(&session_id);
        }
        self.forwarder
            .routes
            .remove_if(key, |_, subscribers| subscribers.is_empty())
            .is_some()
            || !self.forwarder.routes.contains_key(key)
    }

    /// Number of sessions attached to a tenant's topic.
    pub fn subscriber_count(&self, tenant_id: &str, topic: &str) -> usize {
        let key = RouteKey {
            tenant_id: tenant_id.to_string(),
            topic: topic.to_string(),
        };
        self.forwarder.routes.get(&key).map(|s| s.len()).unwrap_or(0)
    }

    /// Broker subscriptions held for dashboard topics (excludes the monitor).
    pub async fn active_routes(&self) -> usize {
        self.handles.lock().await.len()
    }

    /// Handle one text frame from a client and produce the reply.
    pub async fn handle_client_message(&self, session: &Session, text: &str) -> ServerMessage {
        match ClientMessage::parse(text) {
            Ok(ClientMessage::Ping { id, timestamp }) => ServerMessage::pong(id, timestamp),
            Ok(ClientMessage::Subscribe { topic }) => match self.subscribe(session, &topic).await {
                Ok(()) => ServerMessage::subscribed(topic),
                Err(e) => ServerMessage::error(format!("Subscribe to {} failed: {}", topic, e)),
            },
            Ok(ClientMessage::Unsubscribe { topic }) => {
                match self.unsubscribe(session, &topic).await {
                    Ok(()) => ServerMessage::unsubscribed(topic),
                    Err(e) => {
                        ServerMessage::error(format!("Unsubscribe from {} failed: {}", topic, e))
                    }
                }
            }
            Err(ProtocolError::UnknownType(kind)) => {
                ServerMessage::error(format!("Unrecognized message type: {}", kind))
            }
            Err(e @ ProtocolError::Malformed(_)) => ServerMessage::error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::websocket::DashboardEvent;
    use tokio::sync::mpsc;

    struct Fixture {
        broker: Arc<MemoryBroker>,
        registry: Arc<TenantConnectionRegistry>,
        bridge: EventBridge,
    }

    fn fixture() -> Fixture {
        let broker = Arc::new(MemoryBroker::new());
        let registry = Arc::new(TenantConnectionRegistry::new());
        let bridge = EventBridge::new(
            broker.clone(),
            registry.clone(),
            Arc::new(PresenceTracker::new()),
        );
        Fixture {
            broker,
            registry,
            bridge,
        }
    }

    fn connect(
        f: &Fixture,
        tenant: &str,
        user: &str,
    ) -> (Arc<Session>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (f.registry.connect(tenant, user, tx).session, rx)
    }

    fn next_event(rx: &mut mpsc::Receiver<OutboundMessage>) -> Option<Arc<DashboardEvent>> {
        match rx.try_recv() {
            Ok(OutboundMessage::Event(event)) => Some(event),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_subscribe_forwards_targeted_events() {
        let f = fixture();
        let (alice, mut alice_rx) = connect(&f, "acme", "alice");
        let (_bob, mut bob_rx) = connect(&f, "acme", "bob");

        f.bridge.subscribe(&alice, "metrics.acme.*.*").await.unwrap();
        f.broker
            .publish("metrics.acme.a1.sample", br#"{"v":1}"#)
            .await
            .unwrap();

        let event = next_event(&mut alice_rx).unwrap();
        assert_eq!(event.event_type, "metrics.sample");
        assert_eq!(event.topic, "metrics.acme.a1.sample");
        assert!(next_event(&mut bob_rx).is_none());
    }

    #[tokio::test]
    async fn test_lifecycle_events_reach_whole_tenant() {
        let f = fixture();
        let (alice, mut alice_rx) = connect(&f, "acme", "alice");
        let (_bob, mut bob_rx) = connect(&f, "acme", "bob");
        let (_eve, mut eve_rx) = connect(&f, "globex", "eve");

        f.bridge.subscribe(&alice, "agents.acme.*.*").await.unwrap();
        f.broker
            .publish("agents.acme.a1.connected", b"{}")
            .await
            .unwrap();

        assert!(next_event(&mut alice_rx).is_some());
        assert!(next_event(&mut bob_rx).is_some());
        assert!(next_event(&mut eve_rx).is_none());
    }

    #[tokio::test]
    async fn test_foreign_topic_rejected() {
        let f = fixture();
        let (alice, _rx) = connect(&f, "acme", "alice");

        let err = f.bridge.subscribe(&alice, "agents.globex.*.*").await;
        assert!(matches!(
            err,
            Err(BridgeError::Authorization(AuthorizationError::ForeignTenant(_)))
        ));
        assert_eq!(f.broker.active_subscriptions(), 0);
        assert!(alice.topics().await.is_empty());
    }

    #[tokio::test]
    async fn test_shared_topic_is_ref_counted() {
        let f = fixture();
        let (alice, _a) = connect(&f, "acme", "alice");
        let (bob, _b) = connect(&f, "acme", "bob");
        let topic = "agents.acme.*.*";

        f.bridge.subscribe(&alice, topic).await.unwrap();
        f.bridge.subscribe(&bob, topic).await.unwrap();
        assert_eq!(f.broker.subscriptions_for(topic), 1);
        assert_eq!(f.bridge.subscriber_count("acme", topic), 2);

        f.bridge.release_session(&alice).await;
        assert_eq!(f.broker.subscriptions_for(topic), 1);

        f.bridge.release_session(&bob).await;
        assert_eq!(f.broker.subscriptions_for(topic), 0);
        assert_eq!(f.bridge.active_routes().await, 0);
    }

    #[tokio::test]
    async fn test_repeat_subscribe_is_idempotent() {
        let f = fixture();
        let (alice, _rx) = connect(&f, "acme", "alice");
        let topic = "agents.acme.*.*";

        f.bridge.subscribe(&alice, topic).await.unwrap();
        f.bridge.subscribe(&alice, topic).await.unwrap();
        assert_eq!(f.bridge.subscriber_count("acme", topic), 1);

        f.bridge.unsubscribe(&alice, topic).await.unwrap();
        assert_eq!(f.broker.subscriptions_for(topic), 0);

        // Unsubscribing again is harmless
        f.bridge.unsubscribe(&alice, topic).await.unwrap();
        f.bridge.release_session(&alice).await;
    }

    #[tokio::test]
    async fn test_malformed_broker_payload_dropped() {
        let f = fixture();
        let (alice, mut rx) = connect(&f, "acme", "alice");
        f.bridge.subscribe(&alice, "metrics.acme.*.*").await.unwrap();

        f.broker
            .publish("metrics.acme.a1.sample", b"{oops")
            .await
            .unwrap();
        assert!(next_event(&mut rx).is_none());

        f.broker
            .publish("metrics.acme.a1.sample", b"{}")
            .await
            .unwrap();
        assert!(next_event(&mut rx).is_some());
    }

    #[tokio::test]
    async fn test_client_protocol_replies() {
        let f = fixture();
        let (alice, _rx) = connect(&f, "acme", "alice");

        let reply = f
            .bridge
            .handle_client_message(&alice, r#"{"type":"ping","id":7,"timestamp":123}"#)
            .await;
        assert_eq!(
            reply,
            ServerMessage::pong(Some(serde_json::json!(7)), Some(serde_json::json!(123)))
        );

        let reply = f
            .bridge
            .handle_client_message(&alice, r#"{"type":"subscribe","topic":"agents.acme.*.*"}"#)
            .await;
        assert!(matches!(reply, ServerMessage::Subscribed { ref topic, .. } if topic == "agents.acme.*.*"));

        let reply = f
            .bridge
            .handle_client_message(&alice, r#"{"type":"subscribe","topic":"agents.globex.*.*"}"#)
            .await;
        assert!(matches!(reply, ServerMessage::Error { .. }));

        let reply = f
            .bridge
            .handle_client_message(&alice, r#"{"type":"unsubscribe","topic":"agents.acme.*.*"}"#)
            .await;
        assert!(matches!(reply, ServerMessage::Unsubscribed { .. }));

        let reply = f
            .bridge
            .handle_client_message(&alice, r#"{"type":"dance"}"#)
            .await;
        assert!(matches!(reply, ServerMessage::Error { ref message } if message.contains("dance")));
    }

    #[tokio::test]
    async fn test_monitor_feeds_presence() {
        use crate::usage::LiveStateSource;

        let f = fixture();
        f.bridge.start_monitor().await.unwrap();
        f.bridge.start_monitor().await.unwrap();
        assert_eq!(f.broker.active_subscriptions(), MONITOR_PATTERNS.len());

        f.broker
            .publish("agents.acme.a1.connected", b"{}")
            .await
            .unwrap();

        let presence = f.bridge.presence().presence();
        assert_eq!(presence.len(), 1);
        assert_eq!(presence[0].active_agents, 1);

        f.bridge.stop_monitor().await;
        assert_eq!(f.broker.active_subscriptions(), 0);
    }
}
