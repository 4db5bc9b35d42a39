//! Per-tenant live state derived from the broker event stream.

use std::collections::HashSet;

use dashmap::DashMap;

use crate::usage::{LiveStateSource, TenantPresence, TenantTraffic};

use super::event::{BrokerEvent, Direction, Lifecycle};

#[derive(Debug, Default)]
struct EntitySet {
    known: HashSet<String>,
    active: HashSet<String>,
}

impl EntitySet {
    fn apply(&mut self, entity_id: &str, change: Lifecycle) {
        match change {
            Lifecycle::Registered => {
                self.known.insert(entity_id.to_string());
            }
            Lifecycle::Online => {
                self.known.insert(entity_id.to_string());
                self.active.insert(entity_id.to_string());
            }
            Lifecycle::Offline => {
                self.known.insert(entity_id.to_string());
                self.active.remove(entity_id);
            }
            Lifecycle::Removed => {
                self.known.remove(entity_id);
                self.active.remove(entity_id);
            }
        }
    }
}

#[derive(Debug, Default)]
struct TenantState {
    agents: EntitySet,
    channels: EntitySet,
}

#[derive(Debug, Default)]
struct Traffic {
    messages_in: u64,
    messages_out: u64,
    delivered: u64,
}

/// Tracks known/active agents and channels plus message traffic per tenant.
///
/// Fed by the bridge's process-wide monitor subscription and sampled by the
/// metrics aggregator. Only lifecycle events create presence entries; traffic
/// is kept apart and removed on every drain.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    tenants: DashMap<String, TenantState>,
    traffic: DashMap<String, Traffic>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one broker event into the tenant's state. Returns false if the
    /// event carries nothing presence-related.
    pub fn apply(&self, event: &BrokerEvent) -> bool {
        if let Some(change) = event.lifecycle() {
            let mut state = self.tenants.entry(event.tenant_id.clone()).or_default();
            match event.domain.as_str() {
                "agents" => state.agents.apply(&event.entity_id, change),
                "channels" => state.channels.apply(&event.entity_id, change),
                _ => return false,
            }
            return true;
        }

        if let Some((direction, count)) = event.traffic() {
            let mut traffic = self.traffic.entry(event.tenant_id.clone()).or_default();
            match direction {
                Direction::In => traffic.messages_in = traffic.messages_in.saturating_add(count),
                Direction::Out => traffic.messages_out = traffic.messages_out.saturating_add(count),
            }
            return true;
        }

        false
    }

    /// Count events handed to dashboard sessions of a tenant.
    pub fn record_delivered(&self, tenant_id: &str, count: u64) {
        if count == 0 {
            return;
        }
        let mut traffic = self.traffic.entry(tenant_id.to_string()).or_default();
        traffic.delivered = traffic.delivered.saturating_add(count);
    }
}

impl LiveStateSource for PresenceTracker {
    fn presence(&self) -> Vec<TenantPresence> {
        self.tenants
            .iter()
            .map(|entry| {
                let state = entry.value();
                TenantPresence {
                    tenant_id: entry.key().clone(),
                    agents: state.agents.known.len() as u64,
                    active_agents: state.agents.active.len() as u64,
                    channels: state.channels.known.len() as u64,
                    active_channels: state.channels.active.len() as u64,
                }
            })
            .collect()
    }

    fn drain_traffic(&self) -> Vec<TenantTraffic> {
        let tenants: Vec<String> = self.traffic.iter().map(|entry| entry.key().clone()).collect();
        tenants
            .into_iter()
            .filter_map(|tenant_id| self.traffic.remove(&tenant_id))
            .filter(|(_, t)| t.messages_in > 0 || t.messages_out > 0 || t.delivered > 0)
            .map(|(tenant_id, t)| TenantTraffic {
                tenant_id,
                messages_in: t.messages_in,
                messages_out: t.messages_out,
                delivered: t.delivered,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerMessage;

    fn apply(tracker: &PresenceTracker, subject: &str, payload: &str) -> bool {
        let event = BrokerEvent::parse(&BrokerMessage::new(subject, payload.as_bytes().to_vec()))
            .unwrap();
        tracker.apply(&event)
    }

    fn presence_of(tracker: &PresenceTracker, tenant: &str) -> TenantPresence {
        tracker
            .presence()
            .into_iter()
            .find(|p| p.tenant_id == tenant)
            .unwrap()
    }

    #[test]
    fn test_agent_lifecycle() {
        let tracker = PresenceTracker::new();
        apply(&tracker, "agents.acme.a1.connected", "{}");
        apply(&tracker, "agents.acme.a2.connected", "{}");
        apply(&tracker, "agents.acme.a3.registered", "{}");
        apply(&tracker, "agents.acme.a2.disconnected", "{}");

        let p = presence_of(&tracker, "acme");
        assert_eq!(p.agents, 3);
        assert_eq!(p.active_agents, 1);

        apply(&tracker, "agents.acme.a1.removed", "{}");
        let p = presence_of(&tracker, "acme");
        assert_eq!(p.agents, 2);
        assert_eq!(p.active_agents, 0);
    }

    #[test]
    fn test_tenants_are_separate() {
        let tracker = PresenceTracker::new();
        apply(&tracker, "channels.acme.c1.created", "{}");
        apply(&tracker, "channels.globex.c1.opened", "{}");

        let acme = presence_of(&tracker, "acme");
        assert_eq!((acme.channels, acme.active_channels), (1, 0));
        let globex = presence_of(&tracker, "globex");
        assert_eq!((globex.channels, globex.active_channels), (1, 1));
    }

    #[test]
    fn test_traffic_drains_to_zero() {
        let tracker = PresenceTracker::new();
        apply(&tracker, "messages.acme.c1.in", r#"{"count":5}"#);
        apply(&tracker, "messages.acme.c1.in", "{}");
        apply(&tracker, "messages.acme.c1.out", "{}");
        tracker.record_delivered("acme", 2);

        let drained = tracker.drain_traffic();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].messages_in, 6);
        assert_eq!(drained[0].messages_out, 1);
        assert_eq!(drained[0].delivered, 2);

        assert!(tracker.drain_traffic().is_empty());
    }

    #[test]
    fn test_traffic_does_not_create_presence() {
        let tracker = PresenceTracker::new();
        apply(&tracker, "messages.acme.c1.in", "{}");
        tracker.record_delivered("globex", 3);

        assert!(tracker.presence().is_empty());
        assert_eq!(tracker.drain_traffic().len(), 2);
        assert!(tracker.traffic.is_empty());
    }

    #[test]
    fn test_irrelevant_event_ignored() {
        let tracker = PresenceTracker::new();
        assert!(!apply(&tracker, "agents.acme.a1.heartbeat", "{}"));
        assert!(tracker.presence().is_empty());
    }
}
