use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::metrics::{EVENTS_DELIVERED_TOTAL, EVENTS_DROPPED_TOTAL, SESSIONS_ACTIVE};
use crate::websocket::OutboundMessage;

use super::stats::{ConnectionStats, TenantConnectionStats};
use super::types::{DeliveryReport, Session, TransportError};

/// Result of `connect`: the new session plus whichever session it displaced.
///
/// The displaced session's transport is left open; the caller decides how to
/// close it.
pub struct Registration {
    pub session: Arc<Session>,
    pub replaced: Option<Arc<Session>>,
}

/// Live sessions keyed by tenant, then by user.
///
/// Every operation here is synchronous: the table is only touched between
/// suspension points, never across one.
pub struct TenantConnectionRegistry {
    /// tenant_id -> (user_id -> Session)
    tenants: DashMap<String, HashMap<String, Arc<Session>>>,
}

impl TenantConnectionRegistry {
    pub fn new() -> Self {
        Self {
            tenants: DashMap::new(),
        }
    }

    /// Register a session for (tenant_id, user_id), replacing any prior one.
    pub fn connect(
        &self,
        tenant_id: &str,
        user_id: &str,
        transport: mpsc::Sender<OutboundMessage>,
    ) -> Registration {
        let session = Arc::new(Session::new(
            tenant_id.to_string(),
            user_id.to_string(),
            transport,
        ));

        let replaced = self
            .tenants
            .entry(tenant_id.to_string())
            .or_default()
            .insert(user_id.to_string(), session.clone());

        if replaced.is_none() {
            SESSIONS_ACTIVE.inc();
        }

        tracing::info!(
            session_id = %session.id,
            tenant_id = %tenant_id,
            user_id = %user_id,
            replaced = replaced.is_some(),
            "Session registered"
        );

        Registration { session, replaced }
    }

    /// Remove the mapping for (tenant_id, user_id). No-op if absent.
    pub fn disconnect(&self, tenant_id: &str, user_id: &str) -> Option<Arc<Session>> {
        self.remove_where(tenant_id, user_id, |_| true)
    }

    /// Remove the mapping only if it still points at `session`.
    ///
    /// A session's own cleanup must use this so that it cannot evict the
    /// session that replaced it.
    pub fn remove_session(&self, session: &Session) -> bool {
        self.remove_where(&session.tenant_id, &session.user_id, |current| {
            current.id == session.id
        })
        .is_some()
    }

    fn remove_where(
        &self,
        tenant_id: &str,
        user_id: &str,
        predicate: impl Fn(&Session) -> bool,
    ) -> Option<Arc<Session>> {
        let removed = {
            let mut users = self.tenants.get_mut(tenant_id)?;
            let matches = users.get(user_id).map(|s| predicate(s.as_ref())).unwrap_or(false);
            if !matches {
                return None;
            }
            users.remove(user_id)
        };

        // Drop empty tenant entries; re-checked under the shard lock.
        self.tenants.remove_if(tenant_id, |_, users| users.is_empty());

        if let Some(ref session) = removed {
            SESSIONS_ACTIVE.dec();
            tracing::info!(
                session_id = %session.id,
                tenant_id = %tenant_id,
                user_id = %user_id,
                "Session unregistered"
            );
        }

        removed
    }

    /// Deliver to every live session of a tenant.
    ///
    /// A closed transport removes that session only; the remaining sessions
    /// still receive the message.
    pub fn broadcast(&self, tenant_id: &str, message: impl Into<OutboundMessage>) -> DeliveryReport {
        let message = message.into();
        let mut report = DeliveryReport::default();

        for session in self.sessions_for(tenant_id) {
            match self.push_to(&session, message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TransportError::Full) => report.dropped += 1,
                Err(TransportError::Closed) => report.removed += 1,
            }
        }

        tracing::trace!(
            tenant_id = %tenant_id,
            delivered = report.delivered,
            dropped = report.dropped,
            removed = report.removed,
            "Broadcast complete"
        );

        report
    }

    /// Deliver to exactly one session if present.
    pub fn send_to(
        &self,
        tenant_id: &str,
        user_id: &str,
        message: impl Into<OutboundMessage>,
    ) -> Result<(), SendError> {
        let session = self.get(tenant_id, user_id).ok_or(SendError::NotConnected)?;
        self.push_to(&session, message.into()).map_err(SendError::Transport)
    }

    /// Like `send_to`, but only if the current session is `session_id`.
    pub fn send_to_session(
        &self,
        tenant_id: &str,
        user_id: &str,
        session_id: Uuid,
        message: impl Into<OutboundMessage>,
    ) -> Result<(), SendError> {
        let session = self
            .get(tenant_id, user_id)
            .filter(|s| s.id == session_id)
            .ok_or(SendError::NotConnected)?;
        self.push_to(&session, message.into()).map_err(SendError::Transport)
    }

    fn push_to(&self, session: &Arc<Session>, message: OutboundMessage) -> Result<(), TransportError> {
        match session.push(message) {
            Ok(()) => {
                EVENTS_DELIVERED_TOTAL.inc();
                Ok(())
            }
            Err(TransportError::Full) => {
                EVENTS_DROPPED_TOTAL.inc();
                tracing::warn!(
                    session_id = %session.id,
                    tenant_id = %session.tenant_id,
                    user_id = %session.user_id,
                    "Outbound queue full, dropping message"
                );
                Err(TransportError::Full)
            }
            Err(TransportError::Closed) => {
                tracing::debug!(
                    session_id = %session.id,
                    tenant_id = %session.tenant_id,
                    "Transport closed, removing session"
                );
                self.remove_session(session);
                Err(TransportError::Closed)
            }
        }
    }

    pub fn get(&self, tenant_id: &str, user_id: &str) -> Option<Arc<Session>> {
        self.tenants
            .get(tenant_id)
            .and_then(|users| users.get(user_id).cloned())
    }

    /// Snapshot of a tenant's sessions; the table lock is released on return.
    pub fn sessions_for(&self, tenant_id: &str) -> Vec<Arc<Session>> {
        self.tenants
            .get(tenant_id)
            .map(|users| users.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn all_sessions(&self) -> Vec<Arc<Session>> {
        self.tenants
            .iter()
            .flat_map(|entry| entry.value().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn tenant_connection_counts(&self) -> Vec<TenantConnectionStats> {
        self.tenants
            .iter()
            .map(|entry| TenantConnectionStats {
                tenant_id: entry.key().clone(),
                sessions: entry.value().len(),
            })
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.tenants.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn stats(&self) -> ConnectionStats {
        let tenants = self.tenant_connection_counts();
        ConnectionStats {
            total_sessions: tenants.iter().map(|t| t.sessions).sum(),
            tenants,
        }
    }
}

impl Default for TenantConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("no live session for that user")]
    NotConnected,
    #[error(transparent)]
    Transport(TransportError),
}
