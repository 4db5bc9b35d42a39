//! Topic-based message broker interface.
//!
//! Subjects follow `<domain>.<tenant_id>.<entity_id>.<event_type>`; patterns use
//! `*` for a whole segment. Two backends are provided:
//! - `MemoryBroker`: in-process fan-out, used for single-node setups and tests
//! - `RedisBroker`: Redis Pub/Sub with one PSUBSCRIBE per pattern

mod backoff;
mod memory;
mod redis;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use memory::MemoryBroker;
pub use self::redis::RedisBroker;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{BrokerConfig, RedisConfig};

/// A raw message as delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

impl BrokerMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
        }
    }
}

/// Invoked for every message matching a subscription. Must not block.
pub type MessageHandler = Arc<dyn Fn(BrokerMessage) + Send + Sync>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),
}

/// Live subscription. Dropping it releases the broker-side subscription too.
pub trait BrokerSubscription: Send + Sync {
    fn pattern(&self) -> &str;

    fn unsubscribe(self: Box<Self>);
}

#[async_trait]
pub trait Broker: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn subscribe(
        &self,
        pattern: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn BrokerSubscription>, BrokerError>;

    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Number of subscriptions currently held open.
    fn active_subscriptions(&self) -> usize;
}

/// Segment-wise glob match: `*` matches exactly one segment.
pub fn pattern_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_parts = pattern.split('.');
    let mut subject_parts = subject.split('.');

    loop {
        match (pattern_parts.next(), subject_parts.next()) {
            (None, None) => return true,
            (Some(p), Some(s)) if p == "*" || p == s => continue,
            _ => return false,
        }
    }
}

/// Create a broker based on configuration, falling back to memory.
pub fn create_broker(config: &BrokerConfig, redis: &RedisConfig) -> Arc<dyn Broker> {
    match config.backend.as_str() {
        "redis" => match RedisBroker::new(redis) {
            Ok(broker) => {
                tracing::info!(backend = "redis", "Creating Redis broker");
                Arc::new(broker)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Redis broker requested but client could not be created, falling back to memory"
                );
                Arc::new(MemoryBroker::new())
            }
        },
        "memory" => {
            tracing::info!(backend = "memory", "Creating in-process broker");
            Arc::new(MemoryBroker::new())
        }
        other => {
            tracing::warn!(backend = %other, "Unknown broker backend, falling back to memory");
            Arc::new(MemoryBroker::new())
        }
    }
}
