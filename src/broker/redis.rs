//! Redis Pub/Sub broker backend.
//!
//! Each subscription owns a dedicated Pub/Sub connection driven by its own
//! task, so tearing one pattern down never disturbs another. Publishing goes
//! through a shared multiplexed connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{AsyncCommands, Client};
use tokio::sync::{oneshot, RwLock};

use crate::config::RedisConfig;

use super::{
    Broker, BrokerError, BrokerMessage, BrokerSubscription, ExponentialBackoff, MessageHandler,
};

pub struct RedisBroker {
    client: Client,
    publisher: RwLock<Option<MultiplexedConnection>>,
    active: Arc<AtomicUsize>,
}

impl RedisBroker {
    pub fn new(config: &RedisConfig) -> Result<Self, BrokerError> {
        let client = Client::open(config.url.as_str())?;
        Ok(Self {
            client,
            publisher: RwLock::new(None),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    async fn publisher(&self) -> Result<MultiplexedConnection, BrokerError> {
        {
            let conn = self.publisher.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        let mut guard = self.publisher.write().await;
        // Another task may have connected while we waited
        if let Some(ref c) = *guard {
            return Ok(c.clone());
        }

        let conn = self.client.get_multiplexed_tokio_connection().await?;
        *guard = Some(conn.clone());
        tracing::info!("Redis publisher connection established");
        Ok(conn)
    }
}

async fn open_pubsub(client: &Client, pattern: &str) -> Result<PubSub, BrokerError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(pattern).await?;
    Ok(pubsub)
}

/// Drive one pattern subscription until stopped, reconnecting on stream loss.
async fn pump(
    client: Client,
    pattern: String,
    handler: MessageHandler,
    mut pubsub: PubSub,
    mut stop: oneshot::Receiver<()>,
) {
    let mut backoff = ExponentialBackoff::new();

    loop {
        {
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = &mut stop => {
                        tracing::debug!(pattern = %pattern, "Redis subscription stopped");
                        return;
                    }
                    msg = stream.next() => match msg {
                        Some(msg) => handler(BrokerMessage::new(
                            msg.get_channel_name(),
                            msg.get_payload_bytes().to_vec(),
                        )),
                        None => break,
                    }
                }
            }
        }

        tracing::warn!(pattern = %pattern, "Redis message stream ended, reconnecting");

        loop {
            let delay = backoff.next_delay();
            tokio::select! {
                _ = &mut stop => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match open_pubsub(&client, &pattern).await {
                Ok(fresh) => {
                    pubsub = fresh;
                    tracing::info!(
                        pattern = %pattern,
                        attempts = backoff.attempt(),
                        "Redis subscription re-established"
                    );
                    backoff.reset();
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        pattern = %pattern,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Redis resubscribe failed"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn BrokerSubscription>, BrokerError> {
        if pattern.is_empty() {
            return Err(BrokerError::InvalidPattern(pattern.to_string()));
        }

        let pubsub = open_pubsub(&self.client, pattern).await?;
        let (stop_tx, stop_rx) = oneshot::channel();

        tokio::spawn(pump(
            self.client.clone(),
            pattern.to_string(),
            handler,
            pubsub,
            stop_rx,
        ));

        self.active.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(pattern = %pattern, "Redis pattern subscription opened");

        Ok(Box::new(RedisSubscription {
            pattern: pattern.to_string(),
            stop: Some(stop_tx),
            active: self.active.clone(),
        }))
    }

    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut conn = self.publisher().await?;
        let published: Result<i64, redis::RedisError> = conn.publish(subject, payload).await;
        match published {
            Ok(_) => Ok(()),
            Err(e) => {
                // Force a fresh connection next time
                *self.publisher.write().await = None;
                Err(BrokerError::Redis(e))
            }
        }
    }

    fn active_subscriptions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

struct RedisSubscription {
    pattern: String,
    stop: Option<oneshot::Sender<()>>,
    active: Arc<AtomicUsize>,
}

impl BrokerSubscription for RedisSubscription {
    fn pattern(&self) -> &str {
        &self.pattern
    }

    fn unsubscribe(self: Box<Self>) {}
}

impl Drop for RedisSubscription {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
            self.active.fetch_sub(1, Ordering::Relaxed);
            tracing::debug!(pattern = %self.pattern, "Redis pattern subscription released");
        }
    }
}
