//! Optional external relay for cross-process fan-out
//!
//! A relay carries [`RelayEnvelope`]s between hub instances. It is
//! best-effort: hubs log relay failures and keep delivering locally.

use crate::error::RelayError;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// A published message as it travels over the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Hub that published the message
    pub origin: Uuid,
    pub channel: String,
    pub payload: serde_json::Value,
}

/// Publish/subscribe transport shared by several hubs
#[async_trait]
pub trait Relay: Send + Sync {
    /// Forwards an envelope to every listening hub
    async fn publish(&self, envelope: RelayEnvelope) -> Result<(), RelayError>;

    /// Opens a stream of envelopes from all channels
    ///
    /// The subscription is established by the time this returns, so
    /// envelopes published afterwards are not missed.
    async fn listen(&self) -> Result<BoxStream<'static, RelayEnvelope>, RelayError>;

    fn relay_name(&self) -> &'static str;
}

/// In-process relay bus
///
/// Clones share the same bus, which makes it possible to connect several
/// hubs living in one process (or one test).
#[derive(Clone)]
pub struct InMemoryRelay {
    tx: broadcast::Sender<RelayEnvelope>,
}

impl InMemoryRelay {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for InMemoryRelay {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Relay for InMemoryRelay {
    async fn publish(&self, envelope: RelayEnvelope) -> Result<(), RelayError> {
        // No listeners is a normal state
        let _ = self.tx.send(envelope);
        Ok(())
    }

    async fn listen(&self) -> Result<BoxStream<'static, RelayEnvelope>, RelayError> {
        let rx = self.tx.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => return Some((envelope, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped = skipped, "Relay listener lagged, envelopes dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    fn relay_name(&self) -> &'static str {
        "in-memory"
    }
}

#[cfg(feature = "redis-relay")]
pub use self::redis_relay::RedisRelay;

#[cfg(feature = "redis-relay")]
mod redis_relay {
    use super::{Relay, RelayEnvelope};
    use crate::{constants::RELAY_IO_TIMEOUT_SECS, error::RelayError};
    use async_trait::async_trait;
    use futures::stream::{BoxStream, StreamExt};
    use parking_lot::Mutex;
    use redis::{aio::MultiplexedConnection, AsyncCommands};
    use std::future::Future;
    use std::time::Duration;

    /// Runs a Redis call bounded by `RELAY_IO_TIMEOUT_SECS`
    async fn bounded<T>(
        what: &str,
        call: impl Future<Output = redis::RedisResult<T>>,
    ) -> Result<T, RelayError> {
        match tokio::time::timeout(Duration::from_secs(RELAY_IO_TIMEOUT_SECS), call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(RelayError::Unavailable(format!("{what}: {e}"))),
            Err(_) => Err(RelayError::Unavailable(format!(
                "{what}: no answer within {RELAY_IO_TIMEOUT_SECS}s"
            ))),
        }
    }

    /// Relay over Redis pub/sub
    ///
    /// Publishes to `{prefix}:{channel}` and listens with `PSUBSCRIBE {prefix}:*`.
    /// The multiplexed publisher connection is shared by clone; the lock only
    /// guards swapping it.
    pub struct RedisRelay {
        client: redis::Client,
        prefix: String,
        publisher: Mutex<Option<MultiplexedConnection>>,
    }

    impl RedisRelay {
        pub fn new(url: &str, prefix: impl Into<String>) -> Result<Self, RelayError> {
            let client =
                redis::Client::open(url).map_err(|e| RelayError::Unavailable(e.to_string()))?;
            Ok(Self {
                client,
                prefix: prefix.into(),
                publisher: Mutex::new(None),
            })
        }

        async fn connection(&self) -> Result<MultiplexedConnection, RelayError> {
            let cached = self.publisher.lock().clone();
            if let Some(conn) = cached {
                return Ok(conn);
            }
            let conn = bounded("connect", self.client.get_multiplexed_async_connection()).await?;
            *self.publisher.lock() = Some(conn.clone());
            Ok(conn)
        }
    }

    #[async_trait]
    impl Relay for RedisRelay {
        async fn publish(&self, envelope: RelayEnvelope) -> Result<(), RelayError> {
            let payload = serde_json::to_string(&envelope)?;
            let topic = format!("{}:{}", self.prefix, envelope.channel);

            let mut conn = self.connection().await?;
            let result: Result<i64, RelayError> =
                bounded("publish", conn.publish(topic, payload)).await;
            if let Err(e) = result {
                // Reconnect on the next publish
                *self.publisher.lock() = None;
                return Err(e);
            }
            Ok(())
        }

        async fn listen(&self) -> Result<BoxStream<'static, RelayEnvelope>, RelayError> {
            let mut pubsub = bounded("connect", self.client.get_async_pubsub()).await?;
            bounded("psubscribe", pubsub.psubscribe(format!("{}:*", self.prefix))).await?;

            let stream = pubsub.into_on_message().filter_map(|msg| async move {
                let raw: String = msg.get_payload().ok()?;
                match serde_json::from_str::<RelayEnvelope>(&raw) {
                    Ok(envelope) => Some(envelope),
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping undecodable relay message");
                        None
                    }
                }
            });
            Ok(stream.boxed())
        }

        fn relay_name(&self) -> &'static str {
            "redis"
        }
    }
}
