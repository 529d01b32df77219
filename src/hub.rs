//! In-process pub/sub fan-out with an optional relay
//!
//! The registry maps channel names to subscriber sets. Channels are created on
//! first subscribe and never removed; an empty channel is simply inert. Each
//! channel has its own lock, so a busy channel never blocks subscribes on
//! unrelated channels, and deliveries on one channel are serialized in
//! publish-call order.

use crate::{
    constants::{RELAY_IO_TIMEOUT_SECS, RELAY_RECONNECT_SECS},
    relay::{Relay, RelayEnvelope},
};
use dashmap::DashMap;
use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identifier of a subscription within its hub
pub type SubscriberId = u64;

/// Anything a hub can carry
pub trait HubMessage: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> HubMessage for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

type Mailbox<M> = mpsc::UnboundedSender<M>;

struct Channel<M> {
    subscribers: Mutex<HashMap<SubscriberId, Mailbox<M>>>,
}

struct Registry<M> {
    channels: DashMap<String, Arc<Channel<M>>>,
    next_id: AtomicU64,
}

impl<M: Clone> Registry<M> {
    fn new() -> Self {
        Self {
            channels: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn channel(&self, name: &str) -> Arc<Channel<M>> {
        if let Some(channel) = self.channels.get(name) {
            return Arc::clone(channel.value());
        }
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Channel {
                    subscribers: Mutex::new(HashMap::new()),
                })
            })
            .clone()
    }

    /// Delivers to every mailbox registered right now; returns the recipient count
    fn deliver(&self, name: &str, message: &M) -> usize {
        let Some(channel) = self.channels.get(name).map(|c| Arc::clone(c.value())) else {
            return 0;
        };
        let mut subscribers = channel.subscribers.lock();
        // Closed mailboxes belong to terminated subscribers
        subscribers.retain(|_, mailbox| mailbox.send(message.clone()).is_ok());
        subscribers.len()
    }

    fn remove(&self, name: &str, id: SubscriberId) -> bool {
        match self.channels.get(name).map(|c| Arc::clone(c.value())) {
            Some(channel) => channel.subscribers.lock().remove(&id).is_some(),
            None => false,
        }
    }
}

/// Receiving end of one subscription
///
/// Messages arrive in publish order. A new subscription always starts empty.
/// Dropping the handle unsubscribes it.
pub struct Subscription<M: Clone> {
    id: SubscriberId,
    channel: String,
    rx: mpsc::UnboundedReceiver<M>,
    registry: Weak<Registry<M>>,
}

impl<M: Clone> Subscription<M> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the next message; `None` once unsubscribed and drained
    pub async fn recv(&mut self) -> Option<M> {
        self.rx.recv().await
    }

    /// Returns a queued message without waiting
    pub fn try_recv(&mut self) -> Option<M> {
        self.rx.try_recv().ok()
    }

    /// Converts the subscription into a lazy stream of messages
    pub fn into_stream(self) -> impl Stream<Item = M> + Send + 'static
    where
        M: Send + Sync + 'static,
    {
        futures::stream::unfold(self, |mut sub| async move {
            let message = sub.recv().await?;
            Some((message, sub))
        })
    }
}

impl<M: Clone> Drop for Subscription<M> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.channel, self.id);
        }
    }
}

impl<M: Clone> std::fmt::Debug for Subscription<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .finish()
    }
}

/// Named-channel broadcast hub
///
/// # Example
/// ```no_run
/// use market_data_gateway::BroadcastHub;
///
/// # async fn example() {
/// let hub: BroadcastHub<String> = BroadcastHub::new();
/// let mut sub = hub.subscribe("quotes");
/// hub.publish("quotes", "ping".to_string()).await;
/// assert_eq!(sub.recv().await.as_deref(), Some("ping"));
/// # }
/// ```
pub struct BroadcastHub<M: Clone> {
    id: Uuid,
    registry: Arc<Registry<M>>,
    relay: Option<RelayLink>,
    shutdown: CancellationToken,
}

/// Outbound side of a relay; envelopes are forwarded by a background task
struct RelayLink {
    relay: Arc<dyn Relay>,
    outbox: mpsc::UnboundedSender<RelayEnvelope>,
}

impl<M: HubMessage> Default for BroadcastHub<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: HubMessage> BroadcastHub<M> {
    /// Creates a single-process hub
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            registry: Arc::new(Registry::new()),
            relay: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Creates a hub mirrored through `relay`
    ///
    /// Starts the background listener that fans relay-originated messages out
    /// to local subscribers. If the relay cannot be reached the hub still
    /// works locally and the listener keeps retrying.
    pub async fn with_relay(relay: Arc<dyn Relay>) -> Self {
        let mut hub = Self::new();
        let limit = Duration::from_secs(RELAY_IO_TIMEOUT_SECS);
        let initial = match tokio::time::timeout(limit, relay.listen()).await {
            Ok(Ok(stream)) => Some(stream),
            Ok(Err(e)) => {
                tracing::warn!(
                    relay = relay.relay_name(),
                    error = %e,
                    "Relay unavailable, delivering locally only until it recovers"
                );
                None
            }
            Err(_) => {
                tracing::warn!(
                    relay = relay.relay_name(),
                    "Relay did not answer, delivering locally only until it recovers"
                );
                None
            }
        };

        tokio::spawn(relay_listener(
            hub.id,
            Arc::downgrade(&hub.registry),
            Arc::clone(&relay),
            initial,
            hub.shutdown.clone(),
        ));

        let (outbox, pending) = mpsc::unbounded_channel();
        tokio::spawn(relay_forwarder(
            Arc::clone(&relay),
            pending,
            hub.shutdown.clone(),
        ));
        hub.relay = Some(RelayLink { relay, outbox });
        hub
    }

    /// Unique identity of this hub on the relay
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn has_relay(&self) -> bool {
        self.relay.is_some()
    }

    /// Registers a new mailbox on `channel`, creating the channel if needed
    pub fn subscribe(&self, channel: &str) -> Subscription<M> {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry
            .channel(channel)
            .subscribers
            .lock()
            .insert(id, tx);

        tracing::debug!(channel = channel, subscriber = id, "Subscribed");
        Subscription {
            id,
            channel: channel.to_string(),
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Removes a subscription; returns false if it was already gone
    pub fn unsubscribe(&self, channel: &str, id: SubscriberId) -> bool {
        let removed = self.registry.remove(channel, id);
        if removed {
            tracing::debug!(channel = channel, subscriber = id, "Unsubscribed");
        }
        removed
    }

    /// Delivers `message` to every current subscriber of `channel`
    ///
    /// Local delivery happens first. With a relay configured the message is
    /// then queued for the background forwarder, so a slow or dead relay
    /// never delays local subscribers. Returns the number of local recipients.
    pub async fn publish(&self, channel: &str, message: M) -> usize {
        let delivered = self.registry.deliver(channel, &message);

        if let Some(link) = &self.relay {
            match serde_json::to_value(&message) {
                Ok(payload) => {
                    let envelope = RelayEnvelope {
                        origin: self.id,
                        channel: channel.to_string(),
                        payload,
                    };
                    if link.outbox.send(envelope).is_err() {
                        tracing::warn!(
                            relay = link.relay.relay_name(),
                            channel = channel,
                            "Relay forwarder stopped, message not relayed"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(channel = channel, error = %e, "Message not relayable");
                }
            }
        }

        delivered
    }

    /// Number of live subscribers on `channel`
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.registry
            .channels
            .get(channel)
            .map(|c| c.subscribers.lock().len())
            .unwrap_or(0)
    }

    /// Names of every channel created so far
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .registry
            .channels
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}

impl<M: Clone> Drop for BroadcastHub<M> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Sends queued envelopes to the relay in publish order
///
/// Each publish is bounded by `RELAY_IO_TIMEOUT_SECS`; a failed or timed-out
/// envelope is logged and dropped.
async fn relay_forwarder(
    relay: Arc<dyn Relay>,
    mut pending: mpsc::UnboundedReceiver<RelayEnvelope>,
    shutdown: CancellationToken,
) {
    let limit = Duration::from_secs(RELAY_IO_TIMEOUT_SECS);
    loop {
        let envelope = tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            next = pending.recv() => match next {
                Some(envelope) => envelope,
                None => return,
            },
        };
        let channel = envelope.channel.clone();
        match tokio::time::timeout(limit, relay.publish(envelope)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    relay = relay.relay_name(),
                    channel = %channel,
                    error = %e,
                    "Relay publish failed"
                );
            }
            Err(_) => {
                tracing::warn!(
                    relay = relay.relay_name(),
                    channel = %channel,
                    timeout_secs = RELAY_IO_TIMEOUT_SECS,
                    "Relay publish timed out"
                );
            }
        }
    }
}

/// Re-publishes relay envelopes from other hubs to local subscribers
///
/// Envelopes are delivered locally only and never sent back to the relay.
async fn relay_listener<M: HubMessage>(
    hub_id: Uuid,
    registry: Weak<Registry<M>>,
    relay: Arc<dyn Relay>,
    mut stream: Option<BoxStream<'static, RelayEnvelope>>,
    shutdown: CancellationToken,
) {
    let limit = Duration::from_secs(RELAY_IO_TIMEOUT_SECS);
    loop {
        if let Some(mut envelopes) = stream.take() {
            loop {
                let next = tokio::select! {
                    biased;
                    () = shutdown.cancelled() => return,
                    next = envelopes.next() => next,
                };
                let Some(envelope) = next else { break };
                if envelope.origin == hub_id {
                    // Already delivered locally at publish time
                    continue;
                }
                let Some(live) = registry.upgrade() else {
                    return;
                };
                match serde_json::from_value::<M>(envelope.payload) {
                    Ok(message) => {
                        live.deliver(&envelope.channel, &message);
                    }
                    Err(e) => {
                        tracing::warn!(
                            channel = %envelope.channel,
                            error = %e,
                            "Dropping undecodable relay payload"
                        );
                    }
                }
            }
            tracing::warn!(relay = relay.relay_name(), "Relay stream ended");
        }

        tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(Duration::from_secs(RELAY_RECONNECT_SECS)) => {}
        }

        let reconnect = tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            result = tokio::time::timeout(limit, relay.listen()) => result,
        };
        match reconnect {
            Ok(Ok(envelopes)) => {
                tracing::info!(relay = relay.relay_name(), "Relay listener reconnected");
                stream = Some(envelopes);
            }
            Ok(Err(e)) => {
                tracing::warn!(relay = relay.relay_name(), error = %e, "Relay reconnect failed");
            }
            Err(_) => {
                tracing::warn!(relay = relay.relay_name(), "Relay reconnect timed out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::relay::InMemoryRelay;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::timeout;

    /// Relay wrapper that counts publishes
    struct CountingRelay {
        inner: InMemoryRelay,
        published: AtomicUsize,
    }

    #[async_trait]
    impl Relay for CountingRelay {
        async fn publish(&self, envelope: RelayEnvelope) -> Result<(), RelayError> {
            self.published.fetch_add(1, Ordering::SeqCst);
            self.inner.publish(envelope).await
        }

        async fn listen(&self) -> Result<BoxStream<'static, RelayEnvelope>, RelayError> {
            self.inner.listen().await
        }

        fn relay_name(&self) -> &'static str {
            "counting"
        }
    }

    /// Relay that is always down
    struct DeadRelay;

    #[async_trait]
    impl Relay for DeadRelay {
        async fn publish(&self, _envelope: RelayEnvelope) -> Result<(), RelayError> {
            Err(RelayError::Unavailable("connection refused".to_string()))
        }

        async fn listen(&self) -> Result<BoxStream<'static, RelayEnvelope>, RelayError> {
            Err(RelayError::Unavailable("connection refused".to_string()))
        }

        fn relay_name(&self) -> &'static str {
            "dead"
        }
    }

    /// Relay whose calls never complete
    struct StalledRelay {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Relay for StalledRelay {
        async fn publish(&self, _envelope: RelayEnvelope) -> Result<(), RelayError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            futures::future::pending().await
        }

        async fn listen(&self) -> Result<BoxStream<'static, RelayEnvelope>, RelayError> {
            Ok(futures::stream::pending().boxed())
        }

        fn relay_name(&self) -> &'static str {
            "stalled"
        }
    }

    /// Relay whose first listen stream ends immediately
    struct FlakyRelay {
        inner: InMemoryRelay,
        listens: AtomicUsize,
    }

    #[async_trait]
    impl Relay for FlakyRelay {
        async fn publish(&self, envelope: RelayEnvelope) -> Result<(), RelayError> {
            self.inner.publish(envelope).await
        }

        async fn listen(&self) -> Result<BoxStream<'static, RelayEnvelope>, RelayError> {
            let stream = if self.listens.load(Ordering::SeqCst) == 0 {
                futures::stream::empty().boxed()
            } else {
                self.inner.listen().await?
            };
            self.listens.fetch_add(1, Ordering::SeqCst);
            Ok(stream)
        }

        fn relay_name(&self) -> &'static str {
            "flaky"
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(60), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    async fn next(sub: &mut Subscription<u32>) -> Option<u32> {
        timeout(Duration::from_secs(1), sub.recv()).await.ok().flatten()
    }

    async fn assert_quiet(sub: &mut Subscription<u32>) {
        assert!(
            timeout(Duration::from_millis(100), sub.recv()).await.is_err(),
            "unexpected extra message"
        );
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let hub: BroadcastHub<String> = BroadcastHub::new();
        let mut sub = hub.subscribe("broadcast");
        hub.publish("broadcast", "ping".to_string()).await;

        let msg = timeout(Duration::from_secs(1), sub.recv()).await.unwrap();
        assert_eq!(msg.as_deref(), Some("ping"));
    }

    #[tokio::test]
    async fn test_subscribers_see_only_messages_while_subscribed() {
        let hub: BroadcastHub<u32> = BroadcastHub::new();
        let mut early = hub.subscribe("c");

        hub.publish("c", 1).await;
        let mut late = hub.subscribe("c");
        hub.publish("c", 2).await;
        hub.publish("c", 3).await;
        assert!(hub.unsubscribe("c", early.id()));
        hub.publish("c", 4).await;

        assert_eq!(next(&mut early).await, Some(1));
        assert_eq!(next(&mut early).await, Some(2));
        assert_eq!(next(&mut early).await, Some(3));
        // Sender is gone, so the drained mailbox reports closed
        assert_eq!(early.recv().await, None);

        assert_eq!(next(&mut late).await, Some(2));
        assert_eq!(next(&mut late).await, Some(3));
        assert_eq!(next(&mut late).await, Some(4));
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let hub: BroadcastHub<u32> = BroadcastHub::new();
        let sub = hub.subscribe("c");
        assert!(hub.unsubscribe("c", sub.id()));
        assert!(!hub.unsubscribe("c", sub.id()));
        assert!(!hub.unsubscribe("never-created", 42));
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_removed() {
        let hub: BroadcastHub<u32> = BroadcastHub::new();
        let keep = hub.subscribe("c");
        {
            let _gone = hub.subscribe("c");
            assert_eq!(hub.subscriber_count("c"), 2);
        }
        assert_eq!(hub.subscriber_count("c"), 1);
        assert_eq!(hub.publish("c", 7).await, 1);
        drop(keep);

        // Empty channel stays registered and inert
        assert_eq!(hub.publish("c", 8).await, 0);
        assert_eq!(hub.channels(), vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn test_new_subscription_never_replays() {
        let hub: BroadcastHub<u32> = BroadcastHub::new();
        let _first = hub.subscribe("c");
        hub.publish("c", 1).await;

        let mut second = hub.subscribe("c");
        assert_eq!(second.try_recv(), None);
    }

    #[tokio::test]
    async fn test_publish_to_unknown_channel_is_noop() {
        let hub: BroadcastHub<u32> = BroadcastHub::new();
        assert_eq!(hub.publish("nobody", 1).await, 0);
        assert!(hub.channels().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_publishers_keep_per_publisher_order() {
        let hub = Arc::new(BroadcastHub::<u32>::new());
        let mut sub = hub.subscribe("c");

        let publishers = (0..4u32).map(|p| {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move {
                for i in 0..50u32 {
                    hub.publish("c", p * 1000 + i).await;
                }
            })
        });
        for handle in futures::future::join_all(publishers).await {
            handle.unwrap();
        }

        let mut last_seen = [None::<u32>; 4];
        for _ in 0..200 {
            let msg = next(&mut sub).await.unwrap();
            let publisher = (msg / 1000) as usize;
            if let Some(prev) = last_seen[publisher] {
                assert!(msg > prev);
            }
            last_seen[publisher] = Some(msg);
        }
    }

    #[tokio::test]
    async fn test_stream_yields_in_order() {
        let hub: BroadcastHub<u32> = BroadcastHub::new();
        let sub = hub.subscribe("c");
        for i in 0..3 {
            hub.publish("c", i).await;
        }
        let id = sub.id();
        let stream = sub.into_stream();
        hub.unsubscribe("c", id);

        let collected: Vec<u32> = stream.collect().await;
        assert_eq!(collected, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_two_hubs_over_relay_deliver_exactly_once() {
        let relay = Arc::new(CountingRelay {
            inner: InMemoryRelay::default(),
            published: AtomicUsize::new(0),
        });
        let hub_a: BroadcastHub<u32> = BroadcastHub::with_relay(relay.clone()).await;
        let hub_b: BroadcastHub<u32> = BroadcastHub::with_relay(relay.clone()).await;

        let mut on_a = hub_a.subscribe("quotes");
        let mut on_b = hub_b.subscribe("quotes");

        const N: u32 = 5;
        for i in 0..N {
            hub_a.publish("quotes", i).await;
        }

        for i in 0..N {
            assert_eq!(next(&mut on_a).await, Some(i));
            assert_eq!(next(&mut on_b).await, Some(i));
        }
        assert_quiet(&mut on_a).await;
        assert_quiet(&mut on_b).await;
        assert_eq!(relay.published.load(Ordering::SeqCst), N as usize);
    }

    #[tokio::test]
    async fn test_dead_relay_does_not_block_local_delivery() {
        let hub: BroadcastHub<u32> = BroadcastHub::with_relay(Arc::new(DeadRelay)).await;
        let mut sub = hub.subscribe("c");

        assert_eq!(hub.publish("c", 11).await, 1);
        assert_eq!(next(&mut sub).await, Some(11));
    }

    #[tokio::test]
    async fn test_stalled_relay_does_not_block_local_delivery() {
        let relay = Arc::new(StalledRelay {
            attempts: AtomicUsize::new(0),
        });
        let hub: BroadcastHub<u32> = BroadcastHub::with_relay(relay.clone()).await;
        let mut sub = hub.subscribe("c");

        for i in 1..=3 {
            let delivered = timeout(Duration::from_secs(2), hub.publish("c", i)).await;
            assert_eq!(delivered.ok(), Some(1));
            assert_eq!(next(&mut sub).await, Some(i));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwarder_moves_past_stalled_publish() {
        let relay = Arc::new(StalledRelay {
            attempts: AtomicUsize::new(0),
        });
        let hub: BroadcastHub<u32> = BroadcastHub::with_relay(relay.clone()).await;
        hub.publish("c", 1).await;
        hub.publish("c", 2).await;

        let start = tokio::time::Instant::now();
        wait_until(|| relay.attempts.load(Ordering::SeqCst) == 2).await;
        assert!(start.elapsed() >= Duration::from_secs(RELAY_IO_TIMEOUT_SECS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_reconnects_after_stream_ends() {
        let relay = Arc::new(FlakyRelay {
            inner: InMemoryRelay::default(),
            listens: AtomicUsize::new(0),
        });
        let start = tokio::time::Instant::now();
        let hub: BroadcastHub<u32> = BroadcastHub::with_relay(relay.clone()).await;
        let mut sub = hub.subscribe("c");

        wait_until(|| relay.listens.load(Ordering::SeqCst) == 2).await;
        assert!(start.elapsed() >= Duration::from_secs(RELAY_RECONNECT_SECS));

        let foreign = RelayEnvelope {
            origin: Uuid::new_v4(),
            channel: "c".to_string(),
            payload: serde_json::json!(7),
        };
        relay.inner.publish(foreign).await.unwrap();
        assert_eq!(next(&mut sub).await, Some(7));

        // Dropping the hub stops both background tasks and releases the relay
        drop(hub);
        wait_until(|| Arc::strong_count(&relay) == 1).await;
        assert_eq!(relay.listens.load(Ordering::SeqCst), 2);
    }
}
