//! Router: the broker's connection registry and channel index.
//!
//! The `Router` is the only state shared between connection tasks.  It tracks:
//!
//! - every live connection (peer address, bound identity, subscriptions and
//!   the sender half of its outbound queue), and
//! - for every channel, the set of connections currently subscribed to it.
//!
//! # Locking
//!
//! Both maps sit behind one broker-wide `tokio::sync::Mutex`.  A single lock
//! makes teardown atomic: [`Router::remove`] drops a connection from the
//! registry and from every channel bucket in one critical section, so a
//! concurrent publish can never observe a half-removed connection.  Fan-out
//! only enqueues into bounded per-connection queues while holding the lock;
//! socket writes happen later, in each connection's own task.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Unique id of one broker-side connection.
pub type ConnectionId = Uuid;

/// Read-only snapshot of a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    /// `None` until the connection has authenticated.
    pub ident: Option<String>,
    /// Subscribed channels, sorted.
    pub subscriptions: Vec<String>,
}

/// Result of routing one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Subscribers the frame was queued for.
    pub delivered: usize,
    /// Subscribers skipped because their outbound queue was full.
    pub dropped: usize,
}

struct ConnectionEntry {
    peer: SocketAddr,
    ident: Option<String>,
    subscriptions: HashSet<String>,
    outbound: mpsc::Sender<Bytes>,
}

impl ConnectionEntry {
    fn info(&self, id: ConnectionId) -> ConnectionInfo {
        let mut subscriptions: Vec<String> = self.subscriptions.iter().cloned().collect();
        subscriptions.sort();
        ConnectionInfo {
            id,
            peer: self.peer,
            ident: self.ident.clone(),
            subscriptions,
        }
    }
}

#[derive(Default)]
struct RouterState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    channels: HashMap<String, HashSet<ConnectionId>>,
}

/// Connection registry plus channel → subscriber index for one broker.
pub struct Router {
    state: Mutex<RouterState>,
    echo_to_publisher: bool,
}

impl Router {
    /// Creates an empty router.
    ///
    /// With `echo_to_publisher` set, a publisher that is itself subscribed to
    /// the channel receives its own publish as well.
    pub fn new(echo_to_publisher: bool) -> Self {
        Self {
            state: Mutex::new(RouterState::default()),
            echo_to_publisher,
        }
    }

    /// Adds a freshly accepted connection to the registry.
    pub async fn register(&self, id: ConnectionId, peer: SocketAddr, outbound: mpsc::Sender<Bytes>) {
        let mut state = self.state.lock().await;
        state.connections.insert(
            id,
            ConnectionEntry {
                peer,
                ident: None,
                subscriptions: HashSet::new(),
                outbound,
            },
        );
    }

    /// Records the identity a connection authenticated as.
    pub async fn bind_identity(&self, id: ConnectionId, ident: &str) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.connections.get_mut(&id) {
            entry.ident = Some(ident.to_string());
        }
    }

    /// Subscribes `id` to `channel`.
    ///
    /// Returns `true` if the subscription is new, `false` if it already
    /// existed or the connection is not registered.
    pub async fn subscribe(&self, id: ConnectionId, channel: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(entry) = state.connections.get_mut(&id) else {
            return false;
        };
        if !entry.subscriptions.insert(channel.to_string()) {
            return false;
        }
        state
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(id);
        true
    }

    /// Removes `id` from `channel`.  Returns `true` if it was subscribed.
    pub async fn unsubscribe(&self, id: ConnectionId, channel: &str) -> bool {
        let mut state = self.state.lock().await;
        let removed = state
            .connections
            .get_mut(&id)
            .map(|entry| entry.subscriptions.remove(channel))
            .unwrap_or(false);
        if removed {
            remove_from_bucket(&mut state.channels, channel, id);
        }
        removed
    }

    /// Queues an encoded PUBLISH frame for every subscriber of `channel`.
    ///
    /// The same `Bytes` buffer is shared by all recipients, so each one gets a
    /// byte-identical copy.
    pub async fn publish(&self, from: ConnectionId, channel: &str, frame: Bytes) -> PublishOutcome {
        let state = self.state.lock().await;
        let mut outcome = PublishOutcome::default();

        let Some(bucket) = state.channels.get(channel) else {
            return outcome;
        };

        for dest in bucket {
            if *dest == from && !self.echo_to_publisher {
                continue;
            }
            let Some(entry) = state.connections.get(dest) else {
                continue;
            };
            match entry.outbound.try_send(frame.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("outbound queue of connection {dest} is full; dropping publish on {channel}");
                    outcome.dropped += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // The connection task is already tearing down.
                    debug!("connection {dest} closed before publish on {channel} could be queued");
                }
            }
        }
        outcome
    }

    /// Removes a connection from the registry and every channel bucket.
    pub async fn remove(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        let mut state = self.state.lock().await;
        let entry = state.connections.remove(&id)?;
        for channel in &entry.subscriptions {
            remove_from_bucket(&mut state.channels, channel, id);
        }
        Some(entry.info(id))
    }

    /// Snapshot of all live connections.
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let state = self.state.lock().await;
        state
            .connections
            .iter()
            .map(|(id, entry)| entry.info(*id))
            .collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    /// Number of connections subscribed to `channel`.
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        let state = self.state.lock().await;
        state.channels.get(channel).map_or(0, HashSet::len)
    }
}

fn remove_from_bucket(
    channels: &mut HashMap<String, HashSet<ConnectionId>>,
    channel: &str,
    id: ConnectionId,
) {
    if let Some(bucket) = channels.get_mut(channel) {
        bucket.remove(&id);
        if bucket.is_empty() {
            channels.remove(channel);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    async fn add(router: &Router, capacity: usize) -> (ConnectionId, mpsc::Receiver<Bytes>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(capacity);
        router.register(id, peer(), tx).await;
        (id, rx)
    }

    #[tokio::test]
    async fn test_router_starts_empty() {
        let router = Router::new(false);
        assert_eq!(router.connection_count().await, 0);
        assert!(router.connections().await.is_empty());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_but_not_publisher() {
        let router = Router::new(false);
        let (a, mut rx_a) = add(&router, 8).await;
        let (b, mut rx_b) = add(&router, 8).await;
        let (c, mut rx_c) = add(&router, 8).await;
        router.subscribe(a, "chan").await;
        router.subscribe(b, "chan").await;
        router.subscribe(c, "elsewhere").await;

        let frame = Bytes::from_static(b"encoded-publish");
        let outcome = router.publish(a, "chan", frame.clone()).await;

        assert_eq!(outcome, PublishOutcome { delivered: 1, dropped: 0 });
        assert_eq!(rx_b.try_recv().unwrap(), frame);
        assert!(rx_a.try_recv().is_err(), "publisher must not receive its own publish");
        assert!(rx_c.try_recv().is_err(), "other channels must not receive it");
    }

    #[tokio::test]
    async fn test_echo_mode_delivers_to_subscribed_publisher() {
        let router = Router::new(true);
        let (a, mut rx_a) = add(&router, 8).await;
        router.subscribe(a, "chan").await;

        let outcome = router.publish(a, "chan", Bytes::from_static(b"x")).await;
        assert_eq!(outcome.delivered, 1);
        assert_eq!(rx_a.try_recv().unwrap(), Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn test_subscribe_twice_is_idempotent() {
        let router = Router::new(false);
        let (a, _rx_a) = add(&router, 8).await;
        let (b, mut rx_b) = add(&router, 8).await;

        assert!(router.subscribe(b, "chan").await);
        assert!(!router.subscribe(b, "chan").await);
        assert_eq!(router.subscriber_count("chan").await, 1);

        router.publish(a, "chan", Bytes::from_static(b"once")).await;
        assert_eq!(rx_b.try_recv().unwrap(), Bytes::from_static(b"once"));
        assert!(rx_b.try_recv().is_err(), "exactly one copy per subscriber");
    }

    #[tokio::test]
    async fn test_unsubscribe_when_not_subscribed_is_noop() {
        let router = Router::new(false);
        let (a, _rx) = add(&router, 8).await;
        assert!(!router.unsubscribe(a, "chan").await);
        assert_eq!(router.subscriber_count("chan").await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery_and_drops_empty_bucket() {
        let router = Router::new(false);
        let (a, _rx_a) = add(&router, 8).await;
        let (b, mut rx_b) = add(&router, 8).await;
        router.subscribe(b, "chan").await;
        assert!(router.unsubscribe(b, "chan").await);

        let outcome = router.publish(a, "chan", Bytes::from_static(b"late")).await;
        assert_eq!(outcome.delivered, 0);
        assert!(rx_b.try_recv().is_err());
        assert_eq!(router.subscriber_count("chan").await, 0);
    }

    #[tokio::test]
    async fn test_remove_purges_registry_and_all_buckets() {
        let router = Router::new(false);
        let (a, _rx_a) = add(&router, 8).await;
        router.bind_identity(a, "test").await;
        router.subscribe(a, "one").await;
        router.subscribe(a, "two").await;

        let info = router.remove(a).await.expect("connection was registered");
        assert_eq!(info.ident.as_deref(), Some("test"));
        assert_eq!(info.subscriptions, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(router.connection_count().await, 0);
        assert_eq!(router.subscriber_count("one").await, 0);
        assert_eq!(router.subscriber_count("two").await, 0);
        assert!(router.remove(a).await.is_none());
    }

    #[tokio::test]
    async fn test_full_outbound_queue_drops_instead_of_blocking() {
        let router = Router::new(false);
        let (a, _rx_a) = add(&router, 8).await;
        let (b, mut rx_b) = add(&router, 1).await;
        router.subscribe(b, "chan").await;

        let first = router.publish(a, "chan", Bytes::from_static(b"1")).await;
        let second = router.publish(a, "chan", Bytes::from_static(b"2")).await;

        assert_eq!(first, PublishOutcome { delivered: 1, dropped: 0 });
        assert_eq!(second, PublishOutcome { delivered: 0, dropped: 1 });
        assert_eq!(rx_b.try_recv().unwrap(), Bytes::from_static(b"1"));
    }

    #[tokio::test]
    async fn test_subscribe_for_unknown_connection_is_ignored() {
        let router = Router::new(false);
        assert!(!router.subscribe(Uuid::new_v4(), "chan").await);
        assert_eq!(router.subscriber_count("chan").await, 0);
    }
}
