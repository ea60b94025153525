//! Realtime broadcast hub: named rooms fanning telemetry out to dashboard
//! subscribers.
//!
//! ## Design
//! - Room name → `tokio::sync::broadcast::Sender<serde_json::Value>`, behind
//!   `Arc<Mutex<HashMap>>` shared across all connections
//! - A separate all-clients channel carries `"system-alert"` style broadcasts
//! - Subscribing joins one room and the all-channel; membership is pure
//!   bookkeeping, the hub never owns the subscriber's connection lifecycle
//! - Delivery is at-most-once, best-effort, synchronous fan-out per publish;
//!   a slow receiver lags and drops messages without blocking the others
//!
//! No backpressure or queuing beyond the channel capacity; a known
//! limitation for high-fan-out deployments.
//!
//! The monitors depend only on the [`PubSub`] capability; the WebSocket
//! transport in `server.rs` is an adapter over [`Hub::subscribe`].

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::now_ms;

/// Fan-out channel capacity per room (messages in flight before lag).
pub const ROOM_CHANNEL_CAP: usize = 256;

/// Where a published event is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    /// Every subscriber currently joined to the named room.
    Room(&'a str),
    /// Every connected client regardless of room.
    All,
}

/// Publishing capability the monitors depend on.
///
/// Implementations must never block or fail the caller: a publish with no
/// listeners is a no-op.
pub trait PubSub: Send + Sync {
    fn publish(&self, scope: Scope<'_>, event: &str, payload: serde_json::Value);
}

/// A subscriber's pair of receive channels: its room feed and the
/// broadcast-to-all feed.
pub struct Subscription {
    pub subscriber_id: String,
    pub room: String,
    pub room_rx: broadcast::Receiver<serde_json::Value>,
    pub all_rx: broadcast::Receiver<serde_json::Value>,
}

/// Envelope placed on the wire for every published event.
#[derive(Debug, Serialize)]
struct Envelope<'a> {
    event: &'a str,
    payload: &'a serde_json::Value,
    timestamp: u64,
}

pub struct Hub {
    rooms: Mutex<HashMap<String, broadcast::Sender<serde_json::Value>>>,
    /// subscriber id → room name, for membership bookkeeping only.
    members: Mutex<HashMap<String, String>>,
    all_tx: broadcast::Sender<serde_json::Value>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        let (all_tx, _) = broadcast::channel(ROOM_CHANNEL_CAP);
        Hub {
            rooms: Mutex::new(HashMap::new()),
            members: Mutex::new(HashMap::new()),
            all_tx,
        }
    }

    /// Join `room`, returning the subscriber's receive channels.
    ///
    /// The room is created on first join. The same id re-subscribing simply
    /// moves its membership.
    pub fn subscribe(&self, room: &str, subscriber_id: &str) -> Subscription {
        let room_rx = self.room_sender(room).subscribe();
        if let Ok(mut members) = self.members.lock() {
            members.insert(subscriber_id.to_string(), room.to_string());
        }
        Subscription {
            subscriber_id: subscriber_id.to_string(),
            room: room.to_string(),
            room_rx,
            all_rx: self.all_tx.subscribe(),
        }
    }

    /// Drop membership bookkeeping for a departed subscriber.
    pub fn unsubscribe(&self, subscriber_id: &str) {
        if let Ok(mut members) = self.members.lock() {
            members.remove(subscriber_id);
        }
    }

    /// Number of subscribers currently joined to `room`.
    pub fn member_count(&self, room: &str) -> usize {
        match self.members.lock() {
            Ok(members) => members.values().filter(|r| r.as_str() == room).count(),
            Err(_) => 0,
        }
    }

    pub fn publish_to_room(&self, room: &str, event: &str, payload: serde_json::Value) {
        let msg = envelope(event, &payload);
        // Send failure just means nobody is listening right now.
        let _ = self.room_sender(room).send(msg);
    }

    pub fn publish_to_all(&self, event: &str, payload: serde_json::Value) {
        let _ = self.all_tx.send(envelope(event, &payload));
    }

    fn room_sender(&self, room: &str) -> broadcast::Sender<serde_json::Value> {
        match self.rooms.lock() {
            Ok(mut rooms) => rooms
                .entry(room.to_string())
                .or_insert_with(|| broadcast::channel(ROOM_CHANNEL_CAP).0)
                .clone(),
            // Poisoned lock: hand back a disconnected sender so the publish
            // degrades to a no-op instead of propagating a panic.
            Err(_) => broadcast::channel(1).0,
        }
    }
}

impl PubSub for Hub {
    fn publish(&self, scope: Scope<'_>, event: &str, payload: serde_json::Value) {
        match scope {
            Scope::Room(room) => self.publish_to_room(room, event, payload),
            Scope::All => self.publish_to_all(event, payload),
        }
    }
}

fn envelope(event: &str, payload: &serde_json::Value) -> serde_json::Value {
    serde_json::to_value(Envelope {
        event,
        payload,
        timestamp: now_ms(),
    })
    .unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_creates_room() {
        let hub = Hub::new();
        let sub = hub.subscribe("errors-room", "c1");
        assert_eq!(sub.room, "errors-room");
        assert_eq!(hub.member_count("errors-room"), 1);
    }

    #[test]
    fn test_unsubscribe_clears_membership() {
        let hub = Hub::new();
        let _sub = hub.subscribe("metrics-room", "c1");
        hub.unsubscribe("c1");
        assert_eq!(hub.member_count("metrics-room"), 0);
    }

    #[tokio::test]
    async fn test_room_publish_reaches_room_subscriber() {
        let hub = Hub::new();
        let mut sub = hub.subscribe("metrics-room", "c1");
        hub.publish_to_room("metrics-room", "network-update", serde_json::json!({"id": 1}));
        let msg = sub.room_rx.recv().await.unwrap();
        assert_eq!(msg["event"], "network-update");
        assert_eq!(msg["payload"]["id"], 1);
        assert!(msg["timestamp"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_room_isolation() {
        let hub = Hub::new();
        let mut errors_sub = hub.subscribe("errors-room", "c1");
        hub.publish_to_room("metrics-room", "performance-update", serde_json::json!({}));
        // Nothing lands on the errors-room channel.
        assert!(errors_sub.room_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_to_all_reaches_every_subscriber() {
        let hub = Hub::new();
        let mut a = hub.subscribe("errors-room", "c1");
        let mut b = hub.subscribe("metrics-room", "c2");
        hub.publish_to_all("system-alert", serde_json::json!({"type": "warning"}));
        assert_eq!(a.all_rx.recv().await.unwrap()["event"], "system-alert");
        assert_eq!(b.all_rx.recv().await.unwrap()["event"], "system-alert");
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let hub = Hub::new();
        // Neither call may panic or block.
        hub.publish_to_room("empty-room", "error-occurred", serde_json::json!({}));
        hub.publish_to_all("system-alert", serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_pubsub_trait_scopes() {
        let hub = Hub::new();
        let mut sub = hub.subscribe("errors-room", "c1");
        let pubsub: &dyn PubSub = &hub;
        pubsub.publish(Scope::Room("errors-room"), "error-occurred", serde_json::json!({"id": "abc"}));
        pubsub.publish(Scope::All, "system-alert", serde_json::json!({}));
        assert_eq!(sub.room_rx.recv().await.unwrap()["event"], "error-occurred");
        assert_eq!(sub.all_rx.recv().await.unwrap()["event"], "system-alert");
    }
}
