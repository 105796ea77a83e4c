use oracle_core_types::{Tier, WsMessage};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

const HUB_CHANNEL_CAPACITY: usize = 4_096;

/// In-process fan-out point. Publishers never block on subscribers: the
/// broadcast channel drops the oldest backlog for a lagging receiver, and
/// the WS loop reports the lag to that client alone.
#[derive(Clone)]
pub struct BroadcastHub {
    tx: broadcast::Sender<WsMessage>,
    connections: Arc<Mutex<HashMap<String, usize>>>,
    max_per_key: usize,
}

impl BroadcastHub {
    pub fn new(max_per_key: usize) -> Self {
        let (tx, _) = broadcast::channel(HUB_CHANNEL_CAPACITY);
        Self {
            tx,
            connections: Arc::new(Mutex::new(HashMap::new())),
            max_per_key: max_per_key.max(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsMessage> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: impl Into<String>, data: Value) {
        let _ = self.tx.send(WsMessage::broadcast(event, data));
    }

    pub fn publish_to_tier(&self, event: impl Into<String>, data: Value, min_tier: Tier) {
        let _ = self.tx.send(WsMessage::for_tier(event, data, min_tier));
    }

    /// Claims a connection slot for the identity; `None` means the per-key
    /// cap is already spent. Dropping the guard frees the slot.
    pub fn register(&self, identity: &str) -> Option<ConnectionGuard> {
        let mut connections = self.connections.lock().expect("ws registry poisoned");
        let count = connections.entry(identity.to_string()).or_insert(0);
        if *count >= self.max_per_key {
            debug!(identity, cap = self.max_per_key, "ws connection cap reached");
            return None;
        }
        *count += 1;
        Some(ConnectionGuard {
            connections: Arc::clone(&self.connections),
            identity: identity.to_string(),
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .expect("ws registry poisoned")
            .values()
            .sum()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub struct ConnectionGuard {
    connections: Arc<Mutex<HashMap<String, usize>>>,
    identity: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let mut connections = self.connections.lock().expect("ws registry poisoned");
        if let Some(count) = connections.get_mut(&self.identity) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                connections.remove(&self.identity);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn per_key_connection_cap_is_enforced_and_released() {
        let hub = BroadcastHub::new(2);
        let first = hub.register("key-1").expect("first slot");
        let _second = hub.register("key-1").expect("second slot");
        assert!(hub.register("key-1").is_none());
        assert!(hub.register("key-2").is_some());

        drop(first);
        assert!(hub.register("key-1").is_some());
    }

    #[tokio::test]
    async fn published_messages_reach_subscribers_in_order() {
        let hub = BroadcastHub::new(5);
        let mut rx = hub.subscribe();

        hub.publish("k", json!({"k": 50}));
        hub.publish_to_tier("status", json!({"ok": true}), Tier::Premium);

        let first = rx.recv().await.expect("first message");
        assert_eq!(first.event, "k");
        assert_eq!(first.min_tier, Tier::Public);

        let second = rx.recv().await.expect("second message");
        assert_eq!(second.event, "status");
        assert_eq!(second.min_tier, Tier::Premium);
    }

    #[test]
    fn connection_count_sums_identities() {
        let hub = BroadcastHub::new(3);
        let _a = hub.register("a").expect("slot");
        let _b1 = hub.register("b").expect("slot");
        let _b2 = hub.register("b").expect("slot");
        assert_eq!(hub.connection_count(), 3);
    }
}
