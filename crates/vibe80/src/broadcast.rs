//! Broadcast Bus: per-session set of live WebSocket subscribers and the
//! fan-out routine. Delivery is at-most-once per currently-connected
//! subscriber — the Message Log and worktree metadata are the recovery
//! path for anyone who missed a beat.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

struct Subscriber {
    tx: mpsc::Sender<Value>,
}

struct SessionBus {
    subscribers: DashMap<Uuid, Subscriber>,
}

impl SessionBus {
    fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
        }
    }
}

/// Registry of one [`SessionBus`] per live session.
pub struct BroadcastBus {
    sessions: DashMap<String, Arc<SessionBus>>,
    outbound_buffer: usize,
}

impl BroadcastBus {
    pub fn new(outbound_buffer: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            outbound_buffer,
        }
    }

    /// Attach a new subscriber to `session_id`'s subscriber set, returning
    /// its id (for later `unsubscribe`) and the receiving half it should
    /// pump into its WebSocket.
    pub fn subscribe(&self, session_id: &str) -> (Uuid, mpsc::Receiver<Value>) {
        let bus = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionBus::new()))
            .clone();

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.outbound_buffer);
        bus.subscribers.insert(id, Subscriber { tx });
        debug!(session_id, %id, "subscriber attached");
        (id, rx)
    }

    pub fn unsubscribe(&self, session_id: &str, id: Uuid) {
        if let Some(bus) = self.sessions.get(session_id) {
            bus.subscribers.remove(&id);
        }
    }

    /// Send `envelope` to every subscriber of `session_id` whose outbound
    /// channel is open and not full. A subscriber that errors on write
    /// (channel closed) or is overwhelmed (channel full) is dropped —
    /// its owning WS handler observes the closed receiver and reconnects.
    pub fn broadcast(&self, session_id: &str, envelope: Value) {
        let Some(bus) = self.sessions.get(session_id) else {
            return;
        };

        let mut dead = Vec::new();
        for entry in bus.subscribers.iter() {
            match entry.value().tx.try_send(envelope.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(session_id, subscriber = %entry.key(), "outbound buffer full, dropping subscriber");
                    dead.push(*entry.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*entry.key());
                }
            }
        }
        for id in dead {
            bus.subscribers.remove(&id);
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|bus| bus.subscribers.len())
            .unwrap_or(0)
    }

    /// Drop every subscriber of a closing session; their WS handlers see
    /// the closed channel and terminate.
    pub fn close_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn broadcast_reaches_all_live_subscribers() {
        let bus = BroadcastBus::new(8);
        let (_id1, mut rx1) = bus.subscribe("s1");
        let (_id2, mut rx2) = bus.subscribe("s1");

        bus.broadcast("s1", json!({"type": "ping"}));

        assert_eq!(rx1.recv().await.unwrap(), json!({"type": "ping"}));
        assert_eq!(rx2.recv().await.unwrap(), json!({"type": "ping"}));
    }

    #[tokio::test]
    async fn unsubscribed_listener_does_not_receive() {
        let bus = BroadcastBus::new(8);
        let (id, mut rx) = bus.subscribe("s1");
        bus.unsubscribe("s1", id);

        bus.broadcast("s1", json!({"type": "ping"}));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn full_buffer_drops_subscriber() {
        let bus = BroadcastBus::new(1);
        let (_id, rx) = bus.subscribe("s1");
        // Fill the one slot, then overflow.
        bus.broadcast("s1", json!(1));
        bus.broadcast("s1", json!(2));
        assert_eq!(bus.subscriber_count("s1"), 0);
        drop(rx);
    }

    #[tokio::test]
    async fn joining_late_does_not_see_past_broadcasts() {
        let bus = BroadcastBus::new(8);
        bus.broadcast("s1", json!({"type": "ping"}));
        let (_id, mut rx) = bus.subscribe("s1");
        bus.broadcast("s1", json!({"type": "pong"}));
        assert_eq!(rx.recv().await.unwrap(), json!({"type": "pong"}));
    }
}
