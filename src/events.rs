//! Coordinator event fan-out.
//!
//! Agent connects/disconnects and operation settlements are published as JSON
//! notifications for anyone who cares (future UI surfaces, tests). No
//! subscribers is fine; slow subscribers lag and drop.

use serde_json::Value;
use tokio::sync::broadcast;

/// Broadcasts JSON event strings to all subscribers.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<String>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Publish an event. Ignore errors — no subscribers is fine.
    pub fn broadcast(&self, event: &str, payload: Value) {
        let notification = serde_json::json!({
            "event": event,
            "payload": payload,
        });
        let _ = self
            .tx
            .send(serde_json::to_string(&notification).unwrap_or_default());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}
