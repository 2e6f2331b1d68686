use crate::types::{Timestamp, now_ms};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Topic carrying runner presence events.
pub const RUNNERS_TOPIC: &str = "runners";

/// Topic for one run's live event stream.
pub fn run_topic(run_id: Uuid) -> String {
    format!("run:{run_id}")
}

/// One fan-out unit: the event kind string plus an arbitrary JSON payload.
/// Persistence is the canonical record; the bus is a best-effort mirror.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEvent {
    pub topic: String,
    pub kind: String,
    pub payload: Value,
    pub timestamp: Timestamp,
}

impl BusEvent {
    pub fn new(topic: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            kind: kind.into(),
            payload,
            timestamp: now_ms(),
        }
    }
}

const SUBSCRIBER_BUFFER: usize = 256;

/// In-process fan-out of per-topic events. Delivery is at-least-once and
/// lossy: a slow subscriber's buffer drops its oldest entries, and the drop
/// count is tracked so operators can see backpressure.
pub struct EventBus {
    topics: RwLock<HashMap<String, broadcast::Sender<BusEvent>>>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Non-blocking publish. Events on topics with no subscribers vanish.
    pub fn publish(&self, topic: &str, event: BusEvent) {
        let guard = match self.topics.read() {
            Ok(g) => g,
            Err(_) => return,
        };
        if let Some(tx) = guard.get(topic) {
            // A send error just means every receiver is gone; the periodic
            // gc in subscribe() reclaims the slot.
            let _ = tx.send(event);
        }
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        let mut guard = match self.topics.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Reclaim topics whose last subscriber went away.
        guard.retain(|_, tx| tx.receiver_count() > 0);
        let tx = guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_BUFFER).0);
        Subscription {
            rx: tx.subscribe(),
            dropped: Arc::clone(&self.dropped),
        }
    }

    /// Total events dropped across all lagging subscribers.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of one topic subscription.
pub struct Subscription {
    rx: broadcast::Receiver<BusEvent>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Next event, skipping over any gap caused by buffer overflow. Returns
    /// `None` when the topic is closed.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant for polling consumers.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_topic_subscribers_only() {
        let bus = EventBus::new();
        let mut run_sub = bus.subscribe("run:abc");
        let mut runners_sub = bus.subscribe(RUNNERS_TOPIC);

        bus.publish("run:abc", BusEvent::new("run:abc", "RUN_QUEUED", json!({})));

        let event = run_sub.recv().await.unwrap();
        assert_eq!(event.kind, "RUN_QUEUED");
        assert!(runners_sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.publish("run:nobody", BusEvent::new("run:nobody", "RUN_QUEUED", json!({})));
        assert_eq!(bus.dropped_events(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_and_counts() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("run:slow");

        for i in 0..(SUBSCRIBER_BUFFER + 10) {
            bus.publish(
                "run:slow",
                BusEvent::new("run:slow", "STEP_END", json!({ "i": i })),
            );
        }

        // First recv reports the lag, then resumes from the oldest retained.
        let first = sub.recv().await.unwrap();
        assert_eq!(first.payload["i"], 10);
        assert_eq!(bus.dropped_events(), 10);
    }
}
