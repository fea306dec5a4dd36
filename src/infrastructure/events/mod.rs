//! In-process pub/sub. Topics are strings; delivery is in-order per topic
//! and non-blocking for the publisher. Each subscriber gets a bounded queue;
//! a lagging subscriber drops oldest events instead of stalling the bus.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

const TOPIC_CAPACITY: usize = 256;

/// One published event: an SSE-compatible event name plus a JSON payload.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub name: String,
    pub data: serde_json::Value,
}

impl BusEvent {
    pub fn new(name: &str, data: impl Serialize) -> Self {
        Self {
            name: name.to_string(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }
}

pub fn cell_status_topic(workspace_id: &str) -> String {
    format!("cell-status:{workspace_id}")
}

pub fn cell_timing_topic(cell_id: &str) -> String {
    format!("cell-timing:{cell_id}")
}

pub fn service_topic(cell_id: &str) -> String {
    format!("service:{cell_id}")
}

pub fn terminal_topic(session_key: &str) -> String {
    format!("terminal:{session_key}")
}

#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<DashMap<String, broadcast::Sender<BusEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, topic: &str, event: BusEvent) {
        if let Some(sender) = self.topics.get(topic) {
            // Send only fails when there are no receivers; that is fine.
            let _ = sender.send(event);
        }
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusEvent> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_publication_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("cell-status:w1");

        for i in 0..3 {
            bus.publish(
                "cell-status:w1",
                BusEvent::new("cell", serde_json::json!({ "seq": i })),
            );
        }

        for i in 0..3 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.data["seq"], i);
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_block() {
        let bus = EventBus::new();
        bus.publish("service:c1", BusEvent::new("service", serde_json::json!({})));
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = EventBus::new();
        let mut rx_a = bus.subscribe("terminal:a");
        let mut rx_b = bus.subscribe("terminal:b");

        bus.publish("terminal:a", BusEvent::new("data", serde_json::json!("x")));

        assert_eq!(rx_a.recv().await.unwrap().name, "data");
        assert!(matches!(
            rx_b.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_instead_of_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("cell-timing:c1");

        for i in 0..(TOPIC_CAPACITY + 10) {
            bus.publish(
                "cell-timing:c1",
                BusEvent::new("timing", serde_json::json!({ "seq": i })),
            );
        }

        // The first recv reports the lag, subsequent events still arrive.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert!(skipped >= 10),
            Ok(_) => panic!("expected lag error for overflowed subscriber"),
            Err(e) => panic!("unexpected error: {e}"),
        }
        assert!(rx.recv().await.is_ok());
    }
}
