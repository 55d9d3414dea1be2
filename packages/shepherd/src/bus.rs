use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

/// Buffered messages per subscription; the oldest are dropped on overflow.
const SUBSCRIPTION_DEPTH: usize = 256;

/// In-process publish/subscribe keyed by topic.
///
/// The dispatcher publishes every decoded broker message here and each
/// websocket session holds one subscription for the lifetime of its
/// connection. Subscribers only see messages published after they
/// subscribed.
#[derive(Debug, Default)]
pub struct EventBus {
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<String> {
        self.sender(topic).subscribe()
    }

    /// Publish a serialized message to every current subscriber of `topic`.
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, topic: &str, payload: String) -> usize {
        self.sender(topic).send(payload).unwrap_or(0)
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        let mut topics = self.topics.lock().expect("event bus lock poisoned");
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIPTION_DEPTH).0)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_messages_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("environment-state");

        assert_eq!(bus.publish("environment-state", "one".to_string()), 1);
        assert_eq!(bus.publish("environment-state", "two".to_string()), 1);

        assert_eq!(rx.recv().await.expect("recv"), "one");
        assert_eq!(rx.recv().await.expect("recv"), "two");
    }

    #[tokio::test]
    async fn late_subscribers_miss_earlier_messages() {
        let bus = EventBus::new();
        bus.publish("environment-state", "early".to_string());

        let mut rx = bus.subscribe("environment-state");
        bus.publish("environment-state", "late".to_string());
        assert_eq!(rx.recv().await.expect("recv"), "late");
    }

    #[tokio::test]
    async fn topics_are_independent() {
        let bus = EventBus::new();
        let mut state = bus.subscribe("environment-state");
        let _cell = bus.subscribe("cell-receive");

        assert_eq!(bus.publish("environment-state", "x".to_string()), 1);
        assert_eq!(bus.publish("unsubscribed", "y".to_string()), 0);
        assert_eq!(state.recv().await.expect("recv"), "x");
    }
}
