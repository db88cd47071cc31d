//! Durable event log with push fan-out (spec §4.5). Every event is appended
//! to persistent storage before being pushed to subscribers; subscribers
//! that originated an event don't get it echoed back. Grounded on the
//! publish/fan-out shape of `infrastructure/replication.rs`'s
//! `ReplicationManager` and the bounded-channel delivery style of
//! `infrastructure/eventual_consistency.rs`.

use crate::error::AppResult;
use crate::models::Event;
use crate::persistence::Persistence;
use crate::vector_clock::VectorClockManager;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

/// Distinguishes a dashboard observer (receives everything) from a node
/// subscription (receives everything except its own echoes).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriberKind {
    Dashboard,
    Node(String),
}

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;
const WRITE_DEADLINE: Duration = Duration::from_secs(5);

struct Subscriber {
    kind: SubscriberKind,
    sender: mpsc::Sender<Event>,
}

pub struct EventBus {
    persistence: Arc<Persistence>,
    subscribers: RwLock<HashMap<String, Subscriber>>,
}

impl EventBus {
    pub fn new(persistence: Arc<Persistence>) -> Self {
        Self { persistence, subscribers: RwLock::new(HashMap::new()) }
    }

    /// Registers a subscription identified by `(kind, id)`. Re-registering
    /// the same `(kind, id)` replaces the old channel rather than creating a
    /// duplicate -- subscription registration is idempotent.
    pub async fn subscribe(&self, kind: SubscriberKind, id: String) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(subscription_key(&kind, &id), Subscriber { kind, sender: tx });
        rx
    }

    pub async fn unsubscribe(&self, kind: &SubscriberKind, id: &str) {
        self.subscribers.write().await.remove(&subscription_key(kind, id));
    }

    /// Appends `event` to durable storage, then fans it out to every
    /// subscriber except the node that originated it (echo suppression).
    /// Delivery is at-least-once: a slow subscriber that misses its write
    /// deadline is dropped from the fan-out for this event, not retried.
    pub async fn publish(&self, event: Event) -> AppResult<()> {
        self.persistence.append_event(&event).await?;

        let subscribers = self.subscribers.read().await;
        for subscriber in subscribers.values() {
            if let SubscriberKind::Node(node_id) = &subscriber.kind {
                if node_id == &event.source_node_id {
                    continue;
                }
            }

            let send_result = tokio::time::timeout(WRITE_DEADLINE, subscriber.sender.send(event.clone())).await;
            if send_result.is_err() {
                tracing::warn!(
                    event_id = %event.event_id,
                    "write deadline exceeded delivering event to a subscriber"
                );
            }
        }

        Ok(())
    }

    pub async fn list_recent(&self, limit: i64) -> AppResult<Vec<Event>> {
        self.persistence.list_events(limit).await
    }

    /// Events touching a single file, returned in causal order (spec §4.2's
    /// `causal_sort`, applied to the file's event window).
    pub async fn causal_events_for_file(
        &self,
        clock_manager: &VectorClockManager,
        file_id: &str,
    ) -> AppResult<Vec<Event>> {
        let events = self.persistence.list_events_for_file(file_id).await?;
        Ok(clock_manager.causal_sort(events))
    }

    pub async fn mark_processed(&self, event_id: &str) -> AppResult<()> {
        self.persistence.mark_event_processed(event_id).await
    }

    /// Oldest-first (spec §4.1's "list-unprocessed (oldest-first)").
    pub async fn list_unprocessed(&self, limit: i64) -> AppResult<Vec<Event>> {
        self.persistence.list_unprocessed_events(limit).await
    }

    pub async fn purge_old_events(&self, retention_days: i64) -> AppResult<u64> {
        self.persistence.purge_processed_events(retention_days).await
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

fn subscription_key(kind: &SubscriberKind, id: &str) -> String {
    match kind {
        SubscriberKind::Dashboard => format!("dashboard::{}", id),
        SubscriberKind::Node(_) => format!("node::{}", id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{current_time_millis, EventPayload};
    use crate::vector_clock::VectorClock;

    async fn test_bus() -> EventBus {
        let persistence = Arc::new(Persistence::connect("sqlite::memory:").await.unwrap());
        EventBus::new(persistence)
    }

    fn sample_event(source: &str) -> Event {
        Event {
            event_id: uuid::Uuid::new_v4().to_string(),
            source_node_id: source.to_string(),
            timestamp: current_time_millis(),
            vector_clock: VectorClock::new(),
            payload: EventPayload::NodeRegistered { node_id: source.to_string() },
            processed: false,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = test_bus().await;
        let mut rx = bus.subscribe(SubscriberKind::Dashboard, "dash-1".to_string()).await;
        bus.publish(sample_event("n1")).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.source_node_id, "n1");
    }

    #[tokio::test]
    async fn originating_node_does_not_receive_its_own_event() {
        let bus = test_bus().await;
        let mut node_rx = bus.subscribe(SubscriberKind::Node("n1".to_string()), "n1".to_string()).await;
        let mut dash_rx = bus.subscribe(SubscriberKind::Dashboard, "dash-1".to_string()).await;

        bus.publish(sample_event("n1")).await.unwrap();

        // The dashboard gets it; the originating node's channel stays empty.
        assert!(dash_rx.recv().await.is_some());
        assert!(node_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn resubscribing_same_id_replaces_the_old_channel() {
        let bus = test_bus().await;
        let _first = bus.subscribe(SubscriberKind::Dashboard, "dash-1".to_string()).await;
        assert_eq!(bus.subscriber_count().await, 1);
        let mut second = bus.subscribe(SubscriberKind::Dashboard, "dash-1".to_string()).await;
        assert_eq!(bus.subscriber_count().await, 1);

        bus.publish(sample_event("n1")).await.unwrap();
        assert!(second.recv().await.is_some());
    }

    #[tokio::test]
    async fn mark_processed_removes_event_from_the_unprocessed_list() {
        let bus = test_bus().await;
        let event = sample_event("n1");
        let event_id = event.event_id.clone();
        bus.publish(event).await.unwrap();

        let unprocessed = bus.list_unprocessed(10).await.unwrap();
        assert!(unprocessed.iter().any(|e| e.event_id == event_id));

        bus.mark_processed(&event_id).await.unwrap();
        let unprocessed = bus.list_unprocessed(10).await.unwrap();
        assert!(!unprocessed.iter().any(|e| e.event_id == event_id));
    }

    #[tokio::test]
    async fn events_for_a_file_come_back_causally_sorted() {
        let bus = test_bus().await;
        let clock_manager = VectorClockManager::new();
        clock_manager.register("n1");

        let mut e1 = sample_event("n1");
        e1.payload = EventPayload::FileCreated { file_id: "f1".to_string(), version_id: "v1".to_string() };
        e1.vector_clock = clock_manager.increment_local("n1");
        bus.publish(e1).await.unwrap();

        let mut e2 = sample_event("n1");
        e2.payload = EventPayload::FileModified {
            file_id: "f1".to_string(),
            version_id: "v2".to_string(),
            action: None,
        };
        e2.vector_clock = clock_manager.increment_local("n1");
        bus.publish(e2).await.unwrap();

        let events = bus.causal_events_for_file(&clock_manager, "f1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].payload.kind(), "file_created");
        assert_eq!(events[1].payload.kind(), "file_modified");
    }
}
