//! Event fan-out
//!
//! The pipeline publishes location, trip-progress and geofence events onto
//! a single broadcast channel tagged with string topics. Delivery is
//! best-effort: send errors just mean no one is listening and are ignored,
//! and the publisher never blocks on subscriber presence.

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// One published event
#[derive(Debug, Clone, Serialize)]
pub struct TrackingEvent {
    /// Unique event id
    pub id: String,
    /// Topic string, e.g. `location:{vehicle_id}`, `trip:{trip_id}`,
    /// `geofence:{vehicle_id}`
    pub topic: String,
    pub payload: serde_json::Value,
    pub published_at: String,
}

pub type EventSender = broadcast::Sender<TrackingEvent>;

#[derive(Clone)]
pub struct EventPublisher {
    tx: EventSender,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackingEvent> {
        self.tx.subscribe()
    }

    /// Publish a payload to a topic. Serialization failures are logged and
    /// dropped; they must never surface into the ingest path.
    pub fn publish<T: Serialize>(&self, topic: String, payload: &T) {
        let payload = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "Failed to serialize event payload");
                return;
            }
        };

        let event = TrackingEvent {
            id: Uuid::new_v4().to_string(),
            topic,
            payload,
            published_at: Utc::now().to_rfc3339(),
        };

        // Ignore send errors - they just mean no one is listening
        let _ = self.tx.send(event);
    }

    pub fn location_topic(vehicle_id: &str) -> String {
        format!("location:{vehicle_id}")
    }

    pub fn trip_topic(trip_id: i64) -> String {
        format!("trip:{trip_id}")
    }

    pub fn geofence_topic(vehicle_id: &str) -> String {
        format!("geofence:{vehicle_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber_with_topic() {
        let publisher = EventPublisher::new(16);
        let mut rx = publisher.subscribe();

        publisher.publish(EventPublisher::location_topic("bus-1"), &42u32);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic, "location:bus-1");
        assert_eq!(event.payload, serde_json::json!(42));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let publisher = EventPublisher::new(16);
        publisher.publish(EventPublisher::trip_topic(7), &"progress");
    }
}
