//! Event bus broadcasting per-request routing outcomes to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;
use uuid::Uuid;

/// A routing outcome published after every terminated request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RouteEvent {
    Success {
        request_id: Uuid,
        model_id: String,
        provider_id: String,
        mode: String,
        latency_ms: u64,
        cost_usd: f64,
        timestamp: DateTime<Utc>,
    },
    Error {
        request_id: Uuid,
        model_id: String,
        provider_id: String,
        mode: String,
        error_class: String,
        http_status: Option<u16>,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus. Publishing never blocks and never fails the request
/// path: with no subscribers the event is simply discarded.
pub struct EventBus {
    sender: broadcast::Sender<RouteEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: RouteEvent) {
        let _ = self.sender.send(event);
        debug!("route event published");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouteEvent> {
        self.sender.subscribe()
    }

    /// Subscription as a `Stream`, for consumers that forward events
    /// (SSE bridges, websocket fan-out). Lagged receivers yield errors
    /// rather than blocking the bus.
    pub fn subscribe_stream(&self) -> BroadcastStream<RouteEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(RouteEvent::Success {
            request_id: Uuid::new_v4(),
            model_id: "m".to_string(),
            provider_id: "p".to_string(),
            mode: "normal".to_string(),
            latency_ms: 42,
            cost_usd: 0.01,
            timestamp: Utc::now(),
        });

        match rx.recv().await.unwrap() {
            RouteEvent::Success { model_id, .. } => assert_eq!(model_id, "m"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn stream_subscription_yields_events() {
        use futures::StreamExt;

        let bus = EventBus::new(16);
        let mut stream = bus.subscribe_stream();
        bus.publish(RouteEvent::Success {
            request_id: Uuid::new_v4(),
            model_id: "m".to_string(),
            provider_id: "p".to_string(),
            mode: "cheap".to_string(),
            latency_ms: 10,
            cost_usd: 0.001,
            timestamp: Utc::now(),
        });
        let event = stream.next().await.unwrap().unwrap();
        assert!(matches!(event, RouteEvent::Success { .. }));
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(RouteEvent::Error {
            request_id: Uuid::new_v4(),
            model_id: "m".to_string(),
            provider_id: "p".to_string(),
            mode: "cheap".to_string(),
            error_class: "retryable".to_string(),
            http_status: Some(500),
            timestamp: Utc::now(),
        });
    }
}
