//! Internal broadcast event bus.
//!
//! Carries container state changes, log lines, and metric samples from the
//! background pipelines (C6/C7/C8) to whatever wants to fan them out over
//! SSE (C10). Grounded on the teacher's `events::bus::EventBus`: a
//! `tokio::sync::broadcast` channel that keeps one receiver alive internally
//! so the channel never closes even with zero external subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::logs::LogEntry;
use crate::metrics::MetricSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Exited,
    Removed,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Starting => "starting",
            ContainerState::Running => "running",
            ContainerState::Stopping => "stopping",
            ContainerState::Stopped => "stopped",
            ContainerState::Exited => "exited",
            ContainerState::Removed => "removed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum Event {
    StateChange {
        container_id: String,
        project_id: String,
        state: ContainerState,
        at: DateTime<Utc>,
    },
    LogLine {
        container_id: String,
        entry: LogEntry,
    },
    Metric {
        container_id: String,
        sample: MetricSample,
    },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    _receiver: std::sync::Arc<broadcast::Receiver<Event>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, receiver) = broadcast::channel(capacity);
        Self {
            sender,
            _receiver: std::sync::Arc::new(receiver),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: Event) {
        // No subscribers is not an error: background pipelines keep running
        // whether or not anyone is watching.
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pubsub_delivers_to_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::StateChange {
            container_id: "c1".into(),
            project_id: "p1".into(),
            state: ContainerState::Running,
            at: Utc::now(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::StateChange { .. }));
    }

    #[test]
    fn subscriber_count_tracks_subscriptions() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        let _rx1 = bus.subscribe();
        let _rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }
}
