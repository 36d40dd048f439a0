//! Presentation bus: every debate publishes here, renderers subscribe.
//!
//! Backed by a tokio broadcast channel. A slow subscriber lags and loses the
//! oldest events; publishing never blocks the coordinator.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use super::types::DebateEvent;

/// Events buffered per subscriber.
const CHANNEL_CAPACITY: usize = 1024;

/// Bus handle shared by the registry and every coordinator.
pub type SharedEventBus = Arc<EventBus>;

pub struct EventBus {
    sender: broadcast::Sender<DebateEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    /// Bus buffering `capacity` events per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Wrap in an `Arc`.
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Fan `event` out to current subscribers. Dropped silently when nobody
    /// listens.
    pub fn publish(&self, event: DebateEvent) {
        let event_type = event.event_type();
        let receivers = self.sender.send(event).unwrap_or(0);
        trace!(event_type, receivers, "event published");
    }

    /// Unfiltered receiver over every debate.
    pub fn subscribe(&self) -> broadcast::Receiver<DebateEvent> {
        self.sender.subscribe()
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

/// Subscription filter. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub debate_id: Option<String>,
    /// Events that carry no participant (status changes, verdicts) always
    /// pass this one.
    pub participant_id: Option<String>,
    /// Accepted [`DebateEvent::event_type`] names.
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debate(mut self, debate_id: &str) -> Self {
        self.debate_id = Some(debate_id.to_string());
        self
    }

    pub fn participant(mut self, participant_id: &str) -> Self {
        self.participant_id = Some(participant_id.to_string());
        self
    }

    pub fn types(mut self, event_types: &[&str]) -> Self {
        self.event_types = Some(event_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn matches(&self, event: &DebateEvent) -> bool {
        let debate_ok = self
            .debate_id
            .as_deref()
            .map_or(true, |id| event.debate_id() == id);
        let participant_ok = match (self.participant_id.as_deref(), event.participant_id()) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        };
        let type_ok = self
            .event_types
            .as_ref()
            .map_or(true, |types| types.iter().any(|t| t == event.event_type()));
        debate_ok && participant_ok && type_ok
    }
}

/// Receiver that skips events its filter rejects.
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<DebateEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    pub fn new(receiver: broadcast::Receiver<DebateEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Next matching event. Lag and close errors pass through.
    pub async fn recv(&mut self) -> Result<DebateEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// Filtered subscription on a bus or a shared bus.
pub trait EventBusExt {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver;
}

impl EventBusExt for EventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

impl EventBusExt for SharedEventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NotificationLevel;
    use chrono::Utc;

    fn chunk(debate: &str, participant: &str) -> DebateEvent {
        DebateEvent::Chunk {
            debate_id: debate.to_string(),
            participant_id: participant.to_string(),
            round: 1,
            text: "x".to_string(),
            timestamp: Utc::now(),
        }
    }

    fn notification(debate: &str) -> DebateEvent {
        DebateEvent::Notification {
            debate_id: debate.to_string(),
            level: NotificationLevel::Info,
            message: "hello".to_string(),
            remedy: None,
            participant_id: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();
        bus.publish(chunk("d-1", "alpha"));
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "chunk");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(chunk("d-1", "alpha"));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new().shared();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(notification("d-1"));
        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.event_type(), e2.event_type());
    }

    #[test]
    fn test_event_filter() {
        let filter = EventFilter::new()
            .debate("d-1")
            .participant("alpha")
            .types(&["chunk", "notification"]);

        assert!(filter.matches(&chunk("d-1", "alpha")));
        assert!(!filter.matches(&chunk("d-2", "alpha")));
        assert!(!filter.matches(&chunk("d-1", "beta")));
        // Debate-wide notification passes the participant filter.
        assert!(filter.matches(&notification("d-1")));
    }

    #[tokio::test]
    async fn test_filtered_receiver() {
        let bus = EventBus::new();
        let mut filtered = bus.subscribe_filtered(EventFilter::new().debate("target"));

        bus.publish(chunk("other", "alpha"));
        bus.publish(chunk("target", "beta"));

        let event = filtered.recv().await.unwrap();
        assert_eq!(event.debate_id(), "target");
        assert_eq!(event.participant_id(), Some("beta"));
    }
}
