use tokio::sync::broadcast;
use uuid::Uuid;

use crate::state_machine::ServiceState;

/// Typed state-transition event emitted on every persisted transition
#[derive(Debug, Clone)]
pub struct TransitionEvent {
    pub service_id: Uuid,
    pub from: ServiceState,
    pub to: ServiceState,
    pub occurred_at: chrono::DateTime<chrono::Utc>,
}

/// Broadcast publisher for lifecycle transition events.
///
/// Dispatch is synchronous and direct: `publish` hands the event to the
/// broadcast channel before the transition call returns, so subscribers
/// observe transitions in the order the store applied them.
#[derive(Debug, Clone)]
pub struct TransitionPublisher {
    sender: broadcast::Sender<TransitionEvent>,
}

impl TransitionPublisher {
    /// Create a new publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a transition event
    pub fn publish(&self, service_id: Uuid, from: ServiceState, to: ServiceState) {
        let event = TransitionEvent {
            service_id,
            from,
            to,
            occurred_at: chrono::Utc::now(),
        };

        // A send error only means there are no subscribers right now, which
        // is acceptable - transitions are persisted regardless of listeners.
        let _ = self.sender.send(event);
    }

    /// Subscribe to transition events
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for TransitionPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}
