//! Broadcast event bus for distributing `WorkflowEvent` to async subscribers.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no active subscribers
//! is a no-op, and a slow subscriber lags instead of blocking the scheduler.

use stepweave_types::event::WorkflowEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus for workflow lifecycle events.
///
/// Cloning the bus clones the sender, so every clone publishes into the
/// same channel.
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity (clamped to at least 1).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn skipped(step_id: &str) -> WorkflowEvent {
        WorkflowEvent::StepSkipped {
            run_id: Uuid::now_v7(),
            step_id: step_id.to_string(),
            reason: "condition false".to_string(),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(skipped("gate"));

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.step_id(), Some("gate"));
        assert_eq!(e2.name(), "step_skipped");
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new(16);
        bus.publish(skipped("a"));
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn lagged_receiver_does_not_block_publisher() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        for i in 0..10 {
            bus.publish(skipped(&format!("s{i}")));
        }

        match rx.try_recv() {
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn clone_shares_channel() {
        let bus = EventBus::new(16);
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();

        bus2.publish(skipped("a"));
        assert!(rx.try_recv().is_ok());
        assert!(format!("{bus:?}").contains("receiver_count"));
    }
}
