//! Lifecycle listeners and the emitter that fans events out to them.
//!
//! Every event goes to the broadcast `EventBus` first, then to each
//! registered `WorkflowListener` in registration order. A listener that
//! errors or panics is logged and skipped; it never affects the run.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use stepweave_types::event::WorkflowEvent;
use tokio::sync::broadcast;

use crate::event::EventBus;

/// Synchronous observer of workflow lifecycle events.
///
/// `payload` is the serialized event, including its `type` tag.
pub trait WorkflowListener: Send + Sync {
    fn notify(&self, event_name: &str, payload: &Value) -> anyhow::Result<()>;
}

impl<F> WorkflowListener for F
where
    F: Fn(&str, &Value) -> anyhow::Result<()> + Send + Sync,
{
    fn notify(&self, event_name: &str, payload: &Value) -> anyhow::Result<()> {
        self(event_name, payload)
    }
}

/// Handle returned by `add_listener`, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Fan-out point for lifecycle events. Cheap to clone.
#[derive(Clone)]
pub struct EventEmitter {
    listeners: Arc<DashMap<ListenerId, Arc<dyn WorkflowListener>>>,
    next_id: Arc<AtomicU64>,
    bus: EventBus,
}

impl EventEmitter {
    pub fn new(bus_capacity: usize) -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(0)),
            bus: EventBus::new(bus_capacity),
        }
    }

    pub fn add_listener<L: WorkflowListener + 'static>(&self, listener: L) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.insert(id, Arc::new(listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Subscribe to the broadcast stream of every future event.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Publish an event to the bus and every listener.
    pub fn emit(&self, event: WorkflowEvent) {
        let name = event.name();
        let payload = event.payload();
        tracing::trace!(event = name, run_id = %event.run_id(), "emit");

        // Snapshot so no map guard is held while user code runs.
        let listeners: BTreeMap<ListenerId, Arc<dyn WorkflowListener>> = self
            .listeners
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        self.bus.publish(event);

        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.notify(name, &payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(listener = id.0, event = name, error = %e, "listener returned error");
                }
                Err(_) => {
                    tracing::warn!(listener = id.0, event = name, "listener panicked");
                }
            }
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(1_024)
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.listeners.len())
            .field("bus", &self.bus)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn cancelled() -> WorkflowEvent {
        WorkflowEvent::WorkflowCancelled {
            run_id: Uuid::now_v7(),
            workflow_id: "wf".into(),
        }
    }

    #[test]
    fn test_listeners_called_in_registration_order() {
        let emitter = EventEmitter::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            emitter.add_listener(move |name: &str, _payload: &Value| {
                seen.lock().unwrap().push(format!("{tag}:{name}"));
                Ok(())
            });
        }

        emitter.emit(cancelled());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "first:workflow_cancelled",
                "second:workflow_cancelled",
                "third:workflow_cancelled"
            ]
        );
    }

    #[test]
    fn test_failing_and_panicking_listeners_are_isolated() {
        let emitter = EventEmitter::default();
        let delivered = Arc::new(AtomicU64::new(0));

        emitter.add_listener(|_: &str, _: &Value| Err(anyhow::anyhow!("listener down")));
        emitter.add_listener(|_: &str, _: &Value| -> anyhow::Result<()> { panic!("boom") });
        let counter = Arc::clone(&delivered);
        emitter.add_listener(move |_: &str, _: &Value| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        emitter.emit(cancelled());
        emitter.emit(cancelled());
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_payload_carries_type_tag() {
        let emitter = EventEmitter::default();
        let captured = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&captured);
        emitter.add_listener(move |_: &str, payload: &Value| {
            *slot.lock().unwrap() = Some(payload.clone());
            Ok(())
        });

        emitter.emit(cancelled());
        let payload = captured.lock().unwrap().clone().unwrap();
        assert_eq!(payload["type"], "workflow_cancelled");
        assert_eq!(payload["workflow_id"], "wf");
    }

    #[test]
    fn test_remove_listener() {
        let emitter = EventEmitter::default();
        let id = emitter.add_listener(|_: &str, _: &Value| Ok(()));
        assert_eq!(emitter.listener_count(), 1);
        assert!(emitter.remove_listener(id));
        assert!(!emitter.remove_listener(id));
        assert_eq!(emitter.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_bus_subscribers_receive_events() {
        let emitter = EventEmitter::new(8);
        let mut rx = emitter.subscribe();
        emitter.emit(cancelled());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "workflow_cancelled");
    }
}
