//! Lifecycle event fan-out.
//!
//! The bus is synchronous and in-process: `emit` invokes every
//! subscriber on the caller's execution context, in registration order.
//! A panicking subscriber is isolated and logged; it never interrupts
//! fan-out. Subscribers must not take locks the scheduler holds.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happened to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// Execution began.
    Started,
    /// Execution finished successfully.
    Completed,
    /// An attempt failed. `retry` is set when another attempt is
    /// scheduled; `delay_ms` is the backoff before it.
    Failed {
        retry: bool,
        attempt: u32,
        delay_ms: Option<u64>,
    },
    /// An upstream dependency failed permanently.
    Blocked,
    /// A deferred retry transitioned the task back to pending.
    RetryScheduled,
    /// The timeout manager routed an overrunning execution.
    TimedOut { action: String },
    /// Guardian advisory: pending past the starvation threshold.
    Starved,
    /// Guardian advisory: running past the wedge threshold.
    Stuck,
}

/// A single lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: Uuid,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl TaskEvent {
    pub fn new(task_id: Uuid, kind: EventKind) -> Self {
        Self {
            task_id,
            at: Utc::now(),
            kind,
        }
    }
}

/// Subscriber callback type.
pub type EventHandler = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

/// In-process event bus with best-effort, fire-and-forget delivery.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Subscribers are invoked in registration
    /// order and are never removed for the life of the bus.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .expect("event bus lock poisoned")
            .push(Arc::new(handler));
    }

    /// Fan an event out to every subscriber.
    pub fn emit(&self, event: TaskEvent) {
        let subscribers = self
            .subscribers
            .read()
            .expect("event bus lock poisoned")
            .clone();
        for handler in subscribers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::warn!(
                    task_id = %event.task_id,
                    kind = ?event.kind,
                    "event subscriber panicked, continuing fan-out"
                );
            }
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .expect("event bus lock poisoned")
            .len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delivers_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let log = Arc::clone(&log);
            bus.subscribe(move |_| log.lock().unwrap().push(tag));
        }

        bus.emit(TaskEvent::new(Uuid::new_v4(), EventKind::Started));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn panicking_subscriber_does_not_interrupt_fanout() {
        let bus = EventBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        bus.subscribe(|_| panic!("subscriber bug"));
        let counter = Arc::clone(&delivered);
        bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(TaskEvent::new(Uuid::new_v4(), EventKind::Completed));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn events_carry_kind_payload() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        bus.subscribe(move |event| {
            *sink.lock().unwrap() = Some(event.kind.clone());
        });

        bus.emit(TaskEvent::new(
            Uuid::new_v4(),
            EventKind::Failed {
                retry: true,
                attempt: 1,
                delay_ms: Some(5_000),
            },
        ));

        match seen.lock().unwrap().clone() {
            Some(EventKind::Failed {
                retry,
                attempt,
                delay_ms,
            }) => {
                assert!(retry);
                assert_eq!(attempt, 1);
                assert_eq!(delay_ms, Some(5_000));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
