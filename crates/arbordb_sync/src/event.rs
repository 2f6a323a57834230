//! Data events and listener registrations.

use arbordb_core::{Node, Path};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

static NEXT_REGISTRATION_ID: AtomicU64 = AtomicU64::new(1);

/// The kind of change a data event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The value at the listened path changed (always follows any child
    /// events of the same change).
    Value,
    /// A child appeared under the listened path.
    ChildAdded,
    /// A child under the listened path changed.
    ChildChanged,
    /// A child disappeared from under the listened path.
    ChildRemoved,
}

/// A single change notification.
#[derive(Debug, Clone)]
pub struct DataEvent {
    /// What happened.
    pub kind: EventKind,
    /// The listened path the event is delivered at.
    pub path: Path,
    /// Snapshot of the value (the child for child events).
    pub snapshot: Node,
    /// The child key, for child events.
    pub child_name: Option<String>,
}

/// Callback invoked with each matching data event.
pub type EventCallback = Arc<dyn Fn(&DataEvent) + Send + Sync>;

/// A listener registration: the kinds it responds to plus its callback.
///
/// Registrations are identified by a process-unique id; removal is by
/// id, so the same callback can be registered more than once.
pub struct EventRegistration {
    id: u64,
    kinds: Vec<EventKind>,
    callback: EventCallback,
}

impl EventRegistration {
    /// Creates a registration responding to the given kinds.
    #[must_use]
    pub fn new(kinds: Vec<EventKind>, callback: EventCallback) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_REGISTRATION_ID.fetch_add(1, Ordering::Relaxed),
            kinds,
            callback,
        })
    }

    /// Creates a registration responding to value events only.
    #[must_use]
    pub fn value(callback: EventCallback) -> Arc<Self> {
        Self::new(vec![EventKind::Value], callback)
    }

    /// Returns the registration id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns true if this registration wants events of `kind`.
    #[must_use]
    pub fn responds_to(&self, kind: EventKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Invokes the callback under an exception guard.
    ///
    /// A panicking listener is logged and isolated; delivery to other
    /// listeners continues.
    pub fn fire(&self, event: &DataEvent) {
        let result = catch_unwind(AssertUnwindSafe(|| (self.callback)(event)));
        if result.is_err() {
            warn!(
                registration = self.id,
                path = %event.path,
                "event callback panicked; continuing delivery"
            );
        }
    }
}

impl std::fmt::Debug for EventRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistration")
            .field("id", &self.id)
            .field("kinds", &self.kinds)
            .finish_non_exhaustive()
    }
}

/// A deliverable event: a [`DataEvent`] bound to its registration.
#[derive(Debug, Clone)]
pub struct Event {
    registration: Arc<EventRegistration>,
    /// The event payload.
    pub data: DataEvent,
}

impl Event {
    /// Binds an event payload to a registration.
    #[must_use]
    pub fn new(registration: Arc<EventRegistration>, data: DataEvent) -> Self {
        Self { registration, data }
    }

    /// The path the event is delivered at.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.data.path
    }

    /// Delivers the event to its registration.
    pub fn raise(&self) {
        self.registration.fire(&self.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn value_event(path: &str, value: serde_json::Value) -> DataEvent {
        DataEvent {
            kind: EventKind::Value,
            path: Path::new(path),
            snapshot: Node::from_json(&value),
            child_name: None,
        }
    }

    #[test]
    fn registration_ids_are_unique() {
        let a = EventRegistration::value(Arc::new(|_| {}));
        let b = EventRegistration::value(Arc::new(|_| {}));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn responds_to_kinds() {
        let reg = EventRegistration::new(
            vec![EventKind::ChildAdded, EventKind::ChildRemoved],
            Arc::new(|_| {}),
        );
        assert!(reg.responds_to(EventKind::ChildAdded));
        assert!(!reg.responds_to(EventKind::Value));
    }

    #[test]
    fn fire_delivers_payload() {
        let seen: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let reg = EventRegistration::value(Arc::new(move |event| {
            sink.lock().push(event.snapshot.val(false));
        }));

        Event::new(reg, value_event("a", json!(5))).raise();
        assert_eq!(*seen.lock(), vec![json!(5)]);
    }

    #[test]
    fn panicking_callback_is_isolated() {
        let reg = EventRegistration::value(Arc::new(|_| panic!("listener bug")));
        // Must not propagate.
        Event::new(reg, value_event("a", json!(1))).raise();
    }
}
