//! Serialised event delivery.

use crate::event::Event;
use arbordb_core::Path;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// An in-order, non-reentrant notification dispatcher.
///
/// Events are queued in batches, each tagged with the path its events
/// belong to. Draining delivers batches in FIFO order; a drain scoped to
/// a path only releases batches whose path is an ancestor or descendant
/// of it, leaving the rest queued. Callbacks run with no queue lock
/// held, so a listener may re-enter the queue; the nested call delivers
/// whatever matches and the outer drain picks up from there.
#[derive(Debug, Default)]
pub struct EventQueue {
    batches: Mutex<VecDeque<EventBatch>>,
}

#[derive(Debug)]
struct EventBatch {
    path: Path,
    events: Vec<Event>,
}

impl EventQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends events without delivering them.
    ///
    /// Consecutive events sharing a path are grouped into one batch so
    /// that a later scoped drain releases them together.
    pub fn queue_events(&self, events: Vec<Event>) {
        let mut batches = self.batches.lock();
        for event in events {
            match batches.back_mut() {
                Some(batch) if batch.path == *event.path() => batch.events.push(event),
                _ => batches.push_back(EventBatch {
                    path: event.path().clone(),
                    events: vec![event],
                }),
            }
        }
    }

    /// Queues `events` and drains every batch at exactly `path`.
    ///
    /// Used when installing or removing registrations, where only that
    /// location's synthetic events should be delivered immediately.
    pub fn raise_events_at_path(&self, path: &Path, events: Vec<Event>) {
        self.queue_events(events);
        self.raise_matching(|batch_path| batch_path == path);
    }

    /// Queues `events` and drains every batch related to `path`.
    ///
    /// "Related" means ancestor-or-descendant-or-equal; an empty event
    /// list simply flushes previously deferred batches.
    pub fn raise_events_for_changed_path(&self, path: &Path, events: Vec<Event>) {
        self.queue_events(events);
        self.raise_matching(|batch_path| batch_path.related_to(path));
    }

    /// Returns the number of queued batches (test hook).
    #[must_use]
    pub fn queued_batches(&self) -> usize {
        self.batches.lock().len()
    }

    fn raise_matching<F>(&self, predicate: F)
    where
        F: Fn(&Path) -> bool,
    {
        loop {
            // Take one matching batch at a time so the lock is never
            // held across a callback.
            let batch = {
                let mut batches = self.batches.lock();
                match batches.iter().position(|b| predicate(&b.path)) {
                    Some(index) => batches.remove(index),
                    None => None,
                }
            };
            let Some(batch) = batch else { break };
            for event in &batch.events {
                event.raise();
            }
        }
    }
}
