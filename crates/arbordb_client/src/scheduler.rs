//! Deferred-task scheduling.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// A task deferred to the next scheduler turn.
pub type Task = Box<dyn FnOnce() + Send>;

/// A same-executor queue of deferred tasks.
///
/// The engine is single-threaded and cooperative: "defer to the next
/// turn" means enqueueing here, and the queue drains at the start of
/// every engine entry point (or when the embedder pumps it explicitly).
/// Tasks enqueued while draining run in the same drain, after the tasks
/// already queued.
#[derive(Default)]
pub struct Scheduler {
    tasks: Mutex<VecDeque<Task>>,
}

impl Scheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a task for the next turn.
    pub fn defer(&self, task: Task) {
        self.tasks.lock().push_back(task);
    }

    /// Runs queued tasks until the queue is empty.
    ///
    /// The lock is released while each task runs, so tasks may re-enter
    /// the scheduler.
    pub fn drain(&self) {
        loop {
            let task = self.tasks.lock().pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// Returns the number of queued tasks.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn defer_does_not_run_immediately() {
        let scheduler = Scheduler::new();
        let ran: Arc<Mutex<bool>> = Arc::new(Mutex::new(false));

        let flag = Arc::clone(&ran);
        scheduler.defer(Box::new(move || *flag.lock() = true));

        assert!(!*ran.lock());
        assert_eq!(scheduler.pending(), 1);

        scheduler.drain();
        assert!(*ran.lock());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn tasks_run_in_order_and_may_requeue() {
        let scheduler = Arc::new(Scheduler::new());
        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        let o2 = Arc::clone(&order);
        let sched = Arc::clone(&scheduler);
        scheduler.defer(Box::new(move || {
            o1.lock().push(1);
            let o3 = Arc::clone(&o2);
            sched.defer(Box::new(move || o3.lock().push(3)));
        }));
        let o4 = Arc::clone(&order);
        scheduler.defer(Box::new(move || o4.lock().push(2)));

        scheduler.drain();
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }
}
