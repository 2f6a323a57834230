//! Per-repository statistics.
//!
//! Counters are collected per repository descriptor in a process-wide
//! registry, so multiple engines for the same repository share one
//! collection and the reporter is registered at most once.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, OnceLock};

/// A set of named monotonic counters.
#[derive(Debug, Default)]
pub struct StatsCollection {
    counters: Mutex<BTreeMap<String, u64>>,
}

impl StatsCollection {
    /// Creates an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `amount` to `metric`, creating it at zero if needed.
    pub fn increment(&self, metric: &str, amount: u64) {
        *self.counters.lock().entry(metric.to_owned()).or_insert(0) += amount;
    }

    /// Returns a snapshot of all counters.
    #[must_use]
    pub fn get(&self) -> BTreeMap<String, u64> {
        self.counters.lock().clone()
    }
}

/// Tracks counter values seen at the last read, yielding deltas.
pub struct StatsListener {
    collection: Arc<StatsCollection>,
    last: Mutex<BTreeMap<String, u64>>,
}

impl StatsListener {
    /// Creates a listener over `collection` with a zero baseline.
    #[must_use]
    pub fn new(collection: Arc<StatsCollection>) -> Self {
        Self {
            collection,
            last: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns counters that changed since the previous call, as deltas.
    #[must_use]
    pub fn get_delta(&self) -> BTreeMap<String, u64> {
        let current = self.collection.get();
        let mut last = self.last.lock();
        let mut delta = BTreeMap::new();
        for (metric, value) in &current {
            let previous = last.get(metric).copied().unwrap_or(0);
            if *value > previous {
                delta.insert(metric.clone(), value - previous);
            }
        }
        *last = current;
        delta
    }
}

/// Remembers which metrics the reporting layer should include.
#[derive(Debug, Default)]
pub struct StatsReporter {
    included: Mutex<HashSet<String>>,
}

impl StatsReporter {
    /// Creates a reporter including no metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a metric for inclusion in reports.
    pub fn include_stat(&self, metric: &str) {
        self.included.lock().insert(metric.to_owned());
    }

    /// Returns true if `metric` is marked for reporting.
    #[must_use]
    pub fn includes(&self, metric: &str) -> bool {
        self.included.lock().contains(metric)
    }
}

struct Registry {
    collections: HashMap<String, Arc<StatsCollection>>,
    reporters: HashMap<String, Arc<StatsReporter>>,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        Mutex::new(Registry {
            collections: HashMap::new(),
            reporters: HashMap::new(),
        })
    })
}

/// Returns the shared stats collection for a repository key.
#[must_use]
pub fn collection_for(repo_key: &str) -> Arc<StatsCollection> {
    let mut registry = registry().lock();
    Arc::clone(
        registry
            .collections
            .entry(repo_key.to_owned())
            .or_insert_with(|| Arc::new(StatsCollection::new())),
    )
}

/// Returns the reporter for a repository key, creating it on first use.
///
/// Subsequent calls for the same key return the same reporter, so
/// registration happens at most once per repository descriptor.
#[must_use]
pub fn reporter_for(repo_key: &str) -> Arc<StatsReporter> {
    let mut registry = registry().lock();
    Arc::clone(
        registry
            .reporters
            .entry(repo_key.to_owned())
            .or_insert_with(|| Arc::new(StatsReporter::new())),
    )
}

/// Prints a stats snapshot as aligned `name value` lines.
///
/// Column width is the longest metric name plus two.
pub fn print_snapshot(snapshot: &BTreeMap<String, u64>) {
    let width = snapshot.keys().map(String::len).max().unwrap_or(0) + 2;
    for (metric, value) in snapshot {
        println!("{metric:<width$}{value}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_and_snapshot() {
        let stats = StatsCollection::new();
        stats.increment("reads", 1);
        stats.increment("reads", 2);
        stats.increment("writes", 1);

        let snapshot = stats.get();
        assert_eq!(snapshot.get("reads"), Some(&3));
        assert_eq!(snapshot.get("writes"), Some(&1));
    }

    #[test]
    fn listener_yields_deltas() {
        let stats = Arc::new(StatsCollection::new());
        let listener = StatsListener::new(Arc::clone(&stats));

        stats.increment("ops", 5);
        assert_eq!(listener.get_delta().get("ops"), Some(&5));

        // No change since last read.
        assert!(listener.get_delta().is_empty());

        stats.increment("ops", 2);
        assert_eq!(listener.get_delta().get("ops"), Some(&2));
    }

    #[test]
    fn reporter_tracks_included_metrics() {
        let reporter = StatsReporter::new();
        assert!(!reporter.includes("ops"));
        reporter.include_stat("ops");
        assert!(reporter.includes("ops"));
    }

    #[test]
    fn registry_shares_by_key() {
        let a = collection_for("host-a/test-registry");
        let b = collection_for("host-a/test-registry");
        let other = collection_for("host-b/test-registry");

        a.increment("shared", 1);
        assert_eq!(b.get().get("shared"), Some(&1));
        assert!(other.get().get("shared").is_none());

        let r1 = reporter_for("host-a/test-registry");
        let r2 = reporter_for("host-a/test-registry");
        assert!(Arc::ptr_eq(&r1, &r2));
    }
}
