//! Single-writer snapshot storage for the synthetic info tree.

use crate::node::Node;
use crate::path::Path;

/// Holds one tree addressable by [`Path`].
///
/// Backs the client-synthesised `.info` subtree: the engine is the only
/// writer, readers get value-type snapshots.
#[derive(Debug, Default)]
pub struct SnapshotHolder {
    root: Node,
}

impl SnapshotHolder {
    /// Creates a holder containing the empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the node at `path`, or the empty node if absent.
    #[must_use]
    pub fn get_node(&self, path: &Path) -> Node {
        self.root.get_child(path)
    }

    /// Replaces the subtree at `path` with `node`.
    pub fn update_snapshot(&mut self, path: &Path, node: Node) {
        self.root = self.root.update_child(path, node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn starts_empty() {
        let holder = SnapshotHolder::new();
        assert!(holder.get_node(&Path::root()).is_empty());
        assert!(holder.get_node(&Path::new("a/b")).is_empty());
    }

    #[test]
    fn update_and_read_back() {
        let mut holder = SnapshotHolder::new();
        holder.update_snapshot(&Path::new(".info/connected"), Node::leaf(json!(true)));

        assert_eq!(
            holder.get_node(&Path::new(".info/connected")).val(false),
            json!(true)
        );
        assert_eq!(
            holder.get_node(&Path::new(".info")).val(false),
            json!({"connected": true})
        );
    }

    #[test]
    fn update_replaces_subtree() {
        let mut holder = SnapshotHolder::new();
        holder.update_snapshot(&Path::new("a"), Node::from_json(&json!({"x": 1, "y": 2})));
        holder.update_snapshot(&Path::new("a"), Node::leaf(json!("flat")));

        assert_eq!(holder.get_node(&Path::new("a")).val(false), json!("flat"));
        assert!(holder.get_node(&Path::new("a/x")).is_empty());
    }
}
