//! Sparse, path-indexed snapshot storage.

use crate::node::Node;
use crate::path::Path;
use std::collections::BTreeMap;

/// A mutable trie of pending snapshots keyed by path fragments.
///
/// Each slot optionally holds a [`Node`]; a stored node subsumes
/// everything beneath it, so the structure never keeps both a node and
/// descendants at the same position. Enumeration yields maximal stored
/// nodes and never descends into one.
///
/// # Invariants
///
/// - `remember` at a path discards any previously stored descendants.
/// - Interior slots with neither a value nor children are pruned.
#[derive(Debug, Default)]
pub struct SparseSnapshotTree {
    value: Option<Node>,
    children: BTreeMap<String, SparseSnapshotTree>,
}

impl SparseSnapshotTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if nothing is stored at or below this position.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }

    /// Stores `node` at `path`, replacing the whole subtree there.
    ///
    /// If an ancestor already holds a node, the write is folded into
    /// that node instead of splitting it.
    pub fn remember(&mut self, path: &Path, node: Node) {
        if path.is_empty() {
            self.value = Some(node);
            self.children.clear();
        } else if let Some(existing) = &self.value {
            self.value = Some(existing.update_child(path, node));
        } else {
            let front = path.front().unwrap_or_default().to_owned();
            let child = self.children.entry(front).or_default();
            child.remember(&path.pop_front(), node);
        }
    }

    /// Drops whatever is stored at `path`.
    ///
    /// A stored ancestor node is split so that only the forgotten
    /// subpath is removed, unless the ancestor is a leaf (leaves cannot
    /// be split and stay in place). Returns true if this position is
    /// empty afterwards, which lets parents prune it.
    pub fn forget(&mut self, path: &Path) -> bool {
        if path.is_empty() {
            self.value = None;
            self.children.clear();
            return true;
        }

        if let Some(existing) = self.value.take() {
            if existing.is_leaf() {
                // Cannot split a leaf; nothing below it to forget.
                self.value = Some(existing);
                return false;
            }
            for (key, child) in existing.children() {
                self.children
                    .entry(key.clone())
                    .or_default()
                    .remember(&Path::root(), child.clone());
            }
        }

        let front = path.front().unwrap_or_default().to_owned();
        if let Some(child) = self.children.get_mut(&front) {
            if child.forget(&path.pop_front()) {
                self.children.remove(&front);
            }
        }
        self.is_empty()
    }

    /// Visits every maximal stored node in pre-order.
    ///
    /// `prefix` is prepended to the reported paths. The visitor is never
    /// called for positions inside a stored node.
    pub fn for_each_tree<F>(&self, prefix: &Path, visit: &mut F)
    where
        F: FnMut(&Path, &Node),
    {
        if let Some(node) = &self.value {
            visit(prefix, node);
        } else {
            for (key, child) in &self.children {
                child.for_each_tree(&prefix.child(key), visit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn collect(tree: &SparseSnapshotTree) -> Vec<(String, serde_json::Value)> {
        let mut out = Vec::new();
        tree.for_each_tree(&Path::root(), &mut |path, node| {
            out.push((path.to_string(), node.val(false)));
        });
        out
    }

    #[test]
    fn remember_and_enumerate() {
        let mut tree = SparseSnapshotTree::new();
        tree.remember(&Path::new("a/b"), Node::leaf(json!(1)));
        tree.remember(&Path::new("c"), Node::leaf(json!(2)));

        assert_eq!(
            collect(&tree),
            vec![("/a/b".to_owned(), json!(1)), ("/c".to_owned(), json!(2))]
        );
    }

    #[test]
    fn remember_at_prefix_discards_descendants() {
        let mut tree = SparseSnapshotTree::new();
        tree.remember(&Path::new("a/b"), Node::leaf(json!(1)));
        tree.remember(&Path::new("a/c"), Node::leaf(json!(2)));
        tree.remember(&Path::new("a"), Node::leaf(json!("whole")));

        assert_eq!(collect(&tree), vec![("/a".to_owned(), json!("whole"))]);
    }

    #[test]
    fn remember_below_stored_node_folds_in() {
        let mut tree = SparseSnapshotTree::new();
        tree.remember(&Path::new("a"), Node::from_json(&json!({"x": 1})));
        tree.remember(&Path::new("a/y"), Node::leaf(json!(2)));

        assert_eq!(
            collect(&tree),
            vec![("/a".to_owned(), json!({"x": 1, "y": 2}))]
        );
    }

    #[test]
    fn forget_prunes_empty_interior_nodes() {
        let mut tree = SparseSnapshotTree::new();
        tree.remember(&Path::new("a/b/c"), Node::leaf(json!(1)));
        tree.forget(&Path::new("a/b/c"));

        assert!(tree.is_empty());
        assert!(collect(&tree).is_empty());
    }

    #[test]
    fn forget_splits_stored_interior_node() {
        let mut tree = SparseSnapshotTree::new();
        tree.remember(&Path::new("a"), Node::from_json(&json!({"x": 1, "y": 2})));
        tree.forget(&Path::new("a/x"));

        assert_eq!(collect(&tree), vec![("/a/y".to_owned(), json!(2))]);
    }

    #[test]
    fn forget_leaves_stored_leaf_alone() {
        let mut tree = SparseSnapshotTree::new();
        tree.remember(&Path::new("a"), Node::leaf(json!("scalar")));
        tree.forget(&Path::new("a/below"));

        assert_eq!(collect(&tree), vec![("/a".to_owned(), json!("scalar"))]);
    }

    #[test]
    fn forget_root_clears_everything() {
        let mut tree = SparseSnapshotTree::new();
        tree.remember(&Path::new("a"), Node::leaf(json!(1)));
        tree.remember(&Path::new("b"), Node::leaf(json!(2)));
        assert!(tree.forget(&Path::root()));
        assert!(tree.is_empty());
    }

    proptest! {
        #[test]
        fn remember_forget_roundtrip(
            segments in proptest::collection::vec("[a-z]{1,4}", 1..4),
        ) {
            let path = Path::from_pieces(segments);
            let mut tree = SparseSnapshotTree::new();
            tree.remember(&path, Node::leaf(json!(1)));
            prop_assert!(!tree.is_empty());
            tree.forget(&path);
            prop_assert!(tree.is_empty());
        }

        #[test]
        fn enumeration_yields_maximal_nodes_only(
            a in "[a-z]{1,4}",
            b in "[a-z]{1,4}",
        ) {
            prop_assume!(a != b);
            let mut tree = SparseSnapshotTree::new();
            tree.remember(&Path::new(&a).child(&b), Node::leaf(json!(1)));
            tree.remember(&Path::new(&a), Node::leaf(json!(2)));

            // The shallow write subsumed the deeper one.
            let seen = {
                let mut out = Vec::new();
                tree.for_each_tree(&Path::root(), &mut |p, _| out.push(p.clone()));
                out
            };
            prop_assert_eq!(seen, vec![Path::new(&a)]);
        }
    }
}
