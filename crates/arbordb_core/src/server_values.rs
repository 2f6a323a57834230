//! Deferred server-value resolution.
//!
//! Clients may write sentinel values such as `{".sv": "timestamp"}` that
//! the server replaces with authoritative data. The engine substitutes
//! the same tokens locally, against a context captured at write time, so
//! optimistic views agree with what the server will eventually store.

use crate::node::Node;
use crate::path::Path;
use crate::sparse_snapshot_tree::SparseSnapshotTree;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Sentinel key marking a deferred value.
const SERVER_VALUE_KEY: &str = ".sv";

/// The substitution context for deferred values.
pub type ServerValues = Map<String, Value>;

/// Builds the substitution context from an estimated server time.
#[must_use]
pub fn generate_server_values(server_time_ms: i64) -> ServerValues {
    let mut values = Map::new();
    values.insert("timestamp".to_owned(), Value::from(server_time_ms));
    values
}

/// Returns the deferred token carried by `value`, if it is a sentinel.
fn deferred_token(value: &Value) -> Option<&str> {
    value
        .as_object()
        .and_then(|map| map.get(SERVER_VALUE_KEY))
        .and_then(Value::as_str)
}

/// Substitutes a deferred sentinel against the context.
///
/// Non-sentinel values pass through unchanged. Unknown tokens resolve to
/// `null`.
#[must_use]
pub fn resolve_deferred_value(value: &Value, server_values: &ServerValues) -> Value {
    match deferred_token(value) {
        Some(token) => server_values.get(token).cloned().unwrap_or(Value::Null),
        None => value.clone(),
    }
}

/// Returns `node` with every deferred leaf and priority substituted.
#[must_use]
pub fn resolve_deferred_node(node: &Node, server_values: &ServerValues) -> Node {
    let priority = node
        .priority()
        .map(|p| resolve_deferred_value(p, server_values));
    if node.is_leaf() {
        let resolved = resolve_deferred_value(&node.val(false), server_values);
        Node::leaf(resolved).with_priority(priority)
    } else if node.is_empty() {
        Node::empty()
    } else {
        let children: BTreeMap<String, Node> = node
            .children()
            .map(|(key, child)| (key.clone(), resolve_deferred_node(child, server_values)))
            .collect();
        Node::from_children(children).with_priority(priority)
    }
}

/// Returns a resolved clone of a sparse snapshot tree.
#[must_use]
pub fn resolve_deferred_tree(
    tree: &SparseSnapshotTree,
    server_values: &ServerValues,
) -> SparseSnapshotTree {
    let mut resolved = SparseSnapshotTree::new();
    tree.for_each_tree(&Path::root(), &mut |path, node| {
        resolved.remember(path, resolve_deferred_node(node, server_values));
    });
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timestamp_token_resolves() {
        let values = generate_server_values(1234);
        let resolved = resolve_deferred_value(&json!({".sv": "timestamp"}), &values);
        assert_eq!(resolved, json!(1234));
    }

    #[test]
    fn plain_values_pass_through() {
        let values = generate_server_values(1234);
        assert_eq!(resolve_deferred_value(&json!(7), &values), json!(7));
        assert_eq!(
            resolve_deferred_value(&json!({"a": 1}), &values),
            json!({"a": 1})
        );
    }

    #[test]
    fn unknown_token_resolves_to_null() {
        let values = generate_server_values(1234);
        let resolved = resolve_deferred_value(&json!({".sv": "moonphase"}), &values);
        assert_eq!(resolved, Value::Null);
    }

    #[test]
    fn nested_node_resolution() {
        let values = generate_server_values(99);
        let node = Node::from_json(&json!({
            "created": {".sv": "timestamp"},
            "name": "alice",
        }));
        let resolved = resolve_deferred_node(&node, &values);
        assert_eq!(resolved.val(false), json!({"created": 99, "name": "alice"}));
    }

    #[test]
    fn deferred_priority_resolution() {
        let values = generate_server_values(55);
        let node = Node::leaf(json!("x")).with_priority(Some(json!({".sv": "timestamp"})));
        let resolved = resolve_deferred_node(&node, &values);
        assert_eq!(resolved.priority(), Some(&json!(55)));
    }

    #[test]
    fn tree_resolution_preserves_paths() {
        let values = generate_server_values(7);
        let mut tree = SparseSnapshotTree::new();
        tree.remember(&Path::new("a/b"), Node::from_json(&json!({".sv": "timestamp"})));
        tree.remember(&Path::new("c"), Node::leaf(json!("keep")));

        let resolved = resolve_deferred_tree(&tree, &values);
        let mut seen = Vec::new();
        resolved.for_each_tree(&Path::root(), &mut |path, node| {
            seen.push((path.to_string(), node.val(false)));
        });
        seen.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            seen,
            vec![
                ("/a/b".to_owned(), json!(7)),
                ("/c".to_owned(), json!("keep")),
            ]
        );
    }
}
