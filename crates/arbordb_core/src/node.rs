//! Immutable subtree snapshots.

use crate::path::Path;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Metadata key wrapping a leaf value in export form.
const VALUE_KEY: &str = ".value";
/// Metadata key carrying a node priority in export form.
const PRIORITY_KEY: &str = ".priority";
/// Metadata key marking a deferred server value.
const SERVER_VALUE_KEY: &str = ".sv";

/// An immutable snapshot of a subtree.
///
/// A node is either empty, a leaf scalar, or a sorted map of child nodes,
/// and optionally carries a priority (a legacy per-node ordering key,
/// held opaquely as a string or number). Nodes share structure through
/// `Arc`, so cloning is cheap and snapshots are freely passed by value.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    repr: Arc<Repr>,
}

#[derive(Debug, PartialEq)]
struct Repr {
    value: NodeValue,
    priority: Option<Value>,
}

#[derive(Debug, PartialEq)]
enum NodeValue {
    Empty,
    Leaf(Value),
    Children(BTreeMap<String, Node>),
}

impl Node {
    fn from_parts(value: NodeValue, priority: Option<Value>) -> Self {
        // An empty node carries no priority.
        let priority = match value {
            NodeValue::Empty => None,
            _ => priority.filter(|p| !p.is_null()),
        };
        Self {
            repr: Arc::new(Repr { value, priority }),
        }
    }

    /// Returns the empty node.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_parts(NodeValue::Empty, None)
    }

    /// Builds a leaf node from a scalar JSON value.
    ///
    /// A `null` value yields the empty node. Deferred server-value
    /// sentinels (objects carrying `".sv"`) are held as leaf payloads
    /// until resolution.
    #[must_use]
    pub fn leaf(value: Value) -> Self {
        if value.is_null() {
            Self::empty()
        } else {
            Self::from_parts(NodeValue::Leaf(value), None)
        }
    }

    /// Builds an interior node from a children map, pruning empty children.
    ///
    /// An empty map yields the empty node.
    #[must_use]
    pub fn from_children(children: BTreeMap<String, Node>) -> Self {
        let children: BTreeMap<String, Node> = children
            .into_iter()
            .filter(|(_, child)| !child.is_empty())
            .collect();
        if children.is_empty() {
            Self::empty()
        } else {
            Self::from_parts(NodeValue::Children(children), None)
        }
    }

    /// Parses a node from its JSON representation.
    ///
    /// Accepts export-form metadata: `".value"` wraps a prioritised leaf
    /// and `".priority"` attaches a priority to either form. Arrays
    /// become children keyed by index. `null` and empty objects produce
    /// the empty node.
    #[must_use]
    pub fn from_json(json: &Value) -> Self {
        match json {
            Value::Null => Self::empty(),
            Value::Object(map) => {
                if map.contains_key(SERVER_VALUE_KEY) {
                    return Self::from_parts(NodeValue::Leaf(json.clone()), None);
                }
                let priority = map.get(PRIORITY_KEY).cloned();
                if let Some(value) = map.get(VALUE_KEY) {
                    return Self::leaf(value.clone()).with_priority(priority);
                }
                let mut children = BTreeMap::new();
                for (key, value) in map {
                    if key.starts_with('.') {
                        continue;
                    }
                    let child = Self::from_json(value);
                    if !child.is_empty() {
                        children.insert(key.clone(), child);
                    }
                }
                Self::from_children(children).with_priority(priority)
            }
            Value::Array(items) => {
                let mut children = BTreeMap::new();
                for (index, item) in items.iter().enumerate() {
                    let child = Self::from_json(item);
                    if !child.is_empty() {
                        children.insert(index.to_string(), child);
                    }
                }
                Self::from_children(children)
            }
            scalar => Self::leaf(scalar.clone()),
        }
    }

    /// Returns true if this node holds no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self.repr.value, NodeValue::Empty)
    }

    /// Returns true if this node is a leaf scalar.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self.repr.value, NodeValue::Leaf(_))
    }

    /// Returns the node's priority, if any.
    #[must_use]
    pub fn priority(&self) -> Option<&Value> {
        self.repr.priority.as_ref()
    }

    /// Returns this node with a different priority.
    ///
    /// Null priorities are normalised to `None`; the empty node never
    /// carries a priority.
    #[must_use]
    pub fn with_priority(&self, priority: Option<Value>) -> Self {
        match &self.repr.value {
            NodeValue::Empty => Self::empty(),
            NodeValue::Leaf(v) => Self::from_parts(NodeValue::Leaf(v.clone()), priority),
            NodeValue::Children(c) => Self::from_parts(NodeValue::Children(c.clone()), priority),
        }
    }

    fn children_map(&self) -> Option<&BTreeMap<String, Node>> {
        match &self.repr.value {
            NodeValue::Children(map) => Some(map),
            _ => None,
        }
    }

    /// Iterates over the immediate children in key order.
    pub fn children(&self) -> impl Iterator<Item = (&String, &Node)> {
        self.children_map().into_iter().flatten()
    }

    /// Returns the number of immediate children.
    #[must_use]
    pub fn num_children(&self) -> usize {
        self.children_map().map_or(0, BTreeMap::len)
    }

    /// Returns the immediate child under `key`, or the empty node.
    #[must_use]
    pub fn get_immediate_child(&self, key: &str) -> Node {
        self.children_map()
            .and_then(|map| map.get(key).cloned())
            .unwrap_or_else(Node::empty)
    }

    /// Returns the node at `path` below this one, or the empty node.
    #[must_use]
    pub fn get_child(&self, path: &Path) -> Node {
        match path.front() {
            None => self.clone(),
            Some(front) => self.get_immediate_child(front).get_child(&path.pop_front()),
        }
    }

    /// Returns this node with the immediate child under `key` replaced.
    ///
    /// An empty replacement removes the child. Replacing a child of a
    /// leaf discards the leaf scalar, as the two representations cannot
    /// coexist.
    #[must_use]
    pub fn update_immediate_child(&self, key: &str, child: Node) -> Node {
        let mut children = self.children_map().cloned().unwrap_or_default();
        if child.is_empty() {
            children.remove(key);
        } else {
            children.insert(key.to_owned(), child);
        }
        Self::from_children(children).with_priority(self.repr.priority.clone())
    }

    /// Returns this node with the subtree at `path` replaced by `node`.
    ///
    /// An empty `path` replaces this node entirely (including its
    /// priority, which follows the replacement).
    #[must_use]
    pub fn update_child(&self, path: &Path, node: Node) -> Node {
        match path.front() {
            None => node,
            Some(front) => {
                let updated = self
                    .get_immediate_child(front)
                    .update_child(&path.pop_front(), node);
                self.update_immediate_child(front, updated)
            }
        }
    }

    /// Renders the node as a plain JSON tree.
    ///
    /// With `export` set, priority metadata is retained: prioritised
    /// leaves render as `{".value": …, ".priority": …}` and interior
    /// nodes gain a `".priority"` entry. The empty node renders as
    /// `null` either way.
    #[must_use]
    pub fn val(&self, export: bool) -> Value {
        match &self.repr.value {
            NodeValue::Empty => Value::Null,
            NodeValue::Leaf(value) => match (&self.repr.priority, export) {
                (Some(priority), true) => {
                    let mut out = Map::new();
                    out.insert(VALUE_KEY.to_owned(), value.clone());
                    out.insert(PRIORITY_KEY.to_owned(), priority.clone());
                    Value::Object(out)
                }
                _ => value.clone(),
            },
            NodeValue::Children(children) => {
                let mut out = Map::new();
                if export {
                    if let Some(priority) = &self.repr.priority {
                        out.insert(PRIORITY_KEY.to_owned(), priority.clone());
                    }
                }
                for (key, child) in children {
                    out.insert(key.clone(), child.val(export));
                }
                Value::Object(out)
            }
        }
    }

    /// Returns a content hash of the node's export form.
    ///
    /// Used as the resume hash when re-establishing listens.
    #[must_use]
    pub fn hash(&self) -> String {
        let rendered = serde_json::to_string(&self.val(true)).unwrap_or_default();
        let digest = Sha256::digest(rendered.as_bytes());
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_is_empty() {
        assert!(Node::from_json(&Value::Null).is_empty());
        assert!(Node::from_json(&json!({})).is_empty());
        assert_eq!(Node::empty().val(false), Value::Null);
    }

    #[test]
    fn leaf_roundtrip() {
        let node = Node::from_json(&json!(42));
        assert!(node.is_leaf());
        assert_eq!(node.val(false), json!(42));
        assert_eq!(node.val(true), json!(42));
    }

    #[test]
    fn prioritised_leaf_export_form() {
        let node = Node::from_json(&json!({".value": "a", ".priority": 7}));
        assert_eq!(node.val(false), json!("a"));
        assert_eq!(node.val(true), json!({".value": "a", ".priority": 7}));
        assert_eq!(node.priority(), Some(&json!(7)));
    }

    #[test]
    fn children_parse_and_render() {
        let node = Node::from_json(&json!({"a": 1, "b": {"c": 2}}));
        assert_eq!(node.num_children(), 2);
        assert_eq!(node.get_child(&Path::new("b/c")).val(false), json!(2));
        assert_eq!(node.val(false), json!({"a": 1, "b": {"c": 2}}));
    }

    #[test]
    fn null_children_are_pruned() {
        let node = Node::from_json(&json!({"a": 1, "b": null}));
        assert_eq!(node.num_children(), 1);
        assert!(node.get_immediate_child("b").is_empty());
    }

    #[test]
    fn arrays_become_indexed_children() {
        let node = Node::from_json(&json!(["x", "y"]));
        assert_eq!(node.get_immediate_child("0").val(false), json!("x"));
        assert_eq!(node.get_immediate_child("1").val(false), json!("y"));
    }

    #[test]
    fn update_child_creates_intermediates() {
        let node = Node::empty().update_child(&Path::new("a/b"), Node::leaf(json!(5)));
        assert_eq!(node.val(false), json!({"a": {"b": 5}}));
    }

    #[test]
    fn update_with_empty_removes() {
        let node = Node::from_json(&json!({"a": 1, "b": 2}));
        let node = node.update_child(&Path::new("a"), Node::empty());
        assert_eq!(node.val(false), json!({"b": 2}));

        let node = node.update_child(&Path::new("b"), Node::empty());
        assert!(node.is_empty());
    }

    #[test]
    fn update_through_leaf_discards_scalar() {
        let node = Node::leaf(json!("scalar"));
        let node = node.update_child(&Path::new("child"), Node::leaf(json!(1)));
        assert_eq!(node.val(false), json!({"child": 1}));
    }

    #[test]
    fn empty_node_sheds_priority() {
        let node = Node::empty().with_priority(Some(json!(3)));
        assert_eq!(node.priority(), None);
    }

    #[test]
    fn structural_equality() {
        let a = Node::from_json(&json!({"x": {"y": 1}}));
        let b = Node::empty().update_child(&Path::new("x/y"), Node::leaf(json!(1)));
        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());

        let c = b.update_child(&Path::new("x/y"), Node::leaf(json!(2)));
        assert_ne!(a, c);
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn server_value_sentinel_is_a_leaf() {
        let node = Node::from_json(&json!({".sv": "timestamp"}));
        assert!(node.is_leaf());
        assert_eq!(node.val(false), json!({".sv": "timestamp"}));
    }
}
