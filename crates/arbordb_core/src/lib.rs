//! # ArborDB Core
//!
//! Value model for the ArborDB realtime database client.
//!
//! This crate provides:
//! - Hierarchical path keys (`Path`)
//! - Immutable subtree snapshots with optional priority (`Node`)
//! - Deferred server-value resolution (timestamp substitution)
//! - A sparse, path-indexed snapshot trie for pending on-disconnect writes
//! - A single-writer holder for the synthetic `.info` tree

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod node;
pub mod path;
pub mod server_values;
pub mod snapshot_holder;
pub mod sparse_snapshot_tree;

pub use error::{CoreError, CoreResult};
pub use node::Node;
pub use path::Path;
pub use snapshot_holder::SnapshotHolder;
pub use sparse_snapshot_tree::SparseSnapshotTree;
