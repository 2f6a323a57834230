//! # ArborDB Sync
//!
//! The overlay and notification layer of the ArborDB client.
//!
//! This crate provides:
//! - Query identity (path plus params) and tag handles for filtered listens
//! - The event model: data events, registrations, and guarded callbacks
//! - The serialised [`EventQueue`] notification dispatcher
//! - The [`SyncTree`] overlay fusing server state with pending user writes

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod event;
pub mod event_queue;
pub mod query;
pub mod sync_tree;

pub use event::{DataEvent, Event, EventKind, EventRegistration};
pub use event_queue::EventQueue;
pub use query::{QueryParams, QuerySpec, Tag};
pub use sync_tree::{ListenCommand, SyncTree};
