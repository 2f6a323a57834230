//! Overlay of server state and pending user writes.

use crate::event::{DataEvent, Event, EventKind, EventRegistration};
use crate::query::{QuerySpec, Tag};
use arbordb_core::{Node, Path};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// A listen lifecycle change the owner must forward to its transport.
///
/// The tree returns these instead of invoking injected callbacks so the
/// owner can dispatch them after releasing its own locks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenCommand {
    /// The first registration arrived at a query: start listening.
    Start {
        /// The query to listen on.
        query: QuerySpec,
        /// Tag for filtered queries, `None` for unfiltered ones.
        tag: Option<Tag>,
        /// Resume hash of the current server cache at the query path.
        hash: String,
    },
    /// The last registration left a query: stop listening.
    Stop {
        /// The query to stop listening on.
        query: QuerySpec,
        /// The tag the listen was started with.
        tag: Option<Tag>,
    },
}

#[derive(Debug)]
enum WriteOp {
    Overwrite(Node),
    Merge(BTreeMap<String, Node>),
}

#[derive(Debug)]
struct WriteRecord {
    write_id: u64,
    path: Path,
    op: WriteOp,
    visible: bool,
}

struct ListenSpot {
    query: QuerySpec,
    tag: Option<Tag>,
    registrations: Vec<Arc<EventRegistration>>,
    /// Last complete view delivered at this spot; `None` until the view
    /// first becomes complete.
    delivered: Option<Node>,
    /// Server cache scoped to this filtered view (tagged spots only).
    tagged_cache: Node,
    tagged_complete: bool,
}

/// Marks paths where server data has been confirmed complete.
#[derive(Debug, Default)]
struct CompletionMarks {
    complete: bool,
    children: BTreeMap<String, CompletionMarks>,
}

impl CompletionMarks {
    fn mark(&mut self, path: &Path) {
        if self.complete {
            return;
        }
        match path.front() {
            None => {
                self.complete = true;
                self.children.clear();
            }
            Some(front) => {
                self.children
                    .entry(front.to_owned())
                    .or_default()
                    .mark(&path.pop_front());
            }
        }
    }

    fn is_complete_at(&self, path: &Path) -> bool {
        if self.complete {
            return true;
        }
        match path.front() {
            None => false,
            Some(front) => self
                .children
                .get(front)
                .is_some_and(|child| child.is_complete_at(&path.pop_front())),
        }
    }
}

/// The overlay fusing a server cache with pending user writes.
///
/// The tree maintains the best-known server state, an ordered ledger of
/// optimistic writes keyed by write id, and the set of listen spots with
/// their registrations. Every mutation re-evaluates the affected spots
/// and returns the event delta; a spot only emits once its view is
/// **complete** (server data confirmed at or above it, or a visible
/// pending overwrite shadowing it) and an incomplete view retains its
/// last delivered value.
pub struct SyncTree {
    server_cache: Node,
    completion: CompletionMarks,
    pending: Vec<WriteRecord>,
    spots: BTreeMap<String, ListenSpot>,
    tags: HashMap<Tag, String>,
    next_tag: Tag,
}

impl SyncTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self {
            server_cache: Node::empty(),
            completion: CompletionMarks::default(),
            pending: Vec::new(),
            spots: BTreeMap::new(),
            tags: HashMap::new(),
            next_tag: 1,
        }
    }

    /// Replaces the server cache at `path` and marks it complete.
    pub fn apply_server_overwrite(&mut self, path: &Path, node: Node) -> Vec<Event> {
        self.server_cache = self.server_cache.update_child(path, node);
        self.completion.mark(path);
        self.emit_for_change(path)
    }

    /// Merges children into the server cache at `path`.
    ///
    /// Each merged child is individually marked complete.
    pub fn apply_server_merge(
        &mut self,
        path: &Path,
        children: &BTreeMap<String, Node>,
    ) -> Vec<Event> {
        for (key, node) in children {
            let child_path = path.child(key);
            self.server_cache = self.server_cache.update_child(&child_path, node.clone());
            self.completion.mark(&child_path);
        }
        self.emit_for_change(path)
    }

    /// Marks server data complete at `path` without changing it.
    pub fn apply_listen_complete(&mut self, path: &Path) -> Vec<Event> {
        self.completion.mark(path);
        self.emit_for_change(path)
    }

    /// Replaces the tagged view's cache at `path`.
    ///
    /// Unknown tags and paths outside the tagged query are protocol
    /// anomalies, tolerated silently.
    pub fn apply_tagged_query_overwrite(
        &mut self,
        path: &Path,
        node: Node,
        tag: Tag,
    ) -> Vec<Event> {
        let Some(spot) = self.tagged_spot_mut(tag, path) else {
            return Vec::new();
        };
        let relative = spot.query.path.relative(path);
        spot.tagged_cache = spot.tagged_cache.update_child(&relative, node);
        if relative.is_empty() {
            spot.tagged_complete = true;
        }
        self.emit_for_change(path)
    }

    /// Merges children into the tagged view's cache at `path`.
    pub fn apply_tagged_query_merge(
        &mut self,
        path: &Path,
        children: &BTreeMap<String, Node>,
        tag: Tag,
    ) -> Vec<Event> {
        let Some(spot) = self.tagged_spot_mut(tag, path) else {
            return Vec::new();
        };
        let relative = spot.query.path.relative(path);
        for (key, node) in children {
            spot.tagged_cache = spot
                .tagged_cache
                .update_child(&relative.child(key), node.clone());
        }
        self.emit_for_change(path)
    }

    /// Marks a tagged view's server data complete.
    pub fn apply_tagged_listen_complete(&mut self, tag: Tag) -> Vec<Event> {
        let Some(key) = self.tags.get(&tag).cloned() else {
            debug!(tag, "listen complete for unknown tag");
            return Vec::new();
        };
        let Some(spot) = self.spots.get_mut(&key) else {
            return Vec::new();
        };
        spot.tagged_complete = true;
        let path = spot.query.path.clone();
        self.emit_for_change(&path)
    }

    /// Records a pending user overwrite on top of the server cache.
    pub fn apply_user_overwrite(
        &mut self,
        path: &Path,
        node: Node,
        write_id: u64,
        visible: bool,
    ) -> Vec<Event> {
        self.pending.push(WriteRecord {
            write_id,
            path: path.clone(),
            op: WriteOp::Overwrite(node),
            visible,
        });
        if visible {
            self.emit_for_change(path)
        } else {
            Vec::new()
        }
    }

    /// Records a pending user merge on top of the server cache.
    pub fn apply_user_merge(
        &mut self,
        path: &Path,
        children: BTreeMap<String, Node>,
        write_id: u64,
    ) -> Vec<Event> {
        self.pending.push(WriteRecord {
            write_id,
            path: path.clone(),
            op: WriteOp::Merge(children),
            visible: true,
        });
        self.emit_for_change(path)
    }

    /// Drops the pending write with `write_id`.
    ///
    /// With `revert` the view recomputes as if the write had never
    /// happened, producing compensating events; on success the server
    /// cache is expected to catch up through a subsequent server update.
    /// Out-of-order and unknown acknowledgements are tolerated.
    pub fn ack_user_write(&mut self, write_id: u64, revert: bool) -> Vec<Event> {
        let Some(index) = self.pending.iter().position(|w| w.write_id == write_id) else {
            debug!(write_id, "ack for unknown write");
            return Vec::new();
        };
        let record = self.pending.remove(index);
        if revert {
            debug!(write_id, path = %record.path, "reverting user write");
        }
        self.emit_for_change(&record.path)
    }

    /// Returns the number of pending (unacknowledged) writes.
    #[must_use]
    pub fn pending_write_count(&self) -> usize {
        self.pending.len()
    }

    /// Adds a listener registration for `query`.
    ///
    /// The first registration at a query produces a
    /// [`ListenCommand::Start`]; if the view is already complete the new
    /// registration receives its synthetic initial events.
    pub fn add_event_registration(
        &mut self,
        query: &QuerySpec,
        registration: Arc<EventRegistration>,
    ) -> (Vec<Event>, Vec<ListenCommand>) {
        let key = query.identity();
        let mut commands = Vec::new();

        if !self.spots.contains_key(&key) {
            let tag = if query.is_default() {
                None
            } else {
                let tag = self.next_tag;
                self.next_tag += 1;
                self.tags.insert(tag, key.clone());
                Some(tag)
            };
            commands.push(ListenCommand::Start {
                query: query.clone(),
                tag,
                hash: self.server_cache.get_child(&query.path).hash(),
            });
            self.spots.insert(
                key.clone(),
                ListenSpot {
                    query: query.clone(),
                    tag,
                    registrations: Vec::new(),
                    delivered: None,
                    tagged_cache: Node::empty(),
                    tagged_complete: false,
                },
            );
        }

        let mut events = Vec::new();
        let view = if let Some(spot) = self.spots.get(&key) {
            let (view, complete) = self.eval_spot(spot);
            complete.then_some(view)
        } else {
            None
        };
        if let Some(spot) = self.spots.get_mut(&key) {
            spot.registrations.push(Arc::clone(&registration));
            if let Some(view) = view {
                events = spot_events(
                    std::slice::from_ref(&registration),
                    &spot.query.path,
                    None,
                    &view,
                );
                spot.delivered = Some(view);
            }
        }
        (events, commands)
    }

    /// Removes the registration with `registration_id` from `query`.
    ///
    /// Removal raises no cancel events; the empty event list is returned
    /// for symmetry with installation. The last removal at a query
    /// produces a [`ListenCommand::Stop`].
    pub fn remove_event_registration(
        &mut self,
        query: &QuerySpec,
        registration_id: u64,
    ) -> (Vec<Event>, Vec<ListenCommand>) {
        let key = query.identity();
        let mut commands = Vec::new();
        let mut emptied = false;
        if let Some(spot) = self.spots.get_mut(&key) {
            spot.registrations.retain(|r| r.id() != registration_id);
            emptied = spot.registrations.is_empty();
        }
        if emptied {
            if let Some(spot) = self.spots.remove(&key) {
                if let Some(tag) = spot.tag {
                    self.tags.remove(&tag);
                }
                commands.push(ListenCommand::Stop {
                    query: spot.query,
                    tag: spot.tag,
                });
            }
        }
        (Vec::new(), commands)
    }

    /// Returns the resume hash of the server cache for `query`.
    #[must_use]
    pub fn current_server_hash(&self, query: &QuerySpec) -> String {
        if let Some(spot) = self.spots.get(&query.identity()) {
            if spot.tag.is_some() {
                return spot.tagged_cache.hash();
            }
        }
        self.server_cache.get_child(&query.path).hash()
    }

    fn tagged_spot_mut(&mut self, tag: Tag, path: &Path) -> Option<&mut ListenSpot> {
        let Some(key) = self.tags.get(&tag) else {
            debug!(tag, %path, "server update for unknown tag");
            return None;
        };
        let spot = self.spots.get_mut(key)?;
        if !spot.query.path.contains(path) {
            debug!(tag, %path, "tagged update outside its query path");
            return None;
        }
        Some(spot)
    }

    /// Composes a spot's base cache with the visible pending writes.
    fn eval_spot(&self, spot: &ListenSpot) -> (Node, bool) {
        let path = &spot.query.path;
        let (base, server_complete) = if spot.tag.is_some() {
            (spot.tagged_cache.clone(), spot.tagged_complete)
        } else {
            (
                self.server_cache.get_child(path),
                self.completion.is_complete_at(path),
            )
        };
        let complete = server_complete || self.write_shadows(path);
        (self.apply_pending(base, path), complete)
    }

    fn apply_pending(&self, base: Node, path: &Path) -> Node {
        let mut view = base;
        for record in &self.pending {
            if !record.visible {
                continue;
            }
            match &record.op {
                WriteOp::Overwrite(node) => {
                    view = overlay_write(view, path, &record.path, node);
                }
                WriteOp::Merge(children) => {
                    for (key, node) in children {
                        view = overlay_write(view, path, &record.path.child(key), node);
                    }
                }
            }
        }
        view
    }

    /// Returns true if a visible pending write fully covers `path`.
    fn write_shadows(&self, path: &Path) -> bool {
        self.pending.iter().any(|record| {
            record.visible
                && match &record.op {
                    WriteOp::Overwrite(_) => record.path.contains(path),
                    WriteOp::Merge(children) => children
                        .keys()
                        .any(|key| record.path.child(key).contains(path)),
                }
        })
    }

    /// Re-evaluates every spot related to `changed` and collects the
    /// event delta against each spot's last delivered view.
    fn emit_for_change(&mut self, changed: &Path) -> Vec<Event> {
        let mut updates: Vec<(String, Node)> = Vec::new();
        for (key, spot) in &self.spots {
            if !spot.query.path.related_to(changed) {
                continue;
            }
            let (view, complete) = self.eval_spot(spot);
            if complete {
                updates.push((key.clone(), view));
            }
        }

        let mut events = Vec::new();
        for (key, view) in updates {
            if let Some(spot) = self.spots.get_mut(&key) {
                events.extend(spot_events(
                    &spot.registrations,
                    &spot.query.path,
                    spot.delivered.as_ref(),
                    &view,
                ));
                spot.delivered = Some(view);
            }
        }
        events
    }
}

impl Default for SyncTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Overlays one write onto a view rooted at `view_path`.
fn overlay_write(view: Node, view_path: &Path, write_path: &Path, node: &Node) -> Node {
    if write_path.contains(view_path) {
        node.get_child(&write_path.relative(view_path))
    } else if view_path.contains(write_path) {
        view.update_child(&view_path.relative(write_path), node.clone())
    } else {
        view
    }
}

/// Builds the events describing the step from `old` to `new` at a spot.
///
/// `None` for `old` means the spot's first complete view: every child is
/// reported as added. Child events precede the value event.
fn spot_events(
    registrations: &[Arc<EventRegistration>],
    path: &Path,
    old: Option<&Node>,
    new: &Node,
) -> Vec<Event> {
    if old.is_some_and(|old| old == new) {
        return Vec::new();
    }

    let mut out = Vec::new();
    let mut push = |kind: EventKind, snapshot: &Node, child_name: Option<&String>| {
        for registration in registrations {
            if registration.responds_to(kind) {
                out.push(Event::new(
                    Arc::clone(registration),
                    DataEvent {
                        kind,
                        path: path.clone(),
                        snapshot: snapshot.clone(),
                        child_name: child_name.cloned(),
                    },
                ));
            }
        }
    };

    let empty = Node::empty();
    let old_node = old.unwrap_or(&empty);
    for (key, new_child) in new.children() {
        let old_child = old_node.get_immediate_child(key);
        if old_child.is_empty() {
            push(EventKind::ChildAdded, new_child, Some(key));
        } else if old_child != *new_child {
            push(EventKind::ChildChanged, new_child, Some(key));
        }
    }
    for (key, old_child) in old_node.children() {
        if new.get_immediate_child(key).is_empty() {
            push(EventKind::ChildRemoved, old_child, Some(key));
        }
    }
    push(EventKind::Value, new, None);
    out
}
