//! The reconciliation engine.
//!
//! [`Repo`] coordinates three sources of truth: optimistic local
//! writes, server-authoritative state, and the synthetic `.info`
//! subtree. User operations apply an optimistic update to the server
//! sync tree, defer the resulting events, send the unresolved form to
//! the transport, and reconcile on acknowledgement. Server callbacks
//! apply deltas and flush notifications through the serialised event
//! queue.

use crate::config::{ClientContext, RepoInfo};
use crate::error::{ClientResult, OperationError};
use crate::scheduler::Scheduler;
use crate::stats::{self, StatsCollection, StatsListener, StatsReporter};
use crate::transport::{ServerActions, TransportDelegate, TransportFactory};
use arbordb_core::server_values::{self, ServerValues};
use arbordb_core::{Node, Path, SnapshotHolder, SparseSnapshotTree};
use arbordb_sync::{EventQueue, EventRegistration, ListenCommand, QuerySpec, SyncTree, Tag};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Reason string forwarded with engine-initiated interrupts.
const INTERRUPT_REASON: &str = "repo_interrupt";

/// First component of every synthetic info path.
const INFO_PREFIX: &str = ".info";

/// Completion callback for a user write.
///
/// Receives `Ok(())` on success or the transport failure rendered as an
/// [`OperationError`].
pub type CompletionCallback = Box<dyn FnOnce(Result<(), OperationError>) + Send>;

/// A transaction-manager hook: maps a path to the affected path.
pub type TransactionHook = Box<dyn Fn(&Path) -> Path + Send + Sync>;

/// Rewrites server payloads before tree application (test seam).
pub type ServerDataInterceptor = Arc<dyn Fn(&str, &Value) -> Value + Send + Sync>;

struct TransactionHooks {
    abort: TransactionHook,
    rerun: TransactionHook,
}

impl TransactionHooks {
    /// Identity hooks used until a transaction manager installs itself.
    fn identity() -> Arc<Self> {
        Arc::new(Self {
            abort: Box::new(Path::clone),
            rerun: Box::new(Path::clone),
        })
    }
}

struct RepoState {
    server_sync_tree: SyncTree,
    info_sync_tree: SyncTree,
    info_data: SnapshotHolder,
    on_disconnect: SparseSnapshotTree,
}

/// The client-side coordinator for one repository.
///
/// Owns both sync trees, the write-id ledger, the on-disconnect tree,
/// the event queue, the deferred-task scheduler and the transport. All
/// entry points run on one logical thread; notification dispatch always
/// happens with no state lock held, so listeners may re-enter the
/// engine.
pub struct Repo {
    repo_info: RepoInfo,
    read_only: bool,
    weak_self: Weak<Repo>,
    transport: Arc<dyn ServerActions>,
    scheduler: Scheduler,
    event_queue: EventQueue,
    state: Mutex<RepoState>,
    next_write_id: AtomicU64,
    data_update_count: AtomicU64,
    stats_collection: Arc<StatsCollection>,
    stats_listener: StatsListener,
    stats_reporter: Arc<StatsReporter>,
    transaction_hooks: Mutex<Arc<TransactionHooks>>,
    interceptor: Mutex<Option<ServerDataInterceptor>>,
}

impl Repo {
    /// Constructs the engine for `repo_info`.
    ///
    /// With `force_read_only`, or when the user agent looks like a
    /// crawler, the transport is created in read-only mode and a
    /// synthetic connect event is scheduled before the first scheduler
    /// turn. Fails fast if the context's auth override is invalid.
    pub fn new(
        repo_info: RepoInfo,
        force_read_only: bool,
        context: ClientContext,
        factory: &dyn TransportFactory,
    ) -> ClientResult<Arc<Self>> {
        context.validate_auth_override()?;

        let read_only = force_read_only || repo_info.being_crawled();
        let stats_collection = stats::collection_for(&repo_info.key());
        let stats_listener = StatsListener::new(Arc::clone(&stats_collection));
        let stats_reporter = stats::reporter_for(&repo_info.key());

        let repo = Arc::new_cyclic(|weak: &Weak<Repo>| {
            let delegate = TransportDelegate {
                on_data_update: {
                    let weak = weak.clone();
                    Box::new(move |path, data, is_merge, tag| {
                        if let Some(repo) = weak.upgrade() {
                            repo.on_data_update(path, data, is_merge, tag);
                        }
                    })
                },
                on_connect_status: {
                    let weak = weak.clone();
                    Box::new(move |connected| {
                        if let Some(repo) = weak.upgrade() {
                            repo.on_connect_status(connected);
                        }
                    })
                },
                on_server_info_update: {
                    let weak = weak.clone();
                    Box::new(move |updates| {
                        if let Some(repo) = weak.upgrade() {
                            repo.on_server_info_update(updates);
                        }
                    })
                },
            };
            let transport = factory.create(
                &repo_info,
                delegate,
                Arc::clone(&context.auth_provider),
                read_only,
            );
            Repo {
                repo_info,
                read_only,
                weak_self: weak.clone(),
                transport,
                scheduler: Scheduler::new(),
                event_queue: EventQueue::new(),
                state: Mutex::new(RepoState {
                    server_sync_tree: SyncTree::new(),
                    info_sync_tree: SyncTree::new(),
                    info_data: SnapshotHolder::new(),
                    on_disconnect: SparseSnapshotTree::new(),
                }),
                next_write_id: AtomicU64::new(1),
                data_update_count: AtomicU64::new(0),
                stats_collection,
                stats_listener,
                stats_reporter,
                transaction_hooks: Mutex::new(TransactionHooks::identity()),
                interceptor: Mutex::new(None),
            }
        });

        {
            let weak = Arc::downgrade(&repo);
            context
                .auth_provider
                .add_token_change_listener(Box::new(move |token| {
                    if let Some(repo) = weak.upgrade() {
                        repo.transport.refresh_auth_token(token);
                    }
                }));
        }

        repo.update_info("connected", Value::Bool(false));

        if read_only {
            let weak = Arc::downgrade(&repo);
            repo.scheduler.defer(Box::new(move || {
                if let Some(repo) = weak.upgrade() {
                    repo.on_connect_status(true);
                }
            }));
        }

        Ok(repo)
    }

    /// Returns the database namespace.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.repo_info.namespace
    }

    /// Estimated current server time in milliseconds.
    ///
    /// Wall-clock time corrected by the `.info/serverTimeOffset` the
    /// server last reported (zero until then).
    #[must_use]
    pub fn server_time(&self) -> i64 {
        let offset = self
            .state
            .lock()
            .info_data
            .get_node(&Path::new(INFO_PREFIX).child("serverTimeOffset"))
            .val(false)
            .as_f64()
            .unwrap_or(0.0);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0);
        now + offset as i64
    }

    /// Builds the substitution context for deferred server values.
    #[must_use]
    pub fn generate_server_values(&self) -> ServerValues {
        server_values::generate_server_values(self.server_time())
    }

    /// Runs deferred tasks queued for the next scheduler turn.
    ///
    /// Every public entry point drains first, so embedders only need to
    /// pump this when idle.
    pub fn drain_scheduler(&self) {
        self.scheduler.drain();
    }

    /// Number of server data updates received (test hook).
    #[must_use]
    pub fn data_update_count(&self) -> u64 {
        self.data_update_count.load(Ordering::Relaxed)
    }

    /// Installs the transaction-manager hooks.
    ///
    /// `abort` aborts transactions at a path and returns the affected
    /// path; `rerun` re-evaluates the queue at a path. Until installed,
    /// both default to the identity.
    pub fn install_transaction_hooks(&self, abort: TransactionHook, rerun: TransactionHook) {
        *self.transaction_hooks.lock() = Arc::new(TransactionHooks { abort, rerun });
    }

    /// Installs or removes the server-payload interceptor (test seam).
    ///
    /// The engine applies only the interceptor's returned value; the
    /// original payload is never mutated in place.
    pub fn intercept_server_data(&self, interceptor: Option<ServerDataInterceptor>) {
        *self.interceptor.lock() = interceptor;
    }

    // === Write operations ===

    /// Writes `value` at `path`, replacing whatever is there.
    pub fn set(&self, path: &Path, value: &Value, on_complete: Option<CompletionCallback>) {
        self.set_with_priority(path, value, None, on_complete);
    }

    /// Writes `value` with an explicit priority at `path`.
    ///
    /// The optimistic view (with deferred values resolved) is applied
    /// immediately but its events are queued until after the transport
    /// call, so transaction side effects compose before notifications
    /// escape. The unresolved form goes to the server.
    pub fn set_with_priority(
        &self,
        path: &Path,
        value: &Value,
        priority: Option<Value>,
        on_complete: Option<CompletionCallback>,
    ) {
        self.drain_scheduler();
        debug!("{}set at {}", self.log_prefix(), path);

        let unresolved = Node::from_json(value).with_priority(priority);
        let server_values = self.generate_server_values();
        let resolved = server_values::resolve_deferred_node(&unresolved, &server_values);

        let write_id = self.next_write_id.fetch_add(1, Ordering::Relaxed);
        let events = self
            .state
            .lock()
            .server_sync_tree
            .apply_user_overwrite(path, resolved, write_id, true);
        self.event_queue.queue_events(events);

        let weak = self.weak_self.clone();
        let ack_path = path.clone();
        self.transport.put(
            &path.to_string(),
            unresolved.val(true),
            Some(Box::new(move |status, reason| {
                if let Some(repo) = weak.upgrade() {
                    repo.ack_set(&ack_path, write_id, status, reason, on_complete);
                } else {
                    Repo::call_on_complete(on_complete, status, reason);
                }
            })),
        );

        let affected = self.abort_transactions(path);
        let _ = self.rerun_transactions(&affected);
        self.event_queue
            .raise_events_for_changed_path(&affected, Vec::new());
    }

    /// Merges `children` into the tree at `path`.
    ///
    /// An empty merge completes with ok and touches neither the
    /// transport nor the trees.
    pub fn update(
        &self,
        path: &Path,
        children: &Map<String, Value>,
        on_complete: Option<CompletionCallback>,
    ) {
        self.drain_scheduler();
        debug!("{}update at {}", self.log_prefix(), path);

        if children.is_empty() {
            debug!("update called with empty data; nothing to do");
            Self::call_on_complete(on_complete, "ok", None);
            return;
        }

        let server_values = self.generate_server_values();
        let mut resolved_children = BTreeMap::new();
        let mut changed_keys = Vec::new();
        for (key, value) in children {
            let unresolved = Node::from_json(value);
            resolved_children.insert(
                key.clone(),
                server_values::resolve_deferred_node(&unresolved, &server_values),
            );
            changed_keys.push(key.clone());
        }

        let write_id = self.next_write_id.fetch_add(1, Ordering::Relaxed);
        let events = self
            .state
            .lock()
            .server_sync_tree
            .apply_user_merge(path, resolved_children, write_id);
        self.event_queue.queue_events(events);

        let weak = self.weak_self.clone();
        let ack_path = path.clone();
        self.transport.merge(
            &path.to_string(),
            Value::Object(children.clone()),
            Some(Box::new(move |status, reason| {
                if let Some(repo) = weak.upgrade() {
                    repo.ack_update(&ack_path, write_id, status, reason, on_complete);
                } else {
                    Repo::call_on_complete(on_complete, status, reason);
                }
            })),
        );

        for key in &changed_keys {
            let affected = self.abort_transactions(&path.child(key));
            let _ = self.rerun_transactions(&affected);
        }
        self.event_queue
            .raise_events_for_changed_path(path, Vec::new());
    }

    fn ack_set(
        &self,
        path: &Path,
        write_id: u64,
        status: &str,
        reason: Option<&str>,
        on_complete: Option<CompletionCallback>,
    ) {
        let success = status == "ok";
        if !success {
            warn!("{}set at {} failed: {}", self.log_prefix(), path, status);
        }
        let clear_events = self
            .state
            .lock()
            .server_sync_tree
            .ack_user_write(write_id, !success);
        self.event_queue
            .raise_events_for_changed_path(path, clear_events);
        Self::call_on_complete(on_complete, status, reason);
    }

    fn ack_update(
        &self,
        path: &Path,
        write_id: u64,
        status: &str,
        reason: Option<&str>,
        on_complete: Option<CompletionCallback>,
    ) {
        let success = status == "ok";
        if !success {
            warn!("{}update at {} failed: {}", self.log_prefix(), path, status);
        }
        let clear_events = self
            .state
            .lock()
            .server_sync_tree
            .ack_user_write(write_id, !success);
        let affected = if clear_events.is_empty() {
            path.clone()
        } else {
            self.rerun_transactions(path)
        };
        self.event_queue
            .raise_events_for_changed_path(&affected, clear_events);
        Self::call_on_complete(on_complete, status, reason);
    }

    // === Server-driven updates ===

    fn on_data_update(&self, path_str: &str, data: Value, is_merge: bool, tag: Option<Tag>) {
        self.data_update_count.fetch_add(1, Ordering::Relaxed);

        let data = {
            let interceptor = self.interceptor.lock().clone();
            match interceptor {
                Some(intercept) => intercept(path_str, &data),
                None => data,
            }
        };

        let path = Path::new(path_str);
        let events = {
            let mut state = self.state.lock();
            match (tag, is_merge) {
                (Some(tag), true) => state.server_sync_tree.apply_tagged_query_merge(
                    &path,
                    &children_from(&data),
                    tag,
                ),
                (Some(tag), false) => state.server_sync_tree.apply_tagged_query_overwrite(
                    &path,
                    Node::from_json(&data),
                    tag,
                ),
                (None, true) => state
                    .server_sync_tree
                    .apply_server_merge(&path, &children_from(&data)),
                (None, false) => state
                    .server_sync_tree
                    .apply_server_overwrite(&path, Node::from_json(&data)),
            }
        };

        // Any events mean something changed that could unblock a
        // pending transaction.
        let affected = if events.is_empty() {
            path
        } else {
            self.rerun_transactions(&path)
        };
        self.event_queue
            .raise_events_for_changed_path(&affected, events);
    }

    fn on_connect_status(&self, connected: bool) {
        debug!("{}connection state: {}", self.log_prefix(), connected);
        self.update_info("connected", Value::Bool(connected));
        if !connected {
            self.run_on_disconnect_events();
        }
    }

    fn on_server_info_update(&self, updates: Map<String, Value>) {
        for (key, value) in updates {
            self.update_info(&key, value);
        }
    }

    fn update_info(&self, relative_path: &str, value: Value) {
        let path = Path::new(INFO_PREFIX).child(relative_path);
        let node = Node::from_json(&value);
        let events = {
            let mut state = self.state.lock();
            state.info_data.update_snapshot(&path, node.clone());
            state.info_sync_tree.apply_server_overwrite(&path, node)
        };
        self.event_queue.raise_events_for_changed_path(&path, events);
    }

    // === Connection control ===

    /// Interrupts the persistent connection. Idempotent; a no-op in
    /// read-only mode.
    pub fn interrupt(&self) {
        if !self.read_only {
            self.transport.interrupt(INTERRUPT_REASON);
        }
    }

    /// Resumes a previously interrupted connection. Idempotent; a no-op
    /// in read-only mode.
    pub fn resume(&self) {
        if !self.read_only {
            self.transport.resume(INTERRUPT_REASON);
        }
    }

    // === OnDisconnect subsystem ===

    /// Registers `value` to be written at `path` when this session
    /// disconnects.
    pub fn on_disconnect_set(
        &self,
        path: &Path,
        value: &Value,
        on_complete: Option<CompletionCallback>,
    ) {
        self.drain_scheduler();
        self.send_on_disconnect_put(path, Node::from_json(value), on_complete);
    }

    /// Registers a prioritised value to be written at `path` on
    /// disconnect.
    pub fn on_disconnect_set_with_priority(
        &self,
        path: &Path,
        value: &Value,
        priority: Option<Value>,
        on_complete: Option<CompletionCallback>,
    ) {
        self.drain_scheduler();
        self.send_on_disconnect_put(path, Node::from_json(value).with_priority(priority), on_complete);
    }

    fn send_on_disconnect_put(
        &self,
        path: &Path,
        node: Node,
        on_complete: Option<CompletionCallback>,
    ) {
        let weak = self.weak_self.clone();
        let remember_path = path.clone();
        let remember_node = node.clone();
        self.transport.on_disconnect_put(
            &path.to_string(),
            node.val(true),
            Some(Box::new(move |status, reason| {
                if status == "ok" {
                    if let Some(repo) = weak.upgrade() {
                        repo.state
                            .lock()
                            .on_disconnect
                            .remember(&remember_path, remember_node.clone());
                    }
                }
                Repo::call_on_complete(on_complete, status, reason);
            })),
        );
    }

    /// Registers `children` to be merged at `path` on disconnect.
    ///
    /// An empty merge completes with ok immediately.
    pub fn on_disconnect_update(
        &self,
        path: &Path,
        children: &Map<String, Value>,
        on_complete: Option<CompletionCallback>,
    ) {
        self.drain_scheduler();
        if children.is_empty() {
            debug!("on-disconnect update called with empty data; nothing to do");
            Self::call_on_complete(on_complete, "ok", None);
            return;
        }

        let weak = self.weak_self.clone();
        let remember_path = path.clone();
        let to_remember: Vec<(String, Node)> = children
            .iter()
            .map(|(key, value)| (key.clone(), Node::from_json(value)))
            .collect();
        self.transport.on_disconnect_merge(
            &path.to_string(),
            Value::Object(children.clone()),
            Some(Box::new(move |status, reason| {
                if status == "ok" {
                    if let Some(repo) = weak.upgrade() {
                        let mut state = repo.state.lock();
                        for (key, node) in &to_remember {
                            state
                                .on_disconnect
                                .remember(&remember_path.child(key), node.clone());
                        }
                    }
                }
                Repo::call_on_complete(on_complete, status, reason);
            })),
        );
    }

    /// Cancels pending on-disconnect actions at `path`.
    pub fn on_disconnect_cancel(&self, path: &Path, on_complete: Option<CompletionCallback>) {
        self.drain_scheduler();
        let weak = self.weak_self.clone();
        let forget_path = path.clone();
        self.transport.on_disconnect_cancel(
            &path.to_string(),
            Some(Box::new(move |status, reason| {
                if status == "ok" {
                    if let Some(repo) = weak.upgrade() {
                        repo.state.lock().on_disconnect.forget(&forget_path);
                    }
                }
                Repo::call_on_complete(on_complete, status, reason);
            })),
        );
    }

    /// Applies the pending on-disconnect tree locally.
    ///
    /// Server values are captured at the moment of disconnect; every
    /// pending write is applied as a server overwrite (with transaction
    /// hooks run per path) before the tree is cleared, then all events
    /// are raised from the root.
    fn run_on_disconnect_events(&self) {
        let server_values = self.generate_server_values();

        let mut entries: Vec<(Path, Node)> = Vec::new();
        {
            let state = self.state.lock();
            let resolved =
                server_values::resolve_deferred_tree(&state.on_disconnect, &server_values);
            resolved.for_each_tree(&Path::root(), &mut |path, node| {
                entries.push((path.clone(), node.clone()));
            });
        }

        let mut events = Vec::new();
        for (path, node) in entries {
            events.extend(
                self.state
                    .lock()
                    .server_sync_tree
                    .apply_server_overwrite(&path, node),
            );
            let affected = self.abort_transactions(&path);
            let _ = self.rerun_transactions(&affected);
        }
        self.state.lock().on_disconnect = SparseSnapshotTree::new();
        self.event_queue
            .raise_events_for_changed_path(&Path::root(), events);
    }

    // === Event registration ===

    /// Adds a listener registration for `query`.
    ///
    /// Queries under `.info` route to the info sync tree; everything
    /// else to the server sync tree. Synthetic initial events are
    /// delivered before this returns.
    pub fn add_event_callback_for_query(
        &self,
        query: &QuerySpec,
        registration: Arc<EventRegistration>,
    ) {
        self.drain_scheduler();
        let is_info = query.path.front() == Some(INFO_PREFIX);
        let (events, commands) = {
            let mut state = self.state.lock();
            if is_info {
                state.info_sync_tree.add_event_registration(query, registration)
            } else {
                state
                    .server_sync_tree
                    .add_event_registration(query, registration)
            }
        };
        if is_info {
            self.run_info_listen_commands(commands);
        } else {
            self.run_server_listen_commands(commands);
        }
        self.event_queue.raise_events_at_path(&query.path, events);
    }

    /// Removes the registration with `registration_id` from `query`.
    ///
    /// Removal raises no cancel events; anything the tree returns is
    /// still raised defensively.
    pub fn remove_event_callback_for_query(&self, query: &QuerySpec, registration_id: u64) {
        self.drain_scheduler();
        let is_info = query.path.front() == Some(INFO_PREFIX);
        let (events, commands) = {
            let mut state = self.state.lock();
            if is_info {
                state
                    .info_sync_tree
                    .remove_event_registration(query, registration_id)
            } else {
                state
                    .server_sync_tree
                    .remove_event_registration(query, registration_id)
            }
        };
        if is_info {
            self.run_info_listen_commands(commands);
        } else {
            self.run_server_listen_commands(commands);
        }
        self.event_queue.raise_events_at_path(&query.path, events);
    }

    /// Listen lifecycle for the info tree: starting a listen where data
    /// already exists applies it as a server overwrite immediately and
    /// schedules the listen completion on the next turn; stopping is a
    /// no-op.
    fn run_info_listen_commands(&self, commands: Vec<ListenCommand>) {
        for command in commands {
            let ListenCommand::Start { query, .. } = command else {
                continue;
            };
            let (events, has_data) = {
                let mut state = self.state.lock();
                let node = state.info_data.get_node(&query.path);
                if node.is_empty() {
                    (Vec::new(), false)
                } else {
                    (
                        state.info_sync_tree.apply_server_overwrite(&query.path, node),
                        true,
                    )
                }
            };
            self.event_queue
                .raise_events_for_changed_path(&query.path, events);
            if has_data {
                let weak = self.weak_self.clone();
                let path = query.path.clone();
                self.scheduler.defer(Box::new(move || {
                    if let Some(repo) = weak.upgrade() {
                        let events = repo.state.lock().info_sync_tree.apply_listen_complete(&path);
                        repo.event_queue.raise_events_for_changed_path(&path, events);
                    }
                }));
            }
        }
    }

    fn run_server_listen_commands(&self, commands: Vec<ListenCommand>) {
        for command in commands {
            match command {
                ListenCommand::Start { query, tag, hash } => {
                    let weak = self.weak_self.clone();
                    let callback_query = query.clone();
                    self.transport.listen(
                        &query,
                        &hash,
                        tag,
                        Box::new(move |status, data| {
                            if let Some(repo) = weak.upgrade() {
                                repo.on_listen_complete(&callback_query, tag, status, data);
                            }
                        }),
                    );
                }
                ListenCommand::Stop { query, tag } => {
                    self.transport.unlisten(&query, tag);
                }
            }
        }
    }

    fn on_listen_complete(
        &self,
        query: &QuerySpec,
        tag: Option<Tag>,
        status: &str,
        data: Option<Value>,
    ) {
        if status != "ok" {
            warn!(
                "{}listen at {} failed: {}",
                self.log_prefix(),
                query.path,
                status
            );
            return;
        }
        let events = {
            let mut state = self.state.lock();
            let mut events = Vec::new();
            if let Some(data) = data {
                let node = Node::from_json(&data);
                events.extend(match tag {
                    Some(tag) => state
                        .server_sync_tree
                        .apply_tagged_query_overwrite(&query.path, node, tag),
                    None => state
                        .server_sync_tree
                        .apply_server_overwrite(&query.path, node),
                });
            }
            events.extend(match tag {
                Some(tag) => state.server_sync_tree.apply_tagged_listen_complete(tag),
                None => state.server_sync_tree.apply_listen_complete(&query.path),
            });
            events
        };
        self.event_queue
            .raise_events_for_changed_path(&query.path, events);
    }

    // === Diagnostics ===

    /// Prints collected stats as aligned `name value` lines.
    ///
    /// With `show_delta`, only counters changed since the previous delta
    /// read are printed, as differences.
    pub fn stats(&self, show_delta: bool) {
        let snapshot = if show_delta {
            self.stats_listener.get_delta()
        } else {
            self.stats_collection.get()
        };
        stats::print_snapshot(&snapshot);
    }

    /// Bumps a counter and marks it for inclusion in stat reports.
    pub fn stats_increment_counter(&self, metric: &str) {
        self.stats_collection.increment(metric, 1);
        self.stats_reporter.include_stat(metric);
    }

    // === Helpers ===

    fn abort_transactions(&self, path: &Path) -> Path {
        let hooks = Arc::clone(&self.transaction_hooks.lock());
        (hooks.abort)(path)
    }

    fn rerun_transactions(&self, path: &Path) -> Path {
        let hooks = Arc::clone(&self.transaction_hooks.lock());
        (hooks.rerun)(path)
    }

    fn log_prefix(&self) -> String {
        self.transport
            .connection_id()
            .map(|id| format!("{id}: "))
            .unwrap_or_default()
    }

    /// Delivers a completion result under an exception guard.
    ///
    /// Status `"ok"` maps to `Ok(())`; anything else becomes an
    /// [`OperationError`]. A panicking callback is logged and isolated.
    fn call_on_complete(
        on_complete: Option<CompletionCallback>,
        status: &str,
        reason: Option<&str>,
    ) {
        let Some(callback) = on_complete else {
            return;
        };
        let result = if status == "ok" {
            Ok(())
        } else {
            Err(OperationError::from_status(status, reason))
        };
        let outcome = catch_unwind(AssertUnwindSafe(move || callback(result)));
        if outcome.is_err() {
            warn!("completion callback panicked; continuing");
        }
    }
}

impl fmt::Display for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repo_info.connection_url())
    }
}

/// Splits a merge payload into per-child nodes.
fn children_from(data: &Value) -> BTreeMap<String, Node> {
    data.as_object()
        .map(|map| {
            map.iter()
                .map(|(key, value)| (key.clone(), Node::from_json(value)))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockServerActions, MockTransportFactory};
    use serde_json::json;

    fn build_repo(info: RepoInfo, force_read_only: bool) -> (Arc<Repo>, Arc<MockServerActions>) {
        let mock = Arc::new(MockServerActions::new());
        let factory = MockTransportFactory::new(Arc::clone(&mock));
        let repo = Repo::new(info, force_read_only, ClientContext::default(), &factory)
            .expect("valid config");
        (repo, mock)
    }

    #[test]
    fn display_is_the_connection_url() {
        let (repo, _mock) = build_repo(RepoInfo::new("db.example.com", "demo", true), false);
        assert_eq!(repo.to_string(), "https://db.example.com");
        assert_eq!(repo.name(), "demo");
    }

    #[test]
    fn invalid_auth_override_fails_construction() {
        let mock = Arc::new(MockServerActions::new());
        let factory = MockTransportFactory::new(Arc::clone(&mock));
        let context = ClientContext::default().with_auth_override(json!(42));
        let result = Repo::new(RepoInfo::new("h", "n", true), false, context, &factory);
        assert!(result.is_err());
    }

    #[test]
    fn object_auth_override_is_accepted() {
        let mock = Arc::new(MockServerActions::new());
        let factory = MockTransportFactory::new(Arc::clone(&mock));
        let context = ClientContext::default().with_auth_override(json!({"uid": "svc"}));
        assert!(Repo::new(RepoInfo::new("h", "n", true), false, context, &factory).is_ok());
    }

    #[test]
    fn write_ids_are_monotonic() {
        let (repo, mock) = build_repo(RepoInfo::new("h", "n", true), false);
        repo.set(&Path::new("a"), &json!(1), None);
        repo.set(&Path::new("b"), &json!(2), None);
        repo.set(&Path::new("c"), &json!(3), None);

        assert_eq!(mock.puts().len(), 3);
        assert_eq!(repo.next_write_id.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn crawler_user_agent_forces_read_only() {
        let info = RepoInfo::new("h", "n", true)
            .with_user_agent("Mozilla/5.0 (compatible; bingbot/2.0)");
        let (repo, _mock) = build_repo(info, false);

        // The synthetic connect event is queued for the next turn.
        assert_eq!(repo.scheduler.pending(), 1);
        repo.drain_scheduler();
        let connected = repo
            .state
            .lock()
            .info_data
            .get_node(&Path::new(".info/connected"))
            .val(false);
        assert_eq!(connected, json!(true));
    }

    #[test]
    fn interrupt_and_resume_forward_with_fixed_reason() {
        let (repo, mock) = build_repo(RepoInfo::new("h", "n", true), false);
        repo.interrupt();
        repo.interrupt();
        repo.resume();

        assert_eq!(mock.interrupts(), vec!["repo_interrupt"; 2]);
        assert_eq!(mock.resumes(), vec!["repo_interrupt"]);
    }

    #[test]
    fn read_only_mode_skips_connection_control() {
        let (repo, mock) = build_repo(RepoInfo::new("h", "n", true), true);
        repo.interrupt();
        repo.resume();
        assert!(mock.interrupts().is_empty());
        assert!(mock.resumes().is_empty());
    }

    #[test]
    fn completion_guard_maps_statuses() {
        let delivered: Arc<Mutex<Vec<Result<(), OperationError>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&delivered);
        Repo::call_on_complete(
            Some(Box::new(move |result| sink.lock().push(result))),
            "ok",
            None,
        );
        let sink = Arc::clone(&delivered);
        Repo::call_on_complete(
            Some(Box::new(move |result| sink.lock().push(result))),
            "permission_denied",
            Some("write denied"),
        );
        // A panicking callback must not unwind into the engine.
        Repo::call_on_complete(Some(Box::new(|_| panic!("user bug"))), "ok", None);

        let delivered = delivered.lock();
        assert_eq!(delivered[0], Ok(()));
        let err = delivered[1].clone().unwrap_err();
        assert_eq!(err.code, "PERMISSION_DENIED");
        assert_eq!(err.message, "PERMISSION_DENIED: write denied");
    }
}
