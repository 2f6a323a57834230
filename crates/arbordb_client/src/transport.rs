//! Transport layer abstraction for the reconciliation engine.

use crate::auth::AuthTokenProvider;
use crate::config::RepoInfo;
use arbordb_sync::{QuerySpec, Tag};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};

/// Completion callback for write-style requests: `(status, reason)`.
///
/// Status `"ok"` means success; any other string is a failure code, with
/// an optional human-readable reason.
pub type StatusCallback = Box<dyn FnOnce(&str, Option<&str>) + Send>;

/// Completion callback for a listen: `(status, data)`.
///
/// On success the transport may deliver the initial data for the
/// listened location alongside the `"ok"` status.
pub type ListenCallback = Box<dyn FnOnce(&str, Option<Value>) + Send>;

/// The engine's view of the server transport.
///
/// This trait abstracts the wire protocol, allowing a persistent
/// connection, a read-only REST fallback, or a mock for testing. The
/// engine is the exclusive owner: no other component calls the mutating
/// methods.
pub trait ServerActions: Send + Sync {
    /// Starts listening on a query. `hash` resumes from cached state;
    /// `tag` scopes filtered queries.
    fn listen(&self, query: &QuerySpec, hash: &str, tag: Option<Tag>, on_complete: ListenCallback);

    /// Stops listening on a query.
    fn unlisten(&self, query: &QuerySpec, tag: Option<Tag>);

    /// Writes a value (export form) at a path.
    fn put(&self, path: &str, data: Value, on_complete: Option<StatusCallback>);

    /// Merges children at a path.
    fn merge(&self, path: &str, children: Value, on_complete: Option<StatusCallback>);

    /// Registers a value the server writes if this session disconnects.
    fn on_disconnect_put(&self, path: &str, data: Value, on_complete: Option<StatusCallback>);

    /// Registers a merge the server applies if this session disconnects.
    fn on_disconnect_merge(&self, path: &str, children: Value, on_complete: Option<StatusCallback>);

    /// Cancels pending on-disconnect actions at a path.
    fn on_disconnect_cancel(&self, path: &str, on_complete: Option<StatusCallback>);

    /// Forwards a refreshed auth token.
    fn refresh_auth_token(&self, token: Option<&str>);

    /// Interrupts the connection for the given reason.
    fn interrupt(&self, reason: &str);

    /// Resumes a previously interrupted connection.
    fn resume(&self, reason: &str);

    /// An identifier for the underlying connection, used as a log
    /// prefix when available.
    fn connection_id(&self) -> Option<String> {
        None
    }
}

/// The engine callbacks a transport invokes with server activity.
///
/// The transport owns only these function handles, never an engine
/// reference, which keeps ownership one-way.
pub struct TransportDelegate {
    /// Data update: `(path, payload, is_merge, tag)`.
    pub on_data_update: Box<dyn Fn(&str, Value, bool, Option<Tag>) + Send + Sync>,
    /// Connection state change.
    pub on_connect_status: Box<dyn Fn(bool) + Send + Sync>,
    /// Server metadata updates for the `.info` subtree.
    pub on_server_info_update: Box<dyn Fn(Map<String, Value>) + Send + Sync>,
}

/// Builds transports for the engine.
pub trait TransportFactory {
    /// Creates the transport for `repo_info`.
    ///
    /// `read_only` selects the crawl-friendly REST path; the factory
    /// must hold onto `delegate` and drive it with server activity.
    fn create(
        &self,
        repo_info: &RepoInfo,
        delegate: TransportDelegate,
        auth_provider: Arc<dyn AuthTokenProvider>,
        read_only: bool,
    ) -> Arc<dyn ServerActions>;
}

struct PendingWrite {
    path: String,
    data: Value,
    on_complete: Option<StatusCallback>,
}

struct PendingListen {
    path: String,
    params: Value,
    hash: String,
    tag: Option<Tag>,
    on_complete: Option<ListenCallback>,
}

#[derive(Default)]
struct MockState {
    listens: Vec<PendingListen>,
    unlistens: Vec<(String, Option<Tag>)>,
    puts: Vec<PendingWrite>,
    merges: Vec<PendingWrite>,
    disconnect_puts: Vec<PendingWrite>,
    disconnect_merges: Vec<PendingWrite>,
    disconnect_cancels: Vec<PendingWrite>,
    tokens: Vec<Option<String>>,
    interrupts: Vec<String>,
    resumes: Vec<String>,
}

/// A transport that records every request for inspection.
///
/// Tests fire completions explicitly (`ack_put`, `complete_listen`, …)
/// and push server activity through the captured delegate
/// (`server_data_update`, `server_connect_status`, …).
#[derive(Default)]
pub struct MockServerActions {
    state: Mutex<MockState>,
    delegate: Mutex<Option<TransportDelegate>>,
}

impl MockServerActions {
    /// Creates an empty mock transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the engine delegate (called by the factory).
    pub fn set_delegate(&self, delegate: TransportDelegate) {
        *self.delegate.lock().unwrap() = Some(delegate);
    }

    // === Test drivers: server-originated activity ===

    /// Pushes a server data update through the delegate.
    pub fn server_data_update(&self, path: &str, data: Value, is_merge: bool, tag: Option<Tag>) {
        if let Some(delegate) = &*self.delegate.lock().unwrap() {
            (delegate.on_data_update)(path, data, is_merge, tag);
        }
    }

    /// Pushes a connection state change through the delegate.
    pub fn server_connect_status(&self, connected: bool) {
        if let Some(delegate) = &*self.delegate.lock().unwrap() {
            (delegate.on_connect_status)(connected);
        }
    }

    /// Pushes server metadata through the delegate.
    pub fn server_info_update(&self, updates: Map<String, Value>) {
        if let Some(delegate) = &*self.delegate.lock().unwrap() {
            (delegate.on_server_info_update)(updates);
        }
    }

    // === Test drivers: request completions ===

    /// Fires the completion of the `index`th put.
    pub fn ack_put(&self, index: usize, status: &str, reason: Option<&str>) {
        let callback = self.state.lock().unwrap().puts[index].on_complete.take();
        if let Some(callback) = callback {
            callback(status, reason);
        }
    }

    /// Fires the completion of the `index`th merge.
    pub fn ack_merge(&self, index: usize, status: &str, reason: Option<&str>) {
        let callback = self.state.lock().unwrap().merges[index].on_complete.take();
        if let Some(callback) = callback {
            callback(status, reason);
        }
    }

    /// Fires the completion of the `index`th on-disconnect put.
    pub fn ack_disconnect_put(&self, index: usize, status: &str, reason: Option<&str>) {
        let callback = self.state.lock().unwrap().disconnect_puts[index]
            .on_complete
            .take();
        if let Some(callback) = callback {
            callback(status, reason);
        }
    }

    /// Fires the completion of the `index`th on-disconnect merge.
    pub fn ack_disconnect_merge(&self, index: usize, status: &str, reason: Option<&str>) {
        let callback = self.state.lock().unwrap().disconnect_merges[index]
            .on_complete
            .take();
        if let Some(callback) = callback {
            callback(status, reason);
        }
    }

    /// Fires the completion of the `index`th on-disconnect cancel.
    pub fn ack_disconnect_cancel(&self, index: usize, status: &str, reason: Option<&str>) {
        let callback = self.state.lock().unwrap().disconnect_cancels[index]
            .on_complete
            .take();
        if let Some(callback) = callback {
            callback(status, reason);
        }
    }

    /// Fires the completion of the `index`th listen.
    pub fn complete_listen(&self, index: usize, status: &str, data: Option<Value>) {
        let callback = self.state.lock().unwrap().listens[index].on_complete.take();
        if let Some(callback) = callback {
            callback(status, data);
        }
    }

    // === Inspection ===

    /// Recorded listens as `(path, params, hash, tag)`.
    #[must_use]
    pub fn listens(&self) -> Vec<(String, Value, String, Option<Tag>)> {
        self.state
            .lock()
            .unwrap()
            .listens
            .iter()
            .map(|l| (l.path.clone(), l.params.clone(), l.hash.clone(), l.tag))
            .collect()
    }

    /// Recorded unlistens as `(path, tag)`.
    #[must_use]
    pub fn unlistens(&self) -> Vec<(String, Option<Tag>)> {
        self.state.lock().unwrap().unlistens.clone()
    }

    /// Recorded puts as `(path, data)`.
    #[must_use]
    pub fn puts(&self) -> Vec<(String, Value)> {
        Self::writes(&self.state.lock().unwrap().puts)
    }

    /// Recorded merges as `(path, children)`.
    #[must_use]
    pub fn merges(&self) -> Vec<(String, Value)> {
        Self::writes(&self.state.lock().unwrap().merges)
    }

    /// Recorded on-disconnect puts as `(path, data)`.
    #[must_use]
    pub fn disconnect_puts(&self) -> Vec<(String, Value)> {
        Self::writes(&self.state.lock().unwrap().disconnect_puts)
    }

    /// Recorded on-disconnect merges as `(path, children)`.
    #[must_use]
    pub fn disconnect_merges(&self) -> Vec<(String, Value)> {
        Self::writes(&self.state.lock().unwrap().disconnect_merges)
    }

    /// Recorded on-disconnect cancels as paths.
    #[must_use]
    pub fn disconnect_cancels(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .disconnect_cancels
            .iter()
            .map(|w| w.path.clone())
            .collect()
    }

    /// Tokens received through [`ServerActions::refresh_auth_token`].
    #[must_use]
    pub fn tokens(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().tokens.clone()
    }

    /// Reasons passed to [`ServerActions::interrupt`].
    #[must_use]
    pub fn interrupts(&self) -> Vec<String> {
        self.state.lock().unwrap().interrupts.clone()
    }

    /// Reasons passed to [`ServerActions::resume`].
    #[must_use]
    pub fn resumes(&self) -> Vec<String> {
        self.state.lock().unwrap().resumes.clone()
    }

    fn writes(writes: &[PendingWrite]) -> Vec<(String, Value)> {
        writes.iter().map(|w| (w.path.clone(), w.data.clone())).collect()
    }
}

impl ServerActions for MockServerActions {
    fn listen(&self, query: &QuerySpec, hash: &str, tag: Option<Tag>, on_complete: ListenCallback) {
        self.state.lock().unwrap().listens.push(PendingListen {
            path: query.path.to_string(),
            params: query.params.to_wire(),
            hash: hash.to_owned(),
            tag,
            on_complete: Some(on_complete),
        });
    }

    fn unlisten(&self, query: &QuerySpec, tag: Option<Tag>) {
        self.state
            .lock()
            .unwrap()
            .unlistens
            .push((query.path.to_string(), tag));
    }

    fn put(&self, path: &str, data: Value, on_complete: Option<StatusCallback>) {
        self.state.lock().unwrap().puts.push(PendingWrite {
            path: path.to_owned(),
            data,
            on_complete,
        });
    }

    fn merge(&self, path: &str, children: Value, on_complete: Option<StatusCallback>) {
        self.state.lock().unwrap().merges.push(PendingWrite {
            path: path.to_owned(),
            data: children,
            on_complete,
        });
    }

    fn on_disconnect_put(&self, path: &str, data: Value, on_complete: Option<StatusCallback>) {
        self.state.lock().unwrap().disconnect_puts.push(PendingWrite {
            path: path.to_owned(),
            data,
            on_complete,
        });
    }

    fn on_disconnect_merge(&self, path: &str, children: Value, on_complete: Option<StatusCallback>) {
        self.state
            .lock()
            .unwrap()
            .disconnect_merges
            .push(PendingWrite {
                path: path.to_owned(),
                data: children,
                on_complete,
            });
    }

    fn on_disconnect_cancel(&self, path: &str, on_complete: Option<StatusCallback>) {
        self.state
            .lock()
            .unwrap()
            .disconnect_cancels
            .push(PendingWrite {
                path: path.to_owned(),
                data: Value::Null,
                on_complete,
            });
    }

    fn refresh_auth_token(&self, token: Option<&str>) {
        self.state
            .lock()
            .unwrap()
            .tokens
            .push(token.map(str::to_owned));
    }

    fn interrupt(&self, reason: &str) {
        self.state.lock().unwrap().interrupts.push(reason.to_owned());
    }

    fn resume(&self, reason: &str) {
        self.state.lock().unwrap().resumes.push(reason.to_owned());
    }

    fn connection_id(&self) -> Option<String> {
        Some("mock".to_owned())
    }
}

/// A factory handing out one shared [`MockServerActions`].
pub struct MockTransportFactory {
    transport: Arc<MockServerActions>,
}

impl MockTransportFactory {
    /// Creates a factory around a shared mock transport.
    #[must_use]
    pub fn new(transport: Arc<MockServerActions>) -> Self {
        Self { transport }
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(
        &self,
        _repo_info: &RepoInfo,
        delegate: TransportDelegate,
        _auth_provider: Arc<dyn AuthTokenProvider>,
        _read_only: bool,
    ) -> Arc<dyn ServerActions> {
        self.transport.set_delegate(delegate);
        Arc::clone(&self.transport) as Arc<dyn ServerActions>
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbordb_core::Path;
    use serde_json::json;

    #[test]
    fn mock_records_requests() {
        let mock = MockServerActions::new();
        mock.put("/a", json!(1), None);
        mock.merge("/b", json!({"x": 2}), None);
        mock.interrupt("test");

        assert_eq!(mock.puts(), vec![("/a".to_owned(), json!(1))]);
        assert_eq!(mock.merges(), vec![("/b".to_owned(), json!({"x": 2}))]);
        assert_eq!(mock.interrupts(), vec!["test".to_owned()]);
    }

    #[test]
    fn mock_fires_stored_completion_once() {
        let mock = MockServerActions::new();
        let fired = std::sync::Arc::new(Mutex::new(0));
        let counter = std::sync::Arc::clone(&fired);
        mock.put(
            "/a",
            json!(1),
            Some(Box::new(move |status, _| {
                assert_eq!(status, "ok");
                *counter.lock().unwrap() += 1;
            })),
        );

        mock.ack_put(0, "ok", None);
        mock.ack_put(0, "ok", None); // second fire is a no-op
        assert_eq!(*fired.lock().unwrap(), 1);
    }

    #[test]
    fn mock_records_listens() {
        let mock = MockServerActions::new();
        let query = QuerySpec::value_at(Path::new("a/b"));
        mock.listen(&query, "h", None, Box::new(|_, _| {}));
        mock.unlisten(&query, None);

        let listens = mock.listens();
        assert_eq!(listens.len(), 1);
        assert_eq!(listens[0].0, "/a/b");
        assert_eq!(mock.unlistens(), vec![("/a/b".to_owned(), None)]);
    }
}
