//! Auth token plumbing.

use parking_lot::Mutex;

/// Callback invoked when the auth token changes.
pub type TokenChangeCallback = Box<dyn Fn(Option<&str>) + Send + Sync>;

/// Supplies auth tokens and notifies about refreshes.
///
/// The engine registers one listener at construction and forwards every
/// refreshed token to the transport.
pub trait AuthTokenProvider: Send + Sync {
    /// Registers a listener for token changes.
    fn add_token_change_listener(&self, listener: TokenChangeCallback);
}

/// A provider for unauthenticated sessions: no tokens, no changes.
pub struct NoopAuthTokenProvider;

impl AuthTokenProvider for NoopAuthTokenProvider {
    fn add_token_change_listener(&self, _listener: TokenChangeCallback) {}
}

/// An in-memory provider that pushes explicitly set tokens.
///
/// Useful for embedding and tests: call [`MemoryAuthTokenProvider::set_token`]
/// to notify all registered listeners.
#[derive(Default)]
pub struct MemoryAuthTokenProvider {
    listeners: Mutex<Vec<TokenChangeCallback>>,
}

impl MemoryAuthTokenProvider {
    /// Creates a provider with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the current token, notifying every listener.
    pub fn set_token(&self, token: Option<&str>) {
        for listener in self.listeners.lock().iter() {
            listener(token);
        }
    }
}

impl AuthTokenProvider for MemoryAuthTokenProvider {
    fn add_token_change_listener(&self, listener: TokenChangeCallback) {
        self.listeners.lock().push(listener);
    }
}
