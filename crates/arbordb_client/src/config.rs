//! Client configuration.

use crate::auth::{AuthTokenProvider, NoopAuthTokenProvider};
use crate::error::{ClientError, ClientResult};
use serde_json::Value;
use std::sync::Arc;

/// User-agent fragments that identify web crawlers.
///
/// Crawled sessions use the read-only transport path so crawlers index
/// data without holding realtime connections open.
const CRAWLER_MARKERS: &[&str] = &["googlebot", "bingbot", "yandexbot", "duckduckbot", "baiduspider"];

/// Describes the repository a client connects to.
#[derive(Debug, Clone)]
pub struct RepoInfo {
    /// Server host, including any port.
    pub host: String,
    /// Database namespace.
    pub namespace: String,
    /// Whether to connect over TLS.
    pub secure: bool,
    /// The embedding application's user agent, if known.
    pub user_agent: Option<String>,
}

impl RepoInfo {
    /// Creates a repository descriptor.
    pub fn new(host: impl Into<String>, namespace: impl Into<String>, secure: bool) -> Self {
        Self {
            host: host.into(),
            namespace: namespace.into(),
            secure,
            user_agent: None,
        }
    }

    /// Sets the user agent used for crawler detection.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Returns the connection URL: scheme plus host.
    #[must_use]
    pub fn connection_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}", self.host)
    }

    /// Returns true if the user agent looks like a web crawler.
    #[must_use]
    pub fn being_crawled(&self) -> bool {
        self.user_agent.as_deref().is_some_and(|agent| {
            let agent = agent.to_lowercase();
            CRAWLER_MARKERS.iter().any(|marker| agent.contains(marker))
        })
    }

    /// Returns the key identifying this repository in process-wide
    /// registries (stats reporting).
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.host, self.namespace)
    }
}

/// Application-level context supplied when constructing a [`crate::Repo`].
pub struct ClientContext {
    /// Provider of auth tokens forwarded to the transport.
    pub auth_provider: Arc<dyn AuthTokenProvider>,
    /// Optional auth variable override sent with the connection.
    ///
    /// Must be absent, `null`, or a JSON object.
    pub auth_override: Option<Value>,
}

impl ClientContext {
    /// Creates a context with the given auth provider and no override.
    pub fn new(auth_provider: Arc<dyn AuthTokenProvider>) -> Self {
        Self {
            auth_provider,
            auth_override: None,
        }
    }

    /// Sets the auth variable override.
    #[must_use]
    pub fn with_auth_override(mut self, auth_override: Value) -> Self {
        self.auth_override = Some(auth_override);
        self
    }

    /// Validates the auth override.
    ///
    /// Anything other than absent, `null`, or an object fails fast with
    /// [`ClientError::InvalidConfig`]. Objects always JSON-encode, so no
    /// separate serialisation check is needed.
    pub fn validate_auth_override(&self) -> ClientResult<()> {
        match &self.auth_override {
            None | Some(Value::Null) | Some(Value::Object(_)) => Ok(()),
            Some(other) => Err(ClientError::invalid_config(format!(
                "auth variable override must be an object, got {}",
                json_kind(other)
            ))),
        }
    }
}

impl Default for ClientContext {
    fn default() -> Self {
        Self::new(Arc::new(NoopAuthTokenProvider))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connection_url_scheme_follows_secure_flag() {
        let info = RepoInfo::new("db.example.com", "demo", true);
        assert_eq!(info.connection_url(), "https://db.example.com");

        let info = RepoInfo::new("localhost:9000", "demo", false);
        assert_eq!(info.connection_url(), "http://localhost:9000");
    }

    #[test]
    fn crawler_detection() {
        let info = RepoInfo::new("h", "n", true)
            .with_user_agent("Mozilla/5.0 (compatible; Googlebot/2.1)");
        assert!(info.being_crawled());

        let info = RepoInfo::new("h", "n", true).with_user_agent("Mozilla/5.0 Firefox/123.0");
        assert!(!info.being_crawled());

        let info = RepoInfo::new("h", "n", true);
        assert!(!info.being_crawled());
    }

    #[test]
    fn auth_override_validation() {
        assert!(ClientContext::default().validate_auth_override().is_ok());
        assert!(ClientContext::default()
            .with_auth_override(Value::Null)
            .validate_auth_override()
            .is_ok());
        assert!(ClientContext::default()
            .with_auth_override(json!({"uid": "service"}))
            .validate_auth_override()
            .is_ok());

        let err = ClientContext::default()
            .with_auth_override(json!(42))
            .validate_auth_override()
            .unwrap_err();
        assert!(err.to_string().contains("a number"));
    }
}
