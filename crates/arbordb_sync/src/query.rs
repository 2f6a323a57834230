//! Query identity and tags.

use arbordb_core::Path;
use serde::Serialize;
use serde_json::Value;

/// Numeric handle identifying a filtered query listener.
///
/// Tags let the server scope deltas to one filtered view; unfiltered
/// listens carry no tag.
pub type Tag = u64;

/// Filtering parameters attached to a listen.
///
/// Default params mean an unfiltered listen on the whole subtree.
/// Non-default params get a [`Tag`] so that server deltas for the
/// filtered view can be routed separately from the main cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct QueryParams {
    /// Child key the server should order by.
    #[serde(rename = "orderBy", skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    /// Limit to the first N children in order.
    #[serde(rename = "limitToFirst", skip_serializing_if = "Option::is_none")]
    pub limit_to_first: Option<u32>,
    /// Limit to the last N children in order.
    #[serde(rename = "limitToLast", skip_serializing_if = "Option::is_none")]
    pub limit_to_last: Option<u32>,
}

impl QueryParams {
    /// Returns true if these params describe an unfiltered listen.
    #[must_use]
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// Renders the wire form sent with a listen request.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Returns a stable identity string used to key listen spots.
    #[must_use]
    pub fn identity(&self) -> String {
        if self.is_default() {
            "default".to_owned()
        } else {
            self.to_wire().to_string()
        }
    }
}

/// A query: a path plus filtering params.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuerySpec {
    /// The path the query observes.
    pub path: Path,
    /// The filtering params.
    pub params: QueryParams,
}

impl QuerySpec {
    /// Creates an unfiltered query at `path`.
    #[must_use]
    pub fn value_at(path: Path) -> Self {
        Self {
            path,
            params: QueryParams::default(),
        }
    }

    /// Creates a query with explicit params.
    #[must_use]
    pub fn new(path: Path, params: QueryParams) -> Self {
        Self { path, params }
    }

    /// Returns true if the query is unfiltered.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.params.is_default()
    }

    /// Returns the stable identity keying this query's listen spot.
    #[must_use]
    pub fn identity(&self) -> String {
        format!("{}|{}", self.path, self.params.identity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_params_identity() {
        let q = QuerySpec::value_at(Path::new("a/b"));
        assert!(q.is_default());
        assert_eq!(q.identity(), "/a/b|default");
    }

    #[test]
    fn filtered_params_wire_form() {
        let params = QueryParams {
            order_by: Some("age".into()),
            limit_to_first: Some(10),
            limit_to_last: None,
        };
        assert!(!params.is_default());
        assert_eq!(
            params.to_wire(),
            json!({"orderBy": "age", "limitToFirst": 10})
        );
    }

    #[test]
    fn distinct_params_have_distinct_identities() {
        let a = QuerySpec::new(
            Path::new("p"),
            QueryParams {
                limit_to_first: Some(1),
                ..QueryParams::default()
            },
        );
        let b = QuerySpec::new(
            Path::new("p"),
            QueryParams {
                limit_to_first: Some(2),
                ..QueryParams::default()
            },
        );
        assert_ne!(a.identity(), b.identity());
    }
}
