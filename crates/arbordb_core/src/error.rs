//! Error types for the core value model.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core value-model operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A path component contains a reserved character.
    #[error("invalid key {key:?}: keys must not contain '.', '#', '$', '[' or ']'")]
    InvalidKey {
        /// The offending key.
        key: String,
    },

    /// A path string is malformed.
    #[error("invalid path: {message}")]
    InvalidPath {
        /// Description of the problem.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CoreError::InvalidKey { key: "a.b".into() };
        assert!(err.to_string().contains("a.b"));

        let err = CoreError::InvalidPath {
            message: "too deep".into(),
        };
        assert!(err.to_string().contains("too deep"));
    }
}
