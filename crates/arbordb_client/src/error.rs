//! Error types for the client engine.

use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur constructing or configuring the client.
///
/// After construction the engine never returns an error: runtime
/// failures flow through completion callbacks as [`OperationError`] or
/// are logged.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The client configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },
}

impl ClientError {
    /// Creates an invalid-configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

/// The error delivered to a completion callback for a failed write.
///
/// `code` is the transport status uppercased (`"ERROR"` if the status
/// was empty); the message is the code alone or `"CODE: reason"` when
/// the transport supplied a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct OperationError {
    /// Machine-readable failure code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl OperationError {
    /// Builds the callback error from a transport status.
    #[must_use]
    pub fn from_status(status: &str, reason: Option<&str>) -> Self {
        let code = if status.is_empty() {
            "ERROR".to_owned()
        } else {
            status.to_uppercase()
        };
        let message = match reason {
            Some(reason) => format!("{code}: {reason}"),
            None => code.clone(),
        };
        Self { code, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_uppercased() {
        let err = OperationError::from_status("permission_denied", None);
        assert_eq!(err.code, "PERMISSION_DENIED");
        assert_eq!(err.message, "PERMISSION_DENIED");
    }

    #[test]
    fn reason_is_appended() {
        let err = OperationError::from_status("permission_denied", Some("write denied"));
        assert_eq!(err.message, "PERMISSION_DENIED: write denied");
        assert_eq!(err.to_string(), "PERMISSION_DENIED: write denied");
    }

    #[test]
    fn empty_status_becomes_error() {
        let err = OperationError::from_status("", Some("boom"));
        assert_eq!(err.code, "ERROR");
        assert_eq!(err.message, "ERROR: boom");
    }

    #[test]
    fn invalid_config_display() {
        let err = ClientError::invalid_config("auth override must be an object");
        assert!(err.to_string().contains("auth override"));
    }
}
