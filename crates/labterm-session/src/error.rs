//! Normalized error types for console session operations.
//!
//! Transport-agnostic errors that hide HTTP details and sort failures into
//! the classes the session manager reacts to: transient conditions are
//! recovered locally, terminal ones stop automatic work on the session.

use std::time::Duration;

use crate::lifecycle::TransitionError;

/// Normalized error for console backend and session operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsoleError {
    /// Credentials expired or were rejected (HTTP 401).
    #[error("authentication expired: {message}")]
    AuthExpired { message: String },

    /// Upstream rate limit hit (HTTP 429).
    #[error("rate limited by backend")]
    RateLimited { retry_after: Option<Duration> },

    /// The endpoint or session no longer exists (HTTP 404).
    #[error("{resource} not found")]
    NotFound { resource: String },

    /// The backend could not be reached (probe or connection failure).
    #[error("backend unreachable: {message}")]
    Unreachable { message: String },

    /// The backend rejected a session open request.
    #[error("session create failed for node {node_id:?}: {message}")]
    CreateFailed { node_id: String, message: String },

    /// Request validation failed before anything was sent.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Any other non-success response.
    #[error("request failed with status {status}: {message}")]
    Request { status: u16, message: String },

    /// The response body did not have a recognizable shape.
    #[error("malformed response: {message}")]
    Decode { message: String },

    /// The operation was abandoned because the session was closed meanwhile.
    #[error("session closed while {operation} was in flight")]
    Cancelled { operation: String },

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl ConsoleError {
    /// Whether the condition is expected to clear on its own (rate limits,
    /// transport failures).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Unreachable { .. })
    }

    /// Whether the condition ends automatic work on the current session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AuthExpired { .. } | Self::NotFound { .. } | Self::CreateFailed { .. }
        )
    }

    pub(crate) fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classes_are_retryable() {
        assert!(ConsoleError::RateLimited { retry_after: None }.is_retryable());
        assert!(ConsoleError::Unreachable {
            message: "refused".into()
        }
        .is_retryable());
        assert!(!ConsoleError::not_found("console").is_retryable());
    }

    #[test]
    fn terminal_classes_stop_automation() {
        assert!(ConsoleError::AuthExpired {
            message: "token".into()
        }
        .is_terminal());
        assert!(ConsoleError::not_found("session").is_terminal());
        assert!(ConsoleError::CreateFailed {
            node_id: "r1".into(),
            message: "busy".into()
        }
        .is_terminal());
        assert!(!ConsoleError::RateLimited { retry_after: None }.is_terminal());
        assert!(!ConsoleError::Request {
            status: 500,
            message: "boom".into()
        }
        .is_terminal());
    }

    #[test]
    fn display_names_the_resource() {
        assert_eq!(
            ConsoleError::not_found("console log").to_string(),
            "console log not found"
        );
    }
}
