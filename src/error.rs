//! Radio-link error types.
//!
//! # Classification
//!
//! Errors split along who is expected to act on them:
//!
//! - **Transport**: the physical link reported a failure. Transient failures
//!   are retried close to where the call was issued; fatal ones end the
//!   session immediately.
//! - **Peer**: the remote device is not the firmware we speak to
//!   (`IncompatiblePeer`) or never finished its configuration exchange
//!   (`HandshakeTimeout`). Both end the session; the caller may start a new one.
//! - **Defect**: `ProtocolViolation` means the session state machine tried to
//!   read outside its legal window. It is unreachable unless there is a bug.
//!
//! Every terminal error maps onto a [`FailureKind`] via
//! [`LinkError::failure_kind`], which is what status consumers see.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::{EndpointRole, FailureKind};

/// Failure reported by the transport adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Momentary condition (stack busy, GATT operation in progress).
    /// Worth retrying within a bounded budget.
    #[error("transient transport error: {0}")]
    Transient(String),

    /// The physical link must be torn down.
    #[error("fatal transport error: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Create a transient error.
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a fatal error.
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether the failed call may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Radio-link errors.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Fatal transport failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A transient failure persisted past the retry budget.
    #[error("{operation} still failing after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Transport operation that kept failing.
        operation: &'static str,
        /// Attempts made, including the first.
        attempts: u32,
        /// Last transient error seen.
        last: TransportError,
    },

    /// Discovery did not find the full characteristic set.
    #[error("Incompatible peer: missing {missing:?}")]
    IncompatiblePeer {
        /// Roles that could not be resolved.
        missing: Vec<EndpointRole>,
    },

    /// The peer never produced configuration data after the handshake write.
    #[error("Handshake timed out after {attempts} reads ({elapsed:?})")]
    HandshakeTimeout {
        /// Configuration reads attempted.
        attempts: u32,
        /// Time spent since the handshake write.
        elapsed: Duration,
    },

    /// A read was attempted outside the window the state machine allows.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The session was closed by its owner.
    #[error("Session closed")]
    SessionClosed,

    /// The link went down underneath the session.
    #[error("Peer disconnected")]
    Disconnected,

    /// The session ended with a failure before the awaited condition.
    #[error("Session failed: {0}")]
    SessionFailed(FailureKind),

    /// The session task panicked or was aborted.
    #[error("Session task failed: {0}")]
    Task(String),

    /// Invalid handshake frame.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),
}

/// Result type alias for radio-link operations
pub type Result<T> = std::result::Result<T, LinkError>;

impl LinkError {
    /// Classify this error for status reporting.
    ///
    /// Returns `None` for outcomes that are not failures (`SessionClosed`,
    /// `Disconnected`) and for local problems (config, task join).
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Transport(TransportError::Fatal(_)) => Some(FailureKind::FatalTransport),
            // A bare transient error escaping its retry site counts as exhausted.
            Self::Transport(TransportError::Transient(_)) | Self::RetriesExhausted { .. } => {
                Some(FailureKind::TransientExhausted)
            },
            Self::IncompatiblePeer { .. } => Some(FailureKind::IncompatiblePeer),
            Self::SessionFailed(kind) => Some(*kind),
            Self::HandshakeTimeout { .. } => Some(FailureKind::HandshakeTimeout),
            Self::ProtocolViolation(_) | Self::InvalidMessage(_) => {
                Some(FailureKind::ProtocolViolation)
            },
            Self::SessionClosed | Self::Disconnected | Self::Task(_) | Self::Config(_) => None,
        }
    }
}

impl From<toml::de::Error> for LinkError {
    fn from(err: toml::de::Error) -> Self {
        LinkError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for LinkError {
    fn from(err: toml::ser::Error) -> Self {
        LinkError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_classification() {
        assert!(TransportError::transient("busy").is_transient());
        assert!(!TransportError::fatal("gone").is_transient());
    }

    #[test]
    fn test_failure_kind_mapping() {
        let err = LinkError::from(TransportError::fatal("link lost"));
        assert_eq!(err.failure_kind(), Some(FailureKind::FatalTransport));

        let err = LinkError::RetriesExhausted {
            operation: "read",
            attempts: 4,
            last: TransportError::transient("busy"),
        };
        assert_eq!(err.failure_kind(), Some(FailureKind::TransientExhausted));

        let err = LinkError::IncompatiblePeer {
            missing: vec![EndpointRole::Notify],
        };
        assert_eq!(err.failure_kind(), Some(FailureKind::IncompatiblePeer));

        assert_eq!(LinkError::SessionClosed.failure_kind(), None);
        assert_eq!(LinkError::Disconnected.failure_kind(), None);
    }

    #[test]
    fn test_local_errors_are_not_session_failures() {
        let err = LinkError::from(toml::from_str::<toml::Value>("= broken").unwrap_err());
        assert!(matches!(err, LinkError::Config(_)));
        assert_eq!(err.failure_kind(), None);
        assert_eq!(LinkError::Task("join".into()).failure_kind(), None);
    }

    #[test]
    fn test_error_display() {
        let err = LinkError::HandshakeTimeout {
            attempts: 3,
            elapsed: Duration::from_millis(700),
        };
        assert_eq!(err.to_string(), "Handshake timed out after 3 reads (700ms)");
    }
}
