//! Link session states and externally reported status.

use serde::Serialize;

/// Session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LinkState {
    /// No physical connection yet
    Idle,
    /// Physical link up, nothing else known about the peer
    Connected,
    /// Service discovery in progress
    Discovering,
    /// Characteristics resolved; configuration exchange pending or running
    AwaitingHandshake,
    /// Configuration received; read-on-notify exchange
    SteadyState,
    /// Link gone (terminal)
    Disconnected,
    /// Session abandoned after a failure (terminal)
    Error,
}

impl LinkState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }

    /// Whether `self -> next` is a legal edge.
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;

        if self.is_terminal() {
            return false;
        }
        match next {
            Disconnected | Error => true,
            Connected => self == Idle,
            Discovering => self == Connected,
            // Self-edge records the handshake dispatch
            AwaitingHandshake => matches!(self, Discovering | AwaitingHandshake),
            SteadyState => matches!(self, AwaitingHandshake | SteadyState),
            Idle => false,
        }
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Why a session failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureKind {
    /// The transport reported a fatal error
    FatalTransport,
    /// Transient errors outlasted the retry budget
    TransientExhausted,
    /// Discovery found a partial or mismatched characteristic set
    IncompatiblePeer,
    /// No configuration data within the handshake budget
    HandshakeTimeout,
    /// Read attempted outside its legal window (defect)
    ProtocolViolation,
}

impl FailureKind {
    /// Whether a fresh session has a chance of succeeding.
    ///
    /// Protocol violations are bugs; restarting would repeat them.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, Self::ProtocolViolation)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Session status reported to UI/service consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    /// Session object exists but nothing has happened yet
    Starting,
    /// Physical link established
    Connected,
    /// Handshake complete, frames flowing
    Ready,
    /// Link dropped or closed
    Disconnected,
    /// Session abandoned
    Failed(FailureKind),
}

impl SessionStatus {
    /// Whether the session is over.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed(_))
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionEnd {
    /// Closed by its owner, or superseded by a newer session
    Closed,
    /// The link dropped underneath it
    PeerDisconnected,
    /// Abandoned after a failure
    Failed(FailureKind),
}

impl SessionEnd {
    /// Failure kind, if the session failed.
    pub fn failure(self) -> Option<FailureKind> {
        match self {
            Self::Failed(kind) => Some(kind),
            _ => None,
        }
    }
}
