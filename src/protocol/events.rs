//! Structured diagnostic events.
//!
//! Every transition, retry and failure is published as a [`LinkEvent`] on a
//! broadcast channel and mirrored to `tracing`. Subscribers that fall behind
//! lose old events (broadcast semantics); the session itself never blocks on
//! them.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::characteristics::EndpointRole;
use super::generation::Generation;
use super::poll::PullTrigger;
use super::state::{FailureKind, LinkState, SessionEnd, SessionStatus};

/// Default broadcast capacity.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Diagnostic event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LinkEvent {
    /// State machine edge taken
    StateChanged {
        /// Session id
        session: Uuid,
        /// Session generation
        generation: Generation,
        /// Previous state
        from: LinkState,
        /// New state
        to: LinkState,
    },
    /// Status reported to consumers
    Status {
        /// Session id
        session: Uuid,
        /// New status
        status: SessionStatus,
    },
    /// Configuration request written
    HandshakeDispatched {
        /// Session id
        session: Uuid,
        /// Correlation nonce
        nonce: u32,
    },
    /// Empty configuration read; another is scheduled
    HandshakeRetry {
        /// Session id
        session: Uuid,
        /// Reads made so far
        attempt: u32,
        /// Delay before the next read
        delay_ms: u64,
    },
    /// First configuration bytes received
    HandshakeCompleted {
        /// Session id
        session: Uuid,
        /// Reads it took
        attempts: u32,
        /// Size of the first configuration frame
        bytes: usize,
    },
    /// Transient transport error; call will be retried
    TransportRetry {
        /// Session id
        session: Uuid,
        /// Operation being retried
        operation: &'static str,
        /// Retry number (1-based)
        attempt: u32,
        /// Error text
        error: String,
    },
    /// Notification folded into an already pending pull
    NotificationCoalesced {
        /// Session id
        session: Uuid,
    },
    /// Drain cycle starting
    PullStarted {
        /// Session id
        session: Uuid,
        /// What scheduled it
        trigger: PullTrigger,
    },
    /// One drain cycle finished
    PullCompleted {
        /// Session id
        session: Uuid,
        /// Frames delivered by this cycle
        frames: usize,
        /// Whether the cycle ended on an empty read
        drained: bool,
    },
    /// A completion from a retired generation was dropped
    StaleCompletion {
        /// Generation the completion belonged to
        generation: Generation,
        /// Operation that completed late
        operation: &'static str,
    },
    /// Discovery rejected the peer
    IncompatiblePeer {
        /// Session id
        session: Uuid,
        /// Unresolved roles
        missing: Vec<EndpointRole>,
    },
    /// Session abandoned
    Failed {
        /// Session id
        session: Uuid,
        /// Failure classification
        kind: FailureKind,
        /// Error text
        error: String,
    },
    /// Supervisor is opening a new session
    Restarting {
        /// Restart number (1-based)
        attempt: u32,
        /// How the previous session ended
        after: SessionEnd,
    },
}

/// Publisher side of the event stream.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<LinkEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl EventSink {
    /// Sink with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// New receiver; sees events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.tx.subscribe()
    }

    /// Publish an event and log it.
    pub fn emit(&self, event: LinkEvent) {
        match &event {
            LinkEvent::StateChanged {
                session,
                generation,
                from,
                to,
            } => {
                tracing::info!(%session, %generation, %from, %to, "link state changed");
            },
            LinkEvent::Failed {
                session,
                kind,
                error,
            } => {
                tracing::warn!(%session, %kind, %error, "link session failed");
            },
            LinkEvent::IncompatiblePeer { session, missing } => {
                tracing::warn!(%session, ?missing, "peer is missing characteristics");
            },
            LinkEvent::TransportRetry {
                session,
                operation,
                attempt,
                error,
            } => {
                tracing::debug!(%session, operation, attempt, %error, "retrying transport call");
            },
            LinkEvent::StaleCompletion {
                generation,
                operation,
            } => {
                tracing::debug!(%generation, operation, "dropping stale completion");
            },
            LinkEvent::Restarting { attempt, after } => {
                tracing::info!(attempt, ?after, "restarting link session");
            },
            other => tracing::debug!(event = ?other, "link event"),
        }
        // No receivers is fine
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = LinkEvent::HandshakeRetry {
            session: Uuid::nil(),
            attempt: 2,
            delay_ms: 200,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "handshake_retry");
        assert_eq!(json["attempt"], 2);
        assert_eq!(json["delay_ms"], 200);
    }

    #[test]
    fn test_status_event_serializes_failure() {
        let event = LinkEvent::Status {
            session: Uuid::nil(),
            status: SessionStatus::Failed(FailureKind::HandshakeTimeout),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"]["Failed"], "HandshakeTimeout");
    }

    #[test]
    fn test_pull_started_names_trigger() {
        let event = LinkEvent::PullStarted {
            session: Uuid::nil(),
            trigger: PullTrigger::Handshake,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "pull_started");
        assert_eq!(json["trigger"], "handshake");
    }

    #[tokio::test]
    async fn test_sink_delivers_to_subscribers() {
        let sink = EventSink::default();
        let mut rx = sink.subscribe();
        sink.emit(LinkEvent::NotificationCoalesced {
            session: Uuid::nil(),
        });
        let got = rx.recv().await.unwrap();
        assert!(matches!(got, LinkEvent::NotificationCoalesced { .. }));
    }
}
