//! Link session record.
//!
//! Holds the logical lifetime of one physical connection: state, handshake
//! bookkeeping, generation and counters. Only the session actor mutates it;
//! every state change goes through [`LinkSession::transition`], which refuses
//! edges the state machine does not have.

use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use super::characteristics::CharacteristicSet;
use super::generation::Generation;
use super::message::HandshakeRequest;
use super::state::{FailureKind, LinkState};
use crate::error::{LinkError, Result};
use crate::transport::ConnectionHandle;

/// Why a read of the data endpoint is being issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPurpose {
    /// Configuration pull following the handshake write
    ConfigPull,
    /// Drain cycle triggered by a notification
    Poll,
}

/// One recorded state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Previous state
    pub from: LinkState,
    /// New state
    pub to: LinkState,
}

/// Link session
#[derive(Debug)]
pub struct LinkSession {
    /// Session ID
    id: Uuid,
    /// Generation this session runs under
    generation: Generation,
    /// Current state
    state: LinkState,
    /// Physical connection, once established
    handle: Option<ConnectionHandle>,
    /// Resolved endpoints, once discovery succeeded
    characteristics: Option<CharacteristicSet>,
    /// Nonce of the in-flight handshake request
    handshake_nonce: Option<u32>,
    /// Whether the handshake request has been written
    first_write_sent: bool,
    /// When the handshake request was written
    handshake_sent_at: Option<Instant>,
    /// A data-endpoint read is outstanding
    read_in_flight: bool,
    /// Last failure
    last_error: Option<FailureKind>,
    /// Edges taken, oldest first; a self-edge repeating the previous entry
    /// is not stored again
    transitions: Vec<Transition>,
    /// Counters
    stats: SessionStats,
    /// Creation time
    created_at: Instant,
}

impl LinkSession {
    /// Create a session in `Idle` under the given generation
    pub fn new(generation: Generation) -> Self {
        Self {
            id: Uuid::new_v4(),
            generation,
            state: LinkState::Idle,
            handle: None,
            characteristics: None,
            handshake_nonce: None,
            first_write_sent: false,
            handshake_sent_at: None,
            read_in_flight: false,
            last_error: None,
            transitions: Vec::new(),
            stats: SessionStats::default(),
            created_at: Instant::now(),
        }
    }

    /// Get session ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get session generation
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Get current state
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Connection handle, if connected
    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.handle
    }

    /// Resolved endpoints, if discovery succeeded
    pub fn characteristics(&self) -> Option<&CharacteristicSet> {
        self.characteristics.as_ref()
    }

    /// Nonce of the dispatched handshake request
    pub fn handshake_nonce(&self) -> Option<u32> {
        self.handshake_nonce
    }

    /// Whether the handshake request has been written
    pub fn is_first_write_sent(&self) -> bool {
        self.first_write_sent
    }

    /// Time since the handshake request was written
    pub fn handshake_elapsed(&self) -> Option<Duration> {
        self.handshake_sent_at.map(|t| t.elapsed())
    }

    /// Last failure, if any
    pub fn last_error(&self) -> Option<FailureKind> {
        self.last_error
    }

    /// Transition log
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Check if the session is exchanging data
    pub fn is_ready(&self) -> bool {
        self.state == LinkState::SteadyState
    }

    /// Move to `next`, recording the edge.
    ///
    /// Repeated self-edges (one per drain cycle in steady state) collapse into
    /// a single log entry, so the log stays bounded however long the session
    /// runs. `SessionStats::pulls` counts the cycles.
    pub fn transition(&mut self, next: LinkState) -> Result<Transition> {
        if !self.state.can_transition_to(next) {
            return Err(LinkError::ProtocolViolation(format!(
                "illegal transition {:?} -> {:?}",
                self.state, next
            )));
        }
        let edge = Transition {
            from: self.state,
            to: next,
        };
        self.state = next;
        if edge.from != edge.to || self.transitions.last() != Some(&edge) {
            self.transitions.push(edge);
        }
        Ok(edge)
    }

    /// `Idle -> Connected`
    pub fn on_connected(&mut self, handle: ConnectionHandle) -> Result<Transition> {
        let edge = self.transition(LinkState::Connected)?;
        self.handle = Some(handle);
        Ok(edge)
    }

    /// `Discovering -> AwaitingHandshake`
    pub fn on_discovered(&mut self, characteristics: CharacteristicSet) -> Result<Transition> {
        let edge = self.transition(LinkState::AwaitingHandshake)?;
        self.characteristics = Some(characteristics);
        Ok(edge)
    }

    /// Record that the handshake request was written and acknowledged.
    ///
    /// Exactly one request per session; a second is a defect.
    pub fn on_handshake_sent(&mut self, request: &HandshakeRequest) -> Result<Transition> {
        if self.first_write_sent {
            return Err(LinkError::ProtocolViolation(
                "handshake request already dispatched on this session".to_string(),
            ));
        }
        let edge = self.transition(LinkState::AwaitingHandshake)?;
        self.handshake_nonce = Some(request.nonce());
        self.first_write_sent = true;
        self.handshake_sent_at = Some(Instant::now());
        Ok(edge)
    }

    /// `AwaitingHandshake -> SteadyState`
    pub fn on_handshake_complete(&mut self) -> Result<Transition> {
        if self.state != LinkState::AwaitingHandshake || !self.first_write_sent {
            return Err(LinkError::ProtocolViolation(format!(
                "handshake completion in state {:?}",
                self.state
            )));
        }
        self.transition(LinkState::SteadyState)
    }

    /// Check a data-endpoint read is legal and mark it outstanding.
    ///
    /// Config pulls are legal only in `AwaitingHandshake` after the request
    /// was written; polls only in `SteadyState`. At most one read at a time.
    pub fn begin_read(&mut self, purpose: ReadPurpose) -> Result<()> {
        let legal = match purpose {
            ReadPurpose::ConfigPull => {
                self.state == LinkState::AwaitingHandshake && self.first_write_sent
            },
            ReadPurpose::Poll => self.state == LinkState::SteadyState,
        };
        if !legal {
            return Err(LinkError::ProtocolViolation(format!(
                "{:?} read in state {:?} (handshake sent: {})",
                purpose, self.state, self.first_write_sent
            )));
        }
        if self.read_in_flight {
            return Err(LinkError::ProtocolViolation(
                "read issued while another is in flight".to_string(),
            ));
        }
        self.read_in_flight = true;
        self.stats.reads_issued += 1;
        Ok(())
    }

    /// Mark the outstanding read finished.
    pub fn end_read(&mut self, bytes: usize) {
        self.read_in_flight = false;
        if bytes == 0 {
            self.stats.empty_reads += 1;
        } else {
            self.stats.bytes_received += bytes as u64;
        }
    }

    /// Clear the outstanding read after it failed or was cancelled.
    pub fn abort_read(&mut self) {
        self.read_in_flight = false;
    }

    /// Whether a data-endpoint read is outstanding
    pub fn is_read_in_flight(&self) -> bool {
        self.read_in_flight
    }

    /// Enter `Error` with the given failure.
    pub fn fail(&mut self, kind: FailureKind) -> Option<Transition> {
        self.last_error = Some(kind);
        self.read_in_flight = false;
        self.transition(LinkState::Error).ok()
    }

    /// Enter `Disconnected`.
    pub fn disconnect(&mut self) -> Option<Transition> {
        self.read_in_flight = false;
        self.transition(LinkState::Disconnected).ok()
    }

    /// Mutable counters
    pub fn stats_mut(&mut self) -> &mut SessionStats {
        &mut self.stats
    }

    /// Get session statistics
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            uptime: self.created_at.elapsed(),
            ..self.stats.clone()
        }
    }
}

/// Session statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Data-endpoint reads issued
    pub reads_issued: u64,
    /// Reads that returned nothing
    pub empty_reads: u64,
    /// Payload bytes received
    pub bytes_received: u64,
    /// Frames handed to the application
    pub frames_delivered: u64,
    /// Configuration reads until completion
    pub handshake_attempts: u32,
    /// Notifications received from the peer
    pub notifications: u64,
    /// Notifications folded into a pending pull
    pub notifications_coalesced: u64,
    /// Drain cycles run
    pub pulls: u64,
    /// Transient transport errors retried
    pub transient_retries: u64,
    /// Session lifetime
    pub uptime: Duration,
}
