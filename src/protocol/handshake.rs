//! Handshake controller.
//!
//! Drives the configuration exchange that moves the peer from "not ready"
//! to "serving data":
//!
//! ```text
//!   begin()                     write want-config(nonce)
//!      │
//!      ▼
//!   on_write_acknowledged() ──> Read
//!      │
//!      ▼
//!   on_read_result(empty)  ──> RetryAfter(backoff)  ──┐
//!   on_read_result(bytes)  ──> Complete(bytes)        │ (bounded)
//!   budget exhausted       ──> TimedOut  <────────────┘
//! ```
//!
//! An empty read here is the peer still assembling its configuration, not a
//! failure. The controller only decides; the session actor performs the I/O.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use super::message::HandshakeRequest;
use super::session::LinkSession;
use crate::config::HandshakeConfig;
use crate::error::{LinkError, Result};
use crate::transport::ReadResult;

/// What the session should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Issue a configuration read now
    Read,
    /// Wait, then issue another configuration read
    RetryAfter(Duration),
    /// Configuration arrived; the payload is the first frame
    Complete(Bytes),
    /// Budget exhausted
    TimedOut {
        /// Reads made
        attempts: u32,
        /// Time since the handshake write
        elapsed: Duration,
    },
}

/// Exponential backoff schedule for configuration re-reads.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    /// Schedule from config.
    pub fn new(config: &HandshakeConfig) -> Self {
        Self {
            next: config.initial_delay(),
            max: config.max_delay(),
            multiplier: config.backoff_multiplier,
        }
    }

    /// Delay to use now; grows the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.max);
        // Overflow or a non-finite product saturates at the cap
        self.next = Duration::try_from_secs_f64(self.next.as_secs_f64() * self.multiplier)
            .map_or(self.max, |d| d.min(self.max));
        delay
    }
}

/// Handshake controller for one session.
#[derive(Debug)]
pub struct HandshakeController {
    config: HandshakeConfig,
    backoff: Backoff,
    request: Option<HandshakeRequest>,
    acknowledged_at: Option<Instant>,
    attempts: u32,
    completed: bool,
}

impl HandshakeController {
    /// Create a controller with the given budget
    pub fn new(config: HandshakeConfig) -> Self {
        let backoff = Backoff::new(&config);
        Self {
            config,
            backoff,
            request: None,
            acknowledged_at: None,
            attempts: 0,
            completed: false,
        }
    }

    /// Produce the session's single configuration request.
    pub fn begin(&mut self, session: &LinkSession) -> Result<HandshakeRequest> {
        if self.request.is_some() || session.is_first_write_sent() {
            return Err(LinkError::ProtocolViolation(
                "handshake already started".to_string(),
            ));
        }
        let request = HandshakeRequest::generate();
        self.request = Some(request);
        Ok(request)
    }

    /// The peer acknowledged the request write. Starts the budget clock.
    pub fn on_write_acknowledged(&mut self, session: &mut LinkSession) -> Result<HandshakeStep> {
        let request = self.request.ok_or_else(|| {
            LinkError::ProtocolViolation("write acknowledged before begin()".to_string())
        })?;
        session.on_handshake_sent(&request)?;
        self.acknowledged_at = Some(Instant::now());
        Ok(HandshakeStep::Read)
    }

    /// Feed the result of a configuration read.
    pub fn on_read_result(&mut self, result: ReadResult) -> HandshakeStep {
        self.attempts += 1;

        if !result.is_empty() {
            self.completed = true;
            return HandshakeStep::Complete(result.into_bytes());
        }

        let elapsed = self.elapsed();
        if self.attempts >= self.config.max_attempts {
            return HandshakeStep::TimedOut {
                attempts: self.attempts,
                elapsed,
            };
        }

        let delay = self.backoff.next_delay();
        if elapsed + delay >= self.config.total_timeout() {
            return HandshakeStep::TimedOut {
                attempts: self.attempts,
                elapsed,
            };
        }
        HandshakeStep::RetryAfter(delay)
    }

    /// A configuration read did not complete within the remaining budget.
    pub fn on_read_timeout(&mut self) -> HandshakeStep {
        self.attempts += 1;
        HandshakeStep::TimedOut {
            attempts: self.attempts,
            elapsed: self.elapsed(),
        }
    }

    /// Budget left on the wall clock.
    pub fn remaining(&self) -> Duration {
        self.config.total_timeout().saturating_sub(self.elapsed())
    }

    /// Reads made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether configuration has been received
    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// The dispatched request
    pub fn request(&self) -> Option<HandshakeRequest> {
        self.request
    }

    fn elapsed(&self) -> Duration {
        self.acknowledged_at
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }
}
