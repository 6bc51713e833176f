//! # radiolink - Radio-Link Session State Machine
//!
//! Host-side session management for a small embedded radio reached over a
//! packet-oriented, notification-capable link (a GATT-style service with a
//! write, a read and a notify characteristic).
//!
//! ## Features
//!
//! - **Explicit readiness**: "connected" and "ready for data" are separate
//!   states; reads are gated behind an explicit configuration handshake
//! - **Bounded handshake**: empty configuration reads back off and retry
//!   within a count and time budget, never an indefinite wait
//! - **Read-on-notify**: notifications coalesce into drain cycles that
//!   preserve read order and never lose a signal
//! - **Generation tagging**: completions from a torn-down session cannot
//!   touch its successor
//! - **Supervision**: optional whole-session restarts under a policy
//!
//! ## Protocol Overview
//!
//! ### State Machine
//!
//! ```text
//!            connect()
//!     [Idle] ─────────> [Connected]
//!                            │ discover()
//!                            v
//!                      [Discovering] ──── missing endpoint ───> [Error]
//!                            │ all three endpoints resolved        ^
//!                            v                                     │
//!                  ┌─> [AwaitingHandshake] ── budget exhausted ────┤
//!   want-config    │         │                                     │
//!   write + empty  └─────────┤ first non-empty config read         │
//!   reads                    v                                     │
//!                  ┌─> [SteadyState] ──── fatal transport error ───┘
//!   notify → pull  └─────────┤
//!                            │ link lost / close()
//!                            v
//!                     [Disconnected]
//! ```
//!
//! Any live state can reach `Disconnected` or `Error`. Both are terminal:
//! recovery means a brand-new session, never a resume.
//!
//! ### Status Reported to Consumers
//!
//! | Status          | When                                    |
//! |-----------------|-----------------------------------------|
//! | `Connected`     | Physical link established               |
//! | `Ready`         | Handshake complete, frames flowing      |
//! | `Disconnected`  | Link dropped or session closed          |
//! | `Failed(kind)`  | Session abandoned; see [`FailureKind`]  |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use radiolink::{Config, LinkClient, SimTransport};
//!
//! let transport = Arc::new(SimTransport::default());
//! let client = LinkClient::new(Arc::clone(&transport), Config::default());
//!
//! let mut session = client.open();
//! let mut frames = session.take_frames().unwrap();
//! session.wait_ready().await?;
//!
//! transport.deliver([&b"hello"[..]]);
//! while let Some(frame) = frames.next().await {
//!     println!("#{} {} bytes", frame.sequence, frame.payload.len());
//! }
//! ```
//!
//! ## Modules
//!
//! - [`client`]: Session actor, frame stream and supervisor
//! - [`protocol`]: State machine, handshake controller, poll loop, events
//! - [`transport`]: Transport adapter contract and simulated peer
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;

// Re-exports for convenience
pub use client::{FrameStream, LinkClient, SessionHandle, SessionOutcome, Supervisor, SupervisorReport};
pub use config::Config;
pub use error::{LinkError, Result, TransportError};
pub use protocol::{
    FailureKind, Frame, Generation, HandshakeRequest, LinkEvent, LinkState, SessionEnd,
    SessionStats, SessionStatus,
};
pub use transport::{LinkTransport, ReadResult, SimTransport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
