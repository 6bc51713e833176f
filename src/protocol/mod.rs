//! Radio-link session protocol.
//!
//! Takes a freshly established physical connection through discovery, the
//! mandatory configuration handshake, and into the read-on-notify loop.
//!
//! # Protocol Overview
//!
//! The peer runs its own state machine, which we cannot see. It serves
//! nothing until the host has written a configuration request, and even
//! then answers reads with empty payloads until its configuration is
//! assembled. Readiness is therefore never inferred from timing or call
//! order; only an explicit non-empty configuration read moves the session
//! on.
//!
//! ## Message Flow
//!
//! ```text
//! Host                                   Peer
//!    |                                     |
//!    |======== connect ===================>|
//!    |======== discover services =========>|  write / read / notify
//!    |-------- subscribe(notify) --------->|
//!    |-------- want-config(nonce) -------->|  (write endpoint)
//!    |                                     |
//!    |-------- read ---------------------->|
//!    |<------- empty ----------------------|  still assembling
//!    |            ... backoff ...          |
//!    |-------- read ---------------------->|
//!    |<------- config bytes ---------------|  handshake complete
//!    |                                     |
//!    |<------- notify ---------------------|  data queued
//!    |-------- read / read / read -------->|  drain until empty
//! ```
//!
//! ## State Machine
//!
//! | State               | Description                            | Valid Transitions                   |
//! |---------------------|----------------------------------------|-------------------------------------|
//! | `Idle`              | No connection                          | → Connected                         |
//! | `Connected`         | Link up, peer unknown                  | → Discovering                       |
//! | `Discovering`       | Resolving characteristics              | → AwaitingHandshake, Error          |
//! | `AwaitingHandshake` | Request sent/pending, no reads allowed before it | → AwaitingHandshake, SteadyState |
//! | `SteadyState`       | Read-on-notify exchange                | → SteadyState                       |
//! | `Disconnected`      | Link gone                              | (terminal)                          |
//! | `Error`             | Session abandoned                      | (terminal)                          |
//!
//! Every live state can also move to `Disconnected` or `Error`.
//!
//! ## Failures
//!
//! | Kind                 | Meaning                                    | Restart? |
//! |----------------------|--------------------------------------------|----------|
//! | `FatalTransport`     | Link must be torn down                     | yes      |
//! | `TransientExhausted` | Retries outlasted                          | yes      |
//! | `IncompatiblePeer`   | Missing/mismatched characteristic          | policy   |
//! | `HandshakeTimeout`   | No configuration within budget             | yes      |
//! | `ProtocolViolation`  | Read outside legal window (defect)         | no       |
//!
//! Recovery is always a brand-new session; nothing resumes in place.

mod characteristics;
mod events;
mod generation;
mod handshake;
mod message;
mod poll;
mod session;
mod state;

pub use characteristics::{CharacteristicSet, EndpointRole};
pub use events::{EventSink, LinkEvent, EVENT_CHANNEL_CAPACITY};
pub use generation::{Generation, GenerationCounter, GenerationToken};
pub use handshake::{Backoff, HandshakeController, HandshakeStep};
pub use message::{HandshakeRequest, WANT_CONFIG_TAG};
pub use poll::{Frame, NotifyAction, PollLoop, PullStep, PullTrigger};
pub use session::{LinkSession, ReadPurpose, SessionStats, Transition};
pub use state::{FailureKind, LinkState, SessionEnd, SessionStatus};
