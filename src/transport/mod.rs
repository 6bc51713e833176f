//! Transport adapter contract for the radio link.
//!
//! The physical stack (connection establishment, MTU negotiation, GATT
//! primitives) lives outside this crate. Sessions drive it only through
//! [`LinkTransport`]:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Session actor (client)          │
//! │      (one sequencer per session)        │
//! └──────────────────┬──────────────────────┘
//!                    │ LinkTransport
//!          ┌────────┴────────┐
//!          ▼                 ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │  platform BLE   │ │  SimTransport   │
//! │  (external)     │ │  (in-process)   │
//! └─────────────────┘ └─────────────────┘
//! ```
//!
//! Every call may fail with a [`TransportError`]; the transient/fatal split
//! decides whether the session retries or tears down.

pub mod sim;

pub use sim::{SimOp, SimOpKind, SimPeerProfile, SimTransport};

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::error::TransportError;

/// Result type for transport calls.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Callback invoked by the transport for asynchronous link events.
///
/// May be called from any execution context; implementations of the session
/// only forward a message from it.
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

/// Opaque identifier of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

impl std::fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Address of a characteristic on the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(pub Uuid);

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// GATT properties advertised by a characteristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharProps {
    /// Supports read.
    pub read: bool,
    /// Supports write (with or without response).
    pub write: bool,
    /// Supports notifications.
    pub notify: bool,
}

impl CharProps {
    /// Write-only characteristic.
    pub const WRITE: Self = Self {
        read: false,
        write: true,
        notify: false,
    };
    /// Read-only characteristic.
    pub const READ: Self = Self {
        read: true,
        write: false,
        notify: false,
    };
    /// Readable characteristic with notifications.
    pub const READ_NOTIFY: Self = Self {
        read: true,
        write: false,
        notify: true,
    };
}

/// One characteristic reported by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    /// Service the characteristic belongs to.
    pub service: Uuid,
    /// Characteristic id.
    pub uuid: Uuid,
    /// Advertised properties.
    pub props: CharProps,
}

/// Payload returned by a characteristic read.
///
/// An empty result is a normal outcome: the peer has nothing queued, or has
/// not yet entered the state where it serves data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadResult {
    data: Bytes,
}

impl ReadResult {
    /// Wrap a payload.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Empty read.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the peer returned no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Borrow the payload.
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    /// Take the payload.
    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

/// Physical link operations consumed by the session state machine.
///
/// Calls may suspend for arbitrary time; the session never assumes they
/// complete synchronously.
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Establish the physical connection.
    ///
    /// `on_disconnect` fires when the link drops for any reason after this
    /// call succeeds.
    async fn connect(&self, on_disconnect: EventCallback) -> TransportResult<ConnectionHandle>;

    /// Enumerate characteristics exposed by the peer.
    async fn discover(&self, handle: ConnectionHandle)
        -> TransportResult<Vec<DiscoveredCharacteristic>>;

    /// Write bytes to an endpoint. Returns once the peer acknowledged.
    async fn write(
        &self,
        handle: ConnectionHandle,
        endpoint: Endpoint,
        data: Bytes,
    ) -> TransportResult<()>;

    /// Read an endpoint.
    async fn read(&self, handle: ConnectionHandle, endpoint: Endpoint)
        -> TransportResult<ReadResult>;

    /// Enable notifications on an endpoint.
    async fn subscribe(
        &self,
        handle: ConnectionHandle,
        endpoint: Endpoint,
        on_notify: EventCallback,
    ) -> TransportResult<()>;

    /// Disable notifications on an endpoint.
    async fn unsubscribe(&self, handle: ConnectionHandle, endpoint: Endpoint)
        -> TransportResult<()>;

    /// Tear down the connection. Idempotent.
    async fn disconnect(&self, handle: ConnectionHandle);

    /// Transport name for logging.
    fn name(&self) -> &'static str;
}
