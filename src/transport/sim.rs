//! In-process radio peer simulator
//!
//! A scripted stand-in for the embedded device. It models the part of the
//! peer's state machine the session depends on: reads of the data endpoint
//! return empty until a valid want-config request has been written, then
//! optionally keep returning empty for a while before the configuration
//! appears. Failures and latency can be injected per operation, and every
//! call is recorded for invariant checks.
//!
//! Used for integration testing and the `radiolink simulate` command.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{
    CharProps, ConnectionHandle, DiscoveredCharacteristic, Endpoint, EventCallback, LinkTransport,
    ReadResult, TransportResult,
};
use crate::config::LinkIds;
use crate::error::TransportError;
use crate::protocol::{EndpointRole, HandshakeRequest};

/// Operation kinds, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOpKind {
    /// `connect`
    Connect,
    /// `discover`
    Discover,
    /// `write`
    Write,
    /// `read`
    Read,
    /// `subscribe`
    Subscribe,
}

/// Recorded transport activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOp {
    /// Connection established
    Connect(ConnectionHandle),
    /// Discovery run
    Discover(ConnectionHandle),
    /// Bytes written
    Write {
        /// Connection
        handle: ConnectionHandle,
        /// Target endpoint
        endpoint: Endpoint,
        /// Payload
        data: Bytes,
    },
    /// Read issued
    Read {
        /// Connection
        handle: ConnectionHandle,
        /// Target endpoint
        endpoint: Endpoint,
        /// Whether the peer had not yet received a handshake request
        before_handshake: bool,
    },
    /// Notifications enabled
    Subscribe(ConnectionHandle, Endpoint),
    /// Notifications disabled
    Unsubscribe(ConnectionHandle, Endpoint),
    /// Host-side teardown
    Disconnect(ConnectionHandle),
    /// Peer signalled data available
    Notify(ConnectionHandle),
    /// Peer-side link loss
    PeerDropped(ConnectionHandle),
}

/// Static description of the simulated peer.
#[derive(Debug, Clone)]
pub struct SimPeerProfile {
    /// Ids the peer exposes
    pub ids: LinkIds,
    /// Roles whose characteristic the peer does not expose
    pub missing: Vec<EndpointRole>,
    /// Empty reads served after the handshake before configuration appears
    pub empty_reads_before_config: usize,
    /// Configuration frames queued once the handshake request arrives
    pub config_frames: Vec<Bytes>,
    /// Delay applied to every read
    pub read_latency: Duration,
    /// Delay applied to every write
    pub write_latency: Duration,
}

impl Default for SimPeerProfile {
    fn default() -> Self {
        Self {
            ids: LinkIds::default(),
            missing: Vec::new(),
            empty_reads_before_config: 0,
            config_frames: vec![Bytes::from_static(b"\x0a\x04sim0")],
            read_latency: Duration::ZERO,
            write_latency: Duration::ZERO,
        }
    }
}

struct Subscription {
    endpoint: Endpoint,
    callback: EventCallback,
}

struct Connection {
    handle: ConnectionHandle,
    on_disconnect: EventCallback,
    subscription: Option<Subscription>,
    configured: bool,
    empty_reads_remaining: usize,
}

struct Inner {
    profile: SimPeerProfile,
    next_handle: u64,
    conn: Option<Connection>,
    outbox: VecDeque<Bytes>,
    failures: HashMap<SimOpKind, VecDeque<TransportError>>,
    /// Every notify callback ever registered, kept past teardown so tests can
    /// replay late deliveries from a platform stack.
    notify_history: Vec<(ConnectionHandle, EventCallback)>,
    log: Vec<SimOp>,
}

/// Simulated peer implementing [`LinkTransport`].
#[derive(Clone)]
pub struct SimTransport {
    inner: Arc<Mutex<Inner>>,
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new(SimPeerProfile::default())
    }
}

impl std::fmt::Debug for SimTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimTransport").finish_non_exhaustive()
    }
}

impl SimTransport {
    /// Create a simulated peer.
    pub fn new(profile: SimPeerProfile) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                profile,
                next_handle: 1,
                conn: None,
                outbox: VecDeque::new(),
                failures: HashMap::new(),
                notify_history: Vec::new(),
                log: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread must not wedge the others
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `op` call fail with `err`. Queued failures are consumed in order.
    pub fn fail_next(&self, op: SimOpKind, err: TransportError) {
        self.lock().failures.entry(op).or_default().push_back(err);
    }

    /// Replace the peer profile; applies to the next connection.
    pub fn set_profile(&self, profile: SimPeerProfile) {
        self.lock().profile = profile;
    }

    /// Queue application data on the peer. Does not notify.
    pub fn push_frames<I, B>(&self, frames: I)
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.lock().outbox.extend(frames.into_iter().map(Into::into));
    }

    /// Frames still queued on the peer.
    pub fn queued(&self) -> usize {
        self.lock().outbox.len()
    }

    /// Fire the live connection's notify callback. Returns `false` if nothing
    /// is subscribed.
    pub fn notify(&self) -> bool {
        let callback = {
            let mut inner = self.lock();
            let Some((handle, cb)) = inner.conn.as_ref().and_then(|c| {
                c.subscription
                    .as_ref()
                    .map(|s| (c.handle, Arc::clone(&s.callback)))
            }) else {
                return false;
            };
            inner.log.push(SimOp::Notify(handle));
            cb
        };
        callback();
        true
    }

    /// Queue frames and signal their arrival.
    pub fn deliver<I, B>(&self, frames: I) -> bool
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.push_frames(frames);
        self.notify()
    }

    /// Invoke every notify callback ever registered for `handle`, even after
    /// teardown.
    pub fn replay_notify(&self, handle: ConnectionHandle) -> usize {
        let callbacks: Vec<_> = self
            .lock()
            .notify_history
            .iter()
            .filter(|(h, _)| *h == handle)
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in &callbacks {
            cb();
        }
        callbacks.len()
    }

    /// Simulate the peer dropping the link.
    pub fn drop_link(&self) -> bool {
        let callback = {
            let mut inner = self.lock();
            let Some(conn) = inner.conn.take() else {
                return false;
            };
            inner.log.push(SimOp::PeerDropped(conn.handle));
            conn.on_disconnect
        };
        callback();
        true
    }

    /// Handle of the live connection, if any.
    pub fn current_handle(&self) -> Option<ConnectionHandle> {
        self.lock().conn.as_ref().map(|c| c.handle)
    }

    /// Recorded operations.
    pub fn ops(&self) -> Vec<SimOp> {
        self.lock().log.clone()
    }

    /// Reads issued before the peer saw a handshake request.
    pub fn reads_before_handshake(&self) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|op| matches!(op, SimOp::Read { before_handshake: true, .. }))
            .count()
    }

    /// Writes that decode as handshake requests.
    pub fn handshake_writes(&self) -> Vec<HandshakeRequest> {
        self.lock()
            .log
            .iter()
            .filter_map(|op| match op {
                SimOp::Write { data, .. } => HandshakeRequest::decode(data).ok(),
                _ => None,
            })
            .collect()
    }

    /// Reads issued on any connection.
    pub fn read_count(&self) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|op| matches!(op, SimOp::Read { .. }))
            .count()
    }

    fn take_failure(inner: &mut Inner, op: SimOpKind) -> Option<TransportError> {
        inner.failures.get_mut(&op).and_then(VecDeque::pop_front)
    }

    fn live<'a>(inner: &'a mut Inner, handle: ConnectionHandle) -> TransportResult<&'a mut Connection> {
        match inner.conn.as_mut() {
            Some(conn) if conn.handle == handle => Ok(conn),
            _ => Err(TransportError::fatal(format!("{handle} is not connected"))),
        }
    }

    fn characteristics(profile: &SimPeerProfile) -> Vec<DiscoveredCharacteristic> {
        let ids = &profile.ids;
        [
            (EndpointRole::Write, ids.write_uuid, CharProps::WRITE),
            (EndpointRole::Read, ids.read_uuid, CharProps::READ),
            (EndpointRole::Notify, ids.notify_uuid, CharProps::READ_NOTIFY),
        ]
        .into_iter()
        .filter(|(role, _, _)| !profile.missing.contains(role))
        .map(|(_, uuid, props)| DiscoveredCharacteristic {
            service: ids.service_uuid,
            uuid,
            props,
        })
        .collect()
    }
}

#[async_trait]
impl LinkTransport for SimTransport {
    async fn connect(&self, on_disconnect: EventCallback) -> TransportResult<ConnectionHandle> {
        let mut inner = self.lock();
        if let Some(err) = Self::take_failure(&mut inner, SimOpKind::Connect) {
            return Err(err);
        }

        let handle = ConnectionHandle(inner.next_handle);
        inner.next_handle += 1;
        inner.conn = Some(Connection {
            handle,
            on_disconnect,
            subscription: None,
            configured: false,
            empty_reads_remaining: 0,
        });
        inner.log.push(SimOp::Connect(handle));
        Ok(handle)
    }

    async fn discover(
        &self,
        handle: ConnectionHandle,
    ) -> TransportResult<Vec<DiscoveredCharacteristic>> {
        let mut inner = self.lock();
        Self::live(&mut inner, handle)?;
        inner.log.push(SimOp::Discover(handle));
        if let Some(err) = Self::take_failure(&mut inner, SimOpKind::Discover) {
            return Err(err);
        }
        Ok(Self::characteristics(&inner.profile))
    }

    async fn write(
        &self,
        handle: ConnectionHandle,
        endpoint: Endpoint,
        data: Bytes,
    ) -> TransportResult<()> {
        let latency = self.lock().profile.write_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.lock();
        Self::live(&mut inner, handle)?;
        inner.log.push(SimOp::Write {
            handle,
            endpoint,
            data: data.clone(),
        });
        if let Some(err) = Self::take_failure(&mut inner, SimOpKind::Write) {
            return Err(err);
        }

        let write_uuid = inner.profile.ids.write_uuid;
        if endpoint.0 == write_uuid && HandshakeRequest::decode(&data).is_ok() {
            let empty_reads = inner.profile.empty_reads_before_config;
            let config = inner.profile.config_frames.clone();
            let conn = Self::live(&mut inner, handle)?;
            conn.configured = true;
            conn.empty_reads_remaining = empty_reads;
            inner.outbox.extend(config);
        }
        Ok(())
    }

    async fn read(
        &self,
        handle: ConnectionHandle,
        endpoint: Endpoint,
    ) -> TransportResult<ReadResult> {
        let latency = {
            let mut inner = self.lock();
            let before_handshake = !Self::live(&mut inner, handle)?.configured;
            inner.log.push(SimOp::Read {
                handle,
                endpoint,
                before_handshake,
            });
            inner.profile.read_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.lock();
        if let Some(err) = Self::take_failure(&mut inner, SimOpKind::Read) {
            return Err(err);
        }
        let read_uuid = inner.profile.ids.read_uuid;
        let conn = Self::live(&mut inner, handle)?;
        if endpoint.0 != read_uuid || !conn.configured {
            return Ok(ReadResult::empty());
        }
        if conn.empty_reads_remaining > 0 {
            conn.empty_reads_remaining -= 1;
            return Ok(ReadResult::empty());
        }
        Ok(inner
            .outbox
            .pop_front()
            .map(ReadResult::new)
            .unwrap_or_default())
    }

    async fn subscribe(
        &self,
        handle: ConnectionHandle,
        endpoint: Endpoint,
        on_notify: EventCallback,
    ) -> TransportResult<()> {
        let mut inner = self.lock();
        if let Some(err) = Self::take_failure(&mut inner, SimOpKind::Subscribe) {
            return Err(err);
        }
        let conn = Self::live(&mut inner, handle)?;
        conn.subscription = Some(Subscription {
            endpoint,
            callback: Arc::clone(&on_notify),
        });
        inner.notify_history.push((handle, on_notify));
        inner.log.push(SimOp::Subscribe(handle, endpoint));
        Ok(())
    }

    async fn unsubscribe(
        &self,
        handle: ConnectionHandle,
        endpoint: Endpoint,
    ) -> TransportResult<()> {
        let mut inner = self.lock();
        inner.log.push(SimOp::Unsubscribe(handle, endpoint));
        let conn = Self::live(&mut inner, handle)?;
        if conn
            .subscription
            .as_ref()
            .is_some_and(|s| s.endpoint == endpoint)
        {
            conn.subscription = None;
        }
        Ok(())
    }

    async fn disconnect(&self, handle: ConnectionHandle) {
        let mut inner = self.lock();
        if inner.conn.as_ref().is_some_and(|c| c.handle == handle) {
            inner.conn = None;
        }
        inner.log.push(SimOp::Disconnect(handle));
    }

    fn name(&self) -> &'static str {
        "sim"
    }
}
