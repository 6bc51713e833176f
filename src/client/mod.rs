//! Link client.
//!
//! Entry point for applications. A [`LinkClient`] owns a transport, the
//! configuration, the generation counter and the diagnostic event stream;
//! each [`LinkClient::open`] spawns a fresh session actor and returns a
//! [`SessionHandle`] to observe and control it.
//!
//! ```text
//!  LinkClient::open()
//!        │ advance generation, spawn actor
//!        ▼
//!  ┌───────────────┐  commands   ┌───────────────────┐
//!  │ SessionHandle │────────────>│   SessionActor    │──> LinkTransport
//!  │               │<────────────│ (one per session) │<── notify / disconnect
//!  └───────────────┘ status,     └───────────────────┘      callbacks
//!                    frames
//! ```
//!
//! Sessions are never repaired in place. After `Failed` or `Disconnected`,
//! open a new one (or let a [`Supervisor`] do it).

mod actor;
mod supervisor;

pub use supervisor::{Supervisor, SupervisorReport};

use std::pin::Pin;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use self::actor::{Command, SessionActor};
use crate::config::Config;
use crate::error::{LinkError, Result};
use crate::protocol::{
    EventSink, Frame, Generation, GenerationCounter, HandshakeController, LinkEvent, LinkSession,
    LinkState, PollLoop, SessionEnd, SessionStats, SessionStatus, Transition,
};
use crate::transport::LinkTransport;

/// Radio-link client.
pub struct LinkClient<T: LinkTransport + ?Sized> {
    transport: Arc<T>,
    config: Arc<Config>,
    generations: GenerationCounter,
    events: EventSink,
    next_sequence: Arc<AtomicU64>,
}

impl<T: LinkTransport + ?Sized> Clone for LinkClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            config: Arc::clone(&self.config),
            generations: self.generations.clone(),
            events: self.events.clone(),
            next_sequence: Arc::clone(&self.next_sequence),
        }
    }
}

impl<T: LinkTransport + ?Sized + 'static> LinkClient<T> {
    /// Create a new client
    pub fn new(transport: Arc<T>, config: Config) -> Self {
        Self {
            transport,
            config: Arc::new(config),
            generations: GenerationCounter::new(),
            events: EventSink::default(),
            next_sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get transport
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Generation of the most recent session (or its retired successor value).
    pub fn generation(&self) -> Generation {
        self.generations.current()
    }

    /// Receive diagnostic events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Start a new session.
    ///
    /// Advances the generation, which retires any session still running on
    /// this client; its outstanding operations are abandoned and it ends
    /// `Closed`. Must be called within a tokio runtime.
    pub fn open(&self) -> SessionHandle {
        self.generations.advance();
        let token = self.generations.token();
        let generation = token.generation();

        let session = LinkSession::new(generation);
        let id = session.id();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SessionStatus::Starting);
        let (frames_tx, frames) = mpsc::unbounded_channel();

        let actor = SessionActor {
            transport: Arc::clone(&self.transport),
            config: Arc::clone(&self.config),
            generations: self.generations.clone(),
            token,
            events: self.events.clone(),
            session,
            handshake: HandshakeController::new(self.config.handshake.clone()),
            poll: PollLoop::new(self.config.poll.max_reads_per_pull)
                .with_sequence(Arc::clone(&self.next_sequence)),
            commands,
            command_tx: command_tx.clone(),
            status: status_tx,
            frames: frames_tx,
            subscribed: None,
        };

        tracing::info!(session = %id, %generation, "opening link session");
        let task = tokio::spawn(actor.run());

        SessionHandle {
            id,
            generation,
            status,
            commands: command_tx,
            frames: Some(FrameStream { rx: frames }),
            task,
        }
    }

    /// Run sessions under the restart policy in `[restart]`.
    pub fn supervise(&self) -> Supervisor {
        Supervisor::spawn(self.clone())
    }
}

/// Owner's view of one running session.
#[derive(Debug)]
pub struct SessionHandle {
    id: Uuid,
    generation: Generation,
    status: watch::Receiver<SessionStatus>,
    commands: mpsc::UnboundedSender<Command>,
    frames: Option<FrameStream>,
    task: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    /// Session id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Session generation
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Latest reported status.
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Watch status changes.
    pub fn status_watch(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Wait until the session is `Ready`.
    ///
    /// Fails if it ends first: `Disconnected` for a dropped or closed link,
    /// `SessionFailed(kind)` for a failure.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(|s| *s == SessionStatus::Ready || s.is_final())
            .await
            .map(|s| *s)
            .map_err(|_| LinkError::Disconnected)?;

        match status {
            SessionStatus::Ready => Ok(()),
            SessionStatus::Failed(kind) => Err(LinkError::SessionFailed(kind)),
            _ => Err(LinkError::Disconnected),
        }
    }

    /// Take the frame stream. Returns `None` after the first call.
    pub fn take_frames(&mut self) -> Option<FrameStream> {
        self.frames.take()
    }

    /// Ask the session to tear down. Idempotent.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Whether the session task has ended
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session to end.
    pub async fn join(self) -> Result<SessionOutcome> {
        self.task.await.map_err(|e| LinkError::Task(e.to_string()))
    }
}

/// Frames in delivery order. Ends when the session ends.
#[derive(Debug)]
pub struct FrameStream {
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl FrameStream {
    /// Frame if one is ready now.
    pub fn try_next(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}

impl Stream for FrameStream {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        self.rx.poll_recv(cx)
    }
}

/// How a session went.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// Session id
    pub session: Uuid,
    /// Session generation
    pub generation: Generation,
    /// State at exit (`Disconnected` or `Error`)
    pub final_state: LinkState,
    /// Why it ended
    pub end: SessionEnd,
    /// Error text for failures
    pub error: Option<String>,
    /// Counters
    pub stats: SessionStats,
    /// Every state change, oldest first
    pub transitions: Vec<Transition>,
}

impl SessionOutcome {
    /// Failure kind, if the session failed
    pub fn failure(&self) -> Option<crate::protocol::FailureKind> {
        self.end.failure()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FailureKind;
    use crate::transport::{SimOp, SimPeerProfile, SimTransport};
    use futures::StreamExt;

    #[tokio::test]
    async fn test_open_reaches_ready_and_closes() {
        let sim = Arc::new(SimTransport::default());
        let client = LinkClient::new(Arc::clone(&sim), Config::default());
        let mut handle = client.open();
        let mut frames = handle.take_frames().unwrap();

        handle.wait_ready().await.unwrap();
        assert_eq!(handle.status(), SessionStatus::Ready);
        let first = frames.next().await.unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(first.generation, handle.generation());

        handle.close();
        let outcome = handle.join().await.unwrap();
        assert_eq!(outcome.end, SessionEnd::Closed);
        assert_eq!(outcome.final_state, LinkState::Disconnected);
        assert!(sim.ops().iter().any(|op| matches!(op, SimOp::Disconnect(_))));
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn test_wait_ready_reports_failure() {
        let sim = Arc::new(SimTransport::new(SimPeerProfile {
            missing: vec![crate::protocol::EndpointRole::Read],
            ..Default::default()
        }));
        let client = LinkClient::new(sim, Config::default());
        let handle = client.open();

        let err = handle.wait_ready().await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::SessionFailed(FailureKind::IncompatiblePeer)
        ));
        let outcome = handle.join().await.unwrap();
        assert_eq!(outcome.final_state, LinkState::Error);
    }

    #[tokio::test]
    async fn test_sequence_continues_across_sessions() {
        let sim = Arc::new(SimTransport::default());
        let client = LinkClient::new(Arc::clone(&sim), Config::default());

        let mut first = client.open();
        let mut frames = first.take_frames().unwrap();
        first.wait_ready().await.unwrap();
        assert_eq!(frames.next().await.unwrap().sequence, 0);
        first.close();
        first.join().await.unwrap();

        let mut second = client.open();
        let mut frames = second.take_frames().unwrap();
        second.wait_ready().await.unwrap();
        let frame = frames.next().await.unwrap();
        assert_eq!(frame.sequence, 1);
        assert_eq!(frame.generation, second.generation());
        second.close();
        second.join().await.unwrap();
    }
}
