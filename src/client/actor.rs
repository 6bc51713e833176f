//! Per-session sequencer.
//!
//! One task owns the [`LinkSession`] and performs every transport call for
//! it, one at a time. Transport callbacks (notify, disconnect) never touch
//! session state; they post a [`Command`] tagged with their generation and
//! the actor folds it in between or during operations.
//!
//! Every transport call runs under a guard that also watches the command
//! queue and the session's generation. Retiring the generation (peer drop,
//! or a newer session superseding this one) abandons the call; a result that
//! slips in after retirement is discarded.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use super::SessionOutcome;
use crate::config::Config;
use crate::error::{LinkError, Result, TransportError};
use crate::protocol::{
    CharacteristicSet, EventSink, FailureKind, Frame, Generation, GenerationCounter,
    GenerationToken, HandshakeController, HandshakeStep, LinkEvent, LinkSession, LinkState,
    NotifyAction, PollLoop, PullStep, PullTrigger, ReadPurpose, SessionEnd, SessionStatus,
    Transition,
};
use crate::transport::{
    ConnectionHandle, Endpoint, EventCallback, LinkTransport, ReadResult, TransportResult,
};

/// Message into the session actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    /// Peer signalled data available
    Notify(Generation),
    /// Transport reported link loss
    PeerDisconnected(Generation),
    /// Owner asked for teardown
    Close,
}

pub(crate) struct SessionActor<T: LinkTransport + ?Sized> {
    pub(crate) transport: Arc<T>,
    pub(crate) config: Arc<Config>,
    pub(crate) generations: GenerationCounter,
    pub(crate) token: GenerationToken,
    pub(crate) events: EventSink,
    pub(crate) session: LinkSession,
    pub(crate) handshake: HandshakeController,
    pub(crate) poll: PollLoop,
    pub(crate) commands: mpsc::UnboundedReceiver<Command>,
    pub(crate) command_tx: mpsc::UnboundedSender<Command>,
    pub(crate) status: watch::Sender<SessionStatus>,
    pub(crate) frames: mpsc::UnboundedSender<Frame>,
    pub(crate) subscribed: Option<Endpoint>,
}

impl<T: LinkTransport + ?Sized + 'static> SessionActor<T> {
    /// Run the session to completion.
    pub(crate) async fn run(mut self) -> SessionOutcome {
        tracing::debug!(
            session = %self.session.id(),
            generation = %self.session.generation(),
            transport = self.transport.name(),
            "link session started"
        );
        let result = self.drive().await;
        self.finish(result).await
    }

    async fn drive(&mut self) -> Result<()> {
        // Connect
        let on_disconnect = self.disconnect_callback();
        let handle = self
            .call("connect", move |t| {
                let cb = Arc::clone(&on_disconnect);
                async move { t.connect(cb).await }
            })
            .await?;
        let edge = self.session.on_connected(handle)?;
        self.record(edge);
        self.set_status(SessionStatus::Connected);

        // Discover
        let edge = self.session.transition(LinkState::Discovering)?;
        self.record(edge);
        let discovered = self
            .call("discover", move |t| async move { t.discover(handle).await })
            .await?;
        let characteristics = match CharacteristicSet::resolve(&self.config.link, &discovered) {
            Ok(set) => set,
            Err(err) => {
                if let LinkError::IncompatiblePeer { missing } = &err {
                    self.events.emit(LinkEvent::IncompatiblePeer {
                        session: self.session.id(),
                        missing: missing.clone(),
                    });
                }
                return Err(err);
            },
        };
        let edge = self.session.on_discovered(characteristics)?;
        self.record(edge);

        // Subscribe, then the single handshake write
        let notify = characteristics.notify();
        let on_notify = self.notify_callback();
        self.call("subscribe", move |t| {
            let cb = Arc::clone(&on_notify);
            async move { t.subscribe(handle, notify, cb).await }
        })
        .await?;
        self.subscribed = Some(notify);

        let config = self.run_handshake(handle, characteristics).await?;

        let edge = self.session.on_handshake_complete()?;
        self.record(edge);
        self.set_status(SessionStatus::Ready);

        let frame = self.poll.frame(self.session.generation(), config);
        self.deliver(frame);

        self.poll.on_handshake_complete();
        self.steady_state().await
    }

    async fn run_handshake(
        &mut self,
        handle: ConnectionHandle,
        characteristics: CharacteristicSet,
    ) -> Result<Bytes> {
        let request = self.handshake.begin(&self.session)?;
        let payload = request.encode();
        let write = characteristics.write();
        self.call("write", move |t| {
            let data = payload.clone();
            async move { t.write(handle, write, data).await }
        })
        .await?;

        let mut step = self.handshake.on_write_acknowledged(&mut self.session)?;
        if let Some(edge) = self.session.transitions().last().copied() {
            self.record(edge);
        }
        self.events.emit(LinkEvent::HandshakeDispatched {
            session: self.session.id(),
            nonce: request.nonce(),
        });

        loop {
            step = match step {
                HandshakeStep::Read => {
                    let remaining = self.handshake.remaining();
                    match tokio::time::timeout(remaining, self.read_data(ReadPurpose::ConfigPull))
                        .await
                    {
                        Ok(result) => self.handshake.on_read_result(result?),
                        Err(_) => {
                            self.session.abort_read();
                            self.handshake.on_read_timeout()
                        },
                    }
                },
                HandshakeStep::RetryAfter(delay) => {
                    self.events.emit(LinkEvent::HandshakeRetry {
                        session: self.session.id(),
                        attempt: self.handshake.attempts(),
                        delay_ms: delay.as_millis() as u64,
                    });
                    self.pause(delay).await?;
                    HandshakeStep::Read
                },
                HandshakeStep::Complete(config) => {
                    let attempts = self.handshake.attempts();
                    self.session.stats_mut().handshake_attempts = attempts;
                    self.events.emit(LinkEvent::HandshakeCompleted {
                        session: self.session.id(),
                        attempts,
                        bytes: config.len(),
                    });
                    return Ok(config);
                },
                HandshakeStep::TimedOut { attempts, elapsed } => {
                    self.session.stats_mut().handshake_attempts = attempts;
                    return Err(LinkError::HandshakeTimeout { attempts, elapsed });
                },
            };
        }
    }

    async fn steady_state(&mut self) -> Result<()> {
        loop {
            if self.poll.is_pending() {
                self.pull().await?;
                continue;
            }

            tokio::select! {
                biased;
                _ = self.token.retired() => return Err(self.interrupted()),
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd)?,
                    None => return Ok(()),
                },
            }
        }
    }

    /// One drain cycle: read until empty (or the per-cycle bound).
    async fn pull(&mut self) -> Result<()> {
        // Fold in anything already queued so back-to-back signals share a cycle
        while let Ok(cmd) = self.commands.try_recv() {
            self.on_command(cmd)?;
        }
        let Some(trigger) = self.poll.start_pull() else {
            return Ok(());
        };

        // Only signalled cycles take the self-edge
        if trigger != PullTrigger::Handshake {
            let edge = self.session.transition(LinkState::SteadyState)?;
            self.record(edge);
        }
        self.session.stats_mut().pulls += 1;
        self.events.emit(LinkEvent::PullStarted {
            session: self.session.id(),
            trigger,
        });

        let generation = self.session.generation();
        let drained = loop {
            let result = self.read_data(ReadPurpose::Poll).await?;
            match self.poll.on_read(generation, result) {
                PullStep::Deliver(frame) => self.deliver(frame),
                PullStep::DeliverAndYield(frame) => {
                    self.deliver(frame);
                    break false;
                },
                PullStep::Drained => break true,
            }
        };

        let frames = self.poll.frames_this_cycle();
        let follow_up = self.poll.finish_pull();
        tracing::trace!(frames, drained, follow_up, "pull cycle finished");
        self.events.emit(LinkEvent::PullCompleted {
            session: self.session.id(),
            frames,
            drained,
        });
        Ok(())
    }

    /// Single legal read of the data endpoint.
    async fn read_data(&mut self, purpose: ReadPurpose) -> Result<ReadResult> {
        let (handle, endpoint) = match (self.session.handle(), self.session.characteristics()) {
            (Some(handle), Some(set)) => (handle, set.read()),
            _ => {
                return Err(LinkError::ProtocolViolation(format!(
                    "{purpose:?} read without a resolved link"
                )))
            },
        };
        self.session.begin_read(purpose)?;

        let result = self
            .call("read", move |t| async move { t.read(handle, endpoint).await })
            .await;
        match &result {
            Ok(read) => self.session.end_read(read.len()),
            Err(_) => self.session.abort_read(),
        }
        result
    }

    /// Issue a transport call, retrying transient failures within budget.
    async fn call<R, F, Fut>(&mut self, operation: &'static str, mut op: F) -> Result<R>
    where
        F: FnMut(Arc<T>) -> Fut,
        Fut: Future<Output = TransportResult<R>>,
    {
        let max_retries = self.config.transport.max_retries;
        let retry_delay = self.config.transport.retry_delay();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let fut = op(Arc::clone(&self.transport));
            match self.guarded(operation, fut).await? {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt <= max_retries => {
                    self.session.stats_mut().transient_retries += 1;
                    self.events.emit(LinkEvent::TransportRetry {
                        session: self.session.id(),
                        operation,
                        attempt,
                        error: err.to_string(),
                    });
                    self.pause(retry_delay).await?;
                },
                Err(err) if err.is_transient() => {
                    return Err(LinkError::RetriesExhausted {
                        operation,
                        attempts: attempt,
                        last: err,
                    })
                },
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Await `fut` while servicing commands and watching for retirement.
    ///
    /// The outer error means the session must stop; the inner result is the
    /// transport's own outcome.
    async fn guarded<R, Fut>(
        &mut self,
        operation: &'static str,
        fut: Fut,
    ) -> Result<TransportResult<R>>
    where
        Fut: Future<Output = TransportResult<R>>,
    {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                _ = self.token.retired() => return Err(self.interrupted()),
                cmd = self.commands.recv() => {
                    if let Some(cmd) = cmd {
                        self.on_command(cmd)?;
                    }
                },
                result = &mut fut => {
                    if !self.token.is_current() {
                        self.events.emit(LinkEvent::StaleCompletion {
                            generation: self.token.generation(),
                            operation,
                        });
                        return Err(self.interrupted());
                    }
                    return Ok(result);
                },
            }
        }
    }

    async fn pause(&mut self, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            return Ok(());
        }
        let _ = self
            .guarded("backoff", async move {
                tokio::time::sleep(delay).await;
                Ok::<_, TransportError>(())
            })
            .await?;
        Ok(())
    }

    fn on_command(&mut self, cmd: Command) -> Result<()> {
        let current = self.session.generation();
        match cmd {
            Command::Notify(generation) if generation == current => {
                self.session.stats_mut().notifications += 1;
                if self.poll.on_notify() == NotifyAction::Coalesced {
                    self.session.stats_mut().notifications_coalesced += 1;
                    self.events.emit(LinkEvent::NotificationCoalesced {
                        session: self.session.id(),
                    });
                }
                Ok(())
            },
            Command::PeerDisconnected(generation) if generation == current => {
                Err(LinkError::Disconnected)
            },
            Command::Notify(generation) | Command::PeerDisconnected(generation) => {
                self.events.emit(LinkEvent::StaleCompletion {
                    generation,
                    operation: "callback",
                });
                Ok(())
            },
            Command::Close => Err(LinkError::SessionClosed),
        }
    }

    /// Why the generation was retired underneath us.
    fn interrupted(&mut self) -> LinkError {
        let current = self.session.generation();
        while let Ok(cmd) = self.commands.try_recv() {
            if cmd == Command::PeerDisconnected(current) {
                return LinkError::Disconnected;
            }
        }
        // Superseded by a newer session
        LinkError::SessionClosed
    }

    fn notify_callback(&self) -> EventCallback {
        let tx = self.command_tx.clone();
        let token = self.token.clone();
        let events = self.events.clone();
        Arc::new(move || {
            if token.is_current() {
                let _ = tx.send(Command::Notify(token.generation()));
            } else {
                events.emit(LinkEvent::StaleCompletion {
                    generation: token.generation(),
                    operation: "notify",
                });
            }
        })
    }

    fn disconnect_callback(&self) -> EventCallback {
        let tx = self.command_tx.clone();
        let token = self.token.clone();
        let generations = self.generations.clone();
        Arc::new(move || {
            if token.is_current() {
                // Message first, so the actor can tell a drop from a supersede
                let _ = tx.send(Command::PeerDisconnected(token.generation()));
                generations.retire(token.generation());
            }
        })
    }

    fn deliver(&mut self, frame: Frame) {
        self.session.stats_mut().frames_delivered += 1;
        // Consumer may have dropped the stream; frames are then discarded
        let _ = self.frames.send(frame);
    }

    fn record(&self, edge: Transition) {
        self.events.emit(LinkEvent::StateChanged {
            session: self.session.id(),
            generation: self.session.generation(),
            from: edge.from,
            to: edge.to,
        });
    }

    fn set_status(&self, status: SessionStatus) {
        self.status.send_replace(status);
        self.events.emit(LinkEvent::Status {
            session: self.session.id(),
            status,
        });
    }

    async fn finish(mut self, result: Result<()>) -> SessionOutcome {
        let (end, error) = match result {
            Ok(()) | Err(LinkError::SessionClosed) => (SessionEnd::Closed, None),
            Err(LinkError::Disconnected) => (SessionEnd::PeerDisconnected, None),
            Err(err) => {
                let kind = err
                    .failure_kind()
                    .unwrap_or(FailureKind::FatalTransport);
                self.events.emit(LinkEvent::Failed {
                    session: self.session.id(),
                    kind,
                    error: err.to_string(),
                });
                (SessionEnd::Failed(kind), Some(err.to_string()))
            },
        };

        let edge = match end {
            SessionEnd::Failed(kind) => self.session.fail(kind),
            SessionEnd::Closed | SessionEnd::PeerDisconnected => self.session.disconnect(),
        };
        if let Some(edge) = edge {
            self.record(edge);
        }

        self.teardown().await;

        let status = match end {
            SessionEnd::Failed(kind) => SessionStatus::Failed(kind),
            SessionEnd::Closed | SessionEnd::PeerDisconnected => SessionStatus::Disconnected,
        };
        self.set_status(status);

        SessionOutcome {
            session: self.session.id(),
            generation: self.session.generation(),
            final_state: self.session.state(),
            end,
            error,
            stats: self.session.stats(),
            transitions: self.session.transitions().to_vec(),
        }
    }

    /// Release everything the session owns. Retires the generation first so
    /// callbacks racing the teardown are dropped.
    async fn teardown(&mut self) {
        self.generations.retire(self.session.generation());

        let Some(handle) = self.session.handle() else {
            return;
        };
        if let Some(endpoint) = self.subscribed.take() {
            if let Err(e) = self.transport.unsubscribe(handle, endpoint).await {
                tracing::debug!(%handle, error = %e, "unsubscribe during teardown failed");
            }
        }
        self.transport.disconnect(handle).await;
        tracing::debug!(%handle, session = %self.session.id(), "link released");
    }
}
