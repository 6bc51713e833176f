//! Session supervisor.
//!
//! Restarts whole sessions according to `[restart]`: a failed or dropped
//! session is replaced by a brand-new one with a new generation and a fresh
//! handshake. Frames from every session are forwarded, in order, into one
//! stream.
//!
//! | Previous session ended with | Restarted?                         |
//! |-----------------------------|------------------------------------|
//! | `Closed`                    | no                                 |
//! | `PeerDisconnected`          | yes                                |
//! | `Failed(IncompatiblePeer)`  | only with `restart_on_incompatible`|
//! | `Failed(ProtocolViolation)` | never                              |
//! | other `Failed(_)`           | yes                                |

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{FrameStream, LinkClient, SessionOutcome};
use crate::config::RestartConfig;
use crate::error::{LinkError, Result};
use crate::protocol::{FailureKind, Frame, LinkEvent, SessionEnd};
use crate::transport::LinkTransport;

/// Summary of a supervised run.
#[derive(Debug, Clone, Default)]
pub struct SupervisorReport {
    /// Outcome of every session, oldest first
    pub sessions: Vec<SessionOutcome>,
    /// Restarts performed
    pub restarts: u32,
}

impl SupervisorReport {
    /// How the last session ended
    pub fn last_end(&self) -> Option<SessionEnd> {
        self.sessions.last().map(|s| s.end)
    }
}

/// Handle to a running supervisor.
#[derive(Debug)]
pub struct Supervisor {
    stop: watch::Sender<bool>,
    frames: Option<FrameStream>,
    task: JoinHandle<SupervisorReport>,
}

impl Supervisor {
    pub(super) fn spawn<T: LinkTransport + ?Sized + 'static>(client: LinkClient<T>) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(client, stop_rx, frames_tx));
        Self {
            stop,
            frames: Some(FrameStream { rx: frames }),
            task,
        }
    }

    /// Take the combined frame stream. Returns `None` after the first call.
    pub fn take_frames(&mut self) -> Option<FrameStream> {
        self.frames.take()
    }

    /// Close the current session and stop restarting.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Wait for the supervisor to finish.
    pub async fn join(self) -> Result<SupervisorReport> {
        self.task.await.map_err(|e| LinkError::Task(e.to_string()))
    }
}

/// Whether a session that ended with `end` should be replaced.
fn should_restart(end: SessionEnd, policy: &RestartConfig) -> bool {
    match end {
        SessionEnd::Closed => false,
        SessionEnd::PeerDisconnected => true,
        SessionEnd::Failed(FailureKind::IncompatiblePeer) => policy.restart_on_incompatible,
        SessionEnd::Failed(kind) => kind.is_recoverable(),
    }
}

async fn forward(frames: &mut FrameStream, tx: &mpsc::UnboundedSender<Frame>) {
    while let Some(frame) = frames.next().await {
        let _ = tx.send(frame);
    }
}

/// Resolves once a stop is requested. A dropped handle never stops the run.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|s| *s).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn run<T: LinkTransport + ?Sized + 'static>(
    client: LinkClient<T>,
    mut stop: watch::Receiver<bool>,
    frames_tx: mpsc::UnboundedSender<Frame>,
) -> SupervisorReport {
    let policy = client.config().restart.clone();
    let events = client.events.clone();
    let mut report = SupervisorReport::default();

    loop {
        let mut session = client.open();
        let Some(mut frames) = session.take_frames() else {
            break;
        };

        let stopped = tokio::select! {
            _ = stop_requested(&mut stop) => true,
            _ = forward(&mut frames, &frames_tx) => false,
        };
        if stopped {
            session.close();
        }

        let outcome = match session.join().await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "session task failed");
                break;
            },
        };
        // Frames still buffered from the finished session
        forward(&mut frames, &frames_tx).await;

        let end = outcome.end;
        report.sessions.push(outcome);

        if stopped || *stop.borrow() || !should_restart(end, &policy) {
            break;
        }
        if report.restarts >= policy.max_restarts {
            tracing::warn!(restarts = report.restarts, ?end, "restart budget exhausted");
            break;
        }

        report.restarts += 1;
        events.emit(LinkEvent::Restarting {
            attempt: report.restarts,
            after: end,
        });

        let stopped = tokio::select! {
            _ = stop_requested(&mut stop) => true,
            _ = tokio::time::sleep(policy.delay()) => false,
        };
        if stopped {
            break;
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_policy() {
        let mut policy = RestartConfig::default();
        assert!(!should_restart(SessionEnd::Closed, &policy));
        assert!(should_restart(SessionEnd::PeerDisconnected, &policy));
        assert!(should_restart(
            SessionEnd::Failed(FailureKind::HandshakeTimeout),
            &policy
        ));
        assert!(should_restart(
            SessionEnd::Failed(FailureKind::TransientExhausted),
            &policy
        ));
        assert!(!should_restart(
            SessionEnd::Failed(FailureKind::ProtocolViolation),
            &policy
        ));
        assert!(!should_restart(
            SessionEnd::Failed(FailureKind::IncompatiblePeer),
            &policy
        ));

        policy.restart_on_incompatible = true;
        assert!(should_restart(
            SessionEnd::Failed(FailureKind::IncompatiblePeer),
            &policy
        ));
    }
}
