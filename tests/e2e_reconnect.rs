//! Reconnect, stale-completion and supervisor tests.
//!
//! A torn-down session must not be able to touch its successor, whatever the
//! transport delivers late.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use radiolink::error::TransportError;
use radiolink::protocol::{EndpointRole, LinkEvent};
use radiolink::transport::{SimOpKind, SimPeerProfile, SimTransport};
use radiolink::{Config, FailureKind, LinkClient, SessionEnd, SessionStatus};
use tokio::sync::broadcast;

async fn wait_for_event<F>(rx: &mut broadcast::Receiver<LinkEvent>, pred: F) -> LinkEvent
where
    F: Fn(&LinkEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {},
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("event not observed")
}

fn is_drained_pull(event: &LinkEvent) -> bool {
    matches!(event, LinkEvent::PullCompleted { drained: true, .. })
}

fn fast_restart_config() -> Config {
    let mut config = Config::default();
    config.restart.delay_ms = 100;
    config
}

/// A notification callback from the old connection, fired after a reconnect,
/// is dropped instead of triggering a pull on the new session.
#[tokio::test(start_paused = true)]
async fn test_late_notify_from_old_generation_is_ignored() {
    let sim = Arc::new(SimTransport::default());
    let client = LinkClient::new(Arc::clone(&sim), Config::default());
    let mut events = client.subscribe();

    let first = client.open();
    first.wait_ready().await.unwrap();
    let old_handle = sim.current_handle().unwrap();
    let old_generation = first.generation();
    sim.drop_link();
    assert_eq!(first.join().await.unwrap().end, SessionEnd::PeerDisconnected);

    let second = client.open();
    second.wait_ready().await.unwrap();
    assert!(second.generation() > old_generation);
    wait_for_event(&mut events, |e| {
        is_drained_pull(e)
            && matches!(e, LinkEvent::PullCompleted { session, .. } if *session == second.id())
    })
    .await;

    let reads_before = sim.read_count();
    assert_eq!(sim.replay_notify(old_handle), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(sim.read_count(), reads_before);
    assert_eq!(second.status(), SessionStatus::Ready);
    let event = wait_for_event(&mut events, |e| {
        matches!(e, LinkEvent::StaleCompletion { .. })
    })
    .await;
    assert!(matches!(
        event,
        LinkEvent::StaleCompletion { generation, operation: "notify" } if generation == old_generation
    ));

    second.close();
    let outcome = second.join().await.unwrap();
    assert_eq!(outcome.stats.notifications, 0);
}

/// A read in flight when the link drops is abandoned: its data is never
/// delivered under the old generation.
#[tokio::test(start_paused = true)]
async fn test_in_flight_read_abandoned_on_disconnect() {
    let sim = Arc::new(SimTransport::default());
    let client = LinkClient::new(Arc::clone(&sim), Config::default());
    let mut events = client.subscribe();

    let mut first = client.open();
    let mut first_frames = first.take_frames().unwrap();
    first.wait_ready().await.unwrap();
    first_frames.next().await.unwrap();
    wait_for_event(&mut events, is_drained_pull).await;

    sim.set_profile(SimPeerProfile {
        read_latency: Duration::from_millis(100),
        ..Default::default()
    });
    sim.deliver([&b"late"[..]]);
    tokio::time::sleep(Duration::from_millis(10)).await;
    sim.drop_link();

    let outcome = first.join().await.unwrap();
    assert_eq!(outcome.end, SessionEnd::PeerDisconnected);
    assert!(first_frames.next().await.is_none());
    // The abandoned read never consumed the peer's queue
    assert_eq!(sim.queued(), 1);

    let mut second = client.open();
    let mut second_frames = second.take_frames().unwrap();
    second.wait_ready().await.unwrap();
    let frame = second_frames.next().await.unwrap();
    assert_eq!(frame.generation, second.generation());
    second.close();
    second.join().await.unwrap();
}

/// Opening a new session supersedes the running one.
#[tokio::test(start_paused = true)]
async fn test_open_supersedes_running_session() {
    let sim = Arc::new(SimTransport::new(SimPeerProfile {
        empty_reads_before_config: usize::MAX,
        ..Default::default()
    }));
    let client = LinkClient::new(Arc::clone(&sim), Config::default());

    let first = client.open();
    // Let it get into the handshake backoff
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(first.status(), SessionStatus::Connected);

    sim.set_profile(SimPeerProfile::default());
    let second = client.open();
    let outcome = first.join().await.unwrap();
    assert_eq!(outcome.end, SessionEnd::Closed);

    second.wait_ready().await.unwrap();
    assert!(second.generation() > outcome.generation);
    second.close();
    second.join().await.unwrap();
}

/// A superseding session continues the numbering of the one it replaced,
/// even though that one never finished first.
#[tokio::test(start_paused = true)]
async fn test_superseding_session_continues_sequence() {
    let sim = Arc::new(SimTransport::default());
    let client = LinkClient::new(Arc::clone(&sim), Config::default());

    let mut first = client.open();
    let mut first_frames = first.take_frames().unwrap();
    first.wait_ready().await.unwrap();
    let first_config = first_frames.next().await.unwrap();
    assert_eq!(first_config.sequence, 0);

    // No close: open() alone retires the running session
    let mut second = client.open();
    let mut second_frames = second.take_frames().unwrap();
    second.wait_ready().await.unwrap();
    let second_config = second_frames.next().await.unwrap();
    assert_eq!(second_config.generation, second.generation());
    assert!(second_config.sequence > first_config.sequence);

    let outcome = first.join().await.unwrap();
    assert_eq!(outcome.end, SessionEnd::Closed);
    assert!(first_frames.next().await.is_none());

    sim.deliver([&b"more"[..]]);
    let next = second_frames.next().await.unwrap();
    assert_eq!(next.sequence, second_config.sequence + 1);

    second.close();
    second.join().await.unwrap();
}

/// A fatal failure is followed by a brand-new session.
#[tokio::test(start_paused = true)]
async fn test_supervisor_restarts_after_fatal_error() {
    let sim = Arc::new(SimTransport::default());
    sim.fail_next(SimOpKind::Connect, TransportError::fatal("adapter reset"));
    let client = LinkClient::new(Arc::clone(&sim), fast_restart_config());
    let mut events = client.subscribe();

    let mut supervisor = client.supervise();
    let mut frames = supervisor.take_frames().unwrap();

    let frame = frames.next().await.unwrap();
    let event = wait_for_event(&mut events, |e| matches!(e, LinkEvent::Restarting { .. })).await;
    assert!(matches!(
        event,
        LinkEvent::Restarting {
            attempt: 1,
            after: SessionEnd::Failed(FailureKind::FatalTransport)
        }
    ));

    supervisor.stop();
    let report = supervisor.join().await.unwrap();
    assert_eq!(report.restarts, 1);
    assert_eq!(report.sessions.len(), 2);
    assert_eq!(
        report.sessions[0].end,
        SessionEnd::Failed(FailureKind::FatalTransport)
    );
    assert_eq!(report.last_end(), Some(SessionEnd::Closed));
    assert_eq!(frame.generation, report.sessions[1].generation);
}

/// Frames keep their order and numbering across a supervised reconnect.
#[tokio::test(start_paused = true)]
async fn test_supervisor_reconnects_after_peer_drop() {
    let sim = Arc::new(SimTransport::default());
    let client = LinkClient::new(Arc::clone(&sim), fast_restart_config());

    let mut supervisor = client.supervise();
    let mut frames = supervisor.take_frames().unwrap();

    let first = frames.next().await.unwrap();
    sim.drop_link();
    let second = frames.next().await.unwrap();
    assert_eq!(second.sequence, first.sequence + 1);
    assert!(second.generation > first.generation);

    supervisor.stop();
    let report = supervisor.join().await.unwrap();
    assert_eq!(report.sessions[0].end, SessionEnd::PeerDisconnected);
    assert_eq!(report.restarts, 1);
}

/// An incompatible peer is not retried unless the policy asks for it.
#[tokio::test(start_paused = true)]
async fn test_supervisor_gives_up_on_incompatible_peer() {
    let sim = Arc::new(SimTransport::new(SimPeerProfile {
        missing: vec![EndpointRole::Write],
        ..Default::default()
    }));
    let client = LinkClient::new(Arc::clone(&sim), fast_restart_config());

    let report = client.supervise().join().await.unwrap();
    assert_eq!(report.restarts, 0);
    assert_eq!(
        report.last_end(),
        Some(SessionEnd::Failed(FailureKind::IncompatiblePeer))
    );
    assert!(sim.handshake_writes().is_empty());
}

/// Repeated failures stop at the restart budget.
#[tokio::test(start_paused = true)]
async fn test_supervisor_restart_budget() {
    let sim = Arc::new(SimTransport::new(SimPeerProfile {
        empty_reads_before_config: usize::MAX,
        ..Default::default()
    }));
    let mut config = fast_restart_config();
    config.restart.max_restarts = 2;
    config.handshake.max_attempts = 2;
    let client = LinkClient::new(Arc::clone(&sim), config);

    let report = client.supervise().join().await.unwrap();
    assert_eq!(report.restarts, 2);
    assert_eq!(report.sessions.len(), 3);
    assert!(report
        .sessions
        .iter()
        .all(|s| s.end == SessionEnd::Failed(FailureKind::HandshakeTimeout)));

    // Every session wrote its own handshake request
    let nonces: Vec<_> = sim.handshake_writes().iter().map(|r| r.nonce()).collect();
    assert_eq!(nonces.len(), 3);
}
