//! Notification-driven poll loop.
//!
//! The peer's notify endpoint only says "something is queued". Each signal
//! schedules a drain cycle: read the data endpoint until it comes back empty,
//! handing every non-empty payload onward as a [`Frame`] in read order.
//!
//! Notifications coalesce. While a cycle is pending or running, further
//! notifications collapse into at most one follow-up cycle; none is ever
//! dropped outright, since data queued after the running cycle's final read
//! would otherwise sit until the next unrelated notification.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use super::generation::Generation;
use crate::transport::ReadResult;

/// Payload pulled from the peer, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Generation of the session that read it
    pub generation: Generation,
    /// Position in the client's delivery order (starts at 0)
    pub sequence: u64,
    /// Raw bytes as read; decoding is the application's job
    pub payload: Bytes,
}

/// Outcome of feeding a notification to the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyAction {
    /// Nothing pending or running: start a cycle now
    StartPull,
    /// A cycle is running; one follow-up is now scheduled
    FollowUpScheduled,
    /// A cycle was already pending; folded into it
    Coalesced,
}

/// What scheduled a drain cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PullTrigger {
    /// The peer signalled data available
    Notification,
    /// Handshake completed; the peer may have queued data behind its configuration
    Handshake,
    /// The previous cycle stopped at its read bound
    ReadBound,
}

/// What to do after a read inside a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullStep {
    /// Deliver this frame, then read again
    Deliver(Frame),
    /// Empty read: peer drained
    Drained,
    /// Deliver this frame; the cycle hit its read bound and ends here
    DeliverAndYield(Frame),
}

/// Coalescing state and frame sequencing for one client.
#[derive(Debug)]
pub struct PollLoop {
    max_reads_per_pull: usize,
    pending: Option<PullTrigger>,
    pulling: bool,
    reads_this_cycle: usize,
    frames_this_cycle: usize,
    sequence: Arc<AtomicU64>,
}

impl PollLoop {
    /// Loop bounded to `max_reads_per_pull` reads per cycle
    pub fn new(max_reads_per_pull: usize) -> Self {
        Self {
            max_reads_per_pull: max_reads_per_pull.max(1),
            pending: None,
            pulling: false,
            reads_this_cycle: 0,
            frames_this_cycle: 0,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number frames from a counter shared with other sessions of a client.
    ///
    /// Numbers are taken as frames are stamped, so overlapping sessions
    /// never hand out the same one.
    pub fn with_sequence(mut self, sequence: Arc<AtomicU64>) -> Self {
        self.sequence = sequence;
        self
    }

    /// Record a data-available signal.
    pub fn on_notify(&mut self) -> NotifyAction {
        self.schedule(PullTrigger::Notification)
    }

    /// Schedule a drain once the handshake completes, without a notification.
    ///
    /// If notifications already left a cycle pending, that cycle covers it.
    pub fn on_handshake_complete(&mut self) -> NotifyAction {
        self.schedule(PullTrigger::Handshake)
    }

    fn schedule(&mut self, trigger: PullTrigger) -> NotifyAction {
        if self.pending.is_some() {
            NotifyAction::Coalesced
        } else if self.pulling {
            self.pending = Some(trigger);
            NotifyAction::FollowUpScheduled
        } else {
            self.pending = Some(trigger);
            NotifyAction::StartPull
        }
    }

    /// Whether a cycle is waiting to start
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether a cycle is running
    pub fn is_pulling(&self) -> bool {
        self.pulling
    }

    /// Begin the pending cycle, returning what scheduled it.
    /// `None` if nothing was pending.
    pub fn start_pull(&mut self) -> Option<PullTrigger> {
        if self.pulling {
            return None;
        }
        let trigger = self.pending.take()?;
        self.pulling = true;
        self.reads_this_cycle = 0;
        self.frames_this_cycle = 0;
        Some(trigger)
    }

    /// Feed one read of the running cycle.
    pub fn on_read(&mut self, generation: Generation, result: ReadResult) -> PullStep {
        self.reads_this_cycle += 1;
        if result.is_empty() {
            return PullStep::Drained;
        }

        let frame = self.frame(generation, result.into_bytes());
        self.frames_this_cycle += 1;
        if self.reads_this_cycle >= self.max_reads_per_pull {
            // More may be queued; make sure a follow-up runs
            self.pending.get_or_insert(PullTrigger::ReadBound);
            PullStep::DeliverAndYield(frame)
        } else {
            PullStep::Deliver(frame)
        }
    }

    /// End the running cycle. Returns `true` if a follow-up is due.
    pub fn finish_pull(&mut self) -> bool {
        self.pulling = false;
        self.pending.is_some()
    }

    /// Frames produced by the running (or last) cycle
    pub fn frames_this_cycle(&self) -> usize {
        self.frames_this_cycle
    }

    /// Stamp a payload with the next sequence number.
    pub fn frame(&mut self, generation: Generation, payload: Bytes) -> Frame {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        Frame {
            generation,
            sequence,
            payload,
        }
    }

    /// Sequence number the next frame will get
    pub fn next_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const G: Generation = Generation(1);

    #[test]
    fn test_drain_cycle_in_order() {
        let mut poll = PollLoop::new(16);
        assert_eq!(poll.on_notify(), NotifyAction::StartPull);
        assert_eq!(poll.start_pull(), Some(PullTrigger::Notification));

        let mut delivered = Vec::new();
        for payload in [&b"one"[..], &b"two"[..], &b"three"[..], &b""[..]] {
            match poll.on_read(G, ReadResult::new(payload.to_vec())) {
                PullStep::Deliver(frame) => delivered.push(frame),
                PullStep::Drained => break,
                PullStep::DeliverAndYield(_) => panic!("bound not reached"),
            }
        }
        assert!(!poll.finish_pull());

        let payloads: Vec<_> = delivered.iter().map(|f| f.payload.clone()).collect();
        assert_eq!(
            payloads,
            vec![
                Bytes::from_static(b"one"),
                Bytes::from_static(b"two"),
                Bytes::from_static(b"three"),
            ]
        );
        let seqs: Vec<_> = delivered.iter().map(|f| f.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_notify_during_pull_schedules_one_follow_up() {
        let mut poll = PollLoop::new(16);
        poll.on_notify();
        poll.start_pull();

        assert_eq!(poll.on_notify(), NotifyAction::FollowUpScheduled);
        assert_eq!(poll.on_notify(), NotifyAction::Coalesced);
        assert_eq!(poll.on_notify(), NotifyAction::Coalesced);

        assert!(poll.finish_pull());
        assert_eq!(poll.start_pull(), Some(PullTrigger::Notification));
        assert!(!poll.finish_pull());
        assert_eq!(poll.start_pull(), None);
    }

    #[test]
    fn test_read_bound_yields_and_reschedules() {
        let mut poll = PollLoop::new(2);
        poll.on_notify();
        poll.start_pull();

        assert!(matches!(
            poll.on_read(G, ReadResult::new(vec![1])),
            PullStep::Deliver(_)
        ));
        assert!(matches!(
            poll.on_read(G, ReadResult::new(vec![2])),
            PullStep::DeliverAndYield(_)
        ));
        // Follow-up owed even without a new notification
        assert!(poll.finish_pull());
        assert_eq!(poll.start_pull(), Some(PullTrigger::ReadBound));
    }

    #[test]
    fn test_handshake_drain_is_not_a_notification() {
        let mut poll = PollLoop::new(4);
        assert_eq!(poll.on_handshake_complete(), NotifyAction::StartPull);
        assert_eq!(poll.start_pull(), Some(PullTrigger::Handshake));
        assert!(!poll.finish_pull());

        // A notification that arrived during the handshake keeps its trigger
        let mut poll = PollLoop::new(4);
        poll.on_notify();
        assert_eq!(poll.on_handshake_complete(), NotifyAction::Coalesced);
        assert_eq!(poll.start_pull(), Some(PullTrigger::Notification));
    }

    #[test]
    fn test_shared_sequence_across_loops() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut first = PollLoop::new(4).with_sequence(Arc::clone(&counter));
        let mut second = PollLoop::new(4).with_sequence(Arc::clone(&counter));

        assert_eq!(first.frame(G, Bytes::from_static(b"a")).sequence, 0);
        assert_eq!(second.frame(Generation(2), Bytes::from_static(b"b")).sequence, 1);
        assert_eq!(first.frame(G, Bytes::from_static(b"c")).sequence, 2);
        assert_eq!(second.next_sequence(), 3);
    }

    #[test]
    fn test_start_pull_without_pending() {
        let mut poll = PollLoop::new(4);
        assert_eq!(poll.start_pull(), None);
        assert!(!poll.is_pulling());
    }

    proptest! {
        /// However notifications interleave with a running cycle, exactly one
        /// follow-up results if any arrived, and none otherwise.
        #[test]
        fn prop_notifications_coalesce(during in 0usize..50, before in 1usize..10) {
            let mut poll = PollLoop::new(8);
            let mut starts = 0;
            for _ in 0..before {
                if poll.on_notify() == NotifyAction::StartPull {
                    starts += 1;
                }
            }
            prop_assert_eq!(starts, 1);
            prop_assert!(poll.start_pull().is_some());

            for _ in 0..during {
                prop_assert_ne!(poll.on_notify(), NotifyAction::StartPull);
            }

            let follow_up = poll.finish_pull();
            prop_assert_eq!(follow_up, during > 0);
            if follow_up {
                prop_assert!(poll.start_pull().is_some());
                prop_assert!(!poll.finish_pull());
            }
        }
    }
}
