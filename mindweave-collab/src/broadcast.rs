//! Fan-out of encoded frames to the sessions of one room.
//!
//! Each session owns two bounded lanes:
//! - **operations**: accepted operations, acks, errors, membership. A full or
//!   closed lane means the connection cannot keep up; the session is evicted.
//! - **presence**: cursor updates. High frequency and unacknowledged, so a
//!   full lane drops the frame; only a closed lane evicts.
//!
//! Frames are encoded once and shared (`Arc<str>`) across recipients.
//! Stats are atomics so the fan-out path never takes a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::protocol::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Operations,
    Presence,
}

/// Outcome of a single non-blocking send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Presence frame dropped on a full lane.
    Dropped,
    /// The session must be evicted.
    Dead,
}

/// Room-side sending half of a session's lanes.
#[derive(Debug, Clone)]
pub struct SessionLink {
    operations: mpsc::Sender<Frame>,
    presence: mpsc::Sender<Frame>,
}

/// Connection-side receiving half of a session's lanes.
#[derive(Debug)]
pub struct SessionReceivers {
    pub operations: mpsc::Receiver<Frame>,
    pub presence: mpsc::Receiver<Frame>,
}

impl SessionLink {
    pub fn channel(operations_capacity: usize, presence_capacity: usize) -> (SessionLink, SessionReceivers) {
        let (ops_tx, ops_rx) = mpsc::channel(operations_capacity.max(1));
        let (presence_tx, presence_rx) = mpsc::channel(presence_capacity.max(1));
        (
            SessionLink {
                operations: ops_tx,
                presence: presence_tx,
            },
            SessionReceivers {
                operations: ops_rx,
                presence: presence_rx,
            },
        )
    }

    pub fn send(&self, lane: Lane, frame: Frame) -> SendOutcome {
        match lane {
            Lane::Operations => match self.operations.try_send(frame) {
                Ok(()) => SendOutcome::Delivered,
                Err(_) => SendOutcome::Dead,
            },
            Lane::Presence => match self.presence.try_send(frame) {
                Ok(()) => SendOutcome::Delivered,
                Err(TrySendError::Full(_)) => SendOutcome::Dropped,
                Err(TrySendError::Closed(_)) => SendOutcome::Dead,
            },
        }
    }

    pub fn is_closed(&self) -> bool {
        self.operations.is_closed()
    }
}

/// Snapshot of fan-out counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutStats {
    pub messages_sent: u64,
    pub presence_dropped: u64,
    pub sessions_evicted: u64,
}

#[derive(Debug, Default)]
struct AtomicFanOutStats {
    messages_sent: AtomicU64,
    presence_dropped: AtomicU64,
    sessions_evicted: AtomicU64,
}

/// Delivers frames and counts the outcome.
#[derive(Debug, Clone, Default)]
pub struct FanOut {
    stats: Arc<AtomicFanOutStats>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send to one session. Returns `false` when the session is dead.
    pub fn send_to(&self, link: &SessionLink, lane: Lane, frame: Frame) -> bool {
        self.record(link.send(lane, frame))
    }

    /// Send `frame` to every target. A dead session does not interrupt
    /// delivery to the others; its id is returned for eviction.
    pub fn broadcast<'a, I>(&self, targets: I, lane: Lane, frame: &Frame) -> Vec<Uuid>
    where
        I: IntoIterator<Item = (Uuid, &'a SessionLink)>,
    {
        targets
            .into_iter()
            .filter(|(_, link)| !self.record(link.send(lane, frame.clone())))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn record_eviction(&self) {
        self.stats.sessions_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> FanOutStats {
        FanOutStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            presence_dropped: self.stats.presence_dropped.load(Ordering::Relaxed),
            sessions_evicted: self.stats.sessions_evicted.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: SendOutcome) -> bool {
        match outcome {
            SendOutcome::Delivered => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            SendOutcome::Dropped => {
                self.stats.presence_dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            SendOutcome::Dead => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(s: &str) -> Frame {
        Arc::from(s)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_targets() {
        let fanout = FanOut::new();
        let mut sessions = Vec::new();
        for _ in 0..5 {
            let (link, rx) = SessionLink::channel(8, 8);
            sessions.push((Uuid::new_v4(), link, rx));
        }

        let dead = fanout.broadcast(
            sessions.iter().map(|(id, link, _)| (*id, link)),
            Lane::Operations,
            &frame("op"),
        );
        assert!(dead.is_empty());
        for (_, _, rx) in &mut sessions {
            assert_eq!(rx.operations.recv().await.as_deref(), Some("op"));
        }
        assert_eq!(fanout.stats().messages_sent, 5);
    }

    #[tokio::test]
    async fn test_dead_session_does_not_block_others() {
        let fanout = FanOut::new();
        let (alive, mut alive_rx) = SessionLink::channel(8, 8);
        let (gone, gone_rx) = SessionLink::channel(8, 8);
        drop(gone_rx);
        let alive_id = Uuid::new_v4();
        let gone_id = Uuid::new_v4();

        let dead = fanout.broadcast(
            [(gone_id, &gone), (alive_id, &alive)],
            Lane::Operations,
            &frame("op"),
        );
        assert_eq!(dead, vec![gone_id]);
        assert_eq!(alive_rx.operations.recv().await.as_deref(), Some("op"));
    }

    #[test]
    fn test_full_operations_lane_is_dead() {
        let (link, _rx) = SessionLink::channel(1, 1);
        assert_eq!(link.send(Lane::Operations, frame("a")), SendOutcome::Delivered);
        assert_eq!(link.send(Lane::Operations, frame("b")), SendOutcome::Dead);
    }

    #[test]
    fn test_full_presence_lane_drops() {
        let fanout = FanOut::new();
        let (link, rx) = SessionLink::channel(1, 1);
        assert!(fanout.send_to(&link, Lane::Presence, frame("c1")));
        assert!(fanout.send_to(&link, Lane::Presence, frame("c2")));
        assert_eq!(fanout.stats().presence_dropped, 1);

        drop(rx);
        assert!(!fanout.send_to(&link, Lane::Presence, frame("c3")));
    }
}
