//! Client-side reconnection state: backoff schedule, offline buffer and
//! acknowledgment bookkeeping.
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──initial_data──► Connected
//!      ▲                                                      │ unexpected close
//!      │ attempts exhausted / disconnect()                    ▼
//!      └──────────────────────────────────────────────── Reconnecting ──► Connected
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::protocol::Operation;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("no acknowledgment within {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("rejected by server ({code:?}): {message}")]
    Rejected {
        code: ErrorCode,
        message: String,
        conflicts: Vec<Arc<Operation>>,
    },

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let multiplier = self.factor.max(1).saturating_pow(exponent);
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }

    /// The full schedule, one delay per allowed attempt.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).map(|attempt| self.delay(attempt))
    }
}

/// An encoded edit waiting for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedMessage {
    pub message_id: String,
    pub text: String,
}

/// Ordered queue of edits made while offline, replayed on reconnect.
#[derive(Debug)]
pub struct OfflineBuffer {
    queue: VecDeque<BufferedMessage>,
    capacity: usize,
}

impl OfflineBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Append a message. When full the oldest entry is evicted and returned.
    pub fn push(&mut self, message: BufferedMessage) -> Option<BufferedMessage> {
        let evicted = if self.queue.len() >= self.capacity {
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(message);
        evicted
    }

    /// Put messages back at the head, ahead of anything queued since.
    pub fn restore(&mut self, messages: Vec<BufferedMessage>) {
        for message in messages.into_iter().rev() {
            self.queue.push_front(message);
        }
    }

    pub fn drain(&mut self) -> Vec<BufferedMessage> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Positive acknowledgment of a submitted edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckOutcome {
    pub operation_id: Uuid,
    pub version: u64,
    pub duplicate: bool,
}

pub type AckResult = Result<AckOutcome, ClientError>;

/// Waiters keyed by message id.
#[derive(Debug, Default)]
pub struct PendingAcks {
    waiters: HashMap<String, oneshot::Sender<AckResult>>,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also drops waiters whose receiver is gone.
    pub fn register(&mut self, message_id: &str) -> oneshot::Receiver<AckResult> {
        self.waiters.retain(|_, tx| !tx.is_closed());
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(message_id.to_string(), tx);
        rx
    }

    /// Hand `result` to the waiter. `false` if nobody was waiting.
    pub fn resolve(&mut self, message_id: &str, result: AckResult) -> bool {
        match self.waiters.remove(message_id) {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    pub fn remove(&mut self, message_id: &str) {
        self.waiters.remove(message_id);
    }

    /// Fail every waiter with [`ClientError::Cancelled`].
    pub fn cancel_all(&mut self) -> usize {
        let count = self.waiters.len();
        for (_, tx) in self.waiters.drain() {
            let _ = tx.send(Err(ClientError::Cancelled));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
