//! Asynchronous persistence forwarding with retries.

use std::sync::Arc;
use std::time::Duration;

use mindweave_core::Document;
use tokio::sync::{mpsc, oneshot};

use super::{DocumentStore, StoreError};
use crate::config::PersistenceConfig;
use crate::protocol::Operation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(200),
        }
    }
}

impl From<&PersistenceConfig> for RetryPolicy {
    fn from(config: &PersistenceConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

enum PersistCommand {
    Append {
        document_id: String,
        operation: Arc<Operation>,
    },
    Snapshot {
        document_id: String,
        document: Document,
        version: u64,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle to the forwarder task. Cloned into every room.
#[derive(Clone)]
pub struct Persistence {
    tx: mpsc::UnboundedSender<PersistCommand>,
}

impl Persistence {
    /// Spawn the forwarder. Must be called from within a tokio runtime.
    pub fn spawn(store: Arc<dyn DocumentStore>, policy: RetryPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(store, policy, rx));
        Self { tx }
    }

    pub fn append(&self, document_id: &str, operation: Arc<Operation>) {
        self.enqueue(PersistCommand::Append {
            document_id: document_id.to_string(),
            operation,
        });
    }

    pub fn save_snapshot(&self, document_id: &str, document: Document, version: u64) {
        self.enqueue(PersistCommand::Snapshot {
            document_id: document_id.to_string(),
            document,
            version,
        });
    }

    /// Resolves once every write queued before this call has been handled.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.enqueue(PersistCommand::Flush(tx));
        let _ = rx.await;
    }

    fn enqueue(&self, cmd: PersistCommand) {
        if self.tx.send(cmd).is_err() {
            log::error!("persistence forwarder has stopped; write dropped");
        }
    }
}

async fn run(store: Arc<dyn DocumentStore>, policy: RetryPolicy, mut rx: mpsc::UnboundedReceiver<PersistCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            PersistCommand::Append {
                document_id,
                operation,
            } => {
                let what = format!("operation {} of {document_id}", operation.id);
                let store = store.clone();
                with_retry(&policy, &what, move || store.append_operation(&document_id, &operation)).await;
            }
            PersistCommand::Snapshot {
                document_id,
                document,
                version,
            } => {
                let what = format!("snapshot of {document_id} at version {version}");
                let store = store.clone();
                with_retry(&policy, &what, move || store.save_snapshot(&document_id, &document, version)).await;
            }
            PersistCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    log::debug!("persistence forwarder stopped");
}

/// Run `write` on the blocking pool until it succeeds or the attempts run out.
async fn with_retry<F>(policy: &RetryPolicy, what: &str, write: F)
where
    F: Fn() -> Result<(), StoreError> + Send + Sync + 'static,
{
    let write = Arc::new(write);
    for attempt in 1..=policy.attempts {
        let job = write.clone();
        let result = match tokio::task::spawn_blocking(move || job()).await {
            Ok(result) => result,
            Err(e) => Err(StoreError::Unavailable(format!("store task failed: {e}"))),
        };
        match result {
            Ok(()) => return,
            Err(e) if attempt < policy.attempts => {
                log::warn!("persisting {what} failed (attempt {attempt}/{}): {e}", policy.attempts);
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => {
                log::error!("giving up on persisting {what} after {attempt} attempts: {e}");
            }
        }
    }
}
