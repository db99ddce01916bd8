//! Storage collaborator interface.
//!
//! ```text
//! ┌─────────────┐  load (on room creation)   ┌───────────────┐
//! │    Room     │ ◄───────────────────────── │ DocumentStore │
//! │   (task)    │                            │   (trait)     │
//! └──────┬──────┘                            └───────▲───────┘
//!        │ accepted ops, final snapshot              │ retried writes
//!        ▼                                           │
//! ┌─────────────┐     unbounded channel      ┌───────┴───────┐
//! │ Persistence │ ─────────────────────────► │ forwarder task│
//! └─────────────┘                            └───────────────┘
//! ```
//!
//! Durable storage lives outside this crate; [`MemoryStore`] is the
//! in-process implementation used by the server binary and tests. Writes
//! never block a room: they are queued to the forwarder, which retries and
//! finally logs and drops failures.

use mindweave_core::Document;
use thiserror::Error;

use crate::protocol::Operation;

pub mod forwarder;
pub mod memory;

pub use forwarder::{Persistence, RetryPolicy};
pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// A document snapshot together with the version it was taken at.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub document: Document,
    pub version: u64,
}

pub trait DocumentStore: Send + Sync {
    /// Latest snapshot of `document_id`, `None` for a document never stored.
    fn load(&self, document_id: &str) -> Result<Option<StoredDocument>, StoreError>;

    fn append_operation(&self, document_id: &str, operation: &Operation) -> Result<(), StoreError>;

    fn save_snapshot(&self, document_id: &str, document: &Document, version: u64) -> Result<(), StoreError>;
}
