//! # mindweave-collab: Real-time sync engine for Mindweave mind maps
//!
//! Accepts concurrent edits over WebSocket, rejects conflicting ones,
//! applies the rest to a shared document tree and fans them out.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     JSON frames     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │OfflineBuffer│                     │ Room task   │
//! │ PendingAcks │                     │ (per doc)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                         ┌──────────────────┼──────────────┐
//!                         ▼                  ▼              ▼
//!                 OperationPipeline       FanOut       Persistence
//!             (conflict → clock → tree)  (two lanes)    (retrying)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire envelopes and messages
//! - [`conflict`]: recent-operation window and conflict detection
//! - [`clock`]: vector clocks and the causal index
//! - [`pipeline`]: validate, detect, apply, commit
//! - [`room`]: per-document task, session registry, room lifecycle
//! - [`broadcast`]: fan-out with per-session backpressure
//! - [`handshake`]: upgrade validation (426 / 400 / 401)
//! - [`server`]: WebSocket sync server
//! - [`client`], [`reconnect`]: sync client with backoff and offline buffer
//! - [`storage`], [`auth`]: collaborator interfaces

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod error;
pub mod handshake;
pub mod pipeline;
pub mod protocol;
pub mod reconnect;
pub mod room;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use auth::{Authenticator, StaticTokens};
pub use broadcast::{FanOut, FanOutStats, Lane, SessionLink, SessionReceivers};
pub use client::{ClientConfig, Delivery, PendingAck, SyncClient, SyncEvent};
pub use clock::{CausalIndex, CausalOrder, ClockCoordinator, VectorClock};
pub use config::{Config, ConfigError, PersistenceConfig, RoomConfig, ServerConfig};
pub use conflict::{ConflictDetector, ConflictPolicy, ConflictReason, ConflictReport, OperationHistory};
pub use error::{ErrorCode, SyncError};
pub use pipeline::{OperationPipeline, PipelineError, Submission};
pub use protocol::{
    ClientEnvelope, ClientMessage, Cursor, Operation, OperationRequest, OutboundFrame, ParticipantInfo,
    ParticipantView, ServerMessage,
};
pub use reconnect::{AckOutcome, BufferedMessage, ClientError, ConnectionState, OfflineBuffer, ReconnectPolicy};
pub use room::{RoomHandle, RoomManager, RoomSnapshot};
pub use server::{ServerStats, SyncServer};
pub use storage::{DocumentStore, MemoryStore, Persistence, RetryPolicy, StoreError, StoredDocument};
