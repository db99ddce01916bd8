//! Rooms: one task per document.
//!
//! ```text
//! connection ─┐  RoomCommand   ┌──────────────────────────────┐
//! connection ─┼──────────────► │ room task                    │
//! connection ─┘   (mpsc)       │  OperationPipeline           │
//!                              │  sessions ── SessionLink ────┼──► connections
//!                              │  sweep timer / grace timer   │
//!                              └──────────────┬───────────────┘
//!                                             ▼
//!                                        Persistence
//! ```
//!
//! The task owns the document, version, recent-operation window and session
//! table; commands are processed one at a time, which is the only
//! serialization a document needs. Rooms share nothing with each other.
//!
//! A room with no sessions disposes itself after the grace period unless a
//! new session arrives first. On disposal the final snapshot is handed to
//! persistence and flushed before the room leaves the manager's map, so a
//! room reopened for the same document always loads the latest state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mindweave_core::Document;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::broadcast::{FanOut, FanOutStats, Lane, SessionLink};
use crate::clock::VectorClock;
use crate::config::RoomConfig;
use crate::error::SyncError;
use crate::pipeline::{OperationPipeline, Submission};
use crate::protocol::{
    unix_millis, ClientMessage, Cursor, Frame, Operation, OperationRequest, ParticipantInfo, ParticipantView,
    ServerMessage,
};
use crate::storage::{DocumentStore, Persistence, StoreError};

/// Attempts to join a room that is concurrently being disposed.
const REGISTER_ATTEMPTS: usize = 3;
/// Unlocked loads tried before loading under the registry lock.
const OPEN_ATTEMPTS: usize = 3;

type Registry = Arc<RwLock<HashMap<String, RoomHandle>>>;

pub(crate) enum RoomCommand {
    Register {
        participant: ParticipantInfo,
        link: SessionLink,
        reply: oneshot::Sender<Uuid>,
    },
    Unregister {
        session_id: Uuid,
    },
    Submit {
        session_id: Uuid,
        message_id: Option<String>,
        request: OperationRequest,
    },
    Cursor {
        session_id: Uuid,
        cursor: Cursor,
    },
    Heartbeat {
        session_id: Uuid,
    },
    ForceSync {
        session_id: Uuid,
    },
    Inspect {
        reply: oneshot::Sender<RoomSnapshot>,
    },
}

/// Point-in-time view of a room, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub document_id: String,
    pub document: Document,
    pub version: u64,
    pub participants: Vec<ParticipantView>,
    pub recent_operations: Vec<Arc<Operation>>,
    pub clock: VectorClock,
    pub fanout: FanOutStats,
}

/// Cheap, cloneable sender into a room task.
#[derive(Clone)]
pub struct RoomHandle {
    document_id: String,
    generation: u64,
    commands: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Distinguishes successive rooms opened for the same document.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Join the room; `initial_data` is delivered on the link.
    pub async fn register(&self, participant: ParticipantInfo, link: SessionLink) -> Result<Uuid, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Register {
            participant,
            link,
            reply,
        })
        .await?;
        rx.await.map_err(|_| self.closed())
    }

    pub async fn unregister(&self, session_id: Uuid) {
        // A closed room has already forgotten the session.
        let _ = self.commands.send(RoomCommand::Unregister { session_id }).await;
    }

    pub async fn submit(
        &self,
        session_id: Uuid,
        message_id: Option<String>,
        request: OperationRequest,
    ) -> Result<(), SyncError> {
        self.send(RoomCommand::Submit {
            session_id,
            message_id,
            request,
        })
        .await
    }

    /// Route one decoded inbound message. Results reach the session through
    /// its link, never through the return value.
    pub async fn dispatch(
        &self,
        session_id: Uuid,
        message_id: Option<String>,
        message: ClientMessage,
    ) -> Result<(), SyncError> {
        let cmd = match message {
            ClientMessage::CursorUpdate(cursor) => RoomCommand::Cursor { session_id, cursor },
            ClientMessage::Heartbeat => RoomCommand::Heartbeat { session_id },
            ClientMessage::ForceSync => RoomCommand::ForceSync { session_id },
            edit => match edit.into_request() {
                Some(request) => RoomCommand::Submit {
                    session_id,
                    message_id,
                    request,
                },
                None => return Ok(()),
            },
        };
        self.send(cmd).await
    }

    pub async fn inspect(&self) -> Result<RoomSnapshot, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Inspect { reply }).await?;
        rx.await.map_err(|_| self.closed())
    }

    async fn send(&self, cmd: RoomCommand) -> Result<(), SyncError> {
        self.commands.send(cmd).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> SyncError {
        SyncError::RoomClosed(self.document_id.clone())
    }
}

struct Session {
    id: Uuid,
    participant: ParticipantInfo,
    link: SessionLink,
    cursor: Option<Cursor>,
    last_activity: Instant,
}

impl Session {
    fn view(&self) -> ParticipantView {
        ParticipantView {
            session_id: self.id,
            participant_id: self.participant.participant_id.clone(),
            display_name: self.participant.display_name.clone(),
            cursor: self.cursor.clone(),
        }
    }
}

struct Room {
    document_id: String,
    generation: u64,
    pipeline: OperationPipeline,
    sessions: HashMap<Uuid, Session>,
    fanout: FanOut,
    config: RoomConfig,
    persistence: Persistence,
    registry: Registry,
}

impl Room {
    async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;

        let grace = self.config.disposal_grace();
        let mut dispose_at = Some(Instant::now() + grace);
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = sweep.tick() => self.sweep(),
                _ = wait_until(dispose_at) => {
                    if self.sessions.is_empty() {
                        break;
                    }
                }
            }
            dispose_at = match (self.sessions.is_empty(), dispose_at) {
                (true, None) => {
                    log::debug!("room {} is empty, disposing in {grace:?}", self.document_id);
                    Some(Instant::now() + grace)
                }
                (true, deadline) => deadline,
                (false, _) => None,
            };
        }
        self.dispose(rx).await;
    }

    fn handle(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Register {
                participant,
                link,
                reply,
            } => self.register(participant, link, reply),
            RoomCommand::Unregister { session_id } => self.remove_session(session_id),
            RoomCommand::Submit {
                session_id,
                message_id,
                request,
            } => self.submit(session_id, message_id, request),
            RoomCommand::Cursor { session_id, cursor } => self.cursor(session_id, cursor),
            RoomCommand::Heartbeat { session_id } => {
                if self.touch(session_id) {
                    self.send_to(session_id, &ServerMessage::Heartbeat);
                }
            }
            RoomCommand::ForceSync { session_id } => {
                if self.touch(session_id) {
                    let initial = self.initial_data(session_id);
                    self.send_to(session_id, &initial);
                }
            }
            RoomCommand::Inspect { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn register(&mut self, participant: ParticipantInfo, link: SessionLink, reply: oneshot::Sender<Uuid>) {
        let session_id = Uuid::new_v4();
        if reply.send(session_id).is_err() {
            // The connection gave up waiting.
            return;
        }
        log::info!(
            "{} ({}) joined room {} as session {session_id}",
            participant.display_name,
            participant.participant_id,
            self.document_id
        );
        self.sessions.insert(
            session_id,
            Session {
                id: session_id,
                participant,
                link,
                cursor: None,
                last_activity: Instant::now(),
            },
        );

        let initial = self.initial_data(session_id);
        if !self.send_to(session_id, &initial) {
            return;
        }
        if let Some(view) = self.sessions.get(&session_id).map(Session::view) {
            self.broadcast(Some(session_id), Lane::Operations, &ServerMessage::UserJoined(view));
        }
    }

    fn submit(&mut self, session_id: Uuid, message_id: Option<String>, request: OperationRequest) {
        if !self.touch(session_id) {
            log::debug!("dropping operation from unknown session {session_id}");
            return;
        }

        let reply = match self.pipeline.submit(request, session_id, unix_millis()) {
            Ok(Submission::Applied(op)) => {
                self.persistence.append(&self.document_id, op.clone());
                self.broadcast(Some(session_id), Lane::Operations, &ServerMessage::Operation(op.clone()));
                ServerMessage::Ack {
                    message_id,
                    operation_id: op.id,
                    version: op.document_version,
                    duplicate: false,
                }
            }
            Ok(Submission::Duplicate { operation_id, version }) => ServerMessage::Ack {
                message_id,
                operation_id,
                version,
                duplicate: true,
            },
            Err(e) => ServerMessage::error(message_id, &SyncError::from(e)),
        };
        self.send_to(session_id, &reply);
    }

    fn cursor(&mut self, session_id: Uuid, cursor: Cursor) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        session.last_activity = Instant::now();
        session.cursor = Some(cursor.clone());
        let msg = ServerMessage::CursorUpdate {
            session_id,
            participant_id: session.participant.participant_id.clone(),
            cursor,
        };
        log::trace!("cursor update from {session_id} in {}", self.document_id);
        self.broadcast(Some(session_id), Lane::Presence, &msg);
    }

    /// Evict sessions idle past the timeout, or whose connection is gone.
    fn sweep(&mut self) {
        let timeout = self.config.inactivity_timeout();
        let now = Instant::now();
        let stale: Vec<Uuid> = self
            .sessions
            .values()
            .filter(|s| s.link.is_closed() || now.duration_since(s.last_activity) >= timeout)
            .map(|s| s.id)
            .collect();
        for session_id in stale {
            log::info!("session {session_id} in room {} timed out", self.document_id);
            self.remove_session(session_id);
        }
    }

    fn touch(&mut self, session_id: Uuid) -> bool {
        match self.sessions.get_mut(&session_id) {
            Some(session) => {
                session.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    fn remove_session(&mut self, session_id: Uuid) {
        let Some(session) = self.sessions.remove(&session_id) else {
            return;
        };
        log::info!(
            "{} left room {} ({} remaining)",
            session.participant.display_name,
            self.document_id,
            self.sessions.len()
        );
        let dead = self.announce_left(&session);
        self.evict(dead);
    }

    /// Remove dead sessions. Announcing a departure can reveal more dead
    /// sessions, so this runs as a worklist.
    fn evict(&mut self, mut dead: Vec<Uuid>) {
        while let Some(session_id) = dead.pop() {
            let Some(session) = self.sessions.remove(&session_id) else {
                continue;
            };
            self.fanout.record_eviction();
            log::warn!(
                "evicted session {session_id} ({}) from room {}: connection not keeping up",
                session.participant.display_name,
                self.document_id
            );
            dead.extend(self.announce_left(&session));
        }
    }

    fn announce_left(&self, session: &Session) -> Vec<Uuid> {
        let msg = ServerMessage::UserLeft {
            session_id: session.id,
            participant_id: session.participant.participant_id.clone(),
        };
        match encode(&msg) {
            Some(frame) => self.fanout.broadcast(
                self.sessions.iter().map(|(id, s)| (*id, &s.link)),
                Lane::Operations,
                &frame,
            ),
            None => Vec::new(),
        }
    }

    /// Deliver to one session on its operations lane. Returns `false` if the
    /// session was evicted.
    fn send_to(&mut self, session_id: Uuid, msg: &ServerMessage) -> bool {
        let Some(frame) = encode(msg) else {
            return true;
        };
        let delivered = match self.sessions.get(&session_id) {
            Some(session) => self.fanout.send_to(&session.link, Lane::Operations, frame),
            None => return false,
        };
        if !delivered {
            self.evict(vec![session_id]);
        }
        delivered
    }

    fn broadcast(&mut self, except: Option<Uuid>, lane: Lane, msg: &ServerMessage) {
        let Some(frame) = encode(msg) else {
            return;
        };
        let dead = self.fanout.broadcast(
            self.sessions
                .iter()
                .filter(|(id, _)| Some(**id) != except)
                .map(|(id, s)| (*id, &s.link)),
            lane,
            &frame,
        );
        self.evict(dead);
    }

    fn initial_data(&self, session_id: Uuid) -> ServerMessage {
        ServerMessage::InitialData {
            document: self.pipeline.document().clone(),
            version: self.pipeline.version(),
            session_id,
            participants: self.sessions.values().map(Session::view).collect(),
            clock: self.pipeline.room_clock().clone(),
        }
    }

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            document_id: self.document_id.clone(),
            document: self.pipeline.document().clone(),
            version: self.pipeline.version(),
            participants: self.sessions.values().map(Session::view).collect(),
            recent_operations: self.pipeline.recent_operations().cloned().collect(),
            clock: self.pipeline.room_clock().clone(),
            fanout: self.fanout.stats(),
        }
    }

    async fn dispose(self, mut rx: mpsc::Receiver<RoomCommand>) {
        self.persistence.save_snapshot(
            &self.document_id,
            self.pipeline.document().clone(),
            self.pipeline.version(),
        );
        self.persistence.flush().await;

        {
            let mut rooms = self.registry.write().await;
            if rooms.get(&self.document_id).map(RoomHandle::generation) == Some(self.generation) {
                rooms.remove(&self.document_id);
            }
        }
        // Commands that raced the disposal fail with `RoomClosed`; joins are
        // retried against a fresh room by the manager.
        rx.close();
        let mut dropped = 0usize;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        log::info!(
            "disposed room {} at version {} ({dropped} pending commands dropped)",
            self.document_id,
            self.pipeline.version()
        );
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn encode(msg: &ServerMessage) -> Option<Frame> {
    match msg.encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            log::error!("failed to encode {} frame: {e}", msg.type_name());
            None
        }
    }
}

/// Maps document ids to live rooms.
pub struct RoomManager {
    rooms: Registry,
    config: RoomConfig,
    command_capacity: usize,
    store: Arc<dyn DocumentStore>,
    persistence: Persistence,
    next_generation: AtomicU64,
}

impl RoomManager {
    pub fn new(
        config: RoomConfig,
        command_capacity: usize,
        store: Arc<dyn DocumentStore>,
        persistence: Persistence,
    ) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            config,
            command_capacity: command_capacity.max(1),
            store,
            persistence,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Get the room for `document_id`, opening it from the store if needed.
    ///
    /// The store is read without holding the registry lock. If any room was
    /// opened while the load ran, that room may have closed and saved a newer
    /// snapshot than the one loaded, so the load is repeated.
    pub async fn get_or_create(&self, document_id: &str) -> Result<RoomHandle, SyncError> {
        for _ in 0..OPEN_ATTEMPTS {
            let opened = self.next_generation.load(Ordering::SeqCst);

            // Fast path: read lock
            {
                let rooms = self.rooms.read().await;
                if let Some(room) = rooms.get(document_id).filter(|r| !r.is_closed()) {
                    return Ok(room.clone());
                }
            }

            let (document, version) = self.load(document_id).await?;

            // Slow path: write lock, double-checked
            let mut rooms = self.rooms.write().await;
            if let Some(room) = rooms.get(document_id).filter(|r| !r.is_closed()) {
                return Ok(room.clone());
            }
            if self.next_generation.load(Ordering::SeqCst) == opened {
                return Ok(self.open(&mut rooms, document_id, document, version));
            }
            log::debug!("rooms opened while loading {document_id}, reloading");
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(document_id).filter(|r| !r.is_closed()) {
            return Ok(room.clone());
        }
        let (document, version) = self.load(document_id).await?;
        Ok(self.open(&mut rooms, document_id, document, version))
    }

    async fn load(&self, document_id: &str) -> Result<(Document, u64), SyncError> {
        let store = self.store.clone();
        let id = document_id.to_string();
        let stored = tokio::task::spawn_blocking(move || store.load(&id))
            .await
            .map_err(|e| StoreError::Unavailable(format!("load task failed: {e}")))??;
        Ok(match stored {
            Some(stored) => (stored.document, stored.version),
            None => (Document::default(), 0),
        })
    }

    fn open(
        &self,
        rooms: &mut HashMap<String, RoomHandle>,
        document_id: &str,
        document: Document,
        version: u64,
    ) -> RoomHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.command_capacity);
        let handle = RoomHandle {
            document_id: document_id.to_string(),
            generation,
            commands: tx,
        };
        let room = Room {
            document_id: document_id.to_string(),
            generation,
            pipeline: OperationPipeline::new(document, version, &self.config),
            sessions: HashMap::new(),
            fanout: FanOut::new(),
            config: self.config.clone(),
            persistence: self.persistence.clone(),
            registry: self.rooms.clone(),
        };
        tokio::spawn(room.run(rx));
        rooms.insert(document_id.to_string(), handle.clone());
        log::info!("opened room {document_id} at version {version} ({} rooms)", rooms.len());
        handle
    }

    /// Join `document_id`, retrying if the room closes underneath us.
    pub async fn register(
        &self,
        document_id: &str,
        participant: ParticipantInfo,
        link: SessionLink,
    ) -> Result<(RoomHandle, Uuid), SyncError> {
        for attempt in 1..=REGISTER_ATTEMPTS {
            let room = self.get_or_create(document_id).await?;
            match room.register(participant.clone(), link.clone()).await {
                Ok(session_id) => return Ok((room, session_id)),
                Err(SyncError::RoomClosed(_)) => {
                    log::debug!("room {document_id} closed during join (attempt {attempt})");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(SyncError::RoomClosed(document_id.to_string()))
    }

    pub async fn get(&self, document_id: &str) -> Option<RoomHandle> {
        self.rooms.read().await.get(document_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
