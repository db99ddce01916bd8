//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with backoff)
//! - Edits with acknowledgment tracking and vector-clock stamping
//! - Cursor updates, throttled and dropped while offline
//! - Offline buffer for edits made while disconnected
//!
//! A background supervisor task owns the socket. Edits made while the
//! socket is down are buffered in order; on reconnect the buffer is flushed
//! under the link lock, so no live edit can overtake a buffered one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use mindweave_core::{Document, Mutation};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::clock::{ClockCoordinator, VectorClock};
use crate::protocol::{ClientMessage, Cursor, Operation, OutboundFrame, ParticipantView, ServerMessage};
use crate::reconnect::{
    AckOutcome, AckResult, BufferedMessage, ClientError, ConnectionState, OfflineBuffer, PendingAcks,
    ReconnectPolicy,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_CAPACITY: usize = 256;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL, e.g. `ws://127.0.0.1:9090/docs`; the document id is appended.
    pub server_url: String,
    pub document_id: String,
    pub token: String,
    pub client_id: String,
    /// Key under which this client ticks vector clocks.
    pub participant_id: String,
    pub ack_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub cursor_throttle: Duration,
    pub offline_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(
        server_url: impl Into<String>,
        document_id: impl Into<String>,
        token: impl Into<String>,
        participant_id: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            document_id: document_id.into(),
            token: token.into(),
            client_id: Uuid::new_v4().to_string(),
            participant_id: participant_id.into(),
            ack_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            cursor_throttle: Duration::from_millis(33),
            offline_capacity: 10_000,
            reconnect: ReconnectPolicy::default(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/{}?token={}",
            self.server_url.trim_end_matches('/'),
            self.document_id,
            self.token
        )
    }
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Session established (first connect or reconnect)
    Connected { session_id: Uuid },
    /// Connection lost; retrying after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// Closed by `disconnect()`
    Disconnected,
    /// Gave up after `attempts` reconnect attempts
    ConnectionFailed { attempts: u32 },
    /// Full document state, on join and on `force_sync`
    InitialData {
        document: Document,
        version: u64,
        participants: Vec<ParticipantView>,
    },
    RemoteOperation(Arc<Operation>),
    RemoteCursor {
        session_id: Uuid,
        participant_id: String,
        cursor: Cursor,
    },
    ParticipantJoined(ParticipantView),
    ParticipantLeft { session_id: Uuid, participant_id: String },
    /// Ack for an edit nobody is waiting on (e.g. one flushed from the buffer)
    Acknowledged {
        message_id: Option<String>,
        outcome: AckOutcome,
    },
    /// Rejection for an edit nobody is waiting on
    Rejected {
        message_id: Option<String>,
        error: ClientError,
    },
    /// The offline buffer was full; the oldest edit was discarded
    BufferOverflow { dropped: BufferedMessage },
}

/// How an edit left the client.
#[derive(Debug)]
pub enum Delivery {
    /// Written to the live connection.
    Sent(PendingAck),
    /// Buffered until the next connection; its ack arrives as an event.
    Queued { message_id: String, operation_id: Uuid },
}

/// Acknowledgment wait for one sent edit.
#[derive(Debug)]
pub struct PendingAck {
    message_id: String,
    operation_id: Uuid,
    timeout: Duration,
    /// Fixed when the edit was written, not when `wait` is called.
    deadline: Instant,
    rx: oneshot::Receiver<AckResult>,
    pending: Arc<Mutex<PendingAcks>>,
}

impl PendingAck {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    /// Wait for the server's answer. Retrying after a timeout is left to
    /// the caller; the operation id makes a resend idempotent.
    pub async fn wait(self) -> Result<AckOutcome, ClientError> {
        match tokio::time::timeout_at(self.deadline, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Cancelled),
            Err(_) => {
                self.pending.lock().await.remove(&self.message_id);
                Err(ClientError::Timeout(self.timeout))
            }
        }
    }
}

enum Outgoing {
    Edit(BufferedMessage),
    Transient(String),
}

struct LinkState {
    state: ConnectionState,
    outgoing: Option<mpsc::UnboundedSender<Outgoing>>,
    buffer: OfflineBuffer,
}

struct ClientShared {
    config: ClientConfig,
    link: Mutex<LinkState>,
    clock: Mutex<ClockCoordinator>,
    pending: Arc<Mutex<PendingAcks>>,
    events: mpsc::Sender<SyncEvent>,
    shutdown: watch::Sender<bool>,
    last_cursor: Mutex<Option<Instant>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    next_message: AtomicU64,
}

impl ClientShared {
    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.events.try_send(event) {
            log::warn!("Dropping sync event, receiver not keeping up: {e}");
        }
    }

    fn next_message_id(&self) -> String {
        let n = self.next_message.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.config.client_id)
    }

    async fn set_state(&self, state: ConnectionState) {
        self.link.lock().await.state = state;
    }

    fn encode(&self, message: ClientMessage, message_id: Option<String>) -> Result<String, ClientError> {
        let envelope = message
            .into_envelope(self.config.client_id.clone(), message_id)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        serde_json::to_string(&envelope).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    /// Queue a transient message on the live connection; dropped offline.
    async fn send_transient(&self, message: ClientMessage) -> bool {
        let text = match self.encode(message, None) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Failed to encode message: {e}");
                return false;
            }
        };
        let link = self.link.lock().await;
        match (&link.state, &link.outgoing) {
            (ConnectionState::Connected, Some(tx)) => tx.send(Outgoing::Transient(text)).is_ok(),
            _ => false,
        }
    }
}

/// The sync client.
///
/// Manages a WebSocket connection to the collaboration server, edit
/// acknowledgments, cursor updates, and offline buffering.
pub struct SyncClient {
    shared: Arc<ClientShared>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    /// Create a new sync client.
    pub fn new(config: ClientConfig) -> Self {
        let (events, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let shared = ClientShared {
            link: Mutex::new(LinkState {
                state: ConnectionState::Disconnected,
                outgoing: None,
                buffer: OfflineBuffer::new(config.offline_capacity),
            }),
            clock: Mutex::new(ClockCoordinator::new(config.participant_id.clone())),
            pending: Arc::new(Mutex::new(PendingAcks::new())),
            events,
            shutdown,
            last_cursor: Mutex::new(None),
            supervisor: Mutex::new(None),
            next_message: AtomicU64::new(1),
            config,
        };
        Self {
            shared: Arc::new(shared),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.shared.link.lock().await.state
    }

    pub async fn offline_buffer_len(&self) -> usize {
        self.shared.link.lock().await.buffer.len()
    }

    /// This client's current vector clock.
    pub async fn clock(&self) -> VectorClock {
        self.shared.clock.lock().await.current().clone()
    }

    /// Connect to the server. Returns once `initial_data` has arrived and
    /// any buffered edits have been flushed.
    pub async fn connect(&self) -> Result<Uuid, ClientError> {
        {
            let mut link = self.shared.link.lock().await;
            if link.state != ConnectionState::Disconnected {
                return Err(ClientError::Protocol(format!("cannot connect while {:?}", link.state)));
            }
            link.state = ConnectionState::Connecting;
        }
        self.shared.shutdown.send_replace(false);

        let live = match establish(&self.shared).await {
            Ok(ws) => go_live(&self.shared, ws).await,
            Err(e) => Err(e),
        };
        match live {
            Ok(live) => {
                let session_id = live.session_id;
                let handle = tokio::spawn(supervise(self.shared.clone(), live));
                *self.shared.supervisor.lock().await = Some(handle);
                Ok(session_id)
            }
            Err(e) => {
                log::warn!("Connecting to {} failed: {e}", self.shared.config.document_id);
                self.shared.set_state(ConnectionState::Disconnected).await;
                Err(e)
            }
        }
    }

    /// Submit an edit. Online edits come back with an acknowledgment wait;
    /// offline edits are buffered and flushed on reconnect.
    pub async fn send_operation(&self, mutation: Mutation) -> Result<Delivery, ClientError> {
        let shared = &self.shared;
        let operation_id = Uuid::new_v4();
        let clock = shared.clock.lock().await.stamp();
        let message_id = shared.next_message_id();
        let text = shared
            .encode(
                ClientMessage::edit(mutation, Some(operation_id), Some(clock)),
                Some(message_id.clone()),
            )?;
        let message = BufferedMessage {
            message_id: message_id.clone(),
            text,
        };

        let rx = shared.pending.lock().await.register(&message_id);
        let deadline = Instant::now() + shared.config.ack_timeout;
        let mut link = shared.link.lock().await;
        let unsent = match &link.outgoing {
            Some(tx) if link.state == ConnectionState::Connected => match tx.send(Outgoing::Edit(message)) {
                Ok(()) => None,
                Err(mpsc::error::SendError(Outgoing::Edit(message))) => Some(message),
                Err(_) => None,
            },
            _ => Some(message),
        };

        match unsent {
            None => Ok(Delivery::Sent(PendingAck {
                message_id,
                operation_id,
                timeout: shared.config.ack_timeout,
                deadline,
                rx,
                pending: shared.pending.clone(),
            })),
            Some(message) => {
                let mut pending = shared.pending.lock().await;
                pending.remove(&message_id);
                log::debug!("Offline, buffering edit {message_id}");
                if let Some(dropped) = link.buffer.push(message) {
                    log::warn!(
                        "Offline buffer full ({}), discarding edit {}",
                        link.buffer.capacity(),
                        dropped.message_id
                    );
                    pending.remove(&dropped.message_id);
                    shared.emit(SyncEvent::BufferOverflow { dropped });
                }
                Ok(Delivery::Queued {
                    message_id,
                    operation_id,
                })
            }
        }
    }

    /// Send a cursor update. Returns `false` when throttled or offline.
    pub async fn send_cursor(&self, cursor: Cursor) -> bool {
        {
            let mut last = self.shared.last_cursor.lock().await;
            let now = Instant::now();
            if last.is_some_and(|t| now.duration_since(t) < self.shared.config.cursor_throttle) {
                return false;
            }
            *last = Some(now);
        }
        self.shared.send_transient(ClientMessage::CursorUpdate(cursor)).await
    }

    /// Ask the server to resend the full document state.
    pub async fn force_sync(&self) -> bool {
        self.shared.send_transient(ClientMessage::ForceSync).await
    }

    /// Close the connection, cancel any reconnect in progress and fail every
    /// pending acknowledgment with [`ClientError::Cancelled`]. Buffered edits
    /// are kept for the next `connect()`.
    pub async fn disconnect(&self) {
        self.shared.shutdown.send_replace(true);
        let supervisor = self.shared.supervisor.lock().await.take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                log::error!("Client supervisor failed: {e}");
            }
        }
        {
            let mut link = self.shared.link.lock().await;
            link.state = ConnectionState::Disconnected;
            link.outgoing = None;
        }
        let cancelled = self.shared.pending.lock().await.cancel_all();
        if cancelled > 0 {
            log::debug!("Cancelled {cancelled} pending acknowledgments");
        }
        self.shared.emit(SyncEvent::Disconnected);
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

/// A connection that has received `initial_data` and flushed the buffer.
struct Live {
    session_id: Uuid,
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    outgoing: mpsc::UnboundedReceiver<Outgoing>,
}

enum SessionEnd {
    Shutdown,
    Lost,
}

/// Dial and wait for `initial_data`.
async fn establish(shared: &ClientShared) -> Result<(WsStream, Uuid), ClientError> {
    let url = shared.config.endpoint();
    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| ClientError::Connection(e.to_string()))?;

    let first = tokio::time::timeout(shared.config.ack_timeout, next_text(&mut ws))
        .await
        .map_err(|_| ClientError::Timeout(shared.config.ack_timeout))??;
    let frame = OutboundFrame::decode(&first).map_err(|e| ClientError::Protocol(e.to_string()))?;
    match frame.message {
        ServerMessage::InitialData {
            document,
            version,
            session_id,
            participants,
            clock,
        } => {
            shared.clock.lock().await.observe(&clock);
            shared.emit(SyncEvent::InitialData {
                document,
                version,
                participants,
            });
            Ok((ws, session_id))
        }
        ServerMessage::Error { code, message, .. } => Err(ClientError::Rejected {
            code,
            message,
            conflicts: Vec::new(),
        }),
        other => Err(ClientError::Protocol(format!(
            "expected initial_data, got {}",
            other.type_name()
        ))),
    }
}

async fn next_text(ws: &mut WsStream) -> Result<String, ClientError> {
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(text)) => return Ok(text.as_str().to_string()),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(ClientError::Connection(e.to_string())),
        }
    }
    Err(ClientError::Connection("closed before initial_data".into()))
}

/// Flush the offline buffer, then open the link for live traffic.
async fn go_live(shared: &ClientShared, (ws, session_id): (WsStream, Uuid)) -> Result<Live, ClientError> {
    let (mut sink, stream) = ws.split();
    let (tx, outgoing) = mpsc::unbounded_channel();

    let mut link = shared.link.lock().await;
    let queued = link.buffer.drain();
    if !queued.is_empty() {
        log::info!("Replaying {} buffered edits", queued.len());
    }
    let mut queued = queued.into_iter();
    while let Some(message) = queued.next() {
        if let Err(e) = sink.send(Message::text(message.text.clone())).await {
            let mut unsent = vec![message];
            unsent.extend(queued);
            link.buffer.restore(unsent);
            return Err(ClientError::Connection(e.to_string()));
        }
    }
    link.outgoing = Some(tx);
    link.state = ConnectionState::Connected;
    drop(link);

    log::info!("Connected to {} as session {session_id}", shared.config.document_id);
    shared.emit(SyncEvent::Connected { session_id });
    Ok(Live {
        session_id,
        sink,
        stream,
        outgoing,
    })
}

async fn supervise(shared: Arc<ClientShared>, live: Live) {
    let mut live = Some(live);
    while let Some(current) = live.take() {
        match run_session(&shared, current).await {
            SessionEnd::Shutdown => break,
            SessionEnd::Lost => live = reconnect(&shared).await,
        }
    }
    let mut link = shared.link.lock().await;
    link.outgoing = None;
    link.state = ConnectionState::Disconnected;
}

async fn run_session(shared: &ClientShared, live: Live) -> SessionEnd {
    let Live {
        session_id,
        mut sink,
        mut stream,
        mut outgoing,
    } = live;
    let mut shutdown = shared.shutdown.subscribe();
    let mut heartbeat = tokio::time::interval(shared.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    let end = loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break SessionEnd::Shutdown,
            msg = outgoing.recv() => {
                let text = match msg {
                    Some(Outgoing::Edit(message)) => message.text,
                    Some(Outgoing::Transient(text)) => text,
                    None => break SessionEnd::Shutdown,
                };
                if let Err(e) = sink.send(Message::text(text)).await {
                    log::warn!("Write failed on session {session_id}: {e}");
                    break SessionEnd::Lost;
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_frame(shared, text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Server closed session {session_id}");
                    break SessionEnd::Lost;
                }
                Some(Err(e)) => {
                    log::warn!("Connection error on session {session_id}: {e}");
                    break SessionEnd::Lost;
                }
                Some(Ok(_)) => {}
            },
            _ = heartbeat.tick() => {
                match shared.encode(ClientMessage::Heartbeat, None) {
                    Ok(text) => {
                        if sink.send(Message::text(text)).await.is_err() {
                            break SessionEnd::Lost;
                        }
                    }
                    Err(e) => log::warn!("Failed to encode heartbeat: {e}"),
                }
            }
        }
    };

    match end {
        SessionEnd::Shutdown => {
            let _ = sink.close().await;
        }
        SessionEnd::Lost => {
            // Edits queued for the dead socket go back to the buffer.
            let mut link = shared.link.lock().await;
            link.outgoing = None;
            link.state = ConnectionState::Reconnecting;
            outgoing.close();
            let mut requeued = 0usize;
            while let Ok(msg) = outgoing.try_recv() {
                if let Outgoing::Edit(message) = msg {
                    if let Some(dropped) = link.buffer.push(message) {
                        shared.emit(SyncEvent::BufferOverflow { dropped });
                    }
                    requeued += 1;
                }
            }
            if requeued > 0 {
                log::debug!("Requeued {requeued} unsent edits");
            }
        }
    }
    end
}

async fn reconnect(shared: &ClientShared) -> Option<Live> {
    let policy = shared.config.reconnect;
    let mut shutdown = shared.shutdown.subscribe();

    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay(attempt);
        log::info!(
            "Reconnecting to {} in {delay:?} (attempt {attempt}/{})",
            shared.config.document_id,
            policy.max_attempts
        );
        shared.emit(SyncEvent::Reconnecting { attempt, delay });
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_for_shutdown(&mut shutdown) => return None,
        }

        let live = match establish(shared).await {
            Ok(ws) => go_live(shared, ws).await,
            Err(e) => Err(e),
        };
        match live {
            Ok(live) => return Some(live),
            Err(e) => log::warn!("Reconnect attempt {attempt} failed: {e}"),
        }
    }

    log::error!(
        "Giving up on {} after {} attempts",
        shared.config.document_id,
        policy.max_attempts
    );
    shared.emit(SyncEvent::ConnectionFailed {
        attempts: policy.max_attempts,
    });
    None
}

/// Resolves once shutdown is requested or the client is dropped.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn handle_frame(shared: &ClientShared, text: &str) {
    let frame = match OutboundFrame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Ignoring malformed server frame: {e}");
            return;
        }
    };

    match frame.message {
        ServerMessage::Operation(op) => {
            if let Some(clock) = &op.clock {
                shared.clock.lock().await.observe(clock);
            }
            shared.emit(SyncEvent::RemoteOperation(op));
        }
        ServerMessage::CursorUpdate {
            session_id,
            participant_id,
            cursor,
        } => shared.emit(SyncEvent::RemoteCursor {
            session_id,
            participant_id,
            cursor,
        }),
        ServerMessage::UserJoined(view) => shared.emit(SyncEvent::ParticipantJoined(view)),
        ServerMessage::UserLeft {
            session_id,
            participant_id,
        } => shared.emit(SyncEvent::ParticipantLeft {
            session_id,
            participant_id,
        }),
        ServerMessage::InitialData {
            document,
            version,
            participants,
            clock,
            ..
        } => {
            shared.clock.lock().await.observe(&clock);
            shared.emit(SyncEvent::InitialData {
                document,
                version,
                participants,
            });
        }
        ServerMessage::Ack {
            message_id,
            operation_id,
            version,
            duplicate,
        } => {
            let outcome = AckOutcome {
                operation_id,
                version,
                duplicate,
            };
            let delivered = match &message_id {
                Some(id) => shared.pending.lock().await.resolve(id, Ok(outcome.clone())),
                None => false,
            };
            if !delivered {
                shared.emit(SyncEvent::Acknowledged { message_id, outcome });
            }
        }
        ServerMessage::Error {
            message_id,
            code,
            message,
            conflicts,
        } => {
            let error = ClientError::Rejected {
                code,
                message,
                conflicts,
            };
            let delivered = match &message_id {
                Some(id) => shared.pending.lock().await.resolve(id, Err(error.clone())),
                None => false,
            };
            if !delivered {
                log::debug!("Server rejected {message_id:?}: {error}");
                shared.emit(SyncEvent::Rejected { message_id, error });
            }
        }
        ServerMessage::Heartbeat => log::trace!("Heartbeat from server"),
    }
}
