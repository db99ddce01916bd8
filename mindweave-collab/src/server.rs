//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  upgrade + auth  ┌──────────────┐
//!             ├───────────────► │ RoomManager  │── Room (doc_id) ── OperationPipeline
//! Client B ──┘  accept_hdr      └──────────────┘        │
//!                                                       ├── Persistence ── DocumentStore
//!                                                       │
//!                                            ┌──────────┼───────────┐
//!                                            ▼          ▼           ▼
//!                                         Client A   Client B    Client C
//! ```
//!
//! Each connection runs its own task: it forwards decoded inbound messages
//! to its room and writes whatever the room queues on the session's two
//! lanes (operations first, then presence) back to the socket.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::auth::Authenticator;
use crate::broadcast::SessionLink;
use crate::config::{Config, ServerConfig};
use crate::error::SyncError;
use crate::handshake::{self, UpgradeRequest};
use crate::protocol::{ClientEnvelope, ClientMessage, ServerMessage};
use crate::room::RoomManager;
use crate::storage::{DocumentStore, Persistence, RetryPolicy};

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_upgrades: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub invalid_messages: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    auth: Arc<dyn Authenticator>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server. Must be called from within a tokio runtime, since the
    /// persistence forwarder is spawned here.
    pub fn new(config: Config, store: Arc<dyn DocumentStore>, auth: Arc<dyn Authenticator>) -> Self {
        let persistence = Persistence::spawn(store.clone(), RetryPolicy::from(&config.persistence));
        let rooms = RoomManager::new(config.room, config.server.command_capacity, store, persistence);
        Self {
            config: config.server,
            rooms: Arc::new(rooms),
            auth,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), SyncError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SyncError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let connection = Connection {
                config: self.config.clone(),
                rooms: self.rooms.clone(),
                auth: self.auth.clone(),
                stats: self.stats.clone(),
            };
            tokio::spawn(async move {
                if let Err(e) = connection.handle(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// Everything one connection task needs.
struct Connection {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    auth: Arc<dyn Authenticator>,
    stats: Arc<RwLock<ServerStats>>,
}

impl Connection {
    async fn handle(self, mut stream: TcpStream, addr: SocketAddr) -> Result<(), SyncError> {
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
        }

        let mut verdict = None;
        let auth = self.auth.as_ref();
        let callback = |request: &Request, response: Response| {
            let result = handshake::validate(request, auth);
            let reply = match &result {
                Ok(_) => Ok(response),
                Err(e) => Err(handshake::error_response(e)),
            };
            verdict = Some(result);
            reply
        };

        let limit = self.config.handshake_timeout();
        let accepted = tokio::time::timeout(limit, tokio_tungstenite::accept_hdr_async(&mut stream, callback)).await;
        let ws_stream = match accepted {
            Ok(Ok(ws_stream)) => ws_stream,
            Ok(Err(e)) => {
                self.stats.write().await.rejected_upgrades += 1;
                match verdict {
                    Some(Err(rejected)) => log::info!("Rejecting upgrade from {addr}: {rejected}"),
                    _ => match handshake::handshake_failure(&e) {
                        Some(err) => {
                            log::debug!("Rejecting {addr} before upgrade: {err}");
                            handshake::reject(&mut stream, &err).await?;
                        }
                        None => log::debug!("Handshake with {addr} failed: {e}"),
                    },
                }
                return Ok(());
            }
            Err(elapsed) => {
                log::debug!("Handshake with {addr} timed out: {elapsed}");
                self.stats.write().await.rejected_upgrades += 1;
                handshake::reject(&mut stream, &SyncError::Timeout(limit)).await?;
                return Ok(());
            }
        };
        let Some(Ok(UpgradeRequest {
            document_id,
            participant,
        })) = verdict
        else {
            return Err(SyncError::BadRequest("upgrade accepted without validation".into()));
        };

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (link, mut lanes) =
            SessionLink::channel(self.config.operations_capacity, self.config.presence_capacity);
        let (room, session_id) = match self.rooms.register(&document_id, participant.clone(), link).await {
            Ok(joined) => joined,
            Err(e) => {
                log::error!("Could not open room {document_id} for {addr}: {e}");
                if let Ok(frame) = ServerMessage::error(None, &e).encode() {
                    let _ = ws_sender.send(Message::text(frame.to_string())).await;
                }
                let _ = ws_sender.close().await;
                return Ok(());
            }
        };

        {
            let mut s = self.stats.write().await;
            s.active_connections += 1;
        }
        log::info!(
            "WebSocket session {session_id} ({}) established from {addr} on {document_id}",
            participant.display_name
        );

        loop {
            let outbound = tokio::select! {
                biased;

                // Operations lane has priority over presence.
                frame = lanes.operations.recv() => match frame {
                    Some(frame) => frame,
                    None => {
                        log::info!("Session {session_id} dropped by room {document_id}");
                        break;
                    }
                },
                frame = lanes.presence.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },

                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        {
                            let mut s = self.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += text.as_str().len() as u64;
                        }
                        match decode_inbound(text.as_str()) {
                            Ok((message_id, message)) => {
                                if room.dispatch(session_id, message_id, message).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                            Err((message_id, e)) => {
                                log::debug!("Invalid message from session {session_id}: {e}");
                                self.stats.write().await.invalid_messages += 1;
                                match ServerMessage::error(message_id, &e).encode() {
                                    Ok(frame) => frame,
                                    Err(_) => continue,
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("WebSocket connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    Some(Ok(_)) => continue,
                },
            };

            if let Err(e) = ws_sender.send(Message::text(outbound.to_string())).await {
                log::debug!("Write to session {session_id} failed: {e}");
                break;
            }
        }

        room.unregister(session_id).await;
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        let _ = ws_sender.close().await;
        Ok(())
    }
}

/// Decode one text frame. Errors carry the message id when it could be read,
/// so the rejection can be correlated by the client.
fn decode_inbound(text: &str) -> Result<(Option<String>, ClientMessage), (Option<String>, SyncError)> {
    let envelope: ClientEnvelope = serde_json::from_str(text)
        .map_err(|e| (None, SyncError::Validation(e.to_string())))?;
    let message_id = envelope.message_id.clone();
    match ClientMessage::from_envelope(envelope) {
        Ok(message) => Ok((message_id, message)),
        Err(e) => Err((message_id, e)),
    }
}
