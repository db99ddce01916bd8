//! JSON wire protocol.
//!
//! Inbound (client → server), one envelope per text frame:
//! ```text
//! { "type": "node_update", "data": { "nodeId": "x", "text": "Hi" },
//!   "clientId": "c1", "timestamp": 1700000000000, "messageId": "m-17" }
//! ```
//!
//! Outbound (server → client), the message fields are flattened next to the
//! type tag and a server timestamp:
//! ```text
//! { "type": "ack", "messageId": "m-17", "operationId": "…", "version": 42,
//!   "duplicate": false, "timestamp": 1700000000005 }
//! ```

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use mindweave_core::{Document, Mutation, MutationKind, NodePatch, Position, StylePatch};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::VectorClock;
use crate::error::{ErrorCode, SyncError};

/// Encoded outbound frame, shared by every recipient of a broadcast.
pub type Frame = Arc<str>;

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Identity supplied by the authentication collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub participant_id: String,
    pub display_name: String,
}

impl ParticipantInfo {
    pub fn new(participant_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub position: Option<Position>,
}

/// A session as seen by other participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub session_id: Uuid,
    pub participant_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// An accepted, immutable operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: Uuid,
    #[serde(flatten)]
    pub mutation: Mutation,
    pub target_node_id: String,
    pub origin_session_id: Uuid,
    pub server_timestamp: u64,
    pub document_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<VectorClock>,
}

impl Operation {
    pub fn kind(&self) -> MutationKind {
        self.mutation.kind()
    }
}

/// An edit as submitted, before the pipeline assigns version and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    /// Client-chosen id; replays of the same id are idempotent.
    pub operation_id: Option<Uuid>,
    pub mutation: Mutation,
    pub clock: Option<VectorClock>,
}

impl OperationRequest {
    pub fn new(mutation: Mutation) -> Self {
        Self {
            operation_id: None,
            mutation,
            clock: None,
        }
    }
}

// ── Inbound ──────────────────────────────────────────────

/// Raw inbound envelope. `data` is decoded per `type` by
/// [`ClientMessage::from_envelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateData {
    pub parent_id: String,
    /// Generated by the server when absent.
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub style: StylePatch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<VectorClock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateData {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<StylePatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<VectorClock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteData {
    pub node_id: String,
    #[serde(default)]
    pub preserve_children: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<VectorClock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveData {
    pub node_id: String,
    #[serde(default)]
    pub new_parent_id: Option<String>,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<VectorClock>,
}

/// Decoded inbound message. The single dispatch point on both ends is a
/// `match` over this enum.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    NodeCreate(CreateData),
    NodeUpdate(UpdateData),
    NodeDelete(DeleteData),
    NodeMove(MoveData),
    CursorUpdate(Cursor),
    Heartbeat,
    ForceSync,
}

impl ClientMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::NodeCreate(_) => "node_create",
            Self::NodeUpdate(_) => "node_update",
            Self::NodeDelete(_) => "node_delete",
            Self::NodeMove(_) => "node_move",
            Self::CursorUpdate(_) => "cursor_update",
            Self::Heartbeat => "heartbeat",
            Self::ForceSync => "force_sync",
        }
    }

    pub fn from_envelope(envelope: ClientEnvelope) -> Result<Self, SyncError> {
        fn data<T: serde::de::DeserializeOwned>(kind: &str, value: serde_json::Value) -> Result<T, SyncError> {
            serde_json::from_value(value).map_err(|e| SyncError::Validation(format!("{kind}: {e}")))
        }

        let kind = envelope.kind.as_str();
        match kind {
            "node_create" => Ok(Self::NodeCreate(data(kind, envelope.data)?)),
            "node_update" => Ok(Self::NodeUpdate(data(kind, envelope.data)?)),
            "node_delete" => Ok(Self::NodeDelete(data(kind, envelope.data)?)),
            "node_move" => Ok(Self::NodeMove(data(kind, envelope.data)?)),
            "cursor_update" => Ok(Self::CursorUpdate(data(kind, envelope.data)?)),
            "heartbeat" => Ok(Self::Heartbeat),
            "force_sync" => Ok(Self::ForceSync),
            other => Err(SyncError::Validation(format!("unknown message type `{other}`"))),
        }
    }

    pub fn into_envelope(
        self,
        client_id: impl Into<String>,
        message_id: Option<String>,
    ) -> Result<ClientEnvelope, serde_json::Error> {
        let kind = self.type_name().to_string();
        let data = match self {
            Self::NodeCreate(d) => serde_json::to_value(d)?,
            Self::NodeUpdate(d) => serde_json::to_value(d)?,
            Self::NodeDelete(d) => serde_json::to_value(d)?,
            Self::NodeMove(d) => serde_json::to_value(d)?,
            Self::CursorUpdate(c) => serde_json::to_value(c)?,
            Self::Heartbeat | Self::ForceSync => serde_json::Value::Null,
        };
        Ok(ClientEnvelope {
            kind,
            data,
            client_id: client_id.into(),
            timestamp: unix_millis(),
            message_id,
        })
    }

    /// Wrap a mutation as an edit message.
    pub fn edit(mutation: Mutation, operation_id: Option<Uuid>, clock: Option<VectorClock>) -> Self {
        match mutation {
            Mutation::Create {
                parent_id,
                node_id,
                text,
                position,
                style,
            } => Self::NodeCreate(CreateData {
                parent_id,
                node_id: Some(node_id),
                text,
                position,
                style,
                operation_id,
                clock,
            }),
            Mutation::Update { node_id, patch } => Self::NodeUpdate(UpdateData {
                node_id,
                text: patch.text,
                position: patch.position,
                style: patch.style,
                operation_id,
                clock,
            }),
            Mutation::Delete {
                node_id,
                preserve_children,
            } => Self::NodeDelete(DeleteData {
                node_id,
                preserve_children,
                operation_id,
                clock,
            }),
            Mutation::Move {
                node_id,
                new_parent_id,
                position,
            } => Self::NodeMove(MoveData {
                node_id,
                new_parent_id,
                position,
                operation_id,
                clock,
            }),
        }
    }

    /// The edit carried by this message, if any.
    pub fn into_request(self) -> Option<OperationRequest> {
        let (mutation, operation_id, clock) = match self {
            Self::NodeCreate(d) => (
                Mutation::Create {
                    parent_id: d.parent_id,
                    node_id: d.node_id.unwrap_or_else(mindweave_core::Node::generate_id),
                    text: d.text,
                    position: d.position,
                    style: d.style,
                },
                d.operation_id,
                d.clock,
            ),
            Self::NodeUpdate(d) => (
                Mutation::Update {
                    node_id: d.node_id,
                    patch: NodePatch {
                        text: d.text,
                        position: d.position,
                        style: d.style,
                    },
                },
                d.operation_id,
                d.clock,
            ),
            Self::NodeDelete(d) => (
                Mutation::Delete {
                    node_id: d.node_id,
                    preserve_children: d.preserve_children,
                },
                d.operation_id,
                d.clock,
            ),
            Self::NodeMove(d) => (
                Mutation::Move {
                    node_id: d.node_id,
                    new_parent_id: d.new_parent_id,
                    position: d.position,
                },
                d.operation_id,
                d.clock,
            ),
            Self::CursorUpdate(_) | Self::Heartbeat | Self::ForceSync => return None,
        };
        Some(OperationRequest {
            operation_id,
            mutation,
            clock,
        })
    }
}

// ── Outbound ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// An operation accepted from another session.
    Operation(Arc<Operation>),
    #[serde(rename_all = "camelCase")]
    CursorUpdate {
        session_id: Uuid,
        participant_id: String,
        cursor: Cursor,
    },
    UserJoined(ParticipantView),
    #[serde(rename_all = "camelCase")]
    UserLeft {
        session_id: Uuid,
        participant_id: String,
    },
    #[serde(rename_all = "camelCase")]
    InitialData {
        document: Document,
        version: u64,
        session_id: Uuid,
        participants: Vec<ParticipantView>,
        #[serde(default)]
        clock: VectorClock,
    },
    /// Sent to the submitter only.
    #[serde(rename_all = "camelCase")]
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        operation_id: Uuid,
        version: u64,
        #[serde(default)]
        duplicate: bool,
    },
    /// Sent to the submitter only.
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        conflicts: Vec<Arc<Operation>>,
    },
    Heartbeat,
}

#[derive(Serialize)]
struct OutboundRef<'a> {
    #[serde(flatten)]
    message: &'a ServerMessage,
    timestamp: u64,
}

impl ServerMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Operation(_) => "operation",
            Self::CursorUpdate { .. } => "cursor_update",
            Self::UserJoined(_) => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::InitialData { .. } => "initial_data",
            Self::Ack { .. } => "ack",
            Self::Error { .. } => "error",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Error frame for a failure on an open connection.
    pub fn error(message_id: Option<String>, err: &SyncError) -> Self {
        let conflicts = match err {
            SyncError::Conflict(report) => report.conflicting.clone(),
            _ => Vec::new(),
        };
        Self::Error {
            message_id,
            code: err.code(),
            message: err.to_string(),
            conflicts,
        }
    }

    /// Encode once; the resulting frame is shared across recipients.
    pub fn encode(&self) -> Result<Frame, serde_json::Error> {
        let text = serde_json::to_string(&OutboundRef {
            message: self,
            timestamp: unix_millis(),
        })?;
        Ok(Arc::from(text))
    }
}

/// Decoded outbound frame (client side).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    #[serde(flatten)]
    pub message: ServerMessage,
    #[serde(default)]
    pub timestamp: u64,
}

impl OutboundFrame {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
