//! Error taxonomy for the sync layer and the wire error codes sent to clients.

use std::time::Duration;

use mindweave_core::TreeError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conflict::ConflictReport;
use crate::storage::StoreError;

/// `code` field of an outbound `error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    Conflict,
    NotFound,
    InvalidOperation,
    Capacity,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("malformed message: {0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(ConflictReport),
    #[error("node not found: {0}")]
    NotFound(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(TreeError),
    #[error("capacity exceeded: {0}")]
    Capacity(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("websocket upgrade required")]
    UpgradeRequired,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("room {0} is closed")]
    RoomClosed(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl From<TreeError> for SyncError {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::NodeNotFound(id) => Self::NotFound(id),
            e @ TreeError::CapacityExceeded { .. } => Self::Capacity(e.to_string()),
            other => Self::InvalidOperation(other),
        }
    }
}

impl SyncError {
    /// Wire code for errors reported to a client over an open connection.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidOperation(_) => ErrorCode::InvalidOperation,
            Self::Capacity(_) => ErrorCode::Capacity,
            _ => ErrorCode::Validation,
        }
    }

    /// HTTP status for errors raised before the WebSocket upgrade.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::UpgradeRequired => 426,
            Self::Auth(_) => 401,
            Self::Timeout(_) => 408,
            Self::RoomClosed(_) | Self::Storage(_) => 503,
            _ => 400,
        }
    }
}
