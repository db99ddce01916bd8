//! Upgrade request validation, run inside the WebSocket handshake.
//!
//! [`validate`] is called from the `accept_hdr_async` callback once
//! tungstenite has parsed the request head. A request tungstenite itself
//! refuses never reaches the callback, so the server answers those from
//! [`handshake_failure`].
//!
//! | Check | Status |
//! |-------|--------|
//! | no `Upgrade: websocket` / `Connection: Upgrade` | 426 |
//! | no document id in the path | 400 |
//! | missing or unknown credential | 401 |

use http::{header, HeaderValue, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::handshake::server::{write_response, ErrorResponse, Request};
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::auth::Authenticator;
use crate::error::SyncError;
use crate::protocol::ParticipantInfo;

/// A validated upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub document_id: String,
    pub participant: ParticipantInfo,
}

pub fn validate(request: &Request, auth: &dyn Authenticator) -> Result<UpgradeRequest, SyncError> {
    let target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = url::Url::parse(&format!("http://localhost{target}"))
        .map_err(|e| SyncError::BadRequest(format!("invalid request target: {e}")))?;

    let document_id = url
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .ok_or_else(|| SyncError::BadRequest("missing document id".into()))?
        .to_string();

    let credential = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string)
        .or_else(|| {
            url.query_pairs()
                .find(|(k, _)| k == "token")
                .map(|(_, v)| v.into_owned())
        })
        .ok_or_else(|| SyncError::Auth("missing credential".into()))?;
    let participant = auth
        .authenticate(&credential)
        .ok_or_else(|| SyncError::Auth("invalid credential".into()))?;

    Ok(UpgradeRequest {
        document_id,
        participant,
    })
}

fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
}

/// The error a failed tungstenite handshake maps to. `None` when the peer
/// is gone or the failure was already answered by the callback.
pub fn handshake_failure(err: &WsError) -> Option<SyncError> {
    match err {
        WsError::Protocol(ProtocolError::MissingConnectionUpgradeHeader)
        | WsError::Protocol(ProtocolError::MissingUpgradeWebSocketHeader) => Some(SyncError::UpgradeRequired),
        WsError::Protocol(e) => Some(SyncError::BadRequest(e.to_string())),
        WsError::HttpFormat(e) => Some(SyncError::BadRequest(e.to_string())),
        _ => None,
    }
}

/// Reply sent back through the callback for a refused request.
pub fn error_response(err: &SyncError) -> ErrorResponse {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::BAD_REQUEST);
    let body = err.to_string();
    let mut response = ErrorResponse::new(Some(body.clone()));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    if status == StatusCode::UPGRADE_REQUIRED {
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    }
    response
}

/// Answer a request that never reached the callback and close the socket.
pub async fn reject(stream: &mut TcpStream, err: &SyncError) -> Result<(), SyncError> {
    let response = error_response(err);
    let mut bytes = Vec::new();
    write_response(&mut bytes, &response)?;
    if let Some(body) = response.body() {
        bytes.extend_from_slice(body.as_bytes());
    }
    stream.write_all(&bytes).await?;
    stream.shutdown().await?;
    Ok(())
}
