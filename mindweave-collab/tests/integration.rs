//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use mindweave_collab::client::{ClientConfig, Delivery, SyncClient, SyncEvent};
use mindweave_collab::config::Config;
use mindweave_collab::error::ErrorCode;
use mindweave_collab::protocol::{ClientMessage, OutboundFrame, ServerMessage};
use mindweave_collab::reconnect::ConnectionState;
use mindweave_collab::room::RoomManager;
use mindweave_collab::server::SyncServer;
use mindweave_collab::storage::MemoryStore;
use mindweave_collab::StaticTokens;
use mindweave_core::{Mutation, NodePatch, ROOT_ID};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    port: u16,
    rooms: Arc<RoomManager>,
}

fn tokens() -> StaticTokens {
    StaticTokens::new()
        .with_token("alice-token", "alice", "Alice")
        .with_token("bob-token", "bob", "Bob")
}

/// Start a server on a free port.
async fn start_test_server(config: Config) -> TestServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = SyncServer::new(config, Arc::new(MemoryStore::new()), Arc::new(tokens()));
    let rooms = server.rooms().clone();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    TestServer { port, rooms }
}

async fn connect_raw(port: u16, doc: &str, token: &str) -> Ws {
    let url = format!("ws://127.0.0.1:{port}/docs/{doc}?token={token}");
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn next_message(ws: &mut Ws) -> ServerMessage {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no message within timeout")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            return OutboundFrame::decode(text.as_str()).unwrap().message;
        }
    }
}

async fn send(ws: &mut Ws, message: ClientMessage, message_id: &str) {
    let envelope = message.into_envelope("test", Some(message_id.to_string())).unwrap();
    let text = serde_json::to_string(&envelope).unwrap();
    ws.send(Message::text(text)).await.unwrap();
}

async fn raw_http(port: u16, request: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8(response).unwrap()
}

async fn wait_for<F>(events: &mut tokio::sync::mpsc::Receiver<SyncEvent>, mut pred: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no event within timeout")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn test_join_receives_initial_data_and_presence() {
    let server = start_test_server(Config::default()).await;

    let mut alice = connect_raw(server.port, "map", "alice-token").await;
    let alice_session = match next_message(&mut alice).await {
        ServerMessage::InitialData {
            version,
            participants,
            session_id,
            document,
            ..
        } => {
            assert_eq!(version, 0);
            assert_eq!(participants.len(), 1);
            assert_eq!(document.root_id(), ROOT_ID);
            session_id
        }
        other => panic!("expected initial_data, got {other:?}"),
    };

    let mut bob = connect_raw(server.port, "map", "bob-token").await;
    match next_message(&mut bob).await {
        ServerMessage::InitialData { participants, .. } => {
            assert_eq!(participants.len(), 2);
            assert!(participants.iter().any(|p| p.session_id == alice_session));
        }
        other => panic!("expected initial_data, got {other:?}"),
    }
    match next_message(&mut alice).await {
        ServerMessage::UserJoined(view) => assert_eq!(view.participant_id, "bob"),
        other => panic!("expected user_joined, got {other:?}"),
    }

    bob.close(None).await.unwrap();
    match next_message(&mut alice).await {
        ServerMessage::UserLeft { participant_id, .. } => assert_eq!(participant_id, "bob"),
        other => panic!("expected user_left, got {other:?}"),
    }
}

#[tokio::test]
async fn test_edit_acknowledged_and_broadcast() {
    let server = start_test_server(Config::default()).await;
    let mut alice = connect_raw(server.port, "map", "alice-token").await;
    let _ = next_message(&mut alice).await;
    let mut bob = connect_raw(server.port, "map", "bob-token").await;
    let _ = next_message(&mut bob).await;
    let _ = next_message(&mut alice).await; // bob joined

    let create = ClientMessage::edit(Mutation::create(ROOT_ID, "idea", "Idea"), None, None);
    send(&mut alice, create, "a-1").await;

    match next_message(&mut alice).await {
        ServerMessage::Ack {
            message_id, version, ..
        } => {
            assert_eq!(message_id.as_deref(), Some("a-1"));
            assert_eq!(version, 1);
        }
        other => panic!("expected ack, got {other:?}"),
    }
    match next_message(&mut bob).await {
        ServerMessage::Operation(op) => {
            assert_eq!(op.target_node_id, "idea");
            assert_eq!(op.document_version, 1);
        }
        other => panic!("expected operation, got {other:?}"),
    }
}

#[tokio::test]
async fn test_concurrent_updates_conflict() {
    let mut config = Config::default();
    config.room.conflict_threshold_ms = 200;
    let server = start_test_server(config).await;

    let mut alice = connect_raw(server.port, "map", "alice-token").await;
    let _ = next_message(&mut alice).await;
    let mut bob = connect_raw(server.port, "map", "bob-token").await;
    let _ = next_message(&mut bob).await;
    let _ = next_message(&mut alice).await;

    send(&mut alice, ClientMessage::edit(Mutation::create(ROOT_ID, "x", "x"), None, None), "a-1").await;
    let _ = next_message(&mut alice).await;
    let _ = next_message(&mut bob).await;
    // Let the create leave the conflict window.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let update = |text: &str| ClientMessage::edit(Mutation::update("x", NodePatch::text(text)), None, None);
    send(&mut alice, update("alice"), "a-2").await;
    match next_message(&mut alice).await {
        ServerMessage::Ack { version, .. } => assert_eq!(version, 2),
        other => panic!("expected ack, got {other:?}"),
    }
    send(&mut bob, update("bob"), "b-1").await;

    // Bob sees alice's update, then his own rejection.
    match next_message(&mut bob).await {
        ServerMessage::Operation(op) => assert_eq!(op.document_version, 2),
        other => panic!("expected operation, got {other:?}"),
    }
    match next_message(&mut bob).await {
        ServerMessage::Error {
            message_id,
            code,
            conflicts,
            ..
        } => {
            assert_eq!(message_id.as_deref(), Some("b-1"));
            assert_eq!(code, ErrorCode::Conflict);
            assert_eq!(conflicts[0].target_node_id, "x");
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    let room = server.rooms.get("map").await.unwrap();
    let snapshot = room.inspect().await.unwrap();
    assert_eq!(snapshot.version, 2);
    assert_eq!(snapshot.document.find("x").unwrap().text, "alice");
}

#[tokio::test]
async fn test_malformed_message_gets_validation_error() {
    let server = start_test_server(Config::default()).await;
    let mut alice = connect_raw(server.port, "map", "alice-token").await;
    let _ = next_message(&mut alice).await;

    alice
        .send(Message::text(r#"{"type":"node_teleport","data":{},"messageId":"m-1"}"#.to_string()))
        .await
        .unwrap();
    match next_message(&mut alice).await {
        ServerMessage::Error { message_id, code, .. } => {
            assert_eq!(message_id.as_deref(), Some("m-1"));
            assert_eq!(code, ErrorCode::Validation);
        }
        other => panic!("expected validation error, got {other:?}"),
    }

    // The connection survives and still answers.
    send(&mut alice, ClientMessage::Heartbeat, "m-2").await;
    assert_eq!(next_message(&mut alice).await, ServerMessage::Heartbeat);
}

#[tokio::test]
async fn test_upgrade_rejections() {
    let server = start_test_server(Config::default()).await;
    let upgrade = "Connection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n";

    let plain = raw_http(server.port, "GET /docs/map?token=alice-token HTTP/1.1\r\nHost: test\r\n\r\n").await;
    assert!(plain.starts_with("HTTP/1.1 426"), "{plain}");

    let no_doc = raw_http(server.port, &format!("GET /?token=alice-token HTTP/1.1\r\nHost: test\r\n{upgrade}\r\n")).await;
    assert!(no_doc.starts_with("HTTP/1.1 400"), "{no_doc}");

    let bad_token = raw_http(server.port, &format!("GET /docs/map?token=nope HTTP/1.1\r\nHost: test\r\n{upgrade}\r\n")).await;
    assert!(bad_token.starts_with("HTTP/1.1 401"), "{bad_token}");

    let no_token = raw_http(server.port, &format!("GET /docs/map HTTP/1.1\r\nHost: test\r\n{upgrade}\r\n")).await;
    assert!(no_token.starts_with("HTTP/1.1 401"), "{no_token}");

    assert_eq!(server.rooms.room_count().await, 0);
}

#[tokio::test]
async fn test_sync_clients_round_trip() {
    let server = start_test_server(Config::default()).await;
    let url = format!("ws://127.0.0.1:{}/docs", server.port);

    let mut alice = SyncClient::new(ClientConfig::new(&url, "map", "alice-token", "alice"));
    let mut alice_events = alice.take_event_rx().unwrap();
    let mut bob = SyncClient::new(ClientConfig::new(&url, "map", "bob-token", "bob"));
    let mut bob_events = bob.take_event_rx().unwrap();

    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    assert_eq!(alice.connection_state().await, ConnectionState::Connected);
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::ParticipantJoined(_))).await;

    let delivery = alice
        .send_operation(Mutation::create(ROOT_ID, "shared", "Shared"))
        .await
        .unwrap();
    let Delivery::Sent(pending) = delivery else {
        panic!("expected a live send");
    };
    let operation_id = pending.operation_id();
    let outcome = pending.wait().await.unwrap();
    assert_eq!(outcome.operation_id, operation_id);
    assert_eq!(outcome.version, 1);

    match wait_for(&mut bob_events, |e| matches!(e, SyncEvent::RemoteOperation(_))).await {
        SyncEvent::RemoteOperation(op) => {
            assert_eq!(op.id, operation_id);
            assert_eq!(op.clock.as_ref().map(|c| c.get("alice")), Some(1));
        }
        _ => unreachable!(),
    }
    // Bob's clock has absorbed alice's tick.
    assert_eq!(bob.clock().await.get("alice"), 1);

    // A rejected edit resolves the wait with the server's error.
    let Delivery::Sent(pending) = alice
        .send_operation(Mutation::delete("missing", false))
        .await
        .unwrap()
    else {
        panic!("expected a live send");
    };
    match pending.wait().await {
        Err(mindweave_collab::ClientError::Rejected { code, .. }) => assert_eq!(code, ErrorCode::NotFound),
        other => panic!("expected rejection, got {other:?}"),
    }

    alice.disconnect().await;
    assert_eq!(alice.connection_state().await, ConnectionState::Disconnected);
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::ParticipantLeft { .. })).await;
}

#[tokio::test]
async fn test_document_survives_room_disposal() {
    let mut config = Config::default();
    config.room.disposal_grace_ms = 100;
    let server = start_test_server(config).await;

    let mut alice = connect_raw(server.port, "map", "alice-token").await;
    let _ = next_message(&mut alice).await;
    send(&mut alice, ClientMessage::edit(Mutation::create(ROOT_ID, "keep", "Keep"), None, None), "a-1").await;
    let _ = next_message(&mut alice).await;
    alice.close(None).await.unwrap();

    let mut disposed = false;
    for _ in 0..100 {
        if server.rooms.room_count().await == 0 {
            disposed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(disposed, "room was not disposed");

    let mut bob = connect_raw(server.port, "map", "bob-token").await;
    match next_message(&mut bob).await {
        ServerMessage::InitialData { document, version, .. } => {
            assert_eq!(version, 1);
            assert!(document.contains("keep"));
        }
        other => panic!("expected initial_data, got {other:?}"),
    }
}
