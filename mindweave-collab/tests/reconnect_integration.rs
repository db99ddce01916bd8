//! Reconnection tests against a scripted server that drops connections.

use futures_util::{SinkExt, StreamExt};
use mindweave_collab::client::{ClientConfig, Delivery, SyncClient, SyncEvent};
use mindweave_collab::clock::VectorClock;
use mindweave_collab::protocol::{ClientEnvelope, ServerMessage};
use mindweave_collab::reconnect::{ClientError, ConnectionState, ReconnectPolicy};
use mindweave_core::{Document, Mutation, ROOT_ID};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Received envelope, tagged with the index of the connection it came on.
type Received = (usize, ClientEnvelope);

struct FakeServer {
    port: u16,
    received: mpsc::UnboundedReceiver<Received>,
}

/// Accepts `max_connections` connections, then stops listening. The first
/// connection is dropped after `drop_first_after` text messages.
async fn fake_server(max_connections: usize, drop_first_after: Option<usize>) -> FakeServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, received) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        for index in 0..max_connections {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            let limit = if index == 0 { drop_first_after } else { None };
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let hello = ServerMessage::InitialData {
                    document: Document::default(),
                    version: 0,
                    session_id: Uuid::new_v4(),
                    participants: Vec::new(),
                    clock: VectorClock::new(),
                }
                .encode()
                .unwrap();
                ws.send(Message::text(hello.to_string())).await.unwrap();
                if limit == Some(0) {
                    return;
                }

                let mut seen = 0;
                while let Some(Ok(msg)) = ws.next().await {
                    if let Message::Text(text) = msg {
                        let envelope: ClientEnvelope = serde_json::from_str(text.as_str()).unwrap();
                        let _ = tx.send((index, envelope));
                        seen += 1;
                        if Some(seen) == limit {
                            return;
                        }
                    }
                }
            });
        }
    });

    FakeServer { port, received }
}

fn config(port: u16, reconnect: ReconnectPolicy) -> ClientConfig {
    let mut config = ClientConfig::new(format!("ws://127.0.0.1:{port}/docs"), "map", "token", "alice");
    config.reconnect = reconnect;
    config
}

async fn wait_for<F>(events: &mut mpsc::Receiver<SyncEvent>, mut pred: F) -> SyncEvent
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

async fn next_edit(received: &mut mpsc::UnboundedReceiver<Received>) -> (usize, String) {
    loop {
        let (index, envelope) = timeout(Duration::from_secs(5), received.recv())
            .await
            .expect("nothing received within timeout")
            .expect("server gone");
        if envelope.kind.starts_with("node_") {
            return (index, envelope.data["nodeId"].as_str().unwrap_or_default().to_string());
        }
    }
}

#[tokio::test]
async fn test_buffered_edits_flush_before_live_traffic() {
    let mut server = fake_server(2, Some(1)).await;
    let policy = ReconnectPolicy {
        base_delay: Duration::from_millis(300),
        ..ReconnectPolicy::default()
    };
    let mut client = SyncClient::new(config(server.port, policy));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    // The server drops the connection after the first edit.
    let first = client.send_operation(Mutation::create(ROOT_ID, "a", "A")).await.unwrap();
    assert!(matches!(first, Delivery::Sent(_)));
    assert_eq!(next_edit(&mut server.received).await, (0, "a".to_string()));

    match wait_for(&mut events, |e| matches!(e, SyncEvent::Reconnecting { .. })).await {
        SyncEvent::Reconnecting { attempt, delay } => {
            assert_eq!(attempt, 1);
            assert_eq!(delay, Duration::from_millis(300));
        }
        _ => unreachable!(),
    }
    assert_eq!(client.connection_state().await, ConnectionState::Reconnecting);

    for node in ["b", "c"] {
        let delivery = client.send_operation(Mutation::create(ROOT_ID, node, node)).await.unwrap();
        assert!(matches!(delivery, Delivery::Queued { .. }));
    }
    assert_eq!(client.offline_buffer_len().await, 2);

    wait_for(&mut events, |e| matches!(e, SyncEvent::Connected { .. })).await;
    assert_eq!(client.offline_buffer_len().await, 0);
    let live = client.send_operation(Mutation::create(ROOT_ID, "d", "D")).await.unwrap();
    assert!(matches!(live, Delivery::Sent(_)));

    let mut order = Vec::new();
    for _ in 0..3 {
        let (index, node) = next_edit(&mut server.received).await;
        assert_eq!(index, 1);
        order.push(node);
    }
    assert_eq!(order, vec!["b", "c", "d"]);
    client.disconnect().await;
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let server = fake_server(1, Some(0)).await;
    let policy = ReconnectPolicy {
        base_delay: Duration::from_millis(10),
        max_attempts: 3,
        ..ReconnectPolicy::default()
    };
    let mut client = SyncClient::new(config(server.port, policy));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    let mut attempts = Vec::new();
    loop {
        match wait_for(&mut events, |e| {
            matches!(e, SyncEvent::Reconnecting { .. } | SyncEvent::ConnectionFailed { .. })
        })
        .await
        {
            SyncEvent::Reconnecting { attempt, delay } => attempts.push((attempt, delay.as_millis())),
            SyncEvent::ConnectionFailed { attempts: n } => {
                assert_eq!(n, 3);
                break;
            }
            _ => unreachable!(),
        }
    }
    assert_eq!(attempts, vec![(1, 10), (2, 20), (3, 40)]);

    // Terminal: no further attempts, edits are buffered.
    for _ in 0..50 {
        if client.connection_state().await == ConnectionState::Disconnected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    let delivery = client.send_operation(Mutation::create(ROOT_ID, "x", "x")).await.unwrap();
    assert!(matches!(delivery, Delivery::Queued { .. }));
}

#[tokio::test]
async fn test_ack_timeout() {
    let server = fake_server(1, None).await;
    let mut config = config(server.port, ReconnectPolicy::default());
    config.ack_timeout = Duration::from_millis(200);
    let client = SyncClient::new(config);
    client.connect().await.unwrap();

    let Delivery::Sent(pending) = client.send_operation(Mutation::create(ROOT_ID, "a", "A")).await.unwrap() else {
        panic!("expected a live send");
    };
    assert_eq!(pending.wait().await, Err(ClientError::Timeout(Duration::from_millis(200))));
    client.disconnect().await;
}

#[tokio::test]
async fn test_ack_deadline_counts_from_send() {
    let server = fake_server(1, None).await;
    let mut config = config(server.port, ReconnectPolicy::default());
    config.ack_timeout = Duration::from_millis(200);
    let client = SyncClient::new(config);
    client.connect().await.unwrap();

    let Delivery::Sent(pending) = client.send_operation(Mutation::create(ROOT_ID, "a", "A")).await.unwrap() else {
        panic!("expected a live send");
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The deadline has already passed, so waiting late does not extend it.
    let started = tokio::time::Instant::now();
    assert_eq!(pending.wait().await, Err(ClientError::Timeout(Duration::from_millis(200))));
    assert!(started.elapsed() < Duration::from_millis(100));
    client.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_cancels_pending_acks() {
    let server = fake_server(1, None).await;
    let mut config = config(server.port, ReconnectPolicy::default());
    config.ack_timeout = Duration::from_secs(30);
    let mut client = SyncClient::new(config);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    let Delivery::Sent(pending) = client.send_operation(Mutation::create(ROOT_ID, "a", "A")).await.unwrap() else {
        panic!("expected a live send");
    };
    let waiter = tokio::spawn(pending.wait());
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.disconnect().await;
    assert_eq!(waiter.await.unwrap(), Err(ClientError::Cancelled));
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    wait_for(&mut events, |e| matches!(e, SyncEvent::Disconnected)).await;
}

#[tokio::test]
async fn test_disconnect_cancels_reconnect() {
    let server = fake_server(1, Some(0)).await;
    let policy = ReconnectPolicy {
        base_delay: Duration::from_secs(10),
        ..ReconnectPolicy::default()
    };
    let mut client = SyncClient::new(config(server.port, policy));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    wait_for(&mut events, |e| matches!(e, SyncEvent::Reconnecting { .. })).await;
    // Returns promptly even though the backoff timer has seconds left.
    timeout(Duration::from_secs(2), client.disconnect()).await.unwrap();
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
}
