// tests/integration/bridge_test.rs

//! End-to-end tests: a WebSocket client talking to `connection::serve` over an
//! in-memory duplex stream.

use super::test_helpers::{BackboneCall, RecordingConnector, init_tracing};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{DuplexStream, duplex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use topicbridge::BridgeError;
use topicbridge::config::Config;
use topicbridge::connection;
use topicbridge::core::state::BridgeState;

type Client = WebSocketStream<DuplexStream>;

const INIT_ACK: &str = r#"{"action":"init","type":"response","data":"success"}"#;

struct Bridge {
    client: Client,
    server: JoinHandle<Result<(), BridgeError>>,
    shutdown_tx: broadcast::Sender<()>,
}

async fn connect(state: Arc<BridgeState>, port: u16) -> Bridge {
    init_tracing();
    let (client_io, server_io) = duplex(64 * 1024);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let server = tokio::spawn(connection::serve(server_io, addr, state, shutdown_rx));

    let (client, _response) = tokio_tungstenite::client_async("ws://localhost/", client_io)
        .await
        .expect("WebSocket handshake failed");
    Bridge {
        client,
        server,
        shutdown_tx,
    }
}

fn recording_state(config: Config) -> (Arc<BridgeState>, Arc<RecordingConnector>) {
    let connector = RecordingConnector::new();
    let state = BridgeState::with_connector(config, connector.clone());
    (state, connector)
}

async fn send_text(client: &mut Client, text: &str) {
    client
        .send(Message::Text(text.to_string().into()))
        .await
        .unwrap();
}

async fn recv(client: &mut Client) -> Message {
    timeout(Duration::from_secs(2), client.next())
        .await
        .expect("timed out waiting for a message")
        .expect("stream ended")
        .expect("WebSocket error")
}

async fn recv_text(client: &mut Client) -> String {
    match recv(client).await {
        Message::Text(text) => text.to_string(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

/// Polls until `check` holds or a second has passed.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_init_then_passthrough_publish() {
    let (state, connector) = recording_state(Config::default());
    let mut bridge = connect(state.clone(), 40001).await;

    send_text(&mut bridge.client, r#"{"action":"init","data":"priv/42"}"#).await;
    assert_eq!(recv_text(&mut bridge.client).await, INIT_ACK);

    send_text(&mut bridge.client, r#""hello""#).await;
    send_text(
        &mut bridge.client,
        r#"{"action":"publish","topic":"room/1","data":"hi"}"#,
    )
    .await;
    send_text(&mut bridge.client, r#"{"action":"start"}"#).await;

    let handle = connector.handles().remove(0);
    eventually(|| handle.publishes().len() == 3).await;
    assert_eq!(
        handle.calls(),
        vec![
            BackboneCall::subscribe("priv/42"),
            BackboneCall::publish("priv/42", r#""hello""#),
            BackboneCall::publish("room/1", "hi"),
            BackboneCall::publish("/system", r#"{"action":"start"}"#),
        ]
    );

    let sessions = state.registry.snapshot();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].private_topic.as_deref(), Some("priv/42"));
}

#[tokio::test]
async fn test_disconnect_releases_adapter_once() {
    let (state, connector) = recording_state(Config::default());
    let mut bridge = connect(state.clone(), 40002).await;

    send_text(&mut bridge.client, r#"{"action":"init","data":"priv/1"}"#).await;
    assert_eq!(recv_text(&mut bridge.client).await, INIT_ACK);

    bridge.client.close(None).await.unwrap();
    bridge.server.await.unwrap().unwrap();

    let handle = connector.handles().remove(0);
    assert_eq!(handle.close_count(), 1);
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_dropped_connection_still_tears_down() {
    let (state, connector) = recording_state(Config::default());
    let bridge = connect(state.clone(), 40003).await;
    eventually(|| connector.handles().len() == 1).await;

    drop(bridge.client);
    let _ = bridge.server.await.unwrap();

    assert_eq!(connector.handles()[0].close_count(), 1);
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_backbone_messages_are_delivered() {
    let (state, connector) = recording_state(Config::default());
    let mut bridge = connect(state, 40004).await;

    send_text(&mut bridge.client, r#"{"action":"init","data":"priv/7"}"#).await;
    assert_eq!(recv_text(&mut bridge.client).await, INIT_ACK);

    connector.handles()[0].deliver("priv/7", r#"{"reply":true}"#);

    let frame: Value = serde_json::from_str(&recv_text(&mut bridge.client).await).unwrap();
    assert_eq!(frame["topic"], "priv/7");
    assert_eq!(frame["payload"], r#"{"reply":true}"#);
}

#[tokio::test]
async fn test_malformed_frame_is_silently_dropped_by_default() {
    let (state, connector) = recording_state(Config::default());
    let mut bridge = connect(state, 40005).await;

    send_text(&mut bridge.client, "not json").await;
    send_text(&mut bridge.client, r#"{"action":"init","data":"priv/9"}"#).await;

    // The first thing the client hears about is the init.
    assert_eq!(recv_text(&mut bridge.client).await, INIT_ACK);
    assert_eq!(
        connector.handles()[0].calls(),
        vec![BackboneCall::subscribe("priv/9")]
    );
}

#[tokio::test]
async fn test_error_replies_when_enabled() {
    let mut config = Config::default();
    config.session.error_replies = true;
    let (state, _connector) = recording_state(config);
    let mut bridge = connect(state, 40006).await;

    send_text(&mut bridge.client, r#"{"no":"init yet"}"#).await;

    let frame: Value = serde_json::from_str(&recv_text(&mut bridge.client).await).unwrap();
    assert_eq!(frame["type"], "error");
    assert!(frame["data"].as_str().unwrap().contains("init"));
}

#[tokio::test]
async fn test_binary_frames_are_decoded_as_text() {
    let (state, connector) = recording_state(Config::default());
    let mut bridge = connect(state, 40007).await;

    bridge
        .client
        .send(Message::Binary(
            br#"{"action":"publish","topic":"bin","data":"ok"}"#.to_vec().into(),
        ))
        .await
        .unwrap();

    eventually(|| {
        connector
            .handles()
            .first()
            .is_some_and(|h| h.publishes() == vec![("bin".to_string(), "ok".to_string())])
    })
    .await;
}

#[tokio::test]
async fn test_backbone_unavailable_closes_connection() {
    let (state, connector) = recording_state(Config::default());
    connector.set_unavailable(true);
    let mut bridge = connect(state.clone(), 40008).await;

    match recv(&mut bridge.client).await {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Error),
        other => panic!("expected a close frame, got {other:?}"),
    }
    let result = bridge.server.await.unwrap();
    assert!(matches!(result, Err(BridgeError::BackboneUnavailable(_))));
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_shutdown_closes_session_with_going_away() {
    let (state, connector) = recording_state(Config::default());
    let mut bridge = connect(state.clone(), 40009).await;
    eventually(|| connector.handles().len() == 1).await;

    bridge.shutdown_tx.send(()).unwrap();

    match recv(&mut bridge.client).await {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
        other => panic!("expected a close frame, got {other:?}"),
    }
    // Let the closing handshake finish.
    let _ = bridge.client.close(None).await;
    bridge.server.await.unwrap().unwrap();
    assert_eq!(connector.handles()[0].close_count(), 1);
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_two_clients_over_local_backbone() {
    let state = BridgeState::initialize(Config::default());
    let mut alice = connect(state.clone(), 40010).await;
    let mut bob = connect(state.clone(), 40011).await;

    send_text(&mut alice.client, r#"{"action":"init","data":"priv/alice"}"#).await;
    assert_eq!(recv_text(&mut alice.client).await, INIT_ACK);

    send_text(
        &mut bob.client,
        r#"{"action":"publish","topic":"priv/alice","data":{"from":"bob"}}"#,
    )
    .await;

    let frame: Value = serde_json::from_str(&recv_text(&mut alice.client).await).unwrap();
    assert_eq!(frame["topic"], "priv/alice");
    assert_eq!(frame["payload"], r#"{"from":"bob"}"#);
    assert_eq!(state.registry.len(), 2);
}

#[tokio::test]
async fn test_client_frames_are_not_starved_by_deliveries() {
    const BACKLOG: usize = 2000;
    let (state, connector) = recording_state(Config::default());
    let mut bridge = connect(state, 40012).await;

    send_text(&mut bridge.client, r#"{"action":"init","data":"priv/busy"}"#).await;
    assert_eq!(recv_text(&mut bridge.client).await, INIT_ACK);

    let handle = connector.handles().remove(0);
    for n in 0..BACKLOG {
        handle.deliver("priv/busy", &n.to_string());
    }
    send_text(
        &mut bridge.client,
        r#"{"action":"publish","topic":"room/1","data":"urgent"}"#,
    )
    .await;

    let mut published_after = None;
    for received in 0..BACKLOG {
        let frame: Value = serde_json::from_str(&recv_text(&mut bridge.client).await).unwrap();
        assert_eq!(frame["payload"], received.to_string());
        if published_after.is_none() && !handle.publishes().is_empty() {
            published_after = Some(received);
        }
    }

    let published_after = published_after.expect("client frame waited for the whole backlog");
    assert!(published_after < BACKLOG / 2, "published after {published_after} deliveries");
    assert_eq!(
        handle.publishes(),
        vec![("room/1".to_string(), "urgent".to_string())]
    );
}
