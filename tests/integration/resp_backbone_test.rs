// tests/integration/resp_backbone_test.rs

//! Runs the RESP backbone adapter against a small in-process pub/sub server.

use super::test_helpers::init_tracing;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use topicbridge::BridgeError;
use topicbridge::config::RespBackboneConfig;
use topicbridge::core::backbone::{BackboneConnector, RespConnector};
use topicbridge::core::protocol::{RespFrame, RespFrameCodec, encode};

type CommandLog = Arc<Mutex<Vec<Vec<String>>>>;

/// Commands whose first argument starts with `slow` are answered after this delay.
const SLOW_REPLY: Duration = Duration::from_millis(300);

/// A minimal Redis-like server: AUTH, PUBLISH, SUBSCRIBE, UNSUBSCRIBE.
///
/// `PUBLISH bad ...` is answered with an error reply.
struct MockServer {
    addr: SocketAddr,
    log: CommandLog,
}

impl MockServer {
    async fn start(password: Option<&'static str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log: CommandLog = Arc::default();
        let (hub, _) = broadcast::channel::<(String, Bytes)>(64);

        let task_log = log.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve_connection(
                    socket,
                    hub.clone(),
                    task_log.clone(),
                    password,
                ));
            }
        });
        Self { addr, log }
    }

    fn config(&self) -> RespBackboneConfig {
        RespBackboneConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            ..RespBackboneConfig::default()
        }
    }

    fn count(&self, command: &[&str]) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|logged| logged.iter().map(String::as_str).eq(command.iter().copied()))
            .count()
    }
}

fn args_of(frame: RespFrame) -> Vec<String> {
    match frame {
        RespFrame::Array(items) => items
            .iter()
            .filter_map(|item| item.as_bytes())
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect(),
        _ => Vec::new(),
    }
}

fn bulk(s: &str) -> RespFrame {
    RespFrame::BulkString(Bytes::from(s.to_string()))
}

async fn serve_connection(
    socket: TcpStream,
    hub: broadcast::Sender<(String, Bytes)>,
    log: CommandLog,
    password: Option<&'static str>,
) {
    let mut framed = Framed::new(socket, RespFrameCodec);
    let mut rx = hub.subscribe();
    let mut channels = HashSet::new();

    loop {
        tokio::select! {
            frame = framed.next() => {
                let Some(Ok(frame)) = frame else { break };
                let args = args_of(frame);
                log.lock().unwrap().push(args.clone());
                let name = args.first().map(|s| s.to_uppercase()).unwrap_or_default();
                if args.get(1).is_some_and(|arg| arg.starts_with("slow")) {
                    tokio::time::sleep(SLOW_REPLY).await;
                }
                let reply = match name.as_str() {
                    "AUTH" if args.get(1).map(String::as_str) == password => {
                        RespFrame::SimpleString("OK".into())
                    }
                    "AUTH" => RespFrame::Error("WRONGPASS invalid password".into()),
                    "PUBLISH" if args.get(1).map(String::as_str) == Some("bad") => {
                        RespFrame::Error("ERR rejected".into())
                    }
                    "PUBLISH" if args.len() == 3 => {
                        let receivers = hub
                            .send((args[1].clone(), Bytes::from(args[2].clone())))
                            .unwrap_or(0);
                        RespFrame::Integer(receivers as i64)
                    }
                    "SUBSCRIBE" if args.len() == 2 => {
                        channels.insert(args[1].clone());
                        RespFrame::Array(vec![
                            bulk("subscribe"),
                            bulk(&args[1]),
                            RespFrame::Integer(channels.len() as i64),
                        ])
                    }
                    "UNSUBSCRIBE" => {
                        channels.clear();
                        RespFrame::Array(vec![bulk("unsubscribe"), RespFrame::Null, RespFrame::Integer(0)])
                    }
                    _ => RespFrame::Error("ERR unknown command".into()),
                };
                if framed.send(reply).await.is_err() {
                    break;
                }
            }
            Ok((channel, payload)) = rx.recv() => {
                if channels.contains(&channel) {
                    let push = RespFrame::Array(vec![
                        bulk("message"),
                        bulk(&channel),
                        RespFrame::BulkString(payload),
                    ]);
                    if framed.send(push).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

#[tokio::test]
async fn test_publish_reaches_subscribed_adapter() {
    init_tracing();
    let server = MockServer::start(None).await;
    let connector = RespConnector::new(server.config());
    assert_eq!(connector.name(), "resp");

    let mut listener = connector.connect(1).await.unwrap();
    let mut publisher = connector.connect(2).await.unwrap();
    listener.subscribe("priv/1").await.unwrap();

    publisher
        .publish(&encode("priv/1", "hello"))
        .await
        .unwrap();

    let envelope = timeout(Duration::from_secs(2), listener.next_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.topic(), "priv/1");
    assert_eq!(envelope.payload_str(), "hello");
}

#[tokio::test]
async fn test_subscribe_twice_sends_one_command() {
    init_tracing();
    let server = MockServer::start(None).await;
    let connector = RespConnector::new(server.config());
    let mut adapter = connector.connect(1).await.unwrap();

    adapter.subscribe("room/1").await.unwrap();
    adapter.subscribe("room/1").await.unwrap();

    assert_eq!(server.count(&["SUBSCRIBE", "room/1"]), 1);
}

#[tokio::test]
async fn test_auth_is_sent_on_connect() {
    init_tracing();
    let server = MockServer::start(Some("secret")).await;
    let config = RespBackboneConfig {
        password: Some("secret".to_string()),
        ..server.config()
    };

    RespConnector::new(config).connect(1).await.unwrap();

    // One AUTH per connection: commands and subscriber.
    assert_eq!(server.count(&["AUTH", "secret"]), 2);
}

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    init_tracing();
    let server = MockServer::start(Some("secret")).await;
    let config = RespBackboneConfig {
        password: Some("guess".to_string()),
        ..server.config()
    };

    let err = RespConnector::new(config).connect(1).await.err().unwrap();
    assert!(matches!(err, BridgeError::BackboneUnavailable(ref msg) if msg.contains("WRONGPASS")));
}

#[tokio::test]
async fn test_unreachable_server_is_unavailable() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = RespBackboneConfig {
        port,
        connect_timeout: Duration::from_millis(500),
        ..RespBackboneConfig::default()
    };
    let err = RespConnector::new(config).connect(1).await.err().unwrap();
    assert!(matches!(err, BridgeError::BackboneUnavailable(_)));
}

#[tokio::test]
async fn test_close_unsubscribes_and_disables_adapter() {
    init_tracing();
    let server = MockServer::start(None).await;
    let connector = RespConnector::new(server.config());
    let mut adapter = connector.connect(1).await.unwrap();
    adapter.subscribe("priv/1").await.unwrap();

    adapter.close().await.unwrap();
    adapter.close().await.unwrap();

    let unsubscribed = async {
        while server.count(&["UNSUBSCRIBE"]) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(Duration::from_secs(2), unsubscribed).await.unwrap();

    let err = adapter.publish(&encode("priv/1", "late")).await.unwrap_err();
    assert!(matches!(err, BridgeError::Publish { .. }));
}

fn short_replies(server: &MockServer) -> RespBackboneConfig {
    RespBackboneConfig {
        reply_timeout: Duration::from_millis(100),
        ..server.config()
    }
}

fn publish_reason(result: Result<(), BridgeError>) -> String {
    match result {
        Err(BridgeError::Publish { reason, .. }) => reason,
        other => panic!("expected a publish error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_error_reply_fails_only_its_own_publish() {
    init_tracing();
    let server = MockServer::start(None).await;
    let mut adapter = RespConnector::new(short_replies(&server))
        .connect(1)
        .await
        .unwrap();

    let reason = publish_reason(adapter.publish(&encode("bad", "x")).await);
    assert!(reason.contains("ERR rejected"), "{reason}");

    adapter.publish(&encode("ok", "y")).await.unwrap();
}

#[tokio::test]
async fn test_publish_after_reply_timeout_never_sees_stale_reply() {
    init_tracing();
    let server = MockServer::start(None).await;
    let mut adapter = RespConnector::new(short_replies(&server))
        .connect(1)
        .await
        .unwrap();

    let reason = publish_reason(adapter.publish(&encode("slow", "a")).await);
    assert!(reason.contains("timed out"), "{reason}");

    // Let the late reply to the first PUBLISH land on the connection.
    tokio::time::sleep(SLOW_REPLY).await;

    let reason = publish_reason(adapter.publish(&encode("bad", "b")).await);
    assert_eq!(reason, "command connection lost");
    let reason = publish_reason(adapter.publish(&encode("ok", "c")).await);
    assert_eq!(reason, "command connection lost");

    // Nothing after the timed-out command reached the server.
    assert_eq!(server.count(&["PUBLISH", "bad", "b"]), 0);
    assert_eq!(server.count(&["PUBLISH", "ok", "c"]), 0);
}

#[tokio::test]
async fn test_subscribe_timeout_ends_message_stream() {
    init_tracing();
    let server = MockServer::start(None).await;
    let mut adapter = RespConnector::new(short_replies(&server))
        .connect(1)
        .await
        .unwrap();

    let err = adapter.subscribe("slow/1").await.unwrap_err();
    assert!(
        matches!(err, BridgeError::Subscribe { ref reason, .. } if reason.contains("timed out")),
        "{err:?}"
    );

    tokio::time::sleep(SLOW_REPLY).await;

    let err = adapter.subscribe("room/1").await.unwrap_err();
    assert_eq!(
        err,
        BridgeError::Subscribe {
            topic: "room/1".to_string(),
            reason: "subscriber connection lost".to_string(),
        }
    );
    assert_eq!(server.count(&["SUBSCRIBE", "room/1"]), 0);

    let next = timeout(Duration::from_secs(1), adapter.next_message())
        .await
        .expect("message stream should end, not pend");
    assert!(next.is_none());

    // The command connection is unaffected.
    adapter.publish(&encode("room/1", "still works")).await.unwrap();
    adapter.close().await.unwrap();
}
