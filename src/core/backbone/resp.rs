// src/core/backbone/resp.rs

//! A backbone adapter for Redis-compatible servers, using `PUBLISH` and `SUBSCRIBE`.
//!
//! A RESP connection in subscriber mode cannot issue `PUBLISH`, so every
//! session holds two connections: one for commands, one for subscriptions.
//!
//! Replies are matched to commands by order alone. A connection that fails or
//! times out while a reply is outstanding is never used again: later calls on
//! it fail, and a lost subscriber connection ends the message stream.

use super::{BackboneAdapter, BackboneConnector};
use crate::config::RespBackboneConfig;
use crate::core::BridgeError;
use crate::core::protocol::{Envelope, RespFrame, RespFrameCodec};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

type RespStream = Framed<TcpStream, RespFrameCodec>;

/// Opens RESP adapters against the configured server.
#[derive(Debug, Clone)]
pub struct RespConnector {
    config: RespBackboneConfig,
}

impl RespConnector {
    pub fn new(config: RespBackboneConfig) -> Self {
        Self { config }
    }

    async fn open(&self) -> Result<RespStream, BridgeError> {
        let addr = (self.config.host.as_str(), self.config.port);
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                BridgeError::BackboneUnavailable(format!(
                    "timed out connecting to {}:{}",
                    self.config.host, self.config.port
                ))
            })?
            .map_err(|e| {
                BridgeError::BackboneUnavailable(format!(
                    "cannot connect to {}:{}: {e}",
                    self.config.host, self.config.port
                ))
            })?;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, RespFrameCodec);

        if let Some(password) = &self.config.password {
            let auth = RespFrame::command([
                Bytes::from_static(b"AUTH"),
                Bytes::from(password.clone()),
            ]);
            match request(&mut framed, auth, self.config.reply_timeout).await? {
                RespFrame::SimpleString(_) => {}
                RespFrame::Error(e) => {
                    return Err(BridgeError::BackboneUnavailable(format!(
                        "authentication rejected: {e}"
                    )));
                }
                other => {
                    return Err(BridgeError::BackboneUnavailable(format!(
                        "unexpected AUTH reply: {other:?}"
                    )));
                }
            }
        }
        Ok(framed)
    }
}

#[async_trait]
impl BackboneConnector for RespConnector {
    async fn connect(&self, session_id: u64) -> Result<Box<dyn BackboneAdapter>, BridgeError> {
        let commands = self.open().await?;
        let subscriber = self.open().await?;
        info!(
            "Session {}: connected to RESP backbone at {}:{}.",
            session_id, self.config.host, self.config.port
        );
        Ok(Box::new(RespAdapter {
            session_id,
            commands,
            subscriber,
            reply_timeout: self.config.reply_timeout,
            subscribed: HashSet::new(),
            pending: VecDeque::new(),
            commands_lost: false,
            subscriber_lost: false,
            closed: false,
        }))
    }

    fn name(&self) -> &'static str {
        "resp"
    }
}

/// Sends one command and waits for its reply.
async fn request(
    framed: &mut RespStream,
    frame: RespFrame,
    reply_timeout: Duration,
) -> Result<RespFrame, BridgeError> {
    framed.send(frame).await?;
    match timeout(reply_timeout, framed.next()).await {
        Ok(Some(reply)) => reply,
        Ok(None) => Err(BridgeError::BackboneUnavailable(
            "connection closed by the server".to_string(),
        )),
        Err(_) => Err(BridgeError::BackboneUnavailable(
            "timed out waiting for a reply".to_string(),
        )),
    }
}

/// What arrived on the subscriber connection.
enum Push {
    Message(Envelope),
    SubscribeAck(Bytes),
    Error(String),
    Other,
}

fn classify(frame: RespFrame) -> Push {
    let items = match frame {
        RespFrame::Array(items) => items,
        RespFrame::Error(e) => return Push::Error(e),
        _ => return Push::Other,
    };
    let kind = items.first().and_then(RespFrame::as_bytes);
    match (kind, items.as_slice()) {
        (Some(b"message"), [_, channel, payload]) => match (channel, payload) {
            (RespFrame::BulkString(channel), RespFrame::BulkString(payload)) => {
                Push::Message(Envelope::new(
                    String::from_utf8_lossy(channel).into_owned(),
                    payload.clone(),
                ))
            }
            _ => Push::Other,
        },
        (Some(b"subscribe"), [_, RespFrame::BulkString(channel), _]) => {
            Push::SubscribeAck(channel.clone())
        }
        _ => Push::Other,
    }
}

/// A session's pair of RESP connections.
pub struct RespAdapter {
    session_id: u64,
    commands: RespStream,
    subscriber: RespStream,
    reply_timeout: Duration,
    subscribed: HashSet<String>,
    /// Deliveries read while waiting for a subscribe confirmation.
    pending: VecDeque<Envelope>,
    /// Set once the command connection may hold a reply nobody will read.
    commands_lost: bool,
    /// Set once the subscriber connection may hold an unread confirmation.
    subscriber_lost: bool,
    closed: bool,
}

impl RespAdapter {
    fn lose_commands(&mut self, reason: &BridgeError) {
        self.commands_lost = true;
        warn!(
            "Session {}: RESP command connection dropped: {}",
            self.session_id, reason
        );
    }

    fn lose_subscriber(&mut self, reason: &str) {
        self.subscriber_lost = true;
        warn!(
            "Session {}: RESP subscriber connection dropped: {}",
            self.session_id, reason
        );
    }
}

#[async_trait]
impl BackboneAdapter for RespAdapter {
    async fn publish(&mut self, envelope: &Envelope) -> Result<(), BridgeError> {
        if self.closed {
            return Err(BridgeError::publish(envelope.topic(), "adapter is closed"));
        }
        if self.commands_lost {
            return Err(BridgeError::publish(
                envelope.topic(),
                "command connection lost",
            ));
        }
        let command = RespFrame::command([
            Bytes::from_static(b"PUBLISH"),
            Bytes::from(envelope.topic().to_string()),
            envelope.payload().clone(),
        ]);
        match request(&mut self.commands, command, self.reply_timeout).await {
            Ok(RespFrame::Integer(receivers)) => {
                debug!(
                    "Session {}: published to '{}' ({} receivers).",
                    self.session_id,
                    envelope.topic(),
                    receivers
                );
                Ok(())
            }
            Ok(RespFrame::Error(e)) => Err(BridgeError::publish(envelope.topic(), e)),
            Ok(other) => Err(BridgeError::publish(
                envelope.topic(),
                format!("unexpected reply {other:?}"),
            )),
            Err(e) => {
                self.lose_commands(&e);
                Err(BridgeError::publish(envelope.topic(), e))
            }
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), BridgeError> {
        if self.closed {
            return Err(BridgeError::subscribe(topic, "adapter is closed"));
        }
        if self.subscriber_lost {
            return Err(BridgeError::subscribe(topic, "subscriber connection lost"));
        }
        if self.subscribed.contains(topic) {
            return Ok(());
        }
        let command = RespFrame::command([
            Bytes::from_static(b"SUBSCRIBE"),
            Bytes::from(topic.to_string()),
        ]);
        if let Err(e) = self.subscriber.send(command).await {
            let reason = e.to_string();
            self.lose_subscriber(&reason);
            return Err(BridgeError::subscribe(topic, reason));
        }

        loop {
            let frame = match timeout(self.reply_timeout, self.subscriber.next()).await {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => {
                    let reason = e.to_string();
                    self.lose_subscriber(&reason);
                    return Err(BridgeError::subscribe(topic, reason));
                }
                Ok(None) => {
                    self.lose_subscriber("connection closed by the server");
                    return Err(BridgeError::subscribe(
                        topic,
                        "connection closed by the server",
                    ));
                }
                Err(_) => {
                    self.lose_subscriber("timed out waiting for confirmation");
                    return Err(BridgeError::subscribe(
                        topic,
                        "timed out waiting for confirmation",
                    ));
                }
            };
            match classify(frame) {
                Push::SubscribeAck(channel) if &channel[..] == topic.as_bytes() => break,
                Push::Message(envelope) => self.pending.push_back(envelope),
                Push::Error(e) => return Err(BridgeError::subscribe(topic, e)),
                Push::SubscribeAck(_) | Push::Other => {}
            }
        }
        self.subscribed.insert(topic.to_string());
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Envelope> {
        if let Some(envelope) = self.pending.pop_front() {
            return Some(envelope);
        }
        if self.subscriber_lost && !self.closed {
            return None;
        }
        if self.closed || self.subscribed.is_empty() {
            return std::future::pending().await;
        }
        loop {
            match self.subscriber.next().await {
                Some(Ok(frame)) => match classify(frame) {
                    Push::Message(envelope) => return Some(envelope),
                    Push::Error(e) => warn!(
                        "Session {}: RESP backbone reported an error: {}",
                        self.session_id, e
                    ),
                    Push::SubscribeAck(_) | Push::Other => {}
                },
                Some(Err(e)) => {
                    self.lose_subscriber(&e.to_string());
                    return None;
                }
                None => {
                    self.lose_subscriber("connection closed by the server");
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), BridgeError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pending.clear();

        let mut failures = Vec::new();
        if !self.subscribed.is_empty() && !self.subscriber_lost {
            let unsubscribe = RespFrame::command([Bytes::from_static(b"UNSUBSCRIBE")]);
            if let Err(e) = self.subscriber.send(unsubscribe).await {
                failures.push(format!("UNSUBSCRIBE: {e}"));
            }
            self.subscribed.clear();
        }
        if let Err(e) = SinkExt::<RespFrame>::close(&mut self.subscriber).await {
            failures.push(format!("subscriber connection: {e}"));
        }
        if let Err(e) = SinkExt::<RespFrame>::close(&mut self.commands).await {
            failures.push(format!("command connection: {e}"));
        }

        if failures.is_empty() {
            debug!("Session {}: RESP backbone released.", self.session_id);
            Ok(())
        } else {
            Err(BridgeError::SessionTeardown(failures.join("; ")))
        }
    }
}
