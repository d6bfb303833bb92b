// src/connection/handler.rs

//! Defines the `ConnectionHandler` which manages the full lifecycle of a bridged
//! WebSocket connection.

use super::guard::SessionGuard;
use super::session::Session;
use crate::core::metrics;
use crate::core::protocol::{ClientReply, Envelope, encode_delivery};
use crate::core::state::BridgeState;
use crate::core::BridgeError;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{self, Message, Utf8Bytes};
use tracing::{debug, info, warn};

/// Accepts the WebSocket handshake on `stream` and bridges the resulting
/// session until the client leaves, the backbone goes away, or the server
/// shuts down.
pub async fn serve<S>(
    stream: S,
    addr: SocketAddr,
    state: Arc<BridgeState>,
    global_shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), BridgeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let max_message_size = state.session_config().max_message_size;
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(max_message_size))
        .max_frame_size(Some(max_message_size));

    let handshake = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config));
    let mut ws = match timeout(state.config.handshake_timeout, handshake).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            metrics::CONNECTIONS_REJECTED_TOTAL
                .with_label_values(&["handshake"])
                .inc();
            return Err(e.into());
        }
        Err(_) => {
            metrics::CONNECTIONS_REJECTED_TOTAL
                .with_label_values(&["handshake_timeout"])
                .inc();
            return Err(BridgeError::WebSocket(format!(
                "handshake with {addr} timed out"
            )));
        }
    };

    let guard = SessionGuard::register(state.clone(), addr);
    let session_id = guard.session_id();

    let adapter = match state.connector.connect(session_id).await {
        Ok(adapter) => adapter,
        Err(e) => {
            metrics::CONNECTIONS_REJECTED_TOTAL
                .with_label_values(&["backbone_unavailable"])
                .inc();
            warn!(
                "Session {}: backbone '{}' unavailable for {}: {}",
                session_id,
                state.connector.name(),
                addr,
                e
            );
            let frame = CloseFrame {
                code: CloseCode::Error,
                reason: Utf8Bytes::from_static("backbone unavailable"),
            };
            let _ = ws.close(Some(frame)).await;
            return Err(e);
        }
    };

    let session = Session::new(
        session_id,
        adapter,
        state.session_config(),
        state.system_topic(),
    );
    info!("Session {} opened for {}.", session_id, addr);

    let handler = ConnectionHandler {
        ws,
        addr,
        state,
        session,
        global_shutdown_rx,
        backbone_open: true,
        reported_topic: None,
        _guard: guard,
    };
    handler.run().await
}

/// What the event loop does after handling one event.
enum NextAction {
    Continue,
    Close(Option<CloseFrame>),
}

/// Drives one bridged session: client frames in, backbone deliveries out.
pub struct ConnectionHandler<S> {
    ws: WebSocketStream<S>,
    addr: SocketAddr,
    state: Arc<BridgeState>,
    session: Session,
    global_shutdown_rx: broadcast::Receiver<()>,
    /// Cleared once the adapter reports its connection gone for good.
    backbone_open: bool,
    /// The private topic last written to the registry.
    reported_topic: Option<String>,
    _guard: SessionGuard,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Runs the event loop, then tears the session down whatever the outcome.
    pub async fn run(mut self) -> Result<(), BridgeError> {
        let result = self.event_loop().await;

        let ConnectionHandler {
            mut ws,
            addr,
            session,
            _guard,
            ..
        } = self;
        let session_id = session.id();

        if let Err(e) = session.teardown().await {
            metrics::TEARDOWN_ERRORS_TOTAL.inc();
            warn!("Session {}: teardown failed: {}", session_id, e);
        }

        match result {
            Ok(close_frame) => {
                if let Err(e) = ws.close(close_frame).await
                    && !is_normal_disconnect(&e)
                {
                    debug!("Session {}: closing WebSocket failed: {}", session_id, e);
                }
                info!("Session {} for {} closed.", session_id, addr);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn event_loop(&mut self) -> Result<Option<CloseFrame>, BridgeError> {
        loop {
            let action = tokio::select! {
                biased;
                _ = self.global_shutdown_rx.recv() => {
                    info!("Session {} received shutdown signal.", self.session.id());
                    NextAction::Close(Some(CloseFrame {
                        code: CloseCode::Away,
                        reason: Utf8Bytes::from_static("server shutting down"),
                    }))
                }
                // Client frames before deliveries, so a busy backbone cannot starve them.
                message = self.ws.next() => {
                    match message {
                        Some(Ok(message)) => self.process_message(message).await?,
                        Some(Err(e)) => {
                            if is_normal_disconnect(&e) {
                                debug!("Connection from {} closed by peer: {}", self.addr, e);
                            } else {
                                warn!("Connection error for {}: {}", self.addr, e);
                            }
                            return Ok(None);
                        }
                        None => {
                            debug!("Connection from {} closed by peer.", self.addr);
                            return Ok(None);
                        }
                    }
                }
                delivery = self.session.next_delivery(), if self.backbone_open => {
                    match delivery {
                        Some(envelope) => self.deliver(envelope).await?,
                        None => {
                            warn!("Session {}: backbone connection lost.", self.session.id());
                            self.backbone_open = false;
                            NextAction::Close(Some(CloseFrame {
                                code: CloseCode::Error,
                                reason: Utf8Bytes::from_static("backbone connection lost"),
                            }))
                        }
                    }
                }
            };

            if let NextAction::Close(frame) = action {
                return Ok(frame);
            }
        }
    }

    async fn process_message(&mut self, message: Message) -> Result<NextAction, BridgeError> {
        match message {
            Message::Text(text) => self.process_frame(text.as_str()).await?,
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => self.process_frame(text).await?,
                Err(e) => self.reject_frame(e.into()).await?,
            },
            Message::Ping(_) | Message::Pong(_) => {
                self.state.registry.touch(self.session.id());
            }
            Message::Close(frame) => {
                debug!(
                    "Session {}: client sent close frame {:?}.",
                    self.session.id(),
                    frame
                );
                return Ok(NextAction::Close(None));
            }
            Message::Frame(_) => {}
        }
        Ok(NextAction::Continue)
    }

    /// Hands one client frame to the session and sends back whatever it replies.
    async fn process_frame(&mut self, raw: &str) -> Result<(), BridgeError> {
        metrics::FRAMES_RECEIVED_TOTAL.inc();
        let session_id = self.session.id();
        self.state.registry.touch(session_id);

        let started = Instant::now();
        let outcome = self.session.handle_frame(raw).await;
        metrics::DISPATCH_LATENCY_SECONDS.observe(started.elapsed().as_secs_f64());

        self.sync_private_topic();

        match outcome {
            Ok(Some(reply)) => self.send_reply(&reply).await,
            Ok(None) => Ok(()),
            Err(e) => self.reject_frame(e).await,
        }
    }

    /// Logs and counts a dropped frame. The session keeps going.
    async fn reject_frame(&mut self, e: BridgeError) -> Result<(), BridgeError> {
        metrics::FRAMES_REJECTED_TOTAL
            .with_label_values(&[e.kind()])
            .inc();
        if e.is_backbone_error() {
            warn!("Session {}: frame dropped: {}", self.session.id(), e);
        } else {
            debug!("Session {}: frame dropped: {}", self.session.id(), e);
        }

        if self.state.session_config().error_replies {
            self.send_reply(&ClientReply::Error(e.to_string())).await?;
        }
        Ok(())
    }

    async fn deliver(&mut self, envelope: Envelope) -> Result<NextAction, BridgeError> {
        debug!(
            "Session {}: delivering message from '{}'.",
            self.session.id(),
            envelope.topic()
        );
        self.ws
            .send(Message::Text(encode_delivery(&envelope).into()))
            .await?;
        metrics::DELIVERIES_TOTAL.inc();
        Ok(NextAction::Continue)
    }

    async fn send_reply(&mut self, reply: &ClientReply) -> Result<(), BridgeError> {
        self.ws.send(Message::Text(reply.to_json().into())).await?;
        Ok(())
    }

    fn sync_private_topic(&mut self) {
        let current = self.session.private_topic();
        if current != self.reported_topic.as_deref()
            && let Some(topic) = current
        {
            self.state
                .registry
                .set_private_topic(self.session.id(), topic);
            self.reported_topic = Some(topic.to_string());
        }
    }
}

/// Helper function to check for non-critical disconnection errors.
fn is_normal_disconnect(e: &tungstenite::Error) -> bool {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        tungstenite::Error::Protocol(
            tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
        ) => true,
        tungstenite::Error::Io(io_err) => matches!(
            io_err.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionAborted
        ),
        _ => false,
    }
}
