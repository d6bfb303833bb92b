// src/connection/session.rs

//! The bridging session: one client connection's private-topic state machine
//! and the backbone adapter it exclusively owns.

use crate::config::{EarlyFramePolicy, SessionConfig};
use crate::core::backbone::BackboneAdapter;
use crate::core::protocol::{
    ClientAction, ClientFrame, ClientReply, Envelope, data_to_payload, encode,
};
use crate::core::{BridgeError, metrics};
use bytes::Bytes;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Whether `init` has given the session a private topic yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Initialized { private_topic: String },
}

/// Holds the state of a single bridged client.
pub struct Session {
    id: u64,
    phase: SessionPhase,
    adapter: Box<dyn BackboneAdapter>,
    system_topic: String,
    early_frames: EarlyFramePolicy,
    early_frame_capacity: usize,
    /// Frames waiting for `init` under `EarlyFramePolicy::Buffer`.
    buffered: VecDeque<Bytes>,
}

impl Session {
    pub fn new(
        id: u64,
        adapter: Box<dyn BackboneAdapter>,
        settings: &SessionConfig,
        system_topic: impl Into<String>,
    ) -> Self {
        Self {
            id,
            phase: SessionPhase::Uninitialized,
            adapter,
            system_topic: system_topic.into(),
            early_frames: settings.early_frames,
            early_frame_capacity: settings.early_frame_buffer,
            buffered: VecDeque::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    pub fn private_topic(&self) -> Option<&str> {
        match &self.phase {
            SessionPhase::Initialized { private_topic } => Some(private_topic),
            SessionPhase::Uninitialized => None,
        }
    }

    /// Number of frames held back until `init`.
    pub fn buffered_frames(&self) -> usize {
        self.buffered.len()
    }

    /// Decodes one raw client frame and performs its action.
    ///
    /// Returns the reply to send to the client, if any. Errors mean the frame
    /// was dropped; the session stays usable either way.
    pub async fn handle_frame(&mut self, raw: &str) -> Result<Option<ClientReply>, BridgeError> {
        let frame = ClientFrame::parse(raw)?;
        let (raw, action) = frame.into_parts();

        match action {
            ClientAction::Passthrough => {
                self.publish_to_private_topic(raw).await?;
                Ok(None)
            }
            ClientAction::Publish { topic, data } => {
                self.publish(encode(&topic, data_to_payload(&data))).await?;
                Ok(None)
            }
            ClientAction::Subscribe { topic } => {
                self.adapter.subscribe(&topic).await?;
                debug!("Session {}: subscribed to '{}'.", self.id, topic);
                Ok(None)
            }
            ClientAction::Init { private_topic } => self.init(private_topic).await,
            ClientAction::Unrecognized(name) => {
                debug!(
                    "Session {}: forwarding '{}' action to '{}'.",
                    self.id, name, self.system_topic
                );
                let envelope = encode(&self.system_topic, raw);
                self.publish(envelope).await?;
                Ok(None)
            }
        }
    }

    async fn init(&mut self, private_topic: String) -> Result<Option<ClientReply>, BridgeError> {
        if let SessionPhase::Initialized {
            private_topic: previous,
        } = &self.phase
        {
            info!(
                "Session {}: re-init replaces private topic '{}' with '{}'.",
                self.id, previous, private_topic
            );
        }
        self.phase = SessionPhase::Initialized {
            private_topic: private_topic.clone(),
        };
        self.adapter.subscribe(&private_topic).await?;
        info!(
            "Session {}: initialized with private topic '{}'.",
            self.id, private_topic
        );
        self.flush_buffered(&private_topic).await;
        Ok(Some(ClientReply::InitAck))
    }

    async fn publish_to_private_topic(&mut self, raw: String) -> Result<(), BridgeError> {
        if let SessionPhase::Initialized { private_topic } = &self.phase {
            let envelope = encode(private_topic, raw);
            return self.publish(envelope).await;
        }

        match self.early_frames {
            EarlyFramePolicy::Reject => Err(BridgeError::NotInitialized),
            EarlyFramePolicy::Drop => {
                debug!(
                    "Session {}: dropping frame received before init.",
                    self.id
                );
                Ok(())
            }
            EarlyFramePolicy::Buffer => {
                if self.buffered.len() >= self.early_frame_capacity {
                    return Err(BridgeError::Protocol(format!(
                        "{} frames already waiting for init",
                        self.buffered.len()
                    )));
                }
                self.buffered.push_back(Bytes::from(raw));
                Ok(())
            }
        }
    }

    /// Publishes frames held back before `init`, in arrival order.
    async fn flush_buffered(&mut self, private_topic: &str) {
        if self.buffered.is_empty() {
            return;
        }
        let frames = std::mem::take(&mut self.buffered);
        debug!(
            "Session {}: publishing {} frames held until init.",
            self.id,
            frames.len()
        );
        for payload in frames {
            if let Err(e) = self.publish(encode(private_topic, payload)).await {
                warn!("Session {}: buffered frame dropped: {}", self.id, e);
            }
        }
    }

    async fn publish(&mut self, envelope: Envelope) -> Result<(), BridgeError> {
        self.adapter.publish(&envelope).await?;
        metrics::ENVELOPES_PUBLISHED_TOTAL.inc();
        Ok(())
    }

    /// Waits for the next backbone message addressed to this session.
    pub async fn next_delivery(&mut self) -> Option<Envelope> {
        self.adapter.next_message().await
    }

    /// Releases the backbone adapter. Consumes the session, so it runs at most once.
    pub async fn teardown(mut self) -> Result<(), BridgeError> {
        if !self.buffered.is_empty() {
            warn!(
                "Session {}: discarding {} frames that never saw an init.",
                self.id,
                self.buffered.len()
            );
        }
        self.adapter.close().await.map_err(|e| match e {
            BridgeError::SessionTeardown(_) => e,
            other => BridgeError::SessionTeardown(other.to_string()),
        })
    }
}
