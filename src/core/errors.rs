// src/core/errors.rs

//! Defines the primary error type for the bridge.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing every failure a session or the server can hit.
///
/// Frame-level errors (`Protocol`, `NotInitialized`, `Publish`, `Subscribe`) are
/// recovered inside the session: the frame is dropped and the session keeps going.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    /// A client frame could not be parsed or is missing required fields.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A frame without an action arrived before the session received `init`.
    #[error("Session has no private topic yet (send 'init' first)")]
    NotInitialized,

    #[error("Publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    /// Releasing the backbone adapter failed. The session is removed anyway.
    #[error("Session teardown failed: {0}")]
    SessionTeardown(String),

    #[error("Backbone unavailable: {0}")]
    BackboneUnavailable(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

impl BridgeError {
    /// True for errors caused by the content of a client frame.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, BridgeError::Protocol(_) | BridgeError::NotInitialized)
    }

    /// True for errors raised by the backbone while handling a frame.
    pub fn is_backbone_error(&self) -> bool {
        matches!(
            self,
            BridgeError::Publish { .. }
                | BridgeError::Subscribe { .. }
                | BridgeError::BackboneUnavailable(_)
        )
    }

    /// A short, stable label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Io(_) => "io",
            BridgeError::IncompleteData => "incomplete",
            BridgeError::Protocol(_) => "protocol",
            BridgeError::NotInitialized => "not_initialized",
            BridgeError::Publish { .. } => "publish",
            BridgeError::Subscribe { .. } => "subscribe",
            BridgeError::SessionTeardown(_) => "teardown",
            BridgeError::BackboneUnavailable(_) => "backbone_unavailable",
            BridgeError::WebSocket(_) => "websocket",
        }
    }

    pub(crate) fn publish(topic: &str, reason: impl ToString) -> Self {
        BridgeError::Publish {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn subscribe(topic: &str, reason: impl ToString) -> Self {
        BridgeError::Subscribe {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }
}

// `std::io::Error` is not cloneable, so it lives behind an Arc.
impl Clone for BridgeError {
    fn clone(&self) -> Self {
        match self {
            BridgeError::Io(e) => BridgeError::Io(Arc::clone(e)),
            BridgeError::IncompleteData => BridgeError::IncompleteData,
            BridgeError::Protocol(s) => BridgeError::Protocol(s.clone()),
            BridgeError::NotInitialized => BridgeError::NotInitialized,
            BridgeError::Publish { topic, reason } => BridgeError::Publish {
                topic: topic.clone(),
                reason: reason.clone(),
            },
            BridgeError::Subscribe { topic, reason } => BridgeError::Subscribe {
                topic: topic.clone(),
                reason: reason.clone(),
            },
            BridgeError::SessionTeardown(s) => BridgeError::SessionTeardown(s.clone()),
            BridgeError::BackboneUnavailable(s) => BridgeError::BackboneUnavailable(s.clone()),
            BridgeError::WebSocket(s) => BridgeError::WebSocket(s.clone()),
        }
    }
}

impl PartialEq for BridgeError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (BridgeError::Io(e1), BridgeError::Io(e2)) => e1.to_string() == e2.to_string(),
            (BridgeError::Protocol(s1), BridgeError::Protocol(s2)) => s1 == s2,
            (
                BridgeError::Publish {
                    topic: t1,
                    reason: r1,
                },
                BridgeError::Publish {
                    topic: t2,
                    reason: r2,
                },
            ) => t1 == t2 && r1 == r2,
            (
                BridgeError::Subscribe {
                    topic: t1,
                    reason: r1,
                },
                BridgeError::Subscribe {
                    topic: t2,
                    reason: r2,
                },
            ) => t1 == t2 && r1 == r2,
            (BridgeError::SessionTeardown(s1), BridgeError::SessionTeardown(s2)) => s1 == s2,
            (BridgeError::BackboneUnavailable(s1), BridgeError::BackboneUnavailable(s2)) => {
                s1 == s2
            }
            (BridgeError::WebSocket(s1), BridgeError::WebSocket(s2)) => s1 == s2,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Protocol(format!("invalid JSON frame: {e}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::Io(io) => BridgeError::Io(Arc::new(io)),
            other => BridgeError::WebSocket(other.to_string()),
        }
    }
}

impl From<std::str::Utf8Error> for BridgeError {
    fn from(_: std::str::Utf8Error) -> Self {
        BridgeError::Protocol("frame is not valid UTF-8".to_string())
    }
}
