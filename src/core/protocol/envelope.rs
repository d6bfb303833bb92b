// src/core/protocol/envelope.rs

//! The envelope exchanged with the backbone, and the frames written back to clients.

use bytes::Bytes;
use serde::Serialize;
use std::borrow::Cow;

/// The acknowledgement sent to a client after a successful `init`.
pub const INIT_ACK: &str = r#"{"action":"init","type":"response","data":"success"}"#;

/// A destination plus an opaque payload. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    topic: String,
    payload: Bytes,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The payload as text, replacing invalid UTF-8 sequences.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn into_parts(self) -> (String, Bytes) {
        (self.topic, self.payload)
    }
}

/// Builds an envelope for `destination`. Pure and total.
pub fn encode(destination: &str, payload: impl Into<Bytes>) -> Envelope {
    Envelope::new(destination, payload)
}

/// Frames the bridge writes to a client that are not backbone deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientReply {
    /// Sent once per successful `init`.
    InitAck,
    /// Only sent when `session.error_replies` is enabled.
    Error(String),
}

#[derive(Serialize)]
struct ErrorFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a str,
}

#[derive(Serialize)]
struct DeliveryFrame<'a> {
    topic: &'a str,
    payload: Cow<'a, str>,
}

impl ClientReply {
    /// Renders the reply as the JSON text sent over the client connection.
    pub fn to_json(&self) -> String {
        match self {
            ClientReply::InitAck => INIT_ACK.to_string(),
            ClientReply::Error(message) => to_json(&ErrorFrame {
                kind: "error",
                data: message,
            }),
        }
    }
}

/// Renders a backbone message as the `{"topic", "payload"}` frame sent to a client.
pub fn encode_delivery(envelope: &Envelope) -> String {
    to_json(&DeliveryFrame {
        topic: envelope.topic(),
        payload: envelope.payload_str(),
    })
}

// Both frame structs hold only strings, so serialization cannot fail.
fn to_json<T: Serialize>(frame: &T) -> String {
    serde_json::to_string(frame).unwrap_or_default()
}
