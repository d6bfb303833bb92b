// src/core/protocol/client_frame.rs

//! Decodes the JSON text frames sent by WebSocket clients into a tagged action.

use crate::core::BridgeError;
use bytes::Bytes;
use serde_json::{Map, Value};

/// What a client frame asks the session to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientAction {
    /// No `action` field: the raw frame goes to the session's private topic.
    Passthrough,
    /// Publish `data` on `topic`.
    Publish { topic: String, data: Value },
    /// Subscribe the session's adapter to `topic`.
    Subscribe { topic: String },
    /// Set the session's private topic and subscribe to it.
    Init { private_topic: String },
    /// Any other action name. The raw frame goes to the system topic.
    Unrecognized(String),
}

/// A parsed client frame. It lives for the duration of one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientFrame {
    raw: String,
    action: ClientAction,
}

impl ClientFrame {
    /// Parses a raw text frame.
    ///
    /// Any JSON value is accepted; only objects can carry an `action`, so every
    /// other value is a passthrough frame. Non-JSON text is a `Protocol` error.
    pub fn parse(raw: &str) -> Result<Self, BridgeError> {
        let value: Value = serde_json::from_str(raw)?;
        let action = match &value {
            Value::Object(fields) => parse_action(fields)?,
            _ => ClientAction::Passthrough,
        };
        Ok(Self {
            raw: raw.to_string(),
            action,
        })
    }

    pub fn action(&self) -> &ClientAction {
        &self.action
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn into_parts(self) -> (String, ClientAction) {
        (self.raw, self.action)
    }
}

fn parse_action(fields: &Map<String, Value>) -> Result<ClientAction, BridgeError> {
    let name = match fields.get("action") {
        None | Some(Value::Null) => return Ok(ClientAction::Passthrough),
        Some(Value::String(name)) => name.as_str(),
        Some(other) => {
            return Err(BridgeError::Protocol(format!(
                "'action' must be a string, got {other}"
            )));
        }
    };

    match name {
        "publish" => {
            let topic = required_topic(fields, "topic", name)?;
            let data = fields.get("data").cloned().ok_or_else(|| {
                BridgeError::Protocol("'publish' frame is missing 'data'".to_string())
            })?;
            Ok(ClientAction::Publish { topic, data })
        }
        "subscribe" => Ok(ClientAction::Subscribe {
            topic: required_topic(fields, "topic", name)?,
        }),
        "init" => Ok(ClientAction::Init {
            private_topic: required_topic(fields, "data", name)?,
        }),
        other => Ok(ClientAction::Unrecognized(other.to_string())),
    }
}

/// Extracts a non-empty string field naming a topic.
fn required_topic(
    fields: &Map<String, Value>,
    key: &str,
    action: &str,
) -> Result<String, BridgeError> {
    match fields.get(key) {
        Some(Value::String(topic)) if !topic.is_empty() => Ok(topic.clone()),
        Some(Value::String(_)) => Err(BridgeError::Protocol(format!(
            "'{action}' frame has an empty '{key}'"
        ))),
        Some(_) => Err(BridgeError::Protocol(format!(
            "'{action}' frame needs a string '{key}'"
        ))),
        None => Err(BridgeError::Protocol(format!(
            "'{action}' frame is missing '{key}'"
        ))),
    }
}

/// Converts a frame's `data` into backbone payload bytes.
///
/// Strings are sent as their content; every other JSON value as compact JSON.
pub fn data_to_payload(data: &Value) -> Bytes {
    match data {
        Value::String(s) => Bytes::from(s.clone()),
        other => Bytes::from(other.to_string()),
    }
}
