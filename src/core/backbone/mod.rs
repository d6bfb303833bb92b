// src/core/backbone/mod.rs

//! The publish/subscribe backbone as seen by a session.
//!
//! Every session owns exactly one `BackboneAdapter`, obtained from the
//! process-wide `BackboneConnector` when the client connects. Adapters are
//! never shared between sessions.

use crate::config::BackboneConfig;
use crate::core::BridgeError;
use crate::core::protocol::Envelope;
use async_trait::async_trait;
use std::sync::Arc;

pub mod local;
pub mod resp;
pub mod topic_purger;

pub use local::{LocalAdapter, LocalBroker, LocalConnector, topic_matches};
pub use resp::{RespAdapter, RespConnector};
pub use topic_purger::TopicPurgerTask;

/// One session's connection to the backbone.
#[async_trait]
pub trait BackboneAdapter: Send {
    /// Sends the envelope's payload to its topic.
    async fn publish(&mut self, envelope: &Envelope) -> Result<(), BridgeError>;

    /// Registers interest in `topic`. Subscribing twice to the same topic is a no-op.
    async fn subscribe(&mut self, topic: &str) -> Result<(), BridgeError>;

    /// Waits for the next message on any subscribed topic.
    ///
    /// Pends while there are no subscriptions. Returns `None` once the backbone
    /// connection is gone for good. Must be cancellation safe: it is polled
    /// inside `tokio::select!` and dropped whenever a client frame wins.
    async fn next_message(&mut self) -> Option<Envelope>;

    /// Releases every subscription and the underlying connection.
    async fn close(&mut self) -> Result<(), BridgeError>;
}

/// Hands out one fresh adapter per session.
#[async_trait]
pub trait BackboneConnector: Send + Sync {
    async fn connect(&self, session_id: u64) -> Result<Box<dyn BackboneAdapter>, BridgeError>;

    /// A short name for logs.
    fn name(&self) -> &'static str;
}

/// Builds the connector selected in the configuration. The local broker, if
/// any, is returned as well so its purger task can be spawned.
pub fn connector_from_config(
    config: &BackboneConfig,
) -> (Arc<dyn BackboneConnector>, Option<Arc<LocalBroker>>) {
    match config {
        BackboneConfig::Local(local) => {
            let broker = Arc::new(LocalBroker::new(local.channel_capacity));
            (
                Arc::new(LocalConnector::new(broker.clone())),
                Some(broker),
            )
        }
        BackboneConfig::Resp(resp) => (Arc::new(RespConnector::new(resp.clone())), None),
    }
}
