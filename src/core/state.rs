// src/core/state.rs

//! Defines `BridgeState`, the state shared by every connection task.

use crate::config::{Config, SessionConfig};
use crate::core::backbone::{self, BackboneConnector, LocalBroker};
use crate::core::registry::SessionRegistry;
use std::sync::Arc;
use tracing::info;

/// The shared, process-wide state. Wrapped in an `Arc` and handed to every
/// connection task. Holds nothing that belongs to a single session.
pub struct BridgeState {
    pub config: Arc<Config>,
    pub registry: SessionRegistry,
    pub connector: Arc<dyn BackboneConnector>,
    /// Present when the in-process backbone is selected.
    pub local_broker: Option<Arc<LocalBroker>>,
}

impl BridgeState {
    /// Builds the state and the backbone connector selected in `config`.
    pub fn initialize(config: Config) -> Arc<Self> {
        let (connector, local_broker) = backbone::connector_from_config(&config.backbone);
        info!("Backbone '{}' selected.", connector.name());
        Arc::new(Self {
            config: Arc::new(config),
            registry: SessionRegistry::new(),
            connector,
            local_broker,
        })
    }

    /// Builds the state around an externally provided connector.
    pub fn with_connector(config: Config, connector: Arc<dyn BackboneConnector>) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            registry: SessionRegistry::new(),
            connector,
            local_broker: None,
        })
    }

    pub fn session_config(&self) -> &SessionConfig {
        &self.config.session
    }

    pub fn system_topic(&self) -> &str {
        &self.config.system_topic
    }
}
