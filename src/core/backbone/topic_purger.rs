// src/core/backbone/topic_purger.rs

//! A background task that periodically drops local-broker topics nobody listens to.

use super::LocalBroker;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

pub struct TopicPurgerTask {
    broker: Arc<LocalBroker>,
    interval: Duration,
}

impl TopicPurgerTask {
    pub fn new(broker: Arc<LocalBroker>, interval: Duration) -> Self {
        Self { broker, interval }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Local broker topic purger started (interval {:?}).",
            self.interval
        );
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately; nothing to purge at startup.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.broker.purge_empty_topics();
                }
                _ = shutdown_rx.recv() => {
                    info!("Local broker topic purger shutting down.");
                    return;
                }
            }
        }
    }
}
