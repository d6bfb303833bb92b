// src/core/backbone/local.rs

//! An in-process backbone: a hub of broadcast channels keyed by topic.

use super::{BackboneAdapter, BackboneConnector};
use crate::core::BridgeError;
use crate::core::metrics;
use crate::core::protocol::Envelope;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast::{self, Receiver, Sender, error::RecvError};
use tracing::{debug, warn};

/// Separates the levels of a topic name.
const LEVEL_SEPARATOR: char = '/';

/// The central hub of the local backbone.
///
/// Exact topics and filters (`+`, `#`) live in separate maps so a publish only
/// scans the filters, not every topic.
#[derive(Debug)]
pub struct LocalBroker {
    topics: DashMap<String, Arc<Sender<Envelope>>>,
    filters: DashMap<String, Arc<Sender<Envelope>>>,
    capacity: usize,
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new(128)
    }
}

impl LocalBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            filters: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Subscribes to a topic or a filter, creating its channel on first use.
    pub fn subscribe(&self, topic: &str) -> Receiver<Envelope> {
        let map = if is_filter(topic) {
            &self.filters
        } else {
            &self.topics
        };
        map.entry(topic.to_string())
            .or_insert_with(|| Arc::new(broadcast::channel(self.capacity).0))
            .value()
            .subscribe()
    }

    /// Delivers a message to the topic's subscribers and to every matching filter.
    ///
    /// Returns the number of receivers reached.
    pub fn publish(&self, envelope: &Envelope) -> usize {
        let mut receivers = 0;
        if let Some(sender) = self.topics.get(envelope.topic()) {
            receivers += sender.send(envelope.clone()).unwrap_or(0);
        }
        for entry in self.filters.iter() {
            if topic_matches(entry.key(), envelope.topic()) {
                receivers += entry.value().send(envelope.clone()).unwrap_or(0);
            }
        }
        receivers
    }

    /// Removes topics and filters that no longer have subscribers.
    pub fn purge_empty_topics(&self) -> usize {
        let mut purged = 0;
        for map in [&self.topics, &self.filters] {
            map.retain(|_, sender| {
                if sender.receiver_count() == 0 {
                    purged += 1;
                    false
                } else {
                    true
                }
            });
        }
        if purged > 0 {
            debug!("Purged {} empty topics from the local broker.", purged);
        }
        purged
    }

    /// All topics and filters that currently have a channel.
    pub fn topics(&self) -> Vec<String> {
        self.topics
            .iter()
            .chain(self.filters.iter())
            .map(|e| e.key().clone())
            .collect()
    }

    /// Number of live receivers on an exact topic or filter.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let map = if is_filter(topic) {
            &self.filters
        } else {
            &self.topics
        };
        map.get(topic).map_or(0, |s| s.receiver_count())
    }
}

fn is_filter(topic: &str) -> bool {
    topic
        .split(LEVEL_SEPARATOR)
        .any(|level| level == "+" || level == "#")
}

/// Matches a topic against an MQTT-style filter.
///
/// `+` matches exactly one level; `#` as the last level matches the rest,
/// including nothing. Without wildcards the filter must equal the topic.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split(LEVEL_SEPARATOR);
    let mut topic_levels = topic.split(LEVEL_SEPARATOR);
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Creates `LocalAdapter`s bound to one shared broker.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    broker: Arc<LocalBroker>,
}

impl LocalConnector {
    pub fn new(broker: Arc<LocalBroker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<LocalBroker> {
        &self.broker
    }
}

#[async_trait]
impl BackboneConnector for LocalConnector {
    async fn connect(&self, session_id: u64) -> Result<Box<dyn BackboneAdapter>, BridgeError> {
        Ok(Box::new(LocalAdapter::new(self.broker.clone(), session_id)))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// A session's handle on the local broker.
///
/// Each subscription is its own channel. Subscribing twice to the same topic
/// or filter is a no-op, but overlapping subscriptions (`a/b` and `a/#`) each
/// receive a copy of a matching message.
#[derive(Debug)]
pub struct LocalAdapter {
    broker: Arc<LocalBroker>,
    session_id: u64,
    subscribed: HashSet<String>,
    receivers: Vec<(String, Receiver<Envelope>)>,
    closed: bool,
}

impl LocalAdapter {
    pub fn new(broker: Arc<LocalBroker>, session_id: u64) -> Self {
        Self {
            broker,
            session_id,
            subscribed: HashSet::new(),
            receivers: Vec::new(),
            closed: false,
        }
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.subscribed.iter().map(String::as_str)
    }
}

#[async_trait]
impl BackboneAdapter for LocalAdapter {
    async fn publish(&mut self, envelope: &Envelope) -> Result<(), BridgeError> {
        if self.closed {
            return Err(BridgeError::publish(envelope.topic(), "adapter is closed"));
        }
        let receivers = self.broker.publish(envelope);
        debug!(
            "Session {}: published to '{}' ({} receivers).",
            self.session_id,
            envelope.topic(),
            receivers
        );
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), BridgeError> {
        if self.closed {
            return Err(BridgeError::subscribe(topic, "adapter is closed"));
        }
        if !self.subscribed.insert(topic.to_string()) {
            debug!(
                "Session {}: already subscribed to '{}'.",
                self.session_id, topic
            );
            return Ok(());
        }
        let rx = self.broker.subscribe(topic);
        self.receivers.push((topic.to_string(), rx));
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Envelope> {
        loop {
            if self.receivers.is_empty() {
                return std::future::pending().await;
            }

            let (result, index) = {
                let recv_all = self
                    .receivers
                    .iter_mut()
                    .map(|(_, rx)| rx.recv().boxed());
                let (result, index, _) = futures::future::select_all(recv_all).await;
                (result, index)
            };

            match result {
                Ok(envelope) => return Some(envelope),
                Err(RecvError::Lagged(missed)) => {
                    // The receiver skips ahead to the oldest retained message.
                    metrics::DELIVERIES_LAGGED_TOTAL.inc_by(missed as f64);
                    warn!(
                        "Session {}: lagged on '{}', missed {} messages.",
                        self.session_id, self.receivers[index].0, missed
                    );
                }
                Err(RecvError::Closed) => {
                    let (topic, _) = self.receivers.swap_remove(index);
                    self.subscribed.remove(&topic);
                    warn!(
                        "Session {}: channel for '{}' closed by the broker.",
                        self.session_id, topic
                    );
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), BridgeError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let released = self.receivers.len();
        // Dropping the receivers is the unsubscribe; empty channels are
        // reclaimed by the purger.
        self.receivers.clear();
        self.subscribed.clear();
        debug!(
            "Session {}: released {} local subscriptions.",
            self.session_id, released
        );
        Ok(())
    }
}
