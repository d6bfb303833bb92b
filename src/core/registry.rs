// src/core/registry.rs

//! Tracks every live session by id.
//!
//! The registry only holds bookkeeping. The `Session` itself, and with it the
//! backbone adapter, is owned by the task serving the connection, so no
//! session state is ever shared between connections.

use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A registry entry describing one live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: u64,
    pub addr: SocketAddr,
    pub created: Instant,
    pub last_frame_time: Instant,
    pub private_topic: Option<String>,
}

/// A serializable view of `SessionInfo`, served on `/sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: u64,
    pub addr: String,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub private_topic: Option<String>,
}

impl From<&SessionInfo> for SessionSummary {
    fn from(info: &SessionInfo) -> Self {
        Self {
            session_id: info.session_id,
            addr: info.addr.to_string(),
            age_secs: info.created.elapsed().as_secs(),
            idle_secs: info.last_frame_time.elapsed().as_secs(),
            private_topic: info.private_topic.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<u64, SessionInfo>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Allocates a session id and records the session. Ids start at 1 and are never reused.
    pub fn register(&self, addr: SocketAddr) -> u64 {
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Instant::now();
        self.sessions.insert(
            session_id,
            SessionInfo {
                session_id,
                addr,
                created: now,
                last_frame_time: now,
                private_topic: None,
            },
        );
        session_id
    }

    /// Forgets a session. Returns false if it was not registered.
    pub fn remove(&self, session_id: u64) -> bool {
        self.sessions.remove(&session_id).is_some()
    }

    pub fn set_private_topic(&self, session_id: u64, topic: &str) {
        if let Some(mut info) = self.sessions.get_mut(&session_id) {
            info.private_topic = Some(topic.to_string());
        }
    }

    pub fn touch(&self, session_id: u64) {
        if let Some(mut info) = self.sessions.get_mut(&session_id) {
            info.last_frame_time = Instant::now();
        }
    }

    pub fn get(&self, session_id: u64) -> Option<SessionInfo> {
        self.sessions.get(&session_id).map(|e| e.value().clone())
    }

    pub fn contains(&self, session_id: u64) -> bool {
        self.sessions.contains_key(&session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// All live sessions, ordered by id.
    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> =
            self.sessions.iter().map(|e| SessionSummary::from(e.value())).collect();
        summaries.sort_by_key(|s| s.session_id);
        summaries
    }
}
