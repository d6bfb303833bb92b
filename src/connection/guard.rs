// src/connection/guard.rs

//! Defines `SessionGuard`, an RAII guard for session bookkeeping.

use crate::core::metrics;
use crate::core::state::BridgeState;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Removes a session from the registry when the connection task exits, on
/// every path: normal close, error, shutdown, or panic.
pub struct SessionGuard {
    state: Arc<BridgeState>,
    session_id: u64,
    addr: SocketAddr,
}

impl SessionGuard {
    /// Registers a new session for `addr` and returns the guard owning its entry.
    pub(crate) fn register(state: Arc<BridgeState>, addr: SocketAddr) -> Self {
        let session_id = state.registry.register(addr);
        metrics::CONNECTED_SESSIONS.inc();
        Self {
            state,
            session_id,
            addr,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        metrics::CONNECTED_SESSIONS.dec();
        if !self.state.registry.remove(self.session_id) {
            debug!(
                "Session {} ({}) was already gone from the registry.",
                self.session_id, self.addr
            );
        } else {
            debug!(
                "Session {} ({}) removed from the registry.",
                self.session_id, self.addr
            );
        }
    }
}
