// src/connection/mod.rs

//! Manages the lifecycle of a single bridged client connection: the WebSocket
//! handshake, frame dispatch, backbone deliveries, and teardown.

mod guard;
mod handler;
mod session;

pub use guard::SessionGuard;
pub use handler::{ConnectionHandler, serve};
pub use session::{Session, SessionPhase};
