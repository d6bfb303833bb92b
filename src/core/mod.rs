// src/core/mod.rs

//! The central module containing the bridge's core logic and data structures.

pub mod backbone;
pub mod errors;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod state;

pub use errors::BridgeError;
pub use protocol::{ClientAction, ClientFrame, ClientReply, Envelope};
