// src/core/protocol/mod.rs

//! Wire formats: client frames, backbone envelopes, and RESP for the RESP backbone.

pub mod client_frame;
pub mod envelope;
pub mod resp_frame;

pub use client_frame::{ClientAction, ClientFrame, data_to_payload};
pub use envelope::{ClientReply, Envelope, INIT_ACK, encode, encode_delivery};
pub use resp_frame::{RespFrame, RespFrameCodec};
