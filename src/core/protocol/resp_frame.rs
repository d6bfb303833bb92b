// src/core/protocol/resp_frame.rs

//! The subset of RESP (REdis Serialization Protocol) spoken by the RESP backbone,
//! with its `tokio_util` codec.

use crate::core::BridgeError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const CRLF: &[u8] = b"\r\n";

// Limits applied to replies coming from the backbone server.
const MAX_ARRAY_LEN: usize = 1_024;
const MAX_BULK_LEN: usize = 64 * 1024 * 1024;
const MAX_DEPTH: usize = 8;

/// A single RESP value as exchanged with the backbone server.
#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Null,
    Array(Vec<RespFrame>),
}

impl RespFrame {
    /// Builds a command array such as `PUBLISH <topic> <payload>`.
    pub fn command<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        RespFrame::Array(
            parts
                .into_iter()
                .map(|p| RespFrame::BulkString(p.into()))
                .collect(),
        )
    }

    /// Returns the bytes of a bulk or simple string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespFrame::BulkString(b) => Some(b),
            RespFrame::SimpleString(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

/// Encoder/decoder for `RespFrame`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespFrameCodec;

impl Encoder<RespFrame> for RespFrameCodec {
    type Error = BridgeError;

    fn encode(&mut self, item: RespFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RespFrame::SimpleString(s) => write_line(dst, b'+', s.as_bytes()),
            RespFrame::Error(s) => write_line(dst, b'-', s.as_bytes()),
            RespFrame::Integer(i) => write_line(dst, b':', i.to_string().as_bytes()),
            RespFrame::BulkString(b) => {
                write_line(dst, b'$', b.len().to_string().as_bytes());
                dst.extend_from_slice(&b);
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Null => dst.extend_from_slice(b"$-1\r\n"),
            RespFrame::Array(items) => {
                write_line(dst, b'*', items.len().to_string().as_bytes());
                for item in items {
                    self.encode(item, dst)?;
                }
            }
        }
        Ok(())
    }
}

fn write_line(dst: &mut BytesMut, prefix: u8, body: &[u8]) {
    dst.reserve(body.len() + 3);
    dst.extend_from_slice(&[prefix]);
    dst.extend_from_slice(body);
    dst.extend_from_slice(CRLF);
}

impl Decoder for RespFrameCodec {
    type Item = RespFrame;
    type Error = BridgeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let mut cursor = &src[..];
        match parse_frame(&mut cursor, 0) {
            Ok(frame) => {
                let consumed = src.len() - cursor.len();
                src.advance(consumed);
                Ok(Some(frame))
            }
            // Wait for more bytes; nothing is consumed.
            Err(BridgeError::IncompleteData) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn parse_frame(cursor: &mut &[u8], depth: usize) -> Result<RespFrame, BridgeError> {
    if depth > MAX_DEPTH {
        return Err(malformed("nesting too deep"));
    }
    let Some((&prefix, rest)) = cursor.split_first() else {
        return Err(BridgeError::IncompleteData);
    };
    *cursor = rest;
    let line = take_line(cursor)?;

    match prefix {
        b'+' => Ok(RespFrame::SimpleString(
            String::from_utf8_lossy(line).into_owned(),
        )),
        b'-' => Ok(RespFrame::Error(String::from_utf8_lossy(line).into_owned())),
        b':' => Ok(RespFrame::Integer(parse_int(line)?)),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(RespFrame::Null);
            }
            let len = len as usize;
            if len > MAX_BULK_LEN {
                return Err(malformed("bulk string too large"));
            }
            if cursor.len() < len + CRLF.len() {
                return Err(BridgeError::IncompleteData);
            }
            if &cursor[len..len + CRLF.len()] != CRLF {
                return Err(malformed("bulk string not terminated by CRLF"));
            }
            let data = Bytes::copy_from_slice(&cursor[..len]);
            *cursor = &cursor[len + CRLF.len()..];
            Ok(RespFrame::BulkString(data))
        }
        b'*' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(RespFrame::Null);
            }
            let len = len as usize;
            if len > MAX_ARRAY_LEN {
                return Err(malformed("array too long"));
            }
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(parse_frame(cursor, depth + 1)?);
            }
            Ok(RespFrame::Array(items))
        }
        other => Err(malformed(&format!("unexpected type byte {other:#04x}"))),
    }
}

/// Splits off one CRLF-terminated line, advancing the cursor past the CRLF.
fn take_line<'a>(cursor: &mut &'a [u8]) -> Result<&'a [u8], BridgeError> {
    let pos = cursor
        .windows(CRLF.len())
        .position(|w| w == CRLF)
        .ok_or(BridgeError::IncompleteData)?;
    let line = &cursor[..pos];
    *cursor = &cursor[pos + CRLF.len()..];
    Ok(line)
}

fn parse_int(line: &[u8]) -> Result<i64, BridgeError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| malformed("invalid integer"))
}

fn malformed(reason: &str) -> BridgeError {
    BridgeError::BackboneUnavailable(format!("malformed RESP reply: {reason}"))
}
