//! Raw frame header.
//!
//! High-rate streams skip the JSON envelope and the codec entirely. A raw
//! frame is a binary channel message with a fixed header:
//!
//!   [magic (4)] [service (1)] [op (1)] [event token (16)] [payload ...]
//!
//! The event token routes the payload to the registration that asked
//! for it. Anything that does not match the header is a codec frame.

use bytes::Bytes;

pub const RAW_MAGIC: [u8; 4] = [34, 22, 19, 17];

/// Service byte for event-routed raw frames.
pub const RAW_SERVICE_EVENT: u8 = 20;

pub const RAW_HEADER_LEN: usize = 22;

const TOKEN_OFFSET: usize = 6;
const TOKEN_LEN: usize = 16;

/// A decoded raw frame header plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub op: u8,
    /// Hex event token.
    pub event: String,
    pub payload: Bytes,
}

impl RawFrame {
    /// Recognise an event-routed raw frame. Returns None for codec frames.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < RAW_HEADER_LEN {
            return None;
        }
        if buf[..4] != RAW_MAGIC || buf[4] != RAW_SERVICE_EVENT {
            return None;
        }
        Some(Self {
            op: buf[5],
            event: hex::encode(&buf[TOKEN_OFFSET..TOKEN_OFFSET + TOKEN_LEN]),
            payload: Bytes::copy_from_slice(&buf[RAW_HEADER_LEN..]),
        })
    }

    /// Serialize. Fails if `event` is not 16 bytes of hex.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        let token = hex::decode(&self.event).ok()?;
        if token.len() != TOKEN_LEN {
            return None;
        }
        let mut out = Vec::with_capacity(RAW_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&RAW_MAGIC);
        out.push(RAW_SERVICE_EVENT);
        out.push(self.op);
        out.extend_from_slice(&token);
        out.extend_from_slice(&self.payload);
        Some(out)
    }
}
