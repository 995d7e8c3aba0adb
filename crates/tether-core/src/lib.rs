//! tether-core — packet model, channel codecs, raw frame header, and config.
//! All other Tether crates depend on this one.

pub mod codec;
pub mod config;
pub mod packet;
pub mod wire;

pub use codec::{CodecError, FrameCodec, HandshakeError, LightCodec, StandardCodec, Transport};
pub use packet::{act, new_token, Device, Packet, PowerAct};
