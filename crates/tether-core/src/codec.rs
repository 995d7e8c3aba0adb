//! Channel codecs for Tether.
//!
//! Provides three things:
//!   1. StandardCodec — the main channel and HTTP fallback framing
//!   2. LightCodec — the untagged framing used by auxiliary streams
//!   3. Handshake helpers — salt key derivation, `Key` sealing, secret minting
//!
//! Every variant is AES in CTR mode with a 128-bit big-endian counter
//! over the whole IV. The key size picks AES-128/192/256.
//!
//! StandardCodec wire format:
//!   [MD5(plaintext || nonce) (16 bytes)] [CTR(plaintext || nonce, IV = tag)]
//!
//! The tag is an integrity check against corruption, not a MAC.

use aes::{Aes128, Aes192, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use md5::{Digest, Md5};
use rand::RngCore;
use thiserror::Error;

type Ctr<C> = ctr::Ctr128BE<C>;

/// MD5 tag prefixed to every tagged frame.
pub const TAG_LEN: usize = 16;

/// Random bytes appended to the plaintext before tagging.
pub const NONCE_LEN: usize = 64;

/// Per-session shared secret minted at handshake.
pub const SECRET_LEN: usize = 32;

/// Site salt is padded to an AES-192 key.
pub const SALT_LEN: usize = 24;
const SALT_PAD: u8 = 0x19;

/// Agent identity presented at handshake.
pub const UUID_LEN: usize = 16;

/// Largest encoded frame sent on the persistent channel.
/// Anything bigger goes through the HTTP fallback.
pub const CHANNEL_FRAME_LIMIT: usize = 1024;

// ── Key ───────────────────────────────────────────────────────────────────────

#[derive(Clone)]
enum CipherKey {
    Aes128([u8; 16]),
    Aes192([u8; 24]),
    Aes256([u8; 32]),
}

impl CipherKey {
    fn from_slice(key: &[u8]) -> Result<Self, CodecError> {
        let bad = || CodecError::InvalidKey(key.len());
        Ok(match key.len() {
            16 => Self::Aes128(key.try_into().map_err(|_| bad())?),
            24 => Self::Aes192(key.try_into().map_err(|_| bad())?),
            32 => Self::Aes256(key.try_into().map_err(|_| bad())?),
            _ => return Err(bad()),
        })
    }

    fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Aes128(k) => k,
            Self::Aes192(k) => k,
            Self::Aes256(k) => k,
        }
    }

    /// XOR the keystream for `iv` into `buf`. Encrypt and decrypt are the same.
    fn apply(&self, iv: &[u8; 16], buf: &mut [u8]) {
        match self {
            Self::Aes128(k) => Ctr::<Aes128>::new(k.into(), iv.into()).apply_keystream(buf),
            Self::Aes192(k) => Ctr::<Aes192>::new(k.into(), iv.into()).apply_keystream(buf),
            Self::Aes256(k) => Ctr::<Aes256>::new(k.into(), iv.into()).apply_keystream(buf),
        }
    }
}

fn md5_tag(data: &[u8]) -> [u8; TAG_LEN] {
    Md5::digest(data).into()
}

/// Fill a fixed-size array from the thread RNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

// ── FrameCodec ────────────────────────────────────────────────────────────────

/// A symmetric framing bound to one key.
pub trait FrameCodec: Send + Sync {
    fn encode(&self, plaintext: &[u8]) -> Vec<u8>;
    fn decode(&self, wire: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Tagged, nonce-padded AES-CTR framing.
///
/// Identical plaintexts encode to different frames because the random
/// nonce feeds the tag, and the tag is the IV.
#[derive(Clone)]
pub struct StandardCodec {
    key: CipherKey,
}

impl StandardCodec {
    pub fn new(key: &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            key: CipherKey::from_slice(key)?,
        })
    }

    /// AES-256 codec for a minted session secret.
    pub fn from_secret(secret: &[u8; SECRET_LEN]) -> Self {
        Self {
            key: CipherKey::Aes256(*secret),
        }
    }

    /// Tagged framing without the nonce. Used for the handshake `Key` header,
    /// where the plaintext is a random identity already.
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let tag = md5_tag(plaintext);
        let mut out = Vec::with_capacity(TAG_LEN + plaintext.len());
        out.extend_from_slice(&tag);
        out.extend_from_slice(plaintext);
        self.key.apply(&tag, &mut out[TAG_LEN..]);
        out
    }

    /// Inverse of [`seal`](Self::seal).
    pub fn open(&self, wire: &[u8]) -> Result<Vec<u8>, CodecError> {
        if wire.len() <= TAG_LEN {
            return Err(CodecError::TooShort(wire.len()));
        }
        let (tag, body) = split_tag(wire);
        let mut plain = body.to_vec();
        self.key.apply(&tag, &mut plain);
        if md5_tag(&plain) != tag {
            return Err(CodecError::Verification);
        }
        Ok(plain)
    }
}

impl FrameCodec for StandardCodec {
    fn encode(&self, plaintext: &[u8]) -> Vec<u8> {
        let nonce: [u8; NONCE_LEN] = random_bytes();
        let mut body = Vec::with_capacity(plaintext.len() + NONCE_LEN);
        body.extend_from_slice(plaintext);
        body.extend_from_slice(&nonce);

        let tag = md5_tag(&body);
        self.key.apply(&tag, &mut body);

        let mut out = Vec::with_capacity(TAG_LEN + body.len());
        out.extend_from_slice(&tag);
        out.extend_from_slice(&body);
        out
    }

    fn decode(&self, wire: &[u8]) -> Result<Vec<u8>, CodecError> {
        if wire.len() <= TAG_LEN + NONCE_LEN {
            return Err(CodecError::TooShort(wire.len()));
        }
        let (tag, body) = split_tag(wire);
        let mut plain = body.to_vec();
        self.key.apply(&tag, &mut plain);
        if md5_tag(&plain) != tag {
            return Err(CodecError::Verification);
        }
        plain.truncate(plain.len() - NONCE_LEN);
        Ok(plain)
    }
}

fn split_tag(wire: &[u8]) -> ([u8; TAG_LEN], &[u8]) {
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&wire[..TAG_LEN]);
    (tag, &wire[TAG_LEN..])
}

/// Silence after which an auxiliary stream is dropped.
pub const LIGHT_STREAM_IDLE: std::time::Duration = std::time::Duration::from_secs(300);

/// Untagged AES-CTR with the first 16 key bytes as IV.
///
/// Kept for wire compatibility with the terminal and desktop streams.
/// There is no integrity check: decode never fails on content.
#[derive(Clone)]
pub struct LightCodec {
    key: CipherKey,
    iv: [u8; 16],
}

impl LightCodec {
    pub fn new(key: &[u8]) -> Result<Self, CodecError> {
        let key = CipherKey::from_slice(key)?;
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&key.as_bytes()[..16]);
        Ok(Self { key, iv })
    }

    /// Encrypt or decrypt in place.
    pub fn apply(&self, buf: &mut [u8]) {
        self.key.apply(&self.iv, buf);
    }
}

impl FrameCodec for LightCodec {
    fn encode(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut out = plaintext.to_vec();
        self.apply(&mut out);
        out
    }

    fn decode(&self, wire: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(self.encode(wire))
    }
}

// ── Transport selection ───────────────────────────────────────────────────────

/// Where an encoded frame travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Binary message on the persistent channel.
    Channel,
    /// HTTP POST to the fallback endpoint with the `Secret` header.
    Fallback,
}

pub fn select_transport(encoded_len: usize) -> Transport {
    if encoded_len <= CHANNEL_FRAME_LIMIT {
        Transport::Channel
    } else {
        Transport::Fallback
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Pad the site salt to a 24-byte AES-192 key.
pub fn salt_key(salt: &str) -> Result<[u8; SALT_LEN], CodecError> {
    let raw = salt.as_bytes();
    if raw.len() > SALT_LEN {
        return Err(CodecError::SaltTooLong(raw.len()));
    }
    let mut key = [SALT_PAD; SALT_LEN];
    key[..raw.len()].copy_from_slice(raw);
    Ok(key)
}

/// Codec keyed by the padded site salt.
pub fn salt_codec(salt: &str) -> Result<StandardCodec, CodecError> {
    StandardCodec::new(&salt_key(salt)?)
}

/// Build the `UUID` and `Key` header values an agent presents.
pub fn handshake_headers(salt: &StandardCodec, uuid: &[u8; UUID_LEN]) -> (String, String) {
    (hex::encode(uuid), hex::encode(salt.seal(uuid)))
}

/// Check the `UUID` and `Key` headers. Returns the verified identity.
///
/// `Key` must open under the salt and recover exactly the claimed `UUID`.
pub fn verify_handshake(
    salt: &StandardCodec,
    uuid_hex: &str,
    key_hex: &str,
) -> Result<[u8; UUID_LEN], HandshakeError> {
    let uuid = hex::decode(uuid_hex).map_err(|_| HandshakeError::BadHex("UUID"))?;
    let key = hex::decode(key_hex).map_err(|_| HandshakeError::BadHex("Key"))?;
    if uuid.len() != UUID_LEN {
        return Err(HandshakeError::BadLength("UUID", uuid.len()));
    }
    if key.len() != TAG_LEN + UUID_LEN {
        return Err(HandshakeError::BadLength("Key", key.len()));
    }
    let opened = salt.open(&key)?;
    if opened != uuid {
        return Err(HandshakeError::IdentityMismatch);
    }
    let mut out = [0u8; UUID_LEN];
    out.copy_from_slice(&uuid);
    Ok(out)
}

/// Mint a fresh session secret.
pub fn new_secret() -> [u8; SECRET_LEN] {
    random_bytes()
}

/// Parse a hex `Secret` header value.
pub fn parse_secret(secret_hex: &str) -> Result<[u8; SECRET_LEN], HandshakeError> {
    let raw = hex::decode(secret_hex).map_err(|_| HandshakeError::BadHex("Secret"))?;
    raw.as_slice()
        .try_into()
        .map_err(|_| HandshakeError::BadLength("Secret", raw.len()))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),

    #[error("integrity tag mismatch")]
    Verification,

    #[error("key must be 16, 24 or 32 bytes, got {0}")]
    InvalidKey(usize),

    #[error("salt must be at most 24 bytes, got {0}")]
    SaltTooLong(usize),

    #[error("packet json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Handshake rejection. Always answered with 401 before a session exists.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("missing {0} header")]
    Missing(&'static str),

    #[error("{0} header is not hex")]
    BadHex(&'static str),

    #[error("{0} header has wrong length ({1} bytes)")]
    BadLength(&'static str, usize),

    #[error("Key does not open under the site salt: {0}")]
    Codec(#[from] CodecError),

    #[error("Key does not match UUID")]
    IdentityMismatch,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
