//! Embedded message types carried inside an encrypted (or plaintext) frame

use super::peer_id::PeerId;
use serde::{Deserialize, Serialize};

/// Wire type tags for the message kinds this core understands directly;
/// everything else is an opaque application type dispatched to external
/// handlers (§6).
pub const TYPE_SET_KEY: u16 = 1;
pub const TYPE_PING: u16 = 2;
pub const TYPE_PONG: u16 = 3;
pub const TYPE_HANGUP: u16 = 4;
pub const TYPE_NOISE: u16 = 5;
pub const TYPE_APPLICATION_BASE: u16 = 1000;

pub const MAX_SET_KEY_SIZE: usize = 4096;
pub const MAX_PING_PONG_SIZE: usize = 128;
pub const MAX_HANGUP_SIZE: usize = 128;
pub const MAX_APPLICATION_SIZE: usize = 65_536;

/// SET_KEY payload (§6.0 / §6.0): an X25519 ephemeral
/// public key plus a ChaCha20Poly1305-sealed body carrying the symmetric
/// key, the sender's public key, the target peer, a creation time, and
/// a signature over the preceding fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetKeyPayload {
    pub ephemeral_pubkey: [u8; 32],
    pub nonce: [u8; 12],
    pub sealed: Vec<u8>,
}

/// Plaintext body sealed inside `SetKeyPayload::sealed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetKeyBody {
    pub session_key: [u8; 32],
    pub sender_pubkey: Vec<u8>,
    pub target: PeerId,
    pub created_at: u64,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PingPongPayload {
    pub target: PeerId,
    pub challenge: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HangupPayload {
    pub peer: PeerId,
}

/// An embedded message as parsed from a frame body.
#[derive(Debug, Clone)]
pub enum Message {
    SetKey(SetKeyPayload),
    Ping(PingPongPayload),
    Pong(PingPongPayload),
    Hangup(HangupPayload),
    Noise(Vec<u8>),
    Application { kind: u16, bytes: Vec<u8> },
}

impl Message {
    pub fn wire_type(&self) -> u16 {
        match self {
            Message::SetKey(_) => TYPE_SET_KEY,
            Message::Ping(_) => TYPE_PING,
            Message::Pong(_) => TYPE_PONG,
            Message::Hangup(_) => TYPE_HANGUP,
            Message::Noise(_) => TYPE_NOISE,
            Message::Application { kind, .. } => *kind,
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            Message::SetKey(_) => "set_key",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Hangup(_) => "hangup",
            Message::Noise(_) => "noise",
            Message::Application { .. } => "application",
        }
    }

    pub fn max_size_for_type(wire_type: u16) -> usize {
        match wire_type {
            TYPE_SET_KEY => MAX_SET_KEY_SIZE,
            TYPE_PING | TYPE_PONG => MAX_PING_PONG_SIZE,
            TYPE_HANGUP => MAX_HANGUP_SIZE,
            TYPE_NOISE => MAX_APPLICATION_SIZE,
            _ => MAX_APPLICATION_SIZE,
        }
    }

    /// Handlers that never touch the wire before the handshake completes
    /// (SETKEY/PING/PONG may legally arrive on a plaintext frame).
    pub fn allowed_plaintext(&self) -> bool {
        matches!(self, Message::SetKey(_) | Message::Ping(_) | Message::Pong(_))
    }

    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        match self {
            Message::SetKey(p) => postcard::to_allocvec(p),
            Message::Ping(p) | Message::Pong(p) => postcard::to_allocvec(p),
            Message::Hangup(p) => postcard::to_allocvec(p),
            Message::Noise(b) => Ok(b.clone()),
            Message::Application { bytes, .. } => Ok(bytes.clone()),
        }
    }

    pub fn decode(wire_type: u16, bytes: &[u8]) -> Result<Message, postcard::Error> {
        Ok(match wire_type {
            TYPE_SET_KEY => Message::SetKey(postcard::from_bytes(bytes)?),
            TYPE_PING => Message::Ping(postcard::from_bytes(bytes)?),
            TYPE_PONG => Message::Pong(postcard::from_bytes(bytes)?),
            TYPE_HANGUP => Message::Hangup(postcard::from_bytes(bytes)?),
            TYPE_NOISE => Message::Noise(bytes.to_vec()),
            kind => Message::Application { kind, bytes: bytes.to_vec() },
        })
    }
}
