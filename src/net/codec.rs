//! Encrypted-frame wire codec (§6)
//!
//! Frame layout: 64-byte hash (doubles as the ChaCha20Poly1305 nonce
//! material), 4-byte sequence number, 4-byte timestamp, 4-byte
//! advertised bandwidth, followed by length-prefixed embedded messages
//! (`{u16 size, u16 type}` per message).

use super::message::Message;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use sha3::{Digest, Sha3_512};
use thiserror::Error;

pub const HASH_LEN: usize = 64;
pub const HEADER_LEN: usize = HASH_LEN + 4 + 4 + 4;
/// Largest frame body this core will assemble or accept.
pub const MAX_BUFFER_SIZE: usize = 32 * 1024;
pub const FRAME_OVERHEAD: usize = HEADER_LEN;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame shorter than header ({0} < {HEADER_LEN})")]
    Malformed(usize),
    #[error("hash mismatch")]
    HashMismatch,
    #[error("message length prefix overruns frame")]
    TruncatedMessage,
    #[error("decrypt failed")]
    DecryptFailed,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub hash: [u8; HASH_LEN],
    pub sequence_number: u32,
    pub timestamp: u32,
    pub bandwidth: u32,
}

impl FrameHeader {
    pub fn is_plaintext_zero(&self) -> bool {
        self.sequence_number == 0 && self.timestamp == 0 && self.bandwidth == 0
    }
}

fn hash_plaintext(seq: u32, ts: u32, bw: u32, body: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Sha3_512::new();
    hasher.update(seq.to_be_bytes());
    hasher.update(ts.to_be_bytes());
    hasher.update(bw.to_be_bytes());
    hasher.update(body);
    let digest = hasher.finalize();
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&digest);
    out
}

/// Parse a raw frame's header and validate the hash against the claimed
/// plaintext-ness (§6: "A frame is plaintext iff all three fields
/// are zero and hash == hash(bytes[64..])").
pub fn parse_header(bytes: &[u8]) -> Result<(FrameHeader, &[u8]), CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Malformed(bytes.len()));
    }
    let mut hash = [0u8; HASH_LEN];
    hash.copy_from_slice(&bytes[0..HASH_LEN]);
    let sequence_number = u32::from_be_bytes(bytes[64..68].try_into().unwrap());
    let timestamp = u32::from_be_bytes(bytes[68..72].try_into().unwrap());
    let bandwidth = u32::from_be_bytes(bytes[72..76].try_into().unwrap());
    let rest = &bytes[HEADER_LEN..];
    Ok((
        FrameHeader { hash, sequence_number, timestamp, bandwidth },
        rest,
    ))
}

pub fn is_plaintext(header: &FrameHeader, rest: &[u8]) -> bool {
    header.is_plaintext_zero() && header.hash == hash_plaintext(0, 0, 0, rest)
}

/// Encode a set of already-ordered embedded messages into a plaintext
/// frame body (used for the initial SETKEY+PING exchange, which is
/// sent before any key exists).
pub fn encode_plaintext(messages: &[Message]) -> Result<Vec<u8>, postcard::Error> {
    let mut body = Vec::new();
    for m in messages {
        let bytes = m.encode()?;
        body.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        body.extend_from_slice(&m.wire_type().to_be_bytes());
        body.extend_from_slice(&bytes);
    }
    let hash = hash_plaintext(0, 0, 0, &body);
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&hash);
    frame.extend_from_slice(&0u32.to_be_bytes());
    frame.extend_from_slice(&0u32.to_be_bytes());
    frame.extend_from_slice(&0u32.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Encrypt an already-assembled plaintext body into a full encrypted
/// frame: compute the hash of `seq|ts|bw|body`, use the first 12 bytes
/// of that hash as the AEAD nonce, encrypt, and emit the header.
pub fn encode_encrypted(
    key: &[u8; 32],
    seq: u32,
    timestamp: u32,
    bandwidth: u32,
    body: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let hash = hash_plaintext(seq, timestamp, bandwidth, body);
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = Nonce::from_slice(&hash[0..12]);
    let ciphertext = cipher
        .encrypt(nonce, body)
        .map_err(|_| CodecError::DecryptFailed)?;

    let mut frame = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    frame.extend_from_slice(&hash);
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.extend_from_slice(&timestamp.to_be_bytes());
    frame.extend_from_slice(&bandwidth.to_be_bytes());
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

/// Decrypt a frame body given the header already parsed and validated
/// as non-plaintext, returning the recovered plaintext body.
pub fn decrypt_body(
    key: &[u8; 32],
    header: &FrameHeader,
    ciphertext: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = Nonce::from_slice(&header.hash[0..12]);
    let body = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CodecError::DecryptFailed)?;

    let recomputed = hash_plaintext(header.sequence_number, header.timestamp, header.bandwidth, &body);
    if recomputed != header.hash {
        return Err(CodecError::HashMismatch);
    }
    Ok(body)
}

/// Frame a single embedded message as `{u16 size, u16 type, bytes}`, the
/// unit `Entry::send_buffer` holds and the scheduler concatenates in
/// selection order to build a frame body.
pub fn frame_message(msg: &Message) -> Result<Vec<u8>, postcard::Error> {
    let bytes = msg.encode()?;
    let mut out = Vec::with_capacity(4 + bytes.len());
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(&msg.wire_type().to_be_bytes());
    out.extend_from_slice(&bytes);
    Ok(out)
}

/// Parse length-prefixed embedded messages out of a decoded frame body.
pub fn parse_messages(mut body: &[u8]) -> Result<Vec<Message>, CodecError> {
    let mut out = Vec::new();
    while !body.is_empty() {
        if body.len() < 4 {
            return Err(CodecError::TruncatedMessage);
        }
        let size = u16::from_be_bytes(body[0..2].try_into().unwrap()) as usize;
        let wire_type = u16::from_be_bytes(body[2..4].try_into().unwrap());
        if body.len() < 4 + size {
            return Err(CodecError::TruncatedMessage);
        }
        let payload = &body[4..4 + size];
        let msg = Message::decode(wire_type, payload).map_err(|_| CodecError::TruncatedMessage)?;
        out.push(msg);
        body = &body[4 + size..];
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::message::{PingPongPayload, TYPE_PING};
    use crate::net::peer_id::PeerId;

    fn id(b: u8) -> PeerId {
        PeerId([b; 64])
    }

    #[test]
    fn plaintext_frame_roundtrips() {
        let msgs = vec![Message::Ping(PingPongPayload { target: id(1), challenge: 42 })];
        let frame = encode_plaintext(&msgs).unwrap();
        let (header, rest) = parse_header(&frame).unwrap();
        assert!(is_plaintext(&header, rest));
        let decoded = parse_messages(rest).unwrap();
        assert_eq!(decoded.len(), 1);
        match &decoded[0] {
            Message::Ping(p) => assert_eq!(p.challenge, 42),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn encrypted_frame_roundtrips() {
        let key = [7u8; 32];
        let body = {
            let msgs = vec![Message::Ping(PingPongPayload { target: id(2), challenge: 9 })];
            let mut b = Vec::new();
            for m in &msgs {
                let bytes = m.encode().unwrap();
                b.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                b.extend_from_slice(&TYPE_PING.to_be_bytes());
                b.extend_from_slice(&bytes);
            }
            b
        };

        let frame = encode_encrypted(&key, 5, 1000, 60_000, &body).unwrap();
        let (header, ciphertext) = parse_header(&frame).unwrap();
        assert!(!is_plaintext(&header, ciphertext));
        let decrypted = decrypt_body(&key, &header, ciphertext).unwrap();
        assert_eq!(decrypted, body);
    }

    #[test]
    fn tampered_ciphertext_fails_decrypt() {
        let key = [3u8; 32];
        let frame = encode_encrypted(&key, 1, 1, 1, b"hello").unwrap();
        let (header, ciphertext) = parse_header(&frame).unwrap();
        let mut tampered = ciphertext.to_vec();
        tampered[0] ^= 0xff;
        assert!(decrypt_body(&key, &header, &tampered).is_err());
    }

    #[test]
    fn short_frame_is_malformed() {
        assert!(parse_header(&[0u8; 10]).is_err());
    }
}
