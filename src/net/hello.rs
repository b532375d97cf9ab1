//! HELLO peer advertisement (§6)
//!
//! Produced/consumed via the transport collaborator; this crate only
//! owns the message shape and signature verification, not the address
//! resolution or transport wiring that builds one.

use super::peer_id::PeerId;
use serde::{Deserialize, Serialize};

pub const MAX_HELLO_EXPIRES_SECS: u64 = 10 * 24 * 60 * 60;
pub const MAX_ADDRESS_LEN: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloMessage {
    pub public_key: Vec<u8>,
    pub sender: PeerId,
    pub expires_at: u64,
    pub protocol: u16,
    pub mtu: u16,
    pub address: Vec<u8>,
    pub signature: Vec<u8>,
}

impl HelloMessage {
    /// Bytes covered by the signature: every field except the signature
    /// itself, in wire order.
    fn signed_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.public_key);
        buf.extend_from_slice(self.sender.as_bytes());
        buf.extend_from_slice(&self.expires_at.to_be_bytes());
        buf.extend_from_slice(&self.protocol.to_be_bytes());
        buf.extend_from_slice(&self.mtu.to_be_bytes());
        buf.extend_from_slice(&self.address);
        buf
    }

    pub fn is_expired(&self, now_secs: u64) -> bool {
        now_secs >= self.expires_at
    }

    pub fn verify(&self, verify_fn: impl Fn(&[u8], &[u8], &[u8]) -> bool) -> bool {
        self.address.len() <= MAX_ADDRESS_LEN
            && verify_fn(&self.public_key, &self.signed_bytes(), &self.signature)
    }
}

/// Clamp a configured expiry (minutes) into a concrete `expires_at`
/// timestamp, bounded by `MAX_HELLO_EXPIRES_SECS` (§6).
pub fn compute_expires_at(now_secs: u64, requested_minutes: u32) -> u64 {
    let requested_secs = (requested_minutes as u64).saturating_mul(60);
    now_secs + requested_secs.min(MAX_HELLO_EXPIRES_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_bounded() {
        let now = 1_000_000;
        let expires = compute_expires_at(now, u32::MAX);
        assert!(expires - now <= MAX_HELLO_EXPIRES_SECS);
    }

    #[test]
    fn verify_rejects_bad_signature() {
        let hello = HelloMessage {
            public_key: vec![1, 2, 3],
            sender: PeerId([0u8; 64]),
            expires_at: 100,
            protocol: 1,
            mtu: 1400,
            address: vec![127, 0, 0, 1],
            signature: vec![9, 9, 9],
        };
        assert!(!hello.verify(|_, _, _| false));
        assert!(hello.verify(|_, _, _| true));
    }
}
