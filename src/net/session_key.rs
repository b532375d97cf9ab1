//! Per-peer symmetric session key material

use serde::{Deserialize, Serialize};

pub const SESSION_KEY_BYTES: usize = 32;

/// Symmetric key plus a CRC integrity check over its bytes.
///
/// An `Entry` holds two independent instances: `local_key` to encrypt
/// outbound frames and `remote_key` to decrypt inbound ones.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionKey {
    key: [u8; SESSION_KEY_BYTES],
    crc: u32,
    pub created_at: u64,
}

impl SessionKey {
    pub fn new(key: [u8; SESSION_KEY_BYTES], created_at: u64) -> Self {
        let crc = crc32fast::hash(&key);
        Self { key, crc, created_at }
    }

    /// Reject key material whose CRC does not match; guards against
    /// corrupt bytes before they are installed into an `Entry`.
    pub fn verify(&self) -> bool {
        crc32fast::hash(&self.key) == self.crc
    }

    pub fn key(&self) -> &[u8; SESSION_KEY_BYTES] {
        &self.key
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("crc", &self.crc)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_detects_corruption() {
        let mut sk = SessionKey::new([1u8; SESSION_KEY_BYTES], 100);
        assert!(sk.verify());
        sk.key[0] ^= 0xff;
        assert!(!sk.verify());
    }
}
