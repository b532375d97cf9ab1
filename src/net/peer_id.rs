//! Opaque peer identity: a 512-bit hash with a bitwise distance metric

use serde::{Deserialize, Serialize};
use std::fmt;

pub const PEER_ID_BYTES: usize = 64;

/// Opaque 512-bit peer identity.
///
/// `PeerId` carries no semantics of its own beyond equality, ordering
/// for deterministic iteration, and the XOR distance used for bucket
/// selection and priority tie-breaks.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; PEER_ID_BYTES]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; PEER_ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_BYTES] {
        &self.0
    }

    /// XOR distance between two peer ids.
    pub fn distance(&self, other: &PeerId) -> PeerId {
        let mut out = [0u8; PEER_ID_BYTES];
        for i in 0..PEER_ID_BYTES {
            out[i] = self.0[i] ^ other.0[i];
        }
        PeerId(out)
    }

    /// Number of leading zero bits in `self.distance(other)`; larger is closer.
    pub fn distance_leading_zeros(&self, other: &PeerId) -> u32 {
        let d = self.distance(other);
        for (i, byte) in d.0.iter().enumerate() {
            if *byte != 0 {
                return (i as u32) * 8 + byte.leading_zeros();
            }
        }
        (PEER_ID_BYTES as u32) * 8
    }

    /// Low bits used for bucket index selection, independent of distance.
    pub fn low_bits(&self, bits: u32) -> u64 {
        debug_assert!(bits <= 64);
        let mut v = 0u64;
        let take = ((bits as usize) + 7) / 8;
        for i in 0..take.min(PEER_ID_BYTES) {
            v = (v << 8) | self.0[PEER_ID_BYTES - 1 - i] as u64;
        }
        if bits < 64 {
            v &= (1u64 << bits) - 1;
        }
        v
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_symmetric() {
        let a = PeerId([1u8; PEER_ID_BYTES]);
        let b = PeerId([2u8; PEER_ID_BYTES]);
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn distance_to_self_is_zero() {
        let a = PeerId([7u8; PEER_ID_BYTES]);
        assert_eq!(a.distance(&a), PeerId([0u8; PEER_ID_BYTES]));
        assert_eq!(a.distance_leading_zeros(&a), (PEER_ID_BYTES as u32) * 8);
    }

    #[test]
    fn low_bits_extracts_trailing_byte() {
        let mut bytes = [0u8; PEER_ID_BYTES];
        bytes[PEER_ID_BYTES - 1] = 0b1010_1010;
        let id = PeerId(bytes);
        assert_eq!(id.low_bits(8), 0b1010_1010);
        assert_eq!(id.low_bits(4), 0b1010);
    }
}
