//! Identity signing primitives (ML-DSA-65 / Dilithium3)
//!
//! The identity/keystore service itself is out of this crate's scope
//! (§1) — `net::handshake::Signer` / `SignatureVerifier` are the
//! trait boundary the embedder crosses. This module is one concrete,
//! embeddable implementation of that boundary, kept alongside the
//! core rather than inside `net` since it owns key material the core
//! never touches directly.

use crate::net::handshake::{SignatureVerifier, Signer};
use pqcrypto_dilithium::dilithium3 as dilithium;
use pqcrypto_traits::sign::{DetachedSignature, PublicKey as PkTrait, SecretKey as SkTrait};
use thiserror::Error;

pub const MLDSA65_PUBKEY_SIZE: usize = 1952;
pub const MLDSA65_SIG_SIZE: usize = 3293;
pub const MLDSA65_SECRET_SIZE: usize = 4000;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid public key")]
    InvalidPublicKey,
}

/// A generated identity keypair. `secret` never leaves this type.
pub struct Keypair {
    public: Vec<u8>,
    secret: dilithium::SecretKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let (pk, sk) = dilithium::keypair();
        Self { public: pk.as_bytes().to_vec(), secret: sk }
    }

    pub fn public_key_bytes(&self) -> &[u8] {
        &self.public
    }
}

impl Signer for Keypair {
    fn sign(&self, message: &[u8]) -> Vec<u8> {
        dilithium::detached_sign(message, &self.secret).as_bytes().to_vec()
    }

    fn public_key(&self) -> Vec<u8> {
        self.public.clone()
    }
}

/// Stateless verifier over ML-DSA-65 detached signatures; used on both
/// the SETKEY signature check and, embedder-side, on HELLO.
pub struct DilithiumVerifier;

impl SignatureVerifier for DilithiumVerifier {
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        verify(public_key, message, signature).is_ok()
    }
}

pub fn verify(pubkey: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let pk = dilithium::PublicKey::from_bytes(pubkey).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig = dilithium::DetachedSignature::from_bytes(signature)
        .map_err(|_| CryptoError::InvalidSignature)?;
    dilithium::verify_detached_signature(&sig, message, &pk).map_err(|_| CryptoError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"hello core");
        assert!(verify(kp.public_key_bytes(), b"hello core", &sig).is_ok());
    }

    #[test]
    fn tampered_message_fails_verification() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"hello core");
        assert!(verify(kp.public_key_bytes(), b"goodbye core", &sig).is_err());
    }
}
