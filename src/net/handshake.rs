//! SETKEY / PING-PONG session-establishment state machine (§4.3)

use super::entry::{Entry, Status};
use super::message::{HangupPayload, Message, PingPongPayload, SetKeyBody, SetKeyPayload};
use super::peer_id::PeerId;
use super::session_key::SessionKey;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use std::collections::HashMap;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};

/// Upper bound on globally outstanding PING challenges (§4.3/§5).
pub const MAX_PING_PONG: usize = 4096;
pub const SECONDS_INACTIVE_DROP: u64 = 300;
pub const SECONDS_NOPINGPONG_DROP: u64 = 30;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("ping table is full")]
    PingTableFull,
    #[error("challenge mismatch")]
    ChallengeMismatch,
    #[error("session key seal/open failed")]
    CryptoFailed,
    #[error("key material failed integrity check")]
    CorruptKey,
    #[error("signature verification failed")]
    SignatureInvalid,
}

/// Identity-service boundary: signing is out of this crate's scope
/// (§1), so SETKEY bodies are signed/verified through a trait the
/// embedder implements.
pub trait Signer: Send + Sync {
    fn sign(&self, message: &[u8]) -> Vec<u8>;
    fn public_key(&self) -> Vec<u8>;
}

pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool;
}

/// Global table of outstanding PING challenges we've sent, capacity
/// bounded by `MAX_PING_PONG` (§4.3, §5: "overflow is a hard error
/// that surfaces to the caller").
#[derive(Default)]
pub struct PingTable {
    outstanding: HashMap<(PeerId, u32), u64>,
}

impl PingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, peer: PeerId, challenge: u32, expires_at: u64) -> Result<(), HandshakeError> {
        if self.outstanding.len() >= MAX_PING_PONG {
            return Err(HandshakeError::PingTableFull);
        }
        self.outstanding.insert((peer, challenge), expires_at);
        Ok(())
    }

    /// Consume a matching PONG; returns true if a matching outstanding
    /// PING existed.
    pub fn take(&mut self, peer: PeerId, challenge: u32) -> bool {
        self.outstanding.remove(&(peer, challenge)).is_some()
    }

    /// Drop entries past their expiry, freeing the slot (§5).
    pub fn expire(&mut self, now_secs: u64) {
        self.outstanding.retain(|_, expires_at| *expires_at > now_secs);
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }
}

fn random_challenge() -> u32 {
    rand::thread_rng().next_u32()
}

fn random_session_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Seal a `SetKeyBody` under an ephemeral X25519/ChaCha20Poly1305
/// exchange (§6.0's substitution for the original RSA
/// encryption; no RSA dependency is available in this stack).
pub fn build_set_key_payload(
    remote_static_pub: &X25519Public,
    body: &SetKeyBody,
) -> Result<SetKeyPayload, HandshakeError> {
    let ephemeral = EphemeralSecret::random_from_rng(rand::thread_rng());
    let ephemeral_pub = X25519Public::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(remote_static_pub);

    let plaintext = postcard::to_allocvec(body).map_err(|_| HandshakeError::CryptoFailed)?;
    let cipher = ChaCha20Poly1305::new(shared.as_bytes().into());
    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let sealed = cipher
        .encrypt(nonce, plaintext.as_slice())
        .map_err(|_| HandshakeError::CryptoFailed)?;

    Ok(SetKeyPayload {
        ephemeral_pubkey: *ephemeral_pub.as_bytes(),
        nonce: nonce_bytes,
        sealed,
    })
}

pub fn open_set_key_payload(
    our_static_secret: &StaticSecret,
    payload: &SetKeyPayload,
) -> Result<SetKeyBody, HandshakeError> {
    let remote_ephemeral = X25519Public::from(payload.ephemeral_pubkey);
    let shared = our_static_secret.diffie_hellman(&remote_ephemeral);
    let cipher = ChaCha20Poly1305::new(shared.as_bytes().into());
    let nonce = Nonce::from_slice(&payload.nonce);
    let plaintext = cipher
        .decrypt(nonce, payload.sealed.as_slice())
        .map_err(|_| HandshakeError::CryptoFailed)?;
    postcard::from_bytes(&plaintext).map_err(|_| HandshakeError::CryptoFailed)
}

/// Result of processing an inbound SETKEY: the messages that must be
/// sent back, keyed by the new status they bring the entry to.
pub struct HandshakeOutcome {
    pub reply: Vec<Message>,
    pub new_status: Status,
}

/// `Down` / `InitiateConnect`: generate a local key, return the
/// plaintext SETKEY+PING1 the caller must transmit.
pub fn initiate_connect(
    entry: &mut Entry,
    local_id: PeerId,
    remote_static_pub: &X25519Public,
    signer: &dyn Signer,
    now_secs: u64,
    ping_table: &mut PingTable,
) -> Result<Vec<Message>, HandshakeError> {
    let key = random_session_key();
    entry.local_key = Some(SessionKey::new(key, now_secs));

    let body = SetKeyBody {
        session_key: key,
        sender_pubkey: signer.public_key(),
        target: entry.peer,
        created_at: now_secs,
        signature: Vec::new(),
    };
    let signed = signer.sign(&postcard::to_allocvec(&body).unwrap_or_default());
    let body = SetKeyBody { signature: signed, ..body };
    let set_key = build_set_key_payload(remote_static_pub, &body)?;

    let challenge = random_challenge();
    ping_table.register(entry.peer, challenge, now_secs + SECONDS_NOPINGPONG_DROP)?;

    entry.status = Status::SetKeySent;
    entry.last_alive = now_secs;
    entry.established_at = now_secs;

    Ok(vec![
        Message::SetKey(set_key),
        Message::Ping(PingPongPayload { target: local_id, challenge }),
    ])
}

/// `Down` or `SetKeySent` / `ReceiveSetKey`.
///
/// Fresh (from `Down`): accept the remote key, answer with our own
/// SETKEY + PONG1 (echoing the inbound PING challenge) + a fresh PING2.
///
/// Completing (`SetKeySent` with an embedded PONG echoing our earlier
/// challenge): accept the remote key and reply with PONG2 over the now
/// -encrypted channel; the entry transitions directly to `Up` since the
/// PONG1 we just validated is itself proof of receipt.
pub fn receive_set_key(
    entry: &mut Entry,
    local_id: PeerId,
    remote_static_pub: &X25519Public,
    our_static_secret: &StaticSecret,
    signer: &dyn Signer,
    verifier: &dyn SignatureVerifier,
    set_key: &SetKeyPayload,
    accompanying: &[Message],
    now_secs: u64,
    ping_table: &mut PingTable,
) -> Result<HandshakeOutcome, HandshakeError> {
    let body = open_set_key_payload(our_static_secret, set_key)?;
    if body.target != local_id {
        return Err(HandshakeError::SignatureInvalid);
    }
    let unsigned = SetKeyBody { signature: Vec::new(), ..body.clone() };
    if !verifier.verify(
        &body.sender_pubkey,
        &postcard::to_allocvec(&unsigned).unwrap_or_default(),
        &body.signature,
    ) {
        return Err(HandshakeError::SignatureInvalid);
    }

    let remote_key = SessionKey::new(body.session_key, body.created_at);
    if !remote_key.verify() {
        return Err(HandshakeError::CorruptKey);
    }
    entry.remote_key = Some(remote_key);

    let inbound_pong = accompanying.iter().find_map(|m| match m {
        Message::Pong(p) => Some(*p),
        _ => None,
    });
    let inbound_ping = accompanying.iter().find_map(|m| match m {
        Message::Ping(p) => Some(*p),
        _ => None,
    });

    match entry.status {
        Status::SetKeySent => {
            let pong = inbound_pong.ok_or(HandshakeError::ChallengeMismatch)?;
            if !ping_table.take(entry.peer, pong.challenge) {
                return Err(HandshakeError::ChallengeMismatch);
            }
            let ping2 = inbound_ping.ok_or(HandshakeError::ChallengeMismatch)?;
            entry.status = Status::Up;
            entry.last_alive = now_secs;
            Ok(HandshakeOutcome {
                reply: vec![Message::Pong(PingPongPayload { target: local_id, challenge: ping2.challenge })],
                new_status: Status::Up,
            })
        }
        _ => {
            let key = random_session_key();
            entry.local_key = Some(SessionKey::new(key, now_secs));

            let reply_body = SetKeyBody {
                session_key: key,
                sender_pubkey: signer.public_key(),
                target: entry.peer,
                created_at: now_secs,
                signature: Vec::new(),
            };
            let signed = signer.sign(&postcard::to_allocvec(&reply_body).unwrap_or_default());
            let reply_body = SetKeyBody { signature: signed, ..reply_body };
            let reply_set_key = build_set_key_payload(remote_static_pub, &reply_body)?;

            let inbound_ping = inbound_ping.ok_or(HandshakeError::ChallengeMismatch)?;
            let challenge2 = random_challenge();
            ping_table.register(entry.peer, challenge2, now_secs + SECONDS_NOPINGPONG_DROP)?;

            entry.status = Status::SetKeyReceived;
            entry.last_alive = now_secs;
            entry.established_at = now_secs;

            Ok(HandshakeOutcome {
                reply: vec![
                    Message::SetKey(reply_set_key),
                    Message::Pong(PingPongPayload { target: local_id, challenge: inbound_ping.challenge }),
                    Message::Ping(PingPongPayload { target: local_id, challenge: challenge2 }),
                ],
                new_status: Status::SetKeyReceived,
            })
        }
    }
}

/// `SetKeyReceived` / `ReceivePong`: completes the handshake.
pub fn receive_pong(entry: &mut Entry, ping_table: &mut PingTable, pong: PingPongPayload, now_secs: u64) -> bool {
    if entry.status != Status::SetKeyReceived {
        return false;
    }
    if !ping_table.take(entry.peer, pong.challenge) {
        return false;
    }
    entry.status = Status::Up;
    entry.last_alive = now_secs;
    true
}

/// `Up` / `ReceivePing`: reply with an encrypted PONG.
pub fn receive_ping(entry: &mut Entry, local_id: PeerId, ping: PingPongPayload, now_secs: u64) -> Option<Message> {
    if entry.status != Status::Up {
        return None;
    }
    entry.last_alive = now_secs;
    Some(Message::Pong(PingPongPayload { target: local_id, challenge: ping.challenge }))
}

/// Any state / `ReceiveHangup`: free the key and drop to `Down`.
pub fn receive_hangup(entry: &mut Entry, _hangup: HangupPayload) {
    entry.reset_to_down();
}

/// Liveness sweep result for a single entry (§4.7): whether this entry
/// should be dropped and, if so, whether a HANGUP should be sent first.
pub enum LivenessAction {
    None,
    SendKeepAlive,
    DropWithHangup,
    DropSilently,
}

pub fn liveness_check(entry: &Entry, now_secs: u64) -> LivenessAction {
    match entry.status {
        Status::Up => {
            if now_secs.saturating_sub(entry.last_alive) > SECONDS_INACTIVE_DROP {
                LivenessAction::DropWithHangup
            } else if now_secs.saturating_sub(entry.last_alive) > SECONDS_INACTIVE_DROP / 2 {
                LivenessAction::SendKeepAlive
            } else {
                LivenessAction::None
            }
        }
        Status::SetKeySent | Status::SetKeyReceived => {
            if now_secs.saturating_sub(entry.established_at) > SECONDS_NOPINGPONG_DROP {
                LivenessAction::DropSilently
            } else {
                LivenessAction::None
            }
        }
        Status::Down => LivenessAction::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSigner(Vec<u8>);
    impl Signer for NullSigner {
        fn sign(&self, _message: &[u8]) -> Vec<u8> {
            vec![1, 2, 3]
        }
        fn public_key(&self) -> Vec<u8> {
            self.0.clone()
        }
    }
    struct AcceptAllVerifier;
    impl SignatureVerifier for AcceptAllVerifier {
        fn verify(&self, _pk: &[u8], _msg: &[u8], _sig: &[u8]) -> bool {
            true
        }
    }

    fn id(b: u8) -> PeerId {
        PeerId([b; 64])
    }

    #[test]
    fn full_handshake_reaches_up_both_sides() {
        let a_id = id(1);
        let b_id = id(2);

        let a_secret = StaticSecret::random_from_rng(rand::thread_rng());
        let a_pub = X25519Public::from(&a_secret);
        let b_secret = StaticSecret::random_from_rng(rand::thread_rng());
        let b_pub = X25519Public::from(&b_secret);

        let mut a_entry = Entry::new(b_id);
        let mut b_entry = Entry::new(a_id);
        let mut a_pings = PingTable::new();
        let mut b_pings = PingTable::new();
        let signer_a = NullSigner(vec![0xAA]);
        let signer_b = NullSigner(vec![0xBB]);
        let verifier = AcceptAllVerifier;

        // A initiates.
        let msgs = initiate_connect(&mut a_entry, a_id, &b_pub, &signer_a, 100, &mut a_pings).unwrap();
        assert_eq!(a_entry.status, Status::SetKeySent);
        let set_key_1 = msgs.iter().find_map(|m| match m { Message::SetKey(s) => Some(s.clone()), _ => None }).unwrap();

        // B receives fresh SetKey.
        let outcome = receive_set_key(
            &mut b_entry, b_id, &a_pub, &b_secret, &signer_b, &verifier,
            &set_key_1, &[], 101, &mut b_pings,
        ).unwrap();
        assert_eq!(b_entry.status, Status::SetKeyReceived);
        let set_key_2 = outcome.reply.iter().find_map(|m| match m { Message::SetKey(s) => Some(s.clone()), _ => None }).unwrap();

        // A receives B's SetKey carrying PONG1+PING2.
        let outcome2 = receive_set_key(
            &mut a_entry, a_id, &b_pub, &a_secret, &signer_a, &verifier,
            &set_key_2, &outcome.reply, 102, &mut a_pings,
        ).unwrap();
        assert_eq!(a_entry.status, Status::Up);

        let pong2 = outcome2.reply.iter().find_map(|m| match m { Message::Pong(p) => Some(*p), _ => None }).unwrap();
        assert!(receive_pong(&mut b_entry, &mut b_pings, pong2, 103));
        assert_eq!(b_entry.status, Status::Up);
    }

    #[test]
    fn hangup_resets_to_down() {
        let mut entry = Entry::new(id(3));
        entry.status = Status::Up;
        entry.local_key = Some(SessionKey::new([1u8; 32], 0));
        receive_hangup(&mut entry, HangupPayload { peer: id(3) });
        assert_eq!(entry.status, Status::Down);
        assert!(entry.local_key.is_none());
    }

    #[test]
    fn ping_table_overflow_is_an_error() {
        let mut table = PingTable::new();
        for i in 0..MAX_PING_PONG {
            table.register(id(1), i as u32, 1000).unwrap();
        }
        assert!(matches!(table.register(id(1), 999_999, 1000), Err(HandshakeError::PingTableFull)));
    }

    #[test]
    fn liveness_drops_inactive_up_entry() {
        let mut entry = Entry::new(id(4));
        entry.status = Status::Up;
        entry.last_alive = 0;
        assert!(matches!(liveness_check(&entry, SECONDS_INACTIVE_DROP + 1), LivenessAction::DropWithHangup));
    }
}
