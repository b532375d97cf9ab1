//! End-to-end scenarios from spec §8, driven through the crate's public
//! API rather than module-internal state (complements the `#[cfg(test)]`
//! unit tests that live next to each module).

use overlay_core::net::allocator::{self, AllocatorInput, PeerDisposition};
use overlay_core::net::clock::FakeClock;
use overlay_core::net::codec;
use overlay_core::net::config::Config;
use overlay_core::net::entry::{Entry, Placement, SendEntry, Status};
use overlay_core::net::handshake::{SignatureVerifier, Signer};
use overlay_core::net::hello::HelloMessage;
use overlay_core::net::message::Message;
use overlay_core::net::peer_id::PeerId;
use overlay_core::net::scheduler;
use overlay_core::net::transport::MockTransport;
use overlay_core::Core;
use std::sync::Arc;
use std::time::Instant;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

fn id(b: u8) -> PeerId {
    PeerId([b; 64])
}

struct NullSigner(Vec<u8>);
impl Signer for NullSigner {
    fn sign(&self, _message: &[u8]) -> Vec<u8> {
        vec![0xAB]
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

fn hello_for(peer: PeerId) -> HelloMessage {
    HelloMessage {
        public_key: vec![],
        sender: peer,
        expires_at: 1,
        protocol: 0,
        mtu: 0,
        address: vec![],
        signature: vec![],
    }
}

fn make_core(local: PeerId, label: u8, mock: Arc<MockTransport>) -> Arc<Core> {
    Core::new(
        local,
        StaticSecret::random_from_rng(rand::thread_rng()),
        Arc::new(NullSigner(vec![label])),
        Arc::new(AcceptAllVerifier),
        Arc::new(FakeClock::new(1_000)),
        mock,
        Config::default(),
    )
}

/// S1: Handshake. `connect(B)` produces plaintext SETKEY+PING1; feeding
/// the simulated SETKEY+PONG1+PING2 reply back drives both sides to
/// `Up` (observed here indirectly: B emits its PONG2 reply frame, and
/// both sides keep running without error past that point).
#[tokio::test]
async fn s1_handshake_reaches_up_on_both_sides() {
    let mock_a = Arc::new(MockTransport::new(0, hello_for(id(1))));
    let core_a = make_core(id(1), 0xAA, mock_a.clone());

    let mock_b = Arc::new(MockTransport::new(0, hello_for(id(2))));
    let core_b = make_core(id(2), 0xBB, mock_b.clone());

    core_a.connect(id(2), core_b.local_x25519_public()).await.unwrap();
    let frame_a_to_b = mock_a.drain_sent().await.remove(0).1;

    core_b.learn_peer_key(id(1), core_a.local_x25519_public()).await;
    core_b.start().await;
    core_b.on_frame_received(id(1), 0, frame_a_to_b).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;

    let frame_b_to_a = mock_b.drain_sent().await.remove(0).1;

    core_a.learn_peer_key(id(2), core_b.local_x25519_public()).await;
    core_a.start().await;
    core_a.on_frame_received(id(2), 0, frame_b_to_a).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;

    // A has now sent PONG2 back to B over the freshly-encrypted channel.
    let frame_a_to_b_2 = mock_a.drain_sent().await.remove(0).1;
    let (header, rest) = codec::parse_header(&frame_a_to_b_2).unwrap();
    assert!(!codec::is_plaintext(&header, rest), "PONG2 must be encrypted, not plaintext");

    core_a.shutdown().await;
    core_b.shutdown().await;
}

/// S2: Replay drop, exercised through the public codec + dispatcher
/// entry points rather than calling `check_replay` directly: build real
/// encrypted frames and feed them through `process_frame`.
#[tokio::test]
async fn s2_replay_drop_via_real_frames() {
    use overlay_core::net::dispatcher::{process_frame, FrameDecision};
    use overlay_core::net::session_key::SessionKey;

    let mut entry = Entry::new(id(9));
    entry.status = Status::Up;
    let key = [7u8; 32];
    entry.remote_key = Some(SessionKey::new(key, 0));
    entry.local_key = Some(SessionKey::new(key, 0));

    let body = codec::frame_message(&Message::Noise(vec![1, 2, 3])).unwrap();
    let mut accepted = Vec::new();
    for seq in [10u32, 11, 10, 9, 9] {
        let frame = codec::encode_encrypted(&key, seq, 2_000, 60_000, &body).unwrap();
        let decision = process_frame(Some(&mut entry), &frame, 2_000);
        accepted.push(matches!(decision, FrameDecision::Encrypted(_)));
    }
    assert_eq!(accepted, vec![true, true, false, true, false]);
}

/// S3: Over-limit peer. Feed an `adjusted_recent_rate` far above
/// `max_transmitted_limit` through successive allocator passes; after
/// `MAX_VIOLATIONS` passes the peer must be flagged for 24h blacklist.
#[test]
fn s3_over_limit_peer_is_blacklisted_after_max_violations() {
    use overlay_core::net::entry::MAX_VIOLATIONS;

    let mut violations = 0u32;
    let mut disposition = PeerDisposition::Ok;
    let mut rng = rand::thread_rng();

    // A tiny schedulable pool (well under the peer's reported recent
    // rate) keeps its actual allocation pinned near `max_transmitted_limit`
    // every round, so the 10x-over-limit recent rate keeps tripping the
    // violation check instead of being absorbed by round-one's own cap.
    for _ in 0..=MAX_VIOLATIONS {
        let input = AllocatorInput {
            index: 0,
            adjusted_recent_rate: 60_000, // 10x max_transmitted_limit
            value: 1.0,
            max_transmitted_limit: 6_000,
            violations,
            guarded: false,
            established_at: 1_000,
        };
        let decisions = allocator::run_allocation(&[input], 1_000, 0, 0, 50.0, &mut rng);
        let d = decisions[0];
        violations = d.violations;
        disposition = d.disposition;
        if matches!(disposition, PeerDisposition::Blacklist24h) {
            break;
        }
    }

    assert!(matches!(disposition, PeerDisposition::Blacklist24h));
}

/// S4: Placement. Entries `{A:head, B:none, C:tail, D:head, E:none}`
/// each length 100 into a 1000-byte MTU datagram selection: the
/// permuted transmission order must put {A,D} before {B,E} before {C}.
#[test]
fn s4_placement_ordering_is_obeyed_end_to_end() {
    let now = Instant::now();
    let labelled = vec![
        ("A", Placement::Head),
        ("B", Placement::None),
        ("C", Placement::Tail),
        ("D", Placement::Head),
        ("E", Placement::None),
    ];

    let mut entry = Entry::new(id(4));
    entry.mtu = 1000;
    for (_, placement) in &labelled {
        entry.insert_sorted(SendEntry::new_bytes(vec![0u8; 100], 10, now, *placement));
    }

    let lengths: Vec<usize> = entry.send_buffer.iter().map(|e| e.length).collect();
    let priorities: Vec<u32> = entry.send_buffer.iter().map(|e| e.priority).collect();
    let capacity = entry.mtu as usize - codec::FRAME_OVERHEAD;
    let mut stats = scheduler::SchedulerStats::default();
    let config = overlay_core::net::config::SchedulerConfig::default();
    let selected = scheduler::select_datagram(&lengths, &priorities, capacity, 0.0, &config, &mut stats);
    assert!(selected.iter().all(|s| *s), "all five 100-byte entries fit in a 1000-byte MTU");

    let selected_entries: Vec<SendEntry> = std::mem::take(&mut entry.send_buffer);
    let mut rng = rand::thread_rng();
    let permuted = scheduler::permute_with_placement(selected_entries, &mut rng);

    let pos = |want: Placement| -> Vec<usize> {
        permuted
            .iter()
            .enumerate()
            .filter(|(_, e)| e.placement == want)
            .map(|(i, _)| i)
            .collect()
    };
    let head_positions = pos(Placement::Head);
    let none_positions = pos(Placement::None);
    let tail_positions = pos(Placement::Tail);

    assert!(head_positions.iter().max().unwrap() < none_positions.iter().min().unwrap());
    assert!(none_positions.iter().max().unwrap() < tail_positions.iter().min().unwrap());
}

/// S5: HANGUP. With an entry `Up`, deliver HANGUP; expect the entry
/// `Down`, the send buffer cleared, and the disconnect subscriber fired.
#[tokio::test]
async fn s5_hangup_clears_entry_and_notifies_subscribers() {
    let mock = Arc::new(MockTransport::new(0, hello_for(id(1))));
    let core = make_core(id(1), 0xAA, mock.clone());

    let remote_secret = StaticSecret::random_from_rng(rand::thread_rng());
    let remote_pub = *X25519Public::from(&remote_secret).as_bytes();
    core.connect(id(2), remote_pub).await.unwrap();
    let _ = mock.drain_sent().await;

    let notified = Arc::new(std::sync::Mutex::new(false));
    let notified_clone = notified.clone();
    core.register_disconnect_subscriber(Box::new(move |_peer| {
        *notified_clone.lock().unwrap() = true;
    }))
    .await;

    core.start().await;
    let hangup = Message::Hangup(overlay_core::net::message::HangupPayload { peer: id(2) });
    let frame = codec::encode_plaintext(&[hangup]).unwrap();
    core.on_frame_received(id(2), 0, frame).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;

    assert!(*notified.lock().unwrap(), "disconnect subscriber must fire on HANGUP");
    core.shutdown().await;
}

/// S6: Fragmentation trigger. A 9000-byte message enqueued against a
/// 1400-byte-MTU entry must never land in the send buffer and must set
/// `consider_transport_switch`.
#[tokio::test]
async fn s6_oversized_message_is_handed_to_fragmentation_not_queued() {
    let mock = Arc::new(MockTransport::new(1400, hello_for(id(1))));
    let core = make_core(id(1), 0xAA, mock.clone());

    let remote_secret = StaticSecret::random_from_rng(rand::thread_rng());
    let remote_pub = *X25519Public::from(&remote_secret).as_bytes();
    core.connect(id(2), remote_pub).await.unwrap();

    let big = Message::Noise(vec![0u8; 9000]);
    let result = core
        .enqueue_send(id(2), big, 10, Instant::now(), Placement::None)
        .await;
    assert!(result.is_err(), "oversized message must be rejected from the send buffer path");
}
