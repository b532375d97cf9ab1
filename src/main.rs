//! Two-node loopback demonstration of `overlay_core`.
//!
//! This binary does not ship a production node — per the crate's scope,
//! the transport plugin implementation, identity/keystore service, and
//! process lifecycle all belong to the embedding application. What
//! follows is the minimal wiring an embedder does: generate identities,
//! construct a `Config`, hand both to `Core::new`, and pump bytes
//! between two transport endpoints. The transport here is an in-memory
//! loopback (`LoopbackTransport`) standing in for a real socket plugin.

use clap::Parser;
use overlay_core::net::clock::SystemClock;
use overlay_core::net::entry::Placement;
use overlay_core::net::message::Message;
use overlay_core::net::transport::{SendNowTest, SendResult};
use overlay_core::{Core, DilithiumVerifier, HelloMessage, Keypair, PeerId, Transport};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::info;

/// CLI surface for the demo: how long to run before tearing the two
/// nodes down, and at what tracing verbosity.
#[derive(Parser)]
#[command(name = "overlay-core", version, about = "Loopback demo of the peer connection core")]
struct Args {
    /// Seconds to run the demo handshake/keepalive loop before shutting down.
    #[arg(short, long, default_value = "5")]
    run_secs: u64,
}

/// An in-memory transport connecting exactly two `Core`s, used only to
/// demonstrate wiring (the real transport plugin is out of this crate's
/// scope). Frames handed to `send` are pushed straight into the peer's
/// `Core::on_frame_received` rather than traversing a socket.
struct LoopbackTransport {
    local: PeerId,
    mtu: u16,
    hello: HelloMessage,
    peer_core: Mutex<Option<Arc<Core>>>,
    next_session: AtomicUsize,
}

impl LoopbackTransport {
    fn new(local: PeerId, hello: HelloMessage) -> Arc<Self> {
        Arc::new(Self {
            local,
            mtu: 1400,
            hello,
            peer_core: Mutex::new(None),
            next_session: AtomicUsize::new(1),
        })
    }

    /// Wire the far side after both `Core`s exist (breaks the
    /// construction cycle: a `Core` needs its transport up front, but
    /// the transport needs the peer's `Core` to deliver into).
    async fn set_peer(&self, peer_core: Arc<Core>) {
        *self.peer_core.lock().await = Some(peer_core);
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn cost(&self) -> u32 {
        0
    }

    async fn send(&self, session: usize, bytes: &[u8], _important: bool) -> SendResult {
        let peer_core = self.peer_core.lock().await.clone();
        match peer_core {
            Some(core) => {
                let _ = core.on_frame_received(self.local, session, bytes.to_vec()).await;
                SendResult::Ok
            }
            None => SendResult::Error,
        }
    }

    async fn send_now_test(&self, _session: usize, _size: usize, _important: bool) -> SendNowTest {
        SendNowTest::Yes
    }

    async fn connect(&self, _hello: &HelloMessage, _may_reuse: bool) -> Option<usize> {
        Some(self.next_session.fetch_add(1, Ordering::SeqCst))
    }

    async fn associate(&self, _session: usize, _token: u64) {}

    async fn disconnect(&self, _session: usize, _token: u64) {}

    fn create_hello(&self) -> HelloMessage {
        self.hello.clone()
    }

    fn verify_hello(&self, hello: &HelloMessage) -> bool {
        hello.expires_at > 0
    }
}

fn hello_for(id: PeerId, keypair: &Keypair, mtu: u16) -> HelloMessage {
    let mut hello = HelloMessage {
        public_key: keypair.public_key_bytes().to_vec(),
        sender: id,
        expires_at: u64::MAX,
        protocol: 1,
        mtu,
        address: Vec::new(),
        signature: Vec::new(),
    };
    hello.signature = keypair.sign(&hello.sender.as_bytes().to_vec());
    hello
}

fn id_from_pubkey(pubkey: &[u8]) -> PeerId {
    let mut bytes = [0u8; 64];
    let n = pubkey.len().min(64);
    bytes[..n].copy_from_slice(&pubkey[..n]);
    PeerId::from_bytes(bytes)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("overlay_core=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let keypair_a = Keypair::generate();
    let keypair_b = Keypair::generate();
    let id_a = id_from_pubkey(keypair_a.public_key_bytes());
    let id_b = id_from_pubkey(keypair_b.public_key_bytes());

    let config = overlay_core::Config::default();

    let transport_a = LoopbackTransport::new(id_a, hello_for(id_a, &keypair_a, 1400));
    let transport_b = LoopbackTransport::new(id_b, hello_for(id_b, &keypair_b, 1400));

    let x25519_secret_a = x25519_dalek::StaticSecret::random_from_rng(rand::thread_rng());
    let x25519_secret_b = x25519_dalek::StaticSecret::random_from_rng(rand::thread_rng());

    let core_a = Core::new(
        id_a,
        x25519_secret_a,
        Arc::new(keypair_a),
        Arc::new(DilithiumVerifier),
        Arc::new(SystemClock),
        transport_a.clone(),
        config.clone(),
    );
    let core_b = Core::new(
        id_b,
        x25519_secret_b,
        Arc::new(keypair_b),
        Arc::new(DilithiumVerifier),
        Arc::new(SystemClock),
        transport_b.clone(),
        config,
    );

    transport_a.set_peer(Arc::clone(&core_b)).await;
    transport_b.set_peer(Arc::clone(&core_a)).await;

    core_a.start().await;
    core_b.start().await;

    info!(%id_a, %id_b, "nodes started, initiating handshake");
    core_a.connect(id_b, core_b.local_x25519_public()).await?;
    core_b.learn_peer_key(id_a, core_a.local_x25519_public()).await;

    // Give the dispatcher workers a moment to settle the handshake
    // before sending an application message.
    tokio::time::sleep(Duration::from_millis(100)).await;

    core_a
        .enqueue_send(
            id_b,
            Message::Application { kind: 1000, bytes: b"hello from node a".to_vec() },
            100,
            Instant::now() + Duration::from_secs(1),
            Placement::None,
        )
        .await?;

    tokio::time::sleep(Duration::from_secs(args.run_secs)).await;

    core_a.shutdown().await;
    core_b.shutdown().await;
    info!("demo finished");
    Ok(())
}
