//! `Core` context object (§9; §2.1/§5.1/§6.1)
//!
//! Wires the connection table, ping table, handler registry, dispatcher
//! and cron loop together behind one shared, cloneable handle, the way
//! `net::connection::ConnectionManager` owns every piece of shared
//! connection state behind `Arc<Mutex<..>>` fields instead of
//! process-wide statics.

use super::allocator;
use super::clock::Clock;
use super::codec;
use super::config::Config;
use super::cron::{self, CronStats, LivenessOutcome};
use super::dispatcher::{
    Dispatcher, DispatchSender, FrameDecision, Handler, HandlerCapability, HandlerTables,
    InboundFrame,
};
use super::entry::{Placement, Status, EXTREME_PRIORITY};
use super::error::CoreError;
use super::handshake::{self, PingTable, SignatureVerifier, Signer};
use super::message::{HangupPayload, Message};
use super::peer_id::PeerId;
use super::scheduler::{self, SchedulerStats};
use super::table::Table;
use super::transport::{SendResult, Transport};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Token this crate registers itself under when associating a transport
/// session (§5's reference-counted session sharing); a `Core`
/// instance is always the sole owner of sessions it opens, so a single
/// constant token is sufficient.
const CORE_TOKEN: u64 = 1;

fn handshake_to_core_error(peer: PeerId, e: handshake::HandshakeError) -> CoreError {
    match e {
        handshake::HandshakeError::PingTableFull => CoreError::PingTableFull,
        handshake::HandshakeError::ChallengeMismatch | handshake::HandshakeError::SignatureInvalid => {
            CoreError::SignatureInvalid(peer)
        }
        handshake::HandshakeError::CryptoFailed | handshake::HandshakeError::CorruptKey => {
            CoreError::MalformedFrame(peer)
        }
    }
}

type DisconnectSubscriber = Box<dyn Fn(PeerId) + Send + Sync>;

struct CoreStats {
    cron: std::sync::Mutex<CronStats>,
    scheduler: std::sync::Mutex<SchedulerStats>,
}

/// Central context object: construct once via [`Core::new`], share the
/// returned `Arc` with every transport callback and application task.
pub struct Core {
    local_id: PeerId,
    local_x25519_secret: StaticSecret,
    local_x25519_public: X25519Public,
    signer: Arc<dyn Signer>,
    verifier: Arc<dyn SignatureVerifier>,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn Transport>,

    table: Arc<Mutex<Table>>,
    ping_table: Arc<Mutex<PingTable>>,
    handler_tables: Arc<RwLock<HandlerTables>>,
    config: Arc<Mutex<Config>>,
    remote_x25519: Arc<Mutex<HashMap<PeerId, [u8; 32]>>>,
    disconnect_subscribers: Arc<Mutex<Vec<(u64, DisconnectSubscriber)>>>,
    next_subscriber_id: AtomicU64,

    dispatch: Arc<Mutex<Option<DispatchSender>>>,
    running: AtomicBool,
    stats: CoreStats,
}

impl Core {
    pub fn new(
        local_id: PeerId,
        local_x25519_secret: StaticSecret,
        signer: Arc<dyn Signer>,
        verifier: Arc<dyn SignatureVerifier>,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn Transport>,
        config: Config,
    ) -> Arc<Self> {
        let local_x25519_public = X25519Public::from(&local_x25519_secret);
        let table = Table::new(config.max_net_down_bps_total);
        Arc::new(Self {
            local_id,
            local_x25519_secret,
            local_x25519_public,
            signer,
            verifier,
            clock,
            transport,
            table: Arc::new(Mutex::new(table)),
            ping_table: Arc::new(Mutex::new(PingTable::new())),
            handler_tables: Arc::new(RwLock::new(HandlerTables::default())),
            config: Arc::new(Mutex::new(config)),
            remote_x25519: Arc::new(Mutex::new(HashMap::new())),
            disconnect_subscribers: Arc::new(Mutex::new(Vec::new())),
            next_subscriber_id: AtomicU64::new(1),
            dispatch: Arc::new(Mutex::new(None)),
            running: AtomicBool::new(false),
            stats: CoreStats {
                cron: std::sync::Mutex::new(CronStats::default()),
                scheduler: std::sync::Mutex::new(SchedulerStats::default()),
            },
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn local_x25519_public(&self) -> [u8; 32] {
        *self.local_x25519_public.as_bytes()
    }

    pub fn stats(&self) -> (CronStats, SchedulerStats) {
        (
            *self.stats.cron.lock().unwrap(),
            *self.stats.scheduler.lock().unwrap(),
        )
    }

    /// Record the X25519 static public key a higher layer resolved for
    /// `peer` (typically from its HELLO), so a subsequent `connect` or
    /// inbound SET_KEY can seal/open against it. HELLO resolution itself
    /// is out of this crate's scope (§1); this is the handoff point.
    pub async fn learn_peer_key(&self, peer: PeerId, x25519_pub: [u8; 32]) {
        self.remote_x25519.lock().await.insert(peer, x25519_pub);
    }

    /// Spawn the dispatcher worker pool and the cron/liveness loop.
    pub async fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);

        let (workers, capacity) = {
            let cfg = self.config.lock().await;
            (cfg.worker_threads, cfg.queue_capacity)
        };

        let core = Arc::clone(self);
        let sender = Dispatcher::spawn(workers, capacity, move |frame: InboundFrame| {
            let core = Arc::clone(&core);
            async move { core.process_inbound_frame(frame).await }
        });
        *self.dispatch.lock().await = Some(sender);

        let core = Arc::clone(self);
        tokio::spawn(async move { core.cron_loop().await });

        info!(workers, capacity, "core started");
    }

    /// Stop accepting new work, close every `Up` session (HANGUP
    /// best-effort), and free the table (§5, shutdown sequence).
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut table = self.table.lock().await;
        for idx in table.up_indices() {
            self.shutdown_connection(&mut table, idx, true).await;
        }
        info!("core shutdown complete");
    }

    /// `Down` / `InitiateConnect`: open (or reuse) a transport session
    /// and transmit the plaintext SETKEY+PING1.
    pub async fn connect(&self, peer: PeerId, remote_x25519_pub: [u8; 32]) -> Result<(), CoreError> {
        self.remote_x25519.lock().await.insert(peer, remote_x25519_pub);

        let mut table = self.table.lock().await;
        let idx = table.lookup_or_create(peer);
        if table.entry(idx).status != Status::Down {
            debug!(%peer, "connect called on a non-Down entry, ignoring");
            return Ok(());
        }

        let hello = self.transport.create_hello();
        let session = self
            .transport
            .connect(&hello, true)
            .await
            .ok_or_else(|| CoreError::TransportFatal(peer, std::io::Error::new(std::io::ErrorKind::NotConnected, "connect failed")))?;
        self.transport.associate(session, CORE_TOKEN).await;

        table.entry_mut(idx).transport_session = Some(session);
        table.entry_mut(idx).mtu = self.transport.mtu();

        let remote_pub = X25519Public::from(remote_x25519_pub);
        let now = self.clock.now_secs();
        let messages = {
            let mut ping_table = self.ping_table.lock().await;
            handshake::initiate_connect(
                table.entry_mut(idx),
                self.local_id,
                &remote_pub,
                self.signer.as_ref(),
                now,
                &mut ping_table,
            )
            .map_err(|e| handshake_to_core_error(peer, e))?
        };

        let frame = codec::encode_plaintext(&messages).map_err(|_| CoreError::MalformedFrame(peer))?;
        match self.transport.send(session, &frame, false).await {
            SendResult::Ok => Ok(()),
            SendResult::WouldBlock => Err(CoreError::TransportWouldBlock(peer)),
            SendResult::Error => Err(CoreError::TransportFatal(
                peer,
                std::io::Error::new(std::io::ErrorKind::Other, "transport send failed"),
            )),
        }
    }

    /// Entry point for the transport collaborator: hand off one raw
    /// inbound frame for dispatcher-queue processing. Non-blocking; a
    /// full queue drops the frame (§4.4/§5).
    pub async fn on_frame_received(&self, peer: PeerId, session: usize, bytes: Vec<u8>) -> Result<(), CoreError> {
        let sender = self.dispatch.lock().await.clone();
        match sender {
            Some(s) => s
                .try_send(InboundFrame { peer, session, bytes })
                .map_err(|_| CoreError::QueueFull(peer)),
            None => Err(CoreError::QueueFull(peer)),
        }
    }

    pub async fn register_handler(&self, wire_type: u16, capability: HandlerCapability, handler: Handler) {
        self.handler_tables.write().await.register(wire_type, capability, handler);
    }

    /// Register an owned callback invoked on every disconnect (Design
    /// Notes §9: "subscriber lists become owned vectors with stable IDs
    /// returned at registration and consumed at unregistration").
    pub async fn register_disconnect_subscriber(&self, callback: DisconnectSubscriber) -> u64 {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.disconnect_subscribers.lock().await.push((id, callback));
        id
    }

    pub async fn unregister_disconnect_subscriber(&self, id: u64) {
        self.disconnect_subscribers.lock().await.retain(|(sid, _)| *sid != id);
    }

    async fn notify_disconnect(&self, peer: PeerId) {
        let subs = self.disconnect_subscribers.lock().await;
        for (_, cb) in subs.iter() {
            cb(peer);
        }
    }

    /// Enqueue an application message into `peer`'s send buffer (spec
    /// §4.2's `append`); the next scheduler pass selects and transmits it.
    pub async fn enqueue_send(
        &self,
        peer: PeerId,
        msg: Message,
        priority: u32,
        deadline: Instant,
        placement: Placement,
    ) -> Result<(), CoreError> {
        let mut table = self.table.lock().await;
        let idx = table.lookup_index(&peer).ok_or(CoreError::QueueFull(peer))?;
        let send_entry = cron::send_entry_for_message(&msg, priority, deadline, placement)
            .ok_or(CoreError::QueueFull(peer))?;

        match scheduler::append(table.entry_mut(idx), send_entry) {
            scheduler::AppendOutcome::Queued => Ok(()),
            scheduler::AppendOutcome::Fragmented => {
                debug!(%peer, "message exceeds transport MTU; fragmentation collaborator is out of scope");
                Err(CoreError::QueueFull(peer))
            }
            scheduler::AppendOutcome::DroppedPreHandshake | scheduler::AppendOutcome::DroppedOverCap => {
                Err(CoreError::QueueFull(peer))
            }
        }
    }

    /// `reserve_downstream(peer, amount)` (§4.5, closing paragraph).
    pub async fn reserve_downstream(&self, peer: PeerId, amount: i64) -> Result<i64, CoreError> {
        let mut table = self.table.lock().await;
        let idx = table.lookup_index(&peer).ok_or(CoreError::QueueFull(peer))?;
        let now = self.clock.now_secs();
        Ok(allocator::reserve_downstream(table.entry_mut(idx), amount, now))
    }

    /// Per-section config listener (§6, "config changes to `load.*`
    /// trigger a table rehash"; §6.1).
    pub async fn reconfigure(&self, new: Config) -> Result<(), CoreError> {
        new.validate().map_err(CoreError::ConfigInvalid)?;

        let mut cfg = self.config.lock().await;
        if cfg.load_changed(&new) {
            let mut table = self.table.lock().await;
            table.rehash(new.max_net_down_bps_total);
            info!(
                old_down = cfg.max_net_down_bps_total,
                new_down = new.max_net_down_bps_total,
                "load configuration changed, table rehashed"
            );
        }
        *cfg = new;
        Ok(())
    }

    async fn process_inbound_frame(&self, frame: InboundFrame) {
        let now = self.clock.now_secs();
        let peer = frame.peer;
        let mut table = self.table.lock().await;
        let idx_opt = table.lookup_index(&peer);

        let decision = {
            let entry_ref = idx_opt.map(|i| table.entry_mut(i));
            super::dispatcher::process_frame(entry_ref, &frame.bytes, now)
        };

        match decision {
            FrameDecision::Dropped(reason) => {
                super::dispatcher::log_drop(peer, reason);
            }
            FrameDecision::Plaintext(msgs) => {
                let idx = table.lookup_or_create(peer);
                if table.entry(idx).transport_session.is_none() {
                    table.entry_mut(idx).transport_session = Some(frame.session);
                    table.entry_mut(idx).mtu = self.transport.mtu();
                }
                self.handle_messages(&mut table, idx, peer, msgs, true, now).await;
            }
            FrameDecision::Encrypted(msgs) => {
                if let Some(idx) = idx_opt {
                    self.handle_messages(&mut table, idx, peer, msgs, false, now).await;
                }
            }
        }
    }

    async fn handle_messages(
        &self,
        table: &mut Table,
        idx: usize,
        peer: PeerId,
        msgs: Vec<Message>,
        is_plaintext_phase: bool,
        now: u64,
    ) {
        // A SET_KEY message's accompanying PING/PONG in the same frame are
        // already consumed inside `receive_set_key` (it reads them out of
        // `accompanying`); dispatching them again below as standalone
        // events would double-process a challenge already taken from the
        // ping table and send a second, spurious reply.
        let has_set_key = msgs.iter().any(|m| matches!(m, Message::SetKey(_)));

        for msg in &msgs {
            if has_set_key && matches!(msg, Message::Ping(_) | Message::Pong(_)) {
                continue;
            }
            match msg {
                Message::SetKey(payload) => {
                    let remote_pub_bytes = self.remote_x25519.lock().await.get(&peer).copied();
                    let Some(remote_pub_bytes) = remote_pub_bytes else {
                        warn!(%peer, "SET_KEY received before this peer's x25519 key was known");
                        continue;
                    };
                    let remote_pub = X25519Public::from(remote_pub_bytes);

                    let outcome = {
                        let mut ping_table = self.ping_table.lock().await;
                        handshake::receive_set_key(
                            table.entry_mut(idx),
                            self.local_id,
                            &remote_pub,
                            &self.local_x25519_secret,
                            self.signer.as_ref(),
                            self.verifier.as_ref(),
                            payload,
                            &msgs,
                            now,
                            &mut ping_table,
                        )
                    };

                    match outcome {
                        Ok(outcome) => {
                            let use_encryption = matches!(outcome.new_status, Status::Up);
                            info!(%peer, status = ?outcome.new_status, "handshake progressed");
                            self.send_handshake_reply(table, idx, outcome.reply, use_encryption, false).await;
                        }
                        Err(e) => warn!(%peer, error = %e, "SET_KEY handling failed"),
                    }
                }
                Message::Pong(pong) => {
                    let established = {
                        let mut ping_table = self.ping_table.lock().await;
                        handshake::receive_pong(table.entry_mut(idx), &mut ping_table, *pong, now)
                    };
                    if established {
                        info!(%peer, "session established");
                    }
                }
                Message::Ping(ping) => {
                    let reply = handshake::receive_ping(table.entry_mut(idx), self.local_id, *ping, now);
                    if let Some(reply) = reply {
                        let use_encryption = table.entry(idx).status == Status::Up;
                        self.send_handshake_reply(table, idx, vec![reply], use_encryption, false).await;
                    }
                }
                Message::Hangup(h) => {
                    let session = table.entry(idx).transport_session;
                    handshake::receive_hangup(table.entry_mut(idx), *h);
                    if let Some(session) = session {
                        self.transport.disconnect(session, CORE_TOKEN).await;
                    }
                    info!(%peer, "peer sent HANGUP");
                    self.notify_disconnect(peer).await;
                }
                Message::Noise(_) => {}
                Message::Application { .. } => {
                    let handlers = self.handler_tables.read().await;
                    handlers.dispatch(peer, msg, is_plaintext_phase);
                }
            }
        }
    }

    /// Transmit a handshake control message directly, bypassing the
    /// knapsack send buffer (these are latency-sensitive protocol
    /// replies, not application payload).
    async fn send_handshake_reply(
        &self,
        table: &mut Table,
        idx: usize,
        messages: Vec<Message>,
        use_encryption: bool,
        important: bool,
    ) {
        let peer = table.entry(idx).peer;
        let Some(session) = table.entry(idx).transport_session else {
            warn!(%peer, "no transport session to send handshake reply on");
            return;
        };

        let frame = if use_encryption {
            let entry = table.entry_mut(idx);
            let Some(key) = entry.local_key.as_ref().map(|k| *k.key()) else {
                warn!(%peer, "no local session key yet, dropping encrypted handshake reply");
                return;
            };
            let mut body = Vec::new();
            for m in &messages {
                match codec::frame_message(m) {
                    Ok(b) => body.extend_from_slice(&b),
                    Err(_) => return,
                }
            }
            entry.last_seq_sent += 1;
            let seq = entry.last_seq_sent;
            let advertised = allocator::advertised_bandwidth(entry.ideal_limit, entry.violations);
            entry.max_transmitted_limit = allocator::age_max_transmitted_limit(entry.max_transmitted_limit, advertised);
            match codec::encode_encrypted(&key, seq, self.clock.now_secs() as u32, advertised, &body) {
                Ok(f) => f,
                Err(_) => return,
            }
        } else {
            match codec::encode_plaintext(&messages) {
                Ok(f) => f,
                Err(_) => return,
            }
        };

        match self.transport.send(session, &frame, important).await {
            SendResult::Ok => {}
            SendResult::WouldBlock => debug!(%peer, "handshake reply would block"),
            SendResult::Error => warn!(%peer, "transport failed sending handshake reply"),
        }
    }

    async fn disconnect_session(&self, table: &mut Table, idx: usize) {
        if let Some(session) = table.entry(idx).transport_session {
            self.transport.disconnect(session, CORE_TOKEN).await;
        }
        table.entry_mut(idx).reset_to_down();
    }

    /// `shutdown_connection`: emits HANGUP, closes the transport,
    /// notifies subscribers, clears buffers (§7, closing line).
    async fn shutdown_connection(&self, table: &mut Table, idx: usize, emit_hangup: bool) {
        let peer = table.entry(idx).peer;
        if emit_hangup && table.entry(idx).status == Status::Up && table.entry(idx).local_key.is_some() {
            let hangup = vec![Message::Hangup(HangupPayload { peer: self.local_id })];
            self.send_handshake_reply(table, idx, hangup, true, true).await;
        }
        self.disconnect_session(table, idx).await;
        self.notify_disconnect(peer).await;
        debug!(%peer, "connection shut down");
    }

    async fn apply_liveness_outcome(&self, table: &mut Table, idx: usize, outcome: LivenessOutcome) {
        match outcome {
            LivenessOutcome::KeepAlivePing(msg) => {
                let deadline = self.clock.now() + std::time::Duration::from_secs(handshake::SECONDS_NOPINGPONG_DROP);
                if let Some(se) = cron::send_entry_for_message(&msg, EXTREME_PRIORITY / 2, deadline, Placement::Head) {
                    let _ = scheduler::append(table.entry_mut(idx), se);
                }
            }
            LivenessOutcome::DroppedWithHangup(msg, session) => {
                let peer = table.entry(idx).peer;
                if let Some(session) = session {
                    if let Ok(frame) = codec::encode_plaintext(std::slice::from_ref(&msg)) {
                        let _ = self.transport.send(session, &frame, true).await;
                    }
                    self.transport.disconnect(session, CORE_TOKEN).await;
                }
                self.notify_disconnect(peer).await;
            }
            LivenessOutcome::DroppedSilently(session) => {
                let peer = table.entry(idx).peer;
                if let Some(session) = session {
                    self.transport.disconnect(session, CORE_TOKEN).await;
                }
                self.notify_disconnect(peer).await;
            }
        }
    }

    /// Periodic maintenance loop (§4.7): liveness sweep,
    /// ping-table expiry, allocator pass, scheduler pass.
    async fn cron_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(cron::DEFAULT_TICK_MS));
        let mut last_tick = self.clock.now();
        let mut last_allocator_secs = self.clock.now_secs();
        let mut rng = StdRng::from_entropy();

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            let now_instant = self.clock.now();
            let elapsed_secs_f = now_instant.duration_since(last_tick).as_secs_f64();
            last_tick = now_instant;
            let now_secs = self.clock.now_secs();

            let mut table = self.table.lock().await;

            let liveness_outcomes = {
                let mut ping_table = self.ping_table.lock().await;
                let mut stats = self.stats.cron.lock().unwrap();
                let outcomes = cron::liveness_pass(&mut table, &mut ping_table, self.local_id, now_secs, &mut stats);
                cron::expire_ping_table(&mut ping_table, now_secs, &mut stats);
                outcomes
            };
            for (idx, outcome) in liveness_outcomes {
                self.apply_liveness_outcome(&mut table, idx, outcome).await;
            }

            let connected = table.count_up();
            let allocator_elapsed = now_secs.saturating_sub(last_allocator_secs);
            if allocator::should_run(allocator_elapsed, connected) {
                let cfg = self.config.lock().await.clone();
                let mut stats = self.stats.cron.lock().unwrap();
                cron::allocator_pass(
                    &mut table,
                    &cfg,
                    super::table::MIN_CONNECTION_TARGET,
                    0,
                    50.0,
                    allocator_elapsed,
                    &mut rng,
                    &mut stats,
                );
                drop(stats);
                last_allocator_secs = now_secs;
            }

            let cfg = self.config.lock().await.clone();
            let mut sched_stats = *self.stats.scheduler.lock().unwrap();
            let mut cron_stats = *self.stats.cron.lock().unwrap();
            let cpu_load = 0.0;
            let failures = cron::scheduler_pass(
                &mut table,
                self.transport.as_ref(),
                &cfg,
                cpu_load,
                now_secs,
                now_instant,
                elapsed_secs_f,
                &mut rng,
                &mut sched_stats,
                &mut cron_stats,
            )
            .await;
            *self.stats.scheduler.lock().unwrap() = sched_stats;
            *self.stats.cron.lock().unwrap() = cron_stats;

            for peer in failures {
                if let Some(idx) = table.lookup_index(&peer) {
                    self.disconnect_session(&mut table, idx).await;
                    self.notify_disconnect(peer).await;
                }
            }
        }
    }
}
