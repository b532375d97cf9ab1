//! Periodic maintenance loop (§4.7): liveness sweep,
//! keep-alive emission, ping-table expiry, allocator pass, scheduler
//! pass. A tick loop over a shared, lock-guarded table, in the style
//! of `connection.rs`'s background tasks.

use super::allocator::{self, AllocatorInput};
use super::codec;
use super::config::Config;
use super::entry::{Placement, SendEntry, Status, EXTREME_PRIORITY};
use super::handshake::{self, LivenessAction, PingTable};
use super::message::{HangupPayload, Message, PingPongPayload};
use super::peer_id::PeerId;
use super::scheduler::{self, SchedulerStats};
use super::table::Table;
use super::transport::{SendResult, Transport};
use rand::Rng;
use tracing::{debug, warn};

pub const DEFAULT_TICK_MS: u64 = 10;

#[derive(Debug, Default, Clone, Copy)]
pub struct CronStats {
    pub ticks: u64,
    pub liveness_drops: u64,
    pub keepalives_sent: u64,
    pub ping_table_expired: u64,
    pub allocator_passes: u64,
    pub scheduler_passes: u64,
}

/// Result of a liveness check against one entry: either nothing
/// changed, or a message must be transmitted (possibly after the entry
/// has already been reset to `Down`).
pub enum LivenessOutcome {
    KeepAlivePing(Message),
    DroppedWithHangup(Message, Option<usize>),
    DroppedSilently(Option<usize>),
}

/// Walk every non-`Down` entry and apply `handshake::liveness_check`,
/// registering fresh PING challenges for keep-alives and resetting
/// timed-out entries. Returns the (index, outcome) pairs that require
/// caller action (sending a message, or just noting the drop).
pub fn liveness_pass(
    table: &mut Table,
    ping_table: &mut PingTable,
    local_id: PeerId,
    now_secs: u64,
    stats: &mut CronStats,
) -> Vec<(usize, LivenessOutcome)> {
    let mut out = Vec::new();
    for idx in 0..table.len() {
        if table.entry(idx).status == Status::Down {
            continue;
        }
        let action = handshake::liveness_check(table.entry(idx), now_secs);
        let outcome = match action {
            LivenessAction::None => continue,
            LivenessAction::SendKeepAlive => {
                let peer = table.entry(idx).peer;
                let challenge: u32 = rand::random();
                if ping_table
                    .register(peer, challenge, now_secs + handshake::SECONDS_NOPINGPONG_DROP)
                    .is_err()
                {
                    warn!(%peer, "ping table full, skipping keep-alive");
                    continue;
                }
                table.entry_mut(idx).last_send_attempt = now_secs;
                stats.keepalives_sent += 1;
                LivenessOutcome::KeepAlivePing(Message::Ping(PingPongPayload { target: local_id, challenge }))
            }
            LivenessAction::DropWithHangup => {
                let peer = table.entry(idx).peer;
                let session = table.entry(idx).transport_session;
                table.entry_mut(idx).reset_to_down();
                stats.liveness_drops += 1;
                debug!(%peer, "dropping inactive peer with hangup");
                LivenessOutcome::DroppedWithHangup(Message::Hangup(HangupPayload { peer }), session)
            }
            LivenessAction::DropSilently => {
                let session = table.entry(idx).transport_session;
                table.entry_mut(idx).reset_to_down();
                stats.liveness_drops += 1;
                LivenessOutcome::DroppedSilently(session)
            }
        };
        out.push((idx, outcome));
    }
    out
}

/// Drop expired outstanding PING challenges (§5).
pub fn expire_ping_table(ping_table: &mut PingTable, now_secs: u64, stats: &mut CronStats) {
    let before = ping_table.len();
    ping_table.expire(now_secs);
    stats.ping_table_expired += (before - ping_table.len()) as u64;
}

/// One inbound-bandwidth allocator pass over every `Up` entry, applying
/// the resulting `ideal_limit` / `violations` back onto the table and
/// resetting entries the allocator blacklists.
pub fn allocator_pass(
    table: &mut Table,
    config: &Config,
    min_connect: usize,
    guarded_count: usize,
    downstream_load_pct: f64,
    elapsed_secs: u64,
    rng: &mut impl Rng,
    stats: &mut CronStats,
) {
    let total_max_bpm = table.max_bpm();
    let indices = table.up_indices();
    if indices.is_empty() {
        return;
    }

    let inputs: Vec<AllocatorInput> = indices
        .iter()
        .map(|&idx| {
            let e = table.entry(idx);
            AllocatorInput {
                index: idx,
                adjusted_recent_rate: (e.recently_received.min(u32::MAX as u64)) as u32,
                value: allocator::age_value(e.value, elapsed_secs),
                max_transmitted_limit: e.max_transmitted_limit,
                violations: e.violations,
                guarded: idx < guarded_count,
                established_at: e.established_at,
            }
        })
        .collect();

    for &idx in &indices {
        table.entry_mut(idx).recently_received = 0;
    }

    let decisions = allocator::run_allocation(&inputs, total_max_bpm, min_connect, guarded_count, downstream_load_pct, rng);

    for decision in decisions {
        let entry = table.entry_mut(decision.index);
        entry.ideal_limit = decision.ideal_limit;
        entry.violations = decision.violations;
        entry.value = allocator::age_value(entry.value, elapsed_secs);
        match decision.disposition {
            allocator::PeerDisposition::Ok => {}
            allocator::PeerDisposition::Blacklist24h => {
                let peer = entry.peer;
                entry.reset_to_down();
                warn!(%peer, "peer exceeded violation cap, disconnecting");
            }
            allocator::PeerDisposition::BlacklistBrief => {
                debug!(peer = %entry.peer, "peer below minimum share, brief blacklist");
            }
        }
    }

    let _ = config;
    stats.allocator_passes += 1;
}

/// One pass of the outbound scheduler over every connected entry with a
/// live transport session: refill the send window, select datagrams
/// (knapsack) or stream frames (greedy) per entry, assemble and
/// transmit. Returns the peers whose transmit attempt failed.
pub async fn scheduler_pass(
    table: &mut Table,
    transport: &dyn Transport,
    config: &Config,
    cpu_load: f64,
    now_secs: u64,
    now: std::time::Instant,
    elapsed_secs: f64,
    rng: &mut impl Rng,
    stats: &mut SchedulerStats,
    cron_stats: &mut CronStats,
) -> Vec<PeerId> {
    let mut failures = Vec::new();
    let indices = table.up_indices();

    for idx in indices {
        let session = match table.entry(idx).transport_session {
            Some(s) => s,
            None => continue,
        };
        if table.entry(idx).send_buffer.is_empty() {
            continue;
        }

        scheduler::refill_send_window(table.entry_mut(idx), elapsed_secs);

        let mtu = table.entry(idx).mtu;
        let selected_indices: Vec<usize> = if mtu == 0 {
            scheduler::select_streaming(table.entry(idx), cpu_load, &config.scheduler, now, rng, stats)
        } else {
            let capacity = (mtu as usize).saturating_sub(codec::FRAME_OVERHEAD);
            let entry = table.entry(idx);
            let lengths: Vec<usize> = entry.send_buffer.iter().map(|e| e.length).collect();
            let priorities: Vec<u32> = entry.send_buffer.iter().map(|e| e.priority).collect();
            let flags = scheduler::select_datagram(&lengths, &priorities, capacity, cpu_load, &config.scheduler, stats);
            flags.iter().enumerate().filter(|(_, f)| **f).map(|(i, _)| i).collect()
        };

        if selected_indices.is_empty() {
            continue;
        }

        let entry = table.entry_mut(idx);
        let mut taken: Vec<SendEntry> = Vec::with_capacity(selected_indices.len());
        for &i in selected_indices.iter().rev() {
            taken.push(entry.send_buffer.remove(i));
        }
        taken.reverse();

        let top_priority = taken.iter().map(|e| e.priority).max().unwrap_or(0);
        let permuted = scheduler::permute_with_placement(taken, rng);

        let mut body = Vec::new();
        let mut used: i64 = 0;
        for send_entry in permuted {
            used += send_entry.length as i64;
            if let Some(bytes) = send_entry.resolve() {
                body.extend_from_slice(&bytes);
            }
        }

        let key = match entry.local_key.as_ref() {
            Some(k) => *k.key(),
            None => {
                cron_stats_scheduler_skip(&entry.peer);
                continue;
            }
        };
        entry.last_seq_sent += 1;
        let seq = entry.last_seq_sent;
        entry.send_window -= used;

        let advertised = allocator::advertised_bandwidth(entry.ideal_limit, entry.violations);
        entry.max_transmitted_limit = allocator::age_max_transmitted_limit(entry.max_transmitted_limit, advertised);
        let frame = match codec::encode_encrypted(&key, seq, now_secs as u32, advertised, &body) {
            Ok(f) => f,
            Err(_) => {
                failures.push(entry.peer);
                continue;
            }
        };

        let peer = entry.peer;
        match transport.send(session, &frame, top_priority >= EXTREME_PRIORITY).await {
            SendResult::Ok => {}
            SendResult::WouldBlock | SendResult::Error => {
                failures.push(peer);
            }
        }
    }

    cron_stats.scheduler_passes += 1;
    failures
}

fn cron_stats_scheduler_skip(peer: &PeerId) {
    debug!(%peer, "dropping selected send set: no local session key yet");
}

/// Placement helper used when a caller builds a `SendEntry` directly
/// from an embedded `Message` (the common case for handshake replies
/// and keep-alives).
pub fn send_entry_for_message(msg: &Message, priority: u32, deadline: std::time::Instant, placement: Placement) -> Option<SendEntry> {
    let bytes = codec::frame_message(msg).ok()?;
    Some(SendEntry::new_bytes(bytes, priority, deadline, placement))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::entry::Entry;

    fn id(b: u8) -> PeerId {
        PeerId([b; 64])
    }

    #[test]
    fn liveness_pass_drops_inactive_up_entry_with_hangup() {
        let mut table = Table::new(60_000);
        let idx = table.lookup_or_create(id(1));
        table.entry_mut(idx).status = Status::Up;
        table.entry_mut(idx).last_alive = 0;

        let mut ping_table = PingTable::new();
        let mut stats = CronStats::default();
        let out = liveness_pass(&mut table, &mut ping_table, id(99), handshake::SECONDS_INACTIVE_DROP + 1, &mut stats);

        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].1, LivenessOutcome::DroppedWithHangup(_, _)));
        assert_eq!(table.entry(idx).status, Status::Down);
        assert_eq!(stats.liveness_drops, 1);
    }

    #[test]
    fn liveness_pass_emits_keepalive_for_stale_but_not_dead_entry() {
        let mut table = Table::new(60_000);
        let idx = table.lookup_or_create(id(2));
        table.entry_mut(idx).status = Status::Up;
        table.entry_mut(idx).last_alive = 0;

        let mut ping_table = PingTable::new();
        let mut stats = CronStats::default();
        let now = handshake::SECONDS_INACTIVE_DROP / 2 + 1;
        let out = liveness_pass(&mut table, &mut ping_table, id(99), now, &mut stats);

        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].1, LivenessOutcome::KeepAlivePing(_)));
        assert_eq!(ping_table.len(), 1);
    }

    #[test]
    fn allocator_pass_applies_decisions_and_blacklists() {
        let mut table = Table::new(60_000);
        let idx = table.lookup_or_create(id(3));
        {
            let e = table.entry_mut(idx);
            e.status = Status::Up;
            e.violations = allocator::VALUE_AGING_FACTOR as u32 + 100;
        }
        let mut rng = rand::thread_rng();
        let mut stats = CronStats::default();
        allocator_pass(&mut table, &Config::default(), 1, 0, 50.0, 20, &mut rng, &mut stats);
        assert_eq!(stats.allocator_passes, 1);
        assert_eq!(table.entry(idx).status, Status::Down);
    }

    #[test]
    fn expire_ping_table_counts_removed() {
        let mut ping_table = PingTable::new();
        ping_table.register(id(4), 1, 10).unwrap();
        ping_table.register(id(4), 2, 1000).unwrap();
        let mut stats = CronStats::default();
        expire_ping_table(&mut ping_table, 500, &mut stats);
        assert_eq!(stats.ping_table_expired, 1);
        assert_eq!(ping_table.len(), 1);
    }

    #[test]
    fn send_entry_for_message_frames_with_type_prefix() {
        let msg = Message::Ping(PingPongPayload { target: id(5), challenge: 7 });
        let se = send_entry_for_message(&msg, 1, std::time::Instant::now(), Placement::None).unwrap();
        assert!(se.length > 4);
    }

    #[tokio::test]
    async fn scheduler_pass_sends_over_transport() {
        use crate::net::hello::HelloMessage;
        use crate::net::transport::MockTransport;

        let mut table = Table::new(60_000);
        let idx = table.lookup_or_create(id(6));
        {
            let e = table.entry_mut(idx);
            e.status = Status::Up;
            e.transport_session = Some(0);
            e.mtu = 0;
            e.max_bpm = 60_000;
            e.send_window = 10_000;
            e.local_key = Some(crate::net::session_key::SessionKey::new([9u8; 32], 0));
            e.insert_sorted(SendEntry::new_bytes(vec![1, 2, 3], 10, std::time::Instant::now(), Placement::None));
        }

        let hello = HelloMessage {
            public_key: vec![],
            sender: id(6),
            expires_at: 1,
            protocol: 0,
            mtu: 0,
            address: vec![],
            signature: vec![],
        };
        let transport = MockTransport::new(0, hello);
        let mut rng = rand::thread_rng();
        let mut sched_stats = SchedulerStats::default();
        let mut cron_stats = CronStats::default();

        let failures = scheduler_pass(
            &mut table,
            &transport,
            &Config::default(),
            0.0,
            1000,
            std::time::Instant::now(),
            1.0,
            &mut rng,
            &mut sched_stats,
            &mut cron_stats,
        )
        .await;

        assert!(failures.is_empty());
        let sent = transport.drain_sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(cron_stats.scheduler_passes, 1);
    }
}
