//! Send-buffer management and the knapsack-based outbound scheduler
//! (§4.2), following the algorithmic shape of `connection.c`'s
//! `solveKnapsack` / `approximateKnapsack` / `checkSendFrequency` /
//! `outgoingCheck` / `selectMessagesToSend`.

use super::config::SchedulerConfig;
use super::entry::{Entry, Placement, SendEntry, Status, EXPECTED_MTU, EXTREME_PRIORITY, MAX_BUF_FACT, MAX_SEND_BUFFER_SIZE};
use rand::seq::SliceRandom;
use rand::Rng;

/// Minimum number of transmissions the frequency gate must allow within
/// `MIN_SAMPLE_TIME`.
pub const MINIMUM_SAMPLE_COUNT: f64 = 2.0;
pub const MIN_SAMPLE_TIME_MS: f64 = 1000.0;
/// Largest streaming-transport packet body this scheduler will build.
pub const MAX_BUFFER_SIZE: usize = super::codec::MAX_BUFFER_SIZE;

#[derive(Debug, Default, Clone, Copy)]
pub struct SchedulerStats {
    pub exact_selections: u64,
    pub greedy_selections: u64,
    pub deferrals: u64,
    pub lost_sent_bytes: u64,
}

/// Outcome of attempting to enqueue a `SendEntry` (§4.2 "Enqueue").
pub enum AppendOutcome {
    Queued,
    Fragmented,
    DroppedPreHandshake,
    DroppedOverCap,
}

/// `append(entry, send_entry)`: §4.2 steps 1-4.
pub fn append(entry: &mut Entry, send_entry: SendEntry) -> AppendOutcome {
    if entry.mtu != 0 && send_entry.length > entry.mtu as usize - super::codec::FRAME_OVERHEAD {
        entry.consider_transport_switch = true;
        return AppendOutcome::Fragmented;
    }

    if entry.status != Status::Up && !entry.send_buffer.is_empty() {
        return AppendOutcome::DroppedPreHandshake;
    }

    if entry.queued_bytes() + send_entry.length > MAX_SEND_BUFFER_SIZE {
        // One scheduler pass is attempted by the caller before this is
        // reached in the wired-up Core; here we just enforce the cap.
        return AppendOutcome::DroppedOverCap;
    }

    entry.insert_sorted(send_entry);
    AppendOutcome::Queued
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

/// Exact 0/1 knapsack: maximize total priority subject to total length
/// <= `capacity`. Mirrors `solveKnapsack`'s GCD-based table reduction
/// and "take everything" shortcut.
pub fn solve_knapsack_exact(lengths: &[usize], priorities: &[u32], capacity: usize) -> Vec<bool> {
    let n = lengths.len();
    assert_eq!(priorities.len(), n);

    let total: usize = lengths.iter().sum();
    if total <= capacity {
        return vec![true; n];
    }
    if capacity == 0 {
        return vec![false; n];
    }

    let mut g = capacity;
    for &l in lengths {
        if l > 0 {
            g = gcd(g, l);
        }
    }
    let g = g.max(1);

    let reduced_capacity = capacity / g;
    let reduced_lengths: Vec<usize> = lengths.iter().map(|&l| l / g).collect();

    let mut dp = vec![vec![0u64; reduced_capacity + 1]; n + 1];
    for i in 1..=n {
        let w = reduced_lengths[i - 1];
        let v = priorities[i - 1] as u64;
        for c in 0..=reduced_capacity {
            dp[i][c] = dp[i - 1][c];
            if w <= c {
                dp[i][c] = dp[i][c].max(dp[i - 1][c - w] + v);
            }
        }
    }

    let mut selected = vec![false; n];
    let mut c = reduced_capacity;
    for i in (1..=n).rev() {
        if dp[i][c] != dp[i - 1][c] {
            selected[i - 1] = true;
            c -= reduced_lengths[i - 1];
        }
    }
    selected
}

/// Length-greedy approximation: entries must already be sorted by
/// descending `priority / length` (the send buffer's own order).
/// Mirrors `approximateKnapsack`.
pub fn solve_knapsack_greedy(lengths: &[usize], capacity: usize) -> Vec<bool> {
    let mut selected = vec![false; lengths.len()];
    let mut remaining = capacity;
    for (i, &l) in lengths.iter().enumerate() {
        if l <= remaining {
            selected[i] = true;
            remaining -= l;
        }
    }
    selected
}

/// Choose exact-DP vs greedy based on CPU load fraction, recording the
/// choice in `stats` so it is observable (§9).
pub fn select_datagram(
    lengths: &[usize],
    priorities: &[u32],
    capacity: usize,
    cpu_load: f64,
    config: &SchedulerConfig,
    stats: &mut SchedulerStats,
) -> Vec<bool> {
    if cpu_load <= config.exact_dp_load_threshold {
        stats.exact_selections += 1;
        solve_knapsack_exact(lengths, priorities, capacity)
    } else {
        stats.greedy_selections += 1;
        solve_knapsack_greedy(lengths, capacity)
    }
}

/// Cubic load-shedding policy for non-extreme-priority traffic on a
/// streaming transport (`outgoingCheck` in the original source).
/// Returns whether the message is allowed to be sent under the given load.
pub fn outgoing_check(priority: u32, cpu_load: f64) -> bool {
    if priority >= EXTREME_PRIORITY {
        return true;
    }
    if cpu_load >= 1.5 {
        return false;
    }
    if cpu_load > 1.0 {
        return false; // only EXTREME_PRIORITY passes above 100% load
    }
    if cpu_load <= 0.75 {
        return true;
    }
    let delta = cpu_load - 0.75;
    delta.powi(3) <= priority as f64 / EXTREME_PRIORITY as f64
}

/// Minimum inter-send interval (milliseconds) from bandwidth and load
/// (`checkSendFrequency` in the original source), §4.2 step 1.
pub fn frequency_gate_ms(mtu_or_expected: usize, max_bpm: u32, cpu_load: f64, buffer_fullness: f64) -> f64 {
    let max_bpm_per_ms = (max_bpm.max(1) as f64) / 60_000.0;
    let base = mtu_or_expected as f64 / max_bpm_per_ms.max(1e-9);
    let floor = 2.0 * MIN_SAMPLE_TIME_MS / MINIMUM_SAMPLE_COUNT;
    let scaled = base * (cpu_load / buffer_fullness.max(1e-9)).powi(2);
    scaled.max(floor)
}

/// Refill `send_window` from elapsed time, clamped to the cap. Returns
/// the clamped overflow (accounted as "lost-sent").
pub fn refill_send_window(entry: &mut Entry, elapsed_secs: f64) -> i64 {
    let refill = (entry.max_bpm as f64 * elapsed_secs / 60.0) as i64;
    let cap = entry.max_bpm as i64 * MAX_BUF_FACT as i64;
    let new_window = entry.send_window + refill;
    if new_window > cap {
        let overflow = new_window - cap;
        entry.send_window = cap;
        overflow
    } else {
        entry.send_window = new_window;
        0
    }
}

/// Permute the selected entries per §4.2 step 5: random shuffle,
/// then move `Head` entries to the front and `Tail` entries to the
/// back, preserving random order within each group.
pub fn permute_with_placement(mut entries: Vec<SendEntry>, rng: &mut impl Rng) -> Vec<SendEntry> {
    entries.shuffle(rng);
    let mut head = Vec::new();
    let mut mid = Vec::new();
    let mut tail = Vec::new();
    for e in entries {
        match e.placement {
            Placement::Head => head.push(e),
            Placement::None => mid.push(e),
            Placement::Tail => tail.push(e),
        }
    }
    head.extend(mid);
    head.extend(tail);
    head
}

/// Streaming-transport greedy selection (mtu == 0), §4.2 step 3.
/// Returns the indices (into `entry.send_buffer`, which is already
/// priority-sorted) to select, honoring the anti-starvation defer rule.
pub fn select_streaming(
    entry: &Entry,
    cpu_load: f64,
    config: &SchedulerConfig,
    now: std::time::Instant,
    rng: &mut impl Rng,
    stats: &mut SchedulerStats,
) -> Vec<usize> {
    if entry.send_buffer.is_empty() {
        return Vec::new();
    }

    let top = &entry.send_buffer[0];
    let top_fits = top.length as i64 <= entry.send_window || top.priority >= EXTREME_PRIORITY;
    if !top_fits {
        return Vec::new();
    }

    let mut selected = Vec::new();
    let mut used: i64 = 0;
    let cap = MAX_BUFFER_SIZE as i64 - 64;
    for (i, e) in entry.send_buffer.iter().enumerate() {
        if !outgoing_check(e.priority, cpu_load) {
            continue;
        }
        if used + e.length as i64 > cap {
            continue;
        }
        if used + e.length as i64 > entry.send_window && e.priority < EXTREME_PRIORITY {
            continue;
        }
        selected.push(i);
        used += e.length as i64;
    }

    if selected.len() <= 1 {
        let threshold = now + std::time::Duration::from_millis(config.deferral_min_deadline_ms);
        let nearest_deadline_far = entry
            .send_buffer
            .first()
            .map(|e| e.deadline > threshold)
            .unwrap_or(false);
        if nearest_deadline_far && rng.gen_range(0..config.deferral_probability_inverse) == 0 {
            stats.deferrals += 1;
            return Vec::new();
        }
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_knapsack_never_exceeds_capacity() {
        let lengths = vec![10, 20, 30, 15];
        let priorities = vec![60, 100, 120, 50];
        let capacity = 45;
        let selected = solve_knapsack_exact(&lengths, &priorities, capacity);
        let used: usize = selected.iter().zip(&lengths).filter(|(s, _)| **s).map(|(_, l)| l).sum();
        assert!(used <= capacity);
    }

    #[test]
    fn exact_knapsack_takes_everything_when_it_fits() {
        let lengths = vec![10, 10, 10];
        let priorities = vec![1, 1, 1];
        let selected = solve_knapsack_exact(&lengths, &priorities, 100);
        assert!(selected.iter().all(|s| *s));
    }

    #[test]
    fn greedy_respects_capacity_when_presorted() {
        let lengths = vec![10, 20, 5];
        let selected = solve_knapsack_greedy(&lengths, 25);
        let used: usize = selected.iter().zip(&lengths).filter(|(s, _)| **s).map(|(_, l)| l).sum();
        assert!(used <= 25);
    }

    #[test]
    fn outgoing_check_always_allows_extreme_priority() {
        assert!(outgoing_check(EXTREME_PRIORITY, 2.0));
    }

    #[test]
    fn outgoing_check_blocks_non_extreme_above_150_percent() {
        assert!(!outgoing_check(100, 1.6));
    }

    #[test]
    fn placement_head_before_none_before_tail() {
        use std::time::Instant;
        let now = Instant::now();
        let entries = vec![
            SendEntry::new_bytes(vec![0], 1, now, Placement::Tail),
            SendEntry::new_bytes(vec![0], 1, now, Placement::Head),
            SendEntry::new_bytes(vec![0], 1, now, Placement::None),
        ];
        let mut rng = rand::thread_rng();
        let permuted = permute_with_placement(entries, &mut rng);
        assert_eq!(permuted[0].placement, Placement::Head);
        assert_eq!(permuted[1].placement, Placement::None);
        assert_eq!(permuted[2].placement, Placement::Tail);
    }

    #[test]
    fn frequency_gate_has_a_floor() {
        let ms = frequency_gate_ms(1400, 60_000, 0.0, 1.0);
        assert!(ms >= 2.0 * MIN_SAMPLE_TIME_MS / MINIMUM_SAMPLE_COUNT);
    }

    #[test]
    fn refill_clamps_to_cap_and_reports_overflow() {
        let mut e = Entry::new(super::super::peer_id::PeerId([0u8; 64]));
        e.max_bpm = 6000;
        e.send_window = e.max_bpm as i64 * MAX_BUF_FACT as i64;
        let overflow = refill_send_window(&mut e, 60.0);
        assert!(overflow > 0);
        assert_eq!(e.send_window, e.max_bpm as i64 * MAX_BUF_FACT as i64);
    }

    #[test]
    fn oversized_message_on_datagram_transport_is_fragmented_not_queued() {
        use std::time::Instant;
        let mut e = Entry::new(super::super::peer_id::PeerId([7u8; 64]));
        e.mtu = 1400;
        let big = SendEntry::new_bytes(vec![0u8; 9000], 10, Instant::now(), Placement::None);
        let outcome = append(&mut e, big);
        assert!(matches!(outcome, AppendOutcome::Fragmented));
        assert!(e.send_buffer.is_empty());
        assert!(e.consider_transport_switch);
    }
}
