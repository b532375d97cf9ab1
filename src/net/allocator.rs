//! Inbound bandwidth allocator (§4.5)
//!
//! Periodic fair-share redistribution of downstream bandwidth among
//! `Up` entries; enforces per-peer receive limits and disconnects
//! violators.

use super::entry::{Entry, MAX_BUF_FACT, MAX_VIOLATIONS};
use super::table::MIN_BPM_PER_PEER;
use rand::seq::SliceRandom;

pub const MIN_SAMPLE_TIME_SECS: u64 = 10;
pub const MIN_SAMPLE_PEER_COUNT: usize = 4;
/// Fraction `value` is aged by when a full sample interval elapses.
pub const VALUE_AGING_FACTOR: f64 = 0.9;

#[derive(Debug, Clone, Copy)]
pub struct AllocatorInput {
    pub index: usize,
    pub adjusted_recent_rate: u32,
    pub value: f64,
    pub max_transmitted_limit: u32,
    pub violations: u32,
    pub guarded: bool,
    pub established_at: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum PeerDisposition {
    Ok,
    Blacklist24h,
    BlacklistBrief,
}

#[derive(Debug, Clone, Copy)]
pub struct AllocatorDecision {
    pub index: usize,
    pub ideal_limit: u32,
    pub violations: u32,
    pub disposition: PeerDisposition,
}

/// Whether the allocator should run this tick: either enough sample
/// time elapsed, or few enough peers are connected that waiting would
/// needlessly delay the first allocation (§4.5 / §4.5.1).
pub fn should_run(elapsed_secs: u64, connected_peers: usize) -> bool {
    elapsed_secs >= MIN_SAMPLE_TIME_SECS || connected_peers < MIN_SAMPLE_PEER_COUNT
}

/// Run one allocator pass. `total_max_bpm` is the configured downstream
/// cap; `min_connect` / `guarded_count` feed the minimum guaranteed
/// connection reservation (§4.5 step 2); `downstream_load_pct` is
/// the current downstream load as a percentage (100 = at capacity).
pub fn run_allocation(
    inputs: &[AllocatorInput],
    total_max_bpm: u32,
    min_connect: usize,
    guarded_count: usize,
    downstream_load_pct: f64,
    rng: &mut impl rand::Rng,
) -> Vec<AllocatorDecision> {
    let n = inputs.len();
    if n == 0 {
        return Vec::new();
    }

    // Step 1: shares.
    let raw_shares: Vec<f64> = inputs.iter().map(|i| i.value.max(0.0)).collect();
    let share_sum: f64 = raw_shares.iter().sum();
    let shares: Vec<f64> = if share_sum < 1e-9 {
        vec![1.0 / n as f64; n]
    } else {
        raw_shares.iter().map(|s| s / share_sum).collect()
    };

    // Step 2: minimum guaranteed connections.
    let min_con = min_connect.max(guarded_count);
    let reservation = (min_con as u32).saturating_mul(MIN_BPM_PER_PEER);

    // Step 3: schedulable pool, scaled down if downstream is overloaded.
    let mut schedulable = total_max_bpm.saturating_sub(reservation) as f64;
    if downstream_load_pct > 100.0 {
        schedulable *= 100.0 / downstream_load_pct;
    }

    let mut allocated = vec![0u32; n];

    // Step 4: first round, capped at 2x adjusted recent rate, with a
    // floor of MIN_BPM_PER_PEER for guarded peers with zero share
    // (§9 clarification).
    let mut remaining = schedulable;
    for (i, inp) in inputs.iter().enumerate() {
        let cap = (2 * inp.adjusted_recent_rate) as f64;
        let grant = if inp.adjusted_recent_rate == 0 && inp.guarded {
            MIN_BPM_PER_PEER as f64
        } else {
            cap.min(remaining.max(0.0))
        };
        let grant = grant.min(remaining.max(0.0));
        allocated[i] += grant as u32;
        remaining -= grant;
    }

    // Step 5: distribute remainder proportionally to shares until the
    // pool is exhausted below the per-peer granularity or nobody can
    // accept more.
    let mut guard = 0;
    while remaining > (n as f64) * 100.0 && guard < 64 {
        let mut progressed = false;
        for i in 0..n {
            let grant = (remaining * shares[i]).min(remaining);
            if grant >= 1.0 {
                allocated[i] += grant as u32;
                remaining -= grant;
                progressed = true;
            }
        }
        guard += 1;
        if !progressed {
            break;
        }
    }

    // Step 6: residual divided evenly, random permutation to break ties.
    if remaining > 0.0 {
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(rng);
        let share_each = (remaining / n as f64) as u32;
        for i in order {
            allocated[i] += share_each;
        }
    }

    // Step 7: uptime bonus for the min_con peers with earliest established_at.
    let mut by_uptime: Vec<usize> = (0..n).collect();
    by_uptime.sort_by_key(|&i| inputs[i].established_at);
    if min_con >= n {
        for (k, &i) in by_uptime.iter().enumerate() {
            if k % min_con.max(1) == 0 {
                allocated[i] += MIN_BPM_PER_PEER;
            }
        }
    } else {
        for &i in by_uptime.iter().take(min_con) {
            allocated[i] += MIN_BPM_PER_PEER;
        }
    }

    // Step 8 & 9: violation enforcement and commit.
    let mut decisions = Vec::with_capacity(n);
    for (i, inp) in inputs.iter().enumerate() {
        let mut violations = inp.violations;
        let transmitted_ref = inp.max_transmitted_limit.max(allocated[i]);
        if inp.adjusted_recent_rate as f64 > 2.0 * MAX_BUF_FACT as f64 * transmitted_ref as f64 {
            violations += 1;
        } else if (inp.adjusted_recent_rate as u32) < transmitted_ref / 2 && violations > 0 {
            violations -= 1;
        }

        let (ideal_limit, disposition) = if violations > MAX_VIOLATIONS {
            (0, PeerDisposition::Blacklist24h)
        } else if allocated[i] < MIN_BPM_PER_PEER {
            (MIN_BPM_PER_PEER, PeerDisposition::BlacklistBrief)
        } else {
            (allocated[i], PeerDisposition::Ok)
        };

        decisions.push(AllocatorDecision {
            index: inp.index,
            ideal_limit,
            violations,
            disposition,
        });
    }

    decisions
}

/// Bandwidth advertised on every outbound frame: well-behaved peers see
/// the full limit, violators see it shrink (§4.5, closing line).
pub fn advertised_bandwidth(ideal_limit: u32, violations: u32) -> u32 {
    let numerator = MAX_VIOLATIONS.saturating_sub(violations);
    ((ideal_limit as u64 * numerator as u64) / MAX_VIOLATIONS as u64) as u32
}

/// Fraction `max_transmitted_limit` decays by on each sending
/// opportunity (§3: "highest `ideal_limit` we have transmitted,
/// aged exponentially each sending opportunity").
pub const MAX_TRANSMITTED_LIMIT_DECAY: f64 = 0.95;

/// Update the running "highest transmitted" record each time a limit is
/// advertised to a peer: decay the old value, then raise it back up if
/// the just-advertised limit exceeds the decayed floor.
pub fn age_max_transmitted_limit(current: u32, advertised: u32) -> u32 {
    let decayed = (current as f64 * MAX_TRANSMITTED_LIMIT_DECAY) as u32;
    decayed.max(advertised)
}

/// Age `value` by `VALUE_AGING_FACTOR` when a non-trivial sample
/// interval elapsed (§4.5 step 10).
pub fn age_value(value: f64, elapsed_secs: u64) -> f64 {
    if elapsed_secs >= MIN_SAMPLE_TIME_SECS {
        value * VALUE_AGING_FACTOR
    } else {
        value
    }
}

/// Higher-layer downstream credit reservation (§4.5, closing
/// paragraph): age `downstream_reserved` up from `ideal_limit · Δt /
/// 60s` clamped to `ideal_limit · MAX_BUF_FACT`, then grant (`amount >
/// 0`) or return (`amount < 0`) credit. Returns the amount actually
/// granted/returned, which may be less than requested if credit is short.
pub fn reserve_downstream(entry: &mut Entry, amount: i64, now_secs: u64) -> i64 {
    let elapsed = now_secs.saturating_sub(entry.last_reservation_update);
    entry.last_reservation_update = now_secs;
    let refill = (entry.ideal_limit as u64 * elapsed) / 60;
    let cap = entry.ideal_limit as u64 * MAX_BUF_FACT as u64;
    entry.downstream_reserved = (entry.downstream_reserved + refill).min(cap);

    if amount > 0 {
        let grant = (amount as u64).min(entry.downstream_reserved);
        entry.downstream_reserved -= grant;
        grant as i64
    } else if amount < 0 {
        let give_back = (-amount) as u64;
        entry.downstream_reserved = (entry.downstream_reserved + give_back).min(cap);
        amount
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(index: usize, rate: u32, value: f64) -> AllocatorInput {
        AllocatorInput {
            index,
            adjusted_recent_rate: rate,
            value,
            max_transmitted_limit: rate,
            violations: 0,
            guarded: false,
            established_at: index as u64,
        }
    }

    #[test]
    fn conservation_sum_ideal_limit_bounded_by_max_bpm() {
        let mut rng = rand::thread_rng();
        let inputs = vec![input(0, 1000, 1.0), input(1, 2000, 2.0), input(2, 500, 0.5)];
        let decisions = run_allocation(&inputs, 60_000, 2, 0, 50.0, &mut rng);
        let sum: u64 = decisions.iter().map(|d| d.ideal_limit as u64).sum();
        assert!(sum <= 60_000 + 3 * MIN_BPM_PER_PEER as u64);
    }

    #[test]
    fn violation_cap_triggers_blacklist() {
        let mut rng = rand::thread_rng();
        let mut inp = input(0, 600_000, 1.0);
        inp.violations = MAX_VIOLATIONS + 1;
        let decisions = run_allocation(&[inp], 60_000, 1, 0, 50.0, &mut rng);
        assert!(matches!(decisions[0].disposition, PeerDisposition::Blacklist24h));
    }

    #[test]
    fn advertised_bandwidth_shrinks_with_violations() {
        let full = advertised_bandwidth(10_000, 0);
        let degraded = advertised_bandwidth(10_000, 5);
        assert!(degraded < full);
        assert_eq!(advertised_bandwidth(10_000, MAX_VIOLATIONS + 1), 0);
    }

    #[test]
    fn should_run_gate() {
        assert!(should_run(MIN_SAMPLE_TIME_SECS, 10));
        assert!(should_run(0, 1));
        assert!(!should_run(1, 10));
    }

    #[test]
    fn reserve_downstream_grants_up_to_refilled_credit() {
        let mut e = Entry::new(super::super::peer_id::PeerId([0u8; 64]));
        e.ideal_limit = 6000;
        e.last_reservation_update = 0;
        let granted = reserve_downstream(&mut e, 1000, 60);
        assert_eq!(granted, 1000);
        assert_eq!(e.downstream_reserved, 5000);
    }

    #[test]
    fn reserve_downstream_caps_at_ideal_limit_times_buf_fact() {
        let mut e = Entry::new(super::super::peer_id::PeerId([0u8; 64]));
        e.ideal_limit = 1000;
        e.downstream_reserved = 0;
        e.last_reservation_update = 0;
        reserve_downstream(&mut e, 0, 6000);
        assert_eq!(e.downstream_reserved, (1000 * MAX_BUF_FACT) as u64);
    }

    #[test]
    fn negative_amount_returns_credit() {
        let mut e = Entry::new(super::super::peer_id::PeerId([0u8; 64]));
        e.ideal_limit = 1000;
        e.downstream_reserved = 100;
        e.last_reservation_update = 0;
        let r = reserve_downstream(&mut e, -50, 0);
        assert_eq!(r, -50);
        assert_eq!(e.downstream_reserved, 150);
    }
}
