//! Configuration knobs consumed by the core (§6)

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Bound on `hello_expires_minutes`: 10 days.
pub const MAX_HELLO_EXPIRES_MINUTES: u32 = 10 * 24 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Probability (as 1/N) of a small randomized deferral when the
    /// selected set is still tiny and its nearest deadline is far off
    /// (§4.2 step 3; §9 open question, resolved
    /// explicitly per §4.2.3).
    pub deferral_probability_inverse: u32,
    pub deferral_min_deadline_ms: u64,
    /// CPU-load fraction (1.0 = 100%) above which the scheduler falls
    /// back from exact-DP to greedy knapsack selection.
    pub exact_dp_load_threshold: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            deferral_probability_inverse: 16,
            deferral_min_deadline_ms: 500,
            exact_dp_load_threshold: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// `load.max_net_down_bps_total`: total downstream cap; drives
    /// table sizing and the inbound allocator.
    pub max_net_down_bps_total: u32,
    /// `load.max_net_up_bps_total`: total upstream cap.
    pub max_net_up_bps_total: u32,
    /// `gnunetd.hello_expires`, bounded by `MAX_HELLO_EXPIRES_MINUTES`.
    pub hello_expires_minutes: u32,
    /// `gnunetd_experimental.padding`.
    pub padding_enabled: bool,
    /// `network.trusted`; carried through for completeness even though
    /// local control sockets are out of this crate's scope.
    pub trusted_networks: Vec<IpNet>,
    pub scheduler: SchedulerConfig,
    pub worker_threads: usize,
    pub queue_capacity: usize,
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.hello_expires_minutes > MAX_HELLO_EXPIRES_MINUTES {
            return Err(format!(
                "hello_expires_minutes {} exceeds bound {}",
                self.hello_expires_minutes, MAX_HELLO_EXPIRES_MINUTES
            ));
        }
        if self.worker_threads == 0 {
            return Err("worker_threads must be >= 1".to_string());
        }
        Ok(())
    }

    /// True if `load.*` fields differ from `other`, in which case the
    /// connection table must be rehashed (§4.1/§6).
    pub fn load_changed(&self, other: &Config) -> bool {
        self.max_net_down_bps_total != other.max_net_down_bps_total
            || self.max_net_up_bps_total != other.max_net_up_bps_total
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_net_down_bps_total: 60_000,
            max_net_up_bps_total: 60_000,
            hello_expires_minutes: 60,
            padding_enabled: true,
            trusted_networks: Vec::new(),
            scheduler: SchedulerConfig::default(),
            worker_threads: 2,
            queue_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_hello_expiry_beyond_bound() {
        let mut cfg = Config::default();
        cfg.hello_expires_minutes = MAX_HELLO_EXPIRES_MINUTES + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_changed_detects_down_or_up_change() {
        let a = Config::default();
        let mut b = Config::default();
        assert!(!a.load_changed(&b));
        b.max_net_down_bps_total += 1;
        assert!(a.load_changed(&b));
    }
}
