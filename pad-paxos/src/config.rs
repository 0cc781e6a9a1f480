//! Consensus engine tuning knobs.

use rand::Rng;
use std::time::Duration;

/// Consensus configuration.
#[derive(Debug, Clone)]
pub struct PaxosConfig {
    /// Upper bound on one RPC round trip (connect included)
    pub rpc_timeout: Duration,
    /// Backoff before the first retry of a failed round
    pub backoff_base: Duration,
    /// Backoff ceiling
    pub backoff_max: Duration,
}

impl Default for PaxosConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(1),
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_secs(1),
        }
    }
}

impl PaxosConfig {
    /// Short timeouts for in-process clusters.
    pub fn for_testing() -> Self {
        Self {
            rpc_timeout: Duration::from_millis(200),
            backoff_base: Duration::from_millis(2),
            backoff_max: Duration::from_millis(40),
        }
    }

    /// Randomized exponential backoff for the given failed attempt (1-based).
    ///
    /// Uniform in `[cap/2, cap]` where `cap = min(base·2^(attempt-1), max)`,
    /// so dueling proposers drift apart.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let cap = self
            .backoff_base
            .saturating_mul(1u32 << shift)
            .min(self.backoff_max);
        let cap_us = cap.as_micros() as u64;
        if cap_us == 0 {
            return Duration::ZERO;
        }
        let jittered = rand::thread_rng().gen_range(cap_us / 2..=cap_us);
        Duration::from_micros(jittered)
    }
}
