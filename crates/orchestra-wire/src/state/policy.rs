//! Backoff between rejected compare-and-set attempts.

use orchestra_types::CasConfig;
use rand::Rng;
use std::time::Duration;

/// How often, and how patiently, a state update retries under contention.
#[derive(Debug, Clone, PartialEq)]
pub struct CasPolicy {
    /// Attempts before giving up, including the first. Never less than 1.
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Jitter factor (0.0 = none).
    pub jitter: f64,
}

impl CasPolicy {
    /// Delay before retry number `retry` (0-based): `min_delay * 2^retry`,
    /// capped at `max_delay`, with optional upward jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let min_ms = self.min_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let base = min_ms.saturating_mul(1u64.checked_shl(retry).unwrap_or(u64::MAX));
        let capped = base.min(max_ms);

        if self.jitter <= 0.0 || capped == 0 {
            return Duration::from_millis(capped);
        }

        let frac: f64 = rand::thread_rng().gen_range(0.0..1.0);
        let with_jitter = (capped as f64) * (1.0 + frac * self.jitter);
        // Jitter never pushes past the ceiling.
        Duration::from_millis((with_jitter as u64).min(max_ms))
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl From<&CasConfig> for CasPolicy {
    fn from(config: &CasConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            min_delay: Duration::from_millis(config.min_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }
}

impl Default for CasPolicy {
    fn default() -> Self {
        Self::from(&CasConfig::default())
    }
}
