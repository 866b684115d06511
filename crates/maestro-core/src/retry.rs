//! Retry policy with capped exponential backoff.
//!
//! Attempts are 1-based: the first execution is attempt 1, and a step with
//! `retries = 3` runs at most three times. The delay before retry attempt
//! `n` (0-indexed) is `min(2^n * base_delay, max_delay)` -- the cap bounds
//! total wait time no matter how many retries are configured.

use std::time::Duration;

use maestro_types::config::OrchestratorConfig;

/// Backoff configuration shared by every step of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling on any single retry delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(60_000),
        }
    }
}

impl RetryPolicy {
    /// Build a policy from the orchestrator configuration.
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Delay before retry attempt `n` (0-indexed): `min(2^n * base, cap)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let cap_ms = self.max_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(factor).min(cap_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Whether another attempt is allowed. `attempt` is the 1-based attempt
/// that just failed; `max_attempts` is the step's configured limit.
pub fn should_retry(attempt: u32, max_attempts: u32) -> bool {
    attempt < max_attempts
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
