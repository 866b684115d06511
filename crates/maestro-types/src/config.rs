//! Orchestrator configuration.
//!
//! `OrchestratorConfig` represents the `config.toml` knobs that tune retry
//! backoff, in-level fan-out, and checkpoint retention. All fields have
//! sensible defaults so an empty file (or no file) is a valid configuration.

use serde::{Deserialize, Serialize};

/// Tunable settings for the workflow orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Base delay for retry backoff, in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Ceiling on any single retry delay, in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Maximum number of steps dispatched concurrently within one level.
    /// `None` starts every step in the level at once.
    #[serde(default)]
    pub level_fan_out: Option<usize>,

    /// How many checkpoints to retain per execution after completion.
    #[serde(default = "default_checkpoint_keep_latest")]
    pub checkpoint_keep_latest: usize,
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_checkpoint_keep_latest() -> usize {
    5
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            level_fan_out: None,
            checkpoint_keep_latest: default_checkpoint_keep_latest(),
        }
    }
}
