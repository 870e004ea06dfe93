//! Per-batch timeout and chunking helpers (spec §4.4.2).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::Step;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub base_timeout_seconds: u64,
    /// Added per step in the chunk, so a larger chunk gets proportionally
    /// more wall-clock time to finish (spec §4.4.2: "grows with chunk
    /// size, bounded to prevent runaway").
    pub per_step_seconds: u64,
    pub max_timeout_seconds: u64,
    /// How long to wait for in-flight steps to finish after a cancellation
    /// before giving up on them (spec §4.4.4).
    pub future_cleanup_wait_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            base_timeout_seconds: 30,
            per_step_seconds: 5,
            max_timeout_seconds: 300,
            future_cleanup_wait_seconds: 10,
        }
    }
}

/// `T = calculate_batch_timeout(chunk_size)` (spec §4.4.2 step 4).
pub fn calculate_batch_timeout(chunk_size: usize, config: &TimeoutConfig) -> Duration {
    let seconds = config
        .base_timeout_seconds
        .saturating_add(config.per_step_seconds.saturating_mul(chunk_size as u64))
        .min(config.max_timeout_seconds);
    Duration::from_secs(seconds)
}

/// Slice `steps` into chunks of at most `max_concurrent` (spec §4.4.2).
pub fn chunk_steps(steps: Vec<Step>, max_concurrent: usize) -> Vec<Vec<Step>> {
    if max_concurrent == 0 {
        return vec![steps];
    }
    steps
        .chunks(max_concurrent)
        .map(<[Step]>::to_vec)
        .collect()
}
