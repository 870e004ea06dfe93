//! Dynamic concurrency budget (spec §4.4.1).

use serde::{Deserialize, Serialize};

use crate::ports::HealthCounts;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub min_concurrent_steps: usize,
    pub max_concurrent_steps: usize,
    /// Fraction of the pool reserved as a safety margin (spec §5:
    /// "≥ 20% safety margin, minimum 2 connections reserved").
    pub pool_safety_margin_fraction: f64,
    pub pool_safety_margin_min: u32,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            min_concurrent_steps: 1,
            max_concurrent_steps: 20,
            pool_safety_margin_fraction: 0.2,
            pool_safety_margin_min: 2,
        }
    }
}

/// `min(load_derived, pool_derived)`, clamped to `[min, max]` (spec §4.4.1).
/// Falls back to `min_concurrent_steps` when a signal is unavailable.
pub fn compute_max_concurrent(
    load: Option<HealthCounts>,
    pool_size: Option<u32>,
    config: &ConcurrencyConfig,
) -> usize {
    let load_derived = load.map_or(config.min_concurrent_steps, |counts| {
        load_derived_budget(&counts, config)
    });
    let pool_derived = pool_size.map_or(config.min_concurrent_steps, |size| {
        pool_derived_budget(size, config)
    });

    load_derived
        .min(pool_derived)
        .clamp(config.min_concurrent_steps, config.max_concurrent_steps)
}

/// Scale concurrency to the size of the pending backlog: no point reserving
/// more slots than there is work queued, but never fewer than `min`.
fn load_derived_budget(counts: &HealthCounts, config: &ConcurrencyConfig) -> usize {
    let backlog = counts.steps_pending.saturating_add(counts.tasks_pending) as usize;
    backlog.clamp(config.min_concurrent_steps, config.max_concurrent_steps)
}

fn pool_derived_budget(pool_size: u32, config: &ConcurrencyConfig) -> usize {
    let fractional_margin = (pool_size as f64 * config.pool_safety_margin_fraction).ceil() as u32;
    let margin = fractional_margin.max(config.pool_safety_margin_min);
    pool_size.saturating_sub(margin) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_min_with_no_signals() {
        let config = ConcurrencyConfig::default();
        assert_eq!(compute_max_concurrent(None, None, &config), config.min_concurrent_steps);
    }

    #[test]
    fn pool_derived_reserves_safety_margin() {
        let config = ConcurrencyConfig::default();
        // pool of 10: margin = max(ceil(10*0.2)=2, 2) = 2 -> 8 available
        let max = compute_max_concurrent(None, Some(10), &config);
        assert_eq!(max, config.min_concurrent_steps.max(8).min(config.max_concurrent_steps).min(8));
    }

    #[test]
    fn small_pool_still_reserves_the_minimum_margin() {
        let config = ConcurrencyConfig::default();
        // pool of 3: fractional margin ceil(0.6)=1, floored up to min 2 -> 1 available
        let budget = pool_derived_budget(3, &config);
        assert_eq!(budget, 1);
    }

    #[test]
    fn final_budget_is_the_minimum_of_both_signals_clamped() {
        let config = ConcurrencyConfig {
            min_concurrent_steps: 1,
            max_concurrent_steps: 50,
            pool_safety_margin_fraction: 0.2,
            pool_safety_margin_min: 2,
        };
        let load = HealthCounts {
            tasks_in_progress: 0,
            tasks_pending: 0,
            steps_in_progress: 0,
            steps_pending: 5,
        };
        let max = compute_max_concurrent(Some(load), Some(100), &config);
        assert_eq!(max, 5);
    }

    #[test]
    fn budget_never_exceeds_configured_max() {
        let config = ConcurrencyConfig {
            min_concurrent_steps: 1,
            max_concurrent_steps: 4,
            pool_safety_margin_fraction: 0.0,
            pool_safety_margin_min: 0,
        };
        let load = HealthCounts {
            tasks_in_progress: 0,
            tasks_pending: 0,
            steps_in_progress: 0,
            steps_pending: 1000,
        };
        let max = compute_max_concurrent(Some(load), Some(1000), &config);
        assert_eq!(max, 4);
    }
}
