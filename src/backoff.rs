//! BackoffPolicy (spec §4.3): computes the instant a failed step becomes
//! eligible for retry again.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::InvalidBackoff;

/// Tunables for the exponential-with-jitter branch (spec §4.3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub base_delay_seconds: i64,
    pub multiplier: f64,
    /// Lower bound of the exponential clamp (spec §4.3 Inputs), distinct
    /// from the post-jitter floor of half the base delay (rule 4).
    pub min_delay_seconds: i64,
    pub max_delay_seconds: i64,
    /// Jitter is sampled uniformly from `[-jitter_fraction, +jitter_fraction]`
    /// of the computed delay, then the result is floored at
    /// `base_delay_seconds / 2` (spec §4.3 edge case).
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_seconds: 1,
            multiplier: 2.0,
            min_delay_seconds: 1,
            // Spec §4.3 rule 1: server-directed hints are clamped to
            // `max_delay` (default one hour).
            max_delay_seconds: 3600,
            jitter_fraction: 0.1,
        }
    }
}

/// Which branch of spec §4.3's priority list produced a [`BackoffDecision`].
/// Carried on the `step.backoff` event (spec §4.3: "emits a `step.backoff`
/// event with `{type: server_requested | exponential, seconds, attempt}`").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    ServerRequested,
    Exponential,
}

/// The outcome of a single [`BackoffPolicy::next_attempt_at`] call: the
/// absolute retry instant plus enough detail to emit the `step.backoff`
/// event without the caller recomputing anything.
#[derive(Debug, Clone, Copy)]
pub struct BackoffDecision {
    pub at: DateTime<Utc>,
    pub seconds: i64,
    pub kind: BackoffKind,
}

/// Computes retry delays. Holds no state; every call is pure given `attempt`
/// and an optional server hint (spec §4.3: "policy is a pure function of
/// attempt count and an optional server-directed hint").
#[derive(Debug, Clone, Copy, Default)]
pub struct BackoffPolicy {
    config: BackoffConfig,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// `attempt` is 1-indexed (the attempt that just failed). `retry_after`
    /// is a server-directed hint in seconds, when the handler's error
    /// carried one (spec §4.4.3, `HandlerError::Retryable::retry_after_seconds`).
    ///
    /// Server-directed hints take precedence over the exponential schedule
    /// when present (spec §4.3: "a server hint, when present, always wins").
    pub fn next_attempt_at(
        &self,
        attempt: u32,
        retry_after: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<BackoffDecision, InvalidBackoff> {
        let (seconds, kind) = match retry_after {
            Some(s) => (self.server_directed(s)?, BackoffKind::ServerRequested),
            None => (self.exponential_with_jitter(attempt), BackoffKind::Exponential),
        };
        Ok(BackoffDecision {
            at: now + Duration::seconds(seconds),
            seconds,
            kind,
        })
    }

    /// Clamp a server-directed `Retry-After` value into `[0, max_delay]`.
    /// Negative hints are a protocol violation (spec §4.3 edge case) and are
    /// rejected rather than silently clamped to zero, so the caller can
    /// decide whether to fall back to the exponential schedule.
    fn server_directed(&self, seconds: i64) -> Result<i64, InvalidBackoff> {
        if seconds < 0 {
            return Err(InvalidBackoff::NegativeDelta { seconds });
        }
        Ok(seconds.min(self.config.max_delay_seconds))
    }

    /// `base * multiplier^n` with `n = attempt` (spec §4.3 rule 2), clamped
    /// to `[min_delay_seconds, max_delay_seconds]`, jittered by
    /// `+/- jitter_fraction`, then floored at half the base delay so jitter
    /// can never push a retry down to (or below) zero (spec §4.3 edge case:
    /// "floor at half the base delay").
    fn exponential_with_jitter(&self, attempt: u32) -> i64 {
        let attempt = attempt.max(1);
        let raw =
            self.config.base_delay_seconds as f64 * self.config.multiplier.powi(attempt as i32);
        let clamped = raw.clamp(self.config.min_delay_seconds as f64, self.config.max_delay_seconds as f64);

        let jitter_span = clamped * self.config.jitter_fraction;
        let jitter = fastrand::f64() * 2.0 * jitter_span - jitter_span;
        let jittered = clamped + jitter;

        let floor = self.config.base_delay_seconds as f64 / 2.0;
        jittered.max(floor).round() as i64
    }
}
