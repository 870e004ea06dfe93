//! Circuit breaker around repeated Store failures (SPEC_FULL C.3), shaped
//! after the teacher's `CircuitBreakerBehavior` trait: an object-safe
//! interface plus a concrete atomic-counter implementation, rather than an
//! ad hoc retry counter inlined into the Coordinator.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Closed,
            1 => Self::Open,
            _ => Self::HalfOpen,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

/// Unified interface so a Coordinator can hold `Arc<dyn CircuitBreakerBehavior>`
/// without committing to a concrete breaker implementation.
pub trait CircuitBreakerBehavior: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn state(&self) -> CircuitState;
    /// Gate the next call: `false` means skip this cycle.
    fn should_allow(&self) -> bool;
    fn record_success(&self);
    fn record_failure(&self);
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Protects repeated `Store::load_task` calls from hammering a degraded
/// Store every Coordinator invocation (spec §7: "StoreFailure aborts the
/// batch and re-enqueues with backoff").
#[derive(Debug)]
pub struct StoreCircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    opened_at_unix_ms: AtomicU64,
}

impl StoreCircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: AtomicU8::new(CircuitState::Closed.as_u8()),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            opened_at_unix_ms: AtomicU64::new(0),
        }
    }

    fn transition_to(&self, state: CircuitState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn elapsed_since_open(&self, now_unix_ms: u64) -> Duration {
        let opened = self.opened_at_unix_ms.load(Ordering::SeqCst);
        Duration::from_millis(now_unix_ms.saturating_sub(opened))
    }

    /// Like [`CircuitBreakerBehavior::should_allow`] but takes the current
    /// instant explicitly (in ms since epoch) so tests don't depend on wall
    /// clock reads inside this module.
    pub fn should_allow_at(&self, now_unix_ms: u64) -> bool {
        match CircuitState::from_u8(self.state.load(Ordering::SeqCst)) {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.elapsed_since_open(now_unix_ms) >= self.config.recovery_timeout {
                    self.transition_to(CircuitState::HalfOpen);
                    self.success_count.store(0, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success_at(&self, _now_unix_ms: u64) {
        match CircuitState::from_u8(self.state.load(Ordering::SeqCst)) {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    self.transition_to(CircuitState::Closed);
                    self.failure_count.store(0, Ordering::SeqCst);
                    self.success_count.store(0, Ordering::SeqCst);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure_at(&self, now_unix_ms: u64) {
        match CircuitState::from_u8(self.state.load(Ordering::SeqCst)) {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.opened_at_unix_ms.store(now_unix_ms, Ordering::SeqCst);
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.opened_at_unix_ms.store(now_unix_ms, Ordering::SeqCst);
                self.transition_to(CircuitState::Open);
                self.success_count.store(0, Ordering::SeqCst);
            }
            CircuitState::Open => {}
        }
    }
}

impl CircuitBreakerBehavior for StoreCircuitBreaker {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn should_allow(&self) -> bool {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.should_allow_at(now)
    }

    fn record_success(&self) {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.record_success_at(now);
    }

    fn record_failure(&self) {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.record_failure_at(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_object_safe(_: &dyn CircuitBreakerBehavior) {}

    #[test]
    fn compiles_as_trait_object() {
        let breaker = StoreCircuitBreaker::new("store", CircuitBreakerConfig::default());
        assert_object_safe(&breaker);
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = StoreCircuitBreaker::new(
            "store",
            CircuitBreakerConfig { failure_threshold: 3, ..Default::default() },
        );
        for _ in 0..2 {
            breaker.record_failure_at(0);
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        breaker.record_failure_at(0);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.should_allow_at(0));
    }

    #[test]
    fn half_opens_after_recovery_timeout_then_closes_on_successes() {
        let breaker = StoreCircuitBreaker::new(
            "store",
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_millis(100),
                success_threshold: 2,
            },
        );
        breaker.record_failure_at(0);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.should_allow_at(50));

        assert!(breaker.should_allow_at(200));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success_at(200);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success_at(200);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn failure_in_half_open_reopens_the_circuit() {
        let breaker = StoreCircuitBreaker::new(
            "store",
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_millis(10),
                success_threshold: 2,
            },
        );
        breaker.record_failure_at(0);
        breaker.should_allow_at(20);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_failure_at(20);
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
