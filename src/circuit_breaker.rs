//! Per-provider circuit breaker: a finite state machine that trips after repeated
//! failures and probes for recovery after a cooldown window.
//!
//! Grounded on `ciris_engine.logic.registries.circuit_breaker` (CIRISAgent): the state
//! machine, default thresholds, and metric names are ported one-to-one.
//!
//! ## Rust Learning Notes:
//!
//! ### Interior mutability
//! `CircuitBreaker` hands out shared references (`&self`) everywhere — every
//! provider in the registry holds the same `Arc<CircuitBreaker>` — yet
//! `record_success`/`record_failure` mutate counters. A `Mutex<Inner>` is how
//! Rust lets you mutate state behind a shared reference: the borrow checker
//! only sees one field (`inner`), and the actual read/write exclusivity is
//! enforced at runtime by the lock rather than at compile time by `&mut self`.
//!
//! ### Why a private `Inner` struct
//! Splitting the mutable counters into their own `Inner` type means the lock
//! only has to guard the fields that actually change. `name` and `config` stay
//! outside the `Mutex` on `CircuitBreaker` itself, so reading them never
//! contends with a call in flight.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Tunables for a single circuit breaker instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures, counted from CLOSED, that trip the breaker to OPEN.
    pub failure_threshold: u32,
    /// Seconds OPEN must hold before a call is allowed through as a HALF_OPEN probe.
    pub recovery_timeout_seconds: f64,
    /// Consecutive HALF_OPEN successes required before returning to CLOSED.
    pub success_threshold: u32,
    pub timeout_duration_seconds: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_seconds: 60.0,
            success_threshold: 3,
            timeout_duration_seconds: 30.0,
        }
    }
}

/// The three states a breaker can be in. CLOSED lets calls through and counts
/// failures; OPEN rejects calls outright; HALF_OPEN lets exactly one probe
/// kind of call through at a time to test whether the provider has recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used by `get_metrics` (`0/1/2`), matching the telemetry
    /// contract that downstream dashboards key on.
    fn as_metric(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum CircuitBreakerError {
    #[error("circuit breaker '{name}' is open (state={state:?})")]
    Open { name: String, state: CircuitState },
}

/// Point-in-time counters, returned by `get_stats`.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub state_transitions: u64,
    pub total_trips: u64,
    pub total_resets: u64,
    pub recovery_attempts: u64,
    pub time_in_open_state_seconds: f64,
}

/// Fixed-shape float metrics, matching `cb_<name>_*` telemetry keys.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub trips: f64,
    pub resets: f64,
    pub state: f64,
    pub failures: f64,
    pub success_rate: f64,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
    last_open_time: Option<Instant>,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    state_transitions: u64,
    total_trips: u64,
    total_resets: u64,
    recovery_attempts: u64,
    time_in_open_state: Duration,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            consecutive_failures: 0,
            last_failure_time: None,
            last_open_time: None,
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
            state_transitions: 0,
            total_trips: 0,
            total_resets: 0,
            recovery_attempts: 0,
            time_in_open_state: Duration::ZERO,
        }
    }
}

/// A single provider's resilience state. Cheap to construct; intended to live for the
/// lifetime of the provider registration that owns it.
pub struct CircuitBreaker {
    pub name: String,
    pub config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::new()),
        }
    }

    /// Returns whether a call may currently be attempted. Transitions OPEN -> HALF_OPEN
    /// as a side effect once the recovery timeout has elapsed.
    pub fn is_available(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed_since_failure = inner
                    .last_failure_time
                    .map(|t| t.elapsed().as_secs_f64())
                    .unwrap_or(f64::MAX);
                if elapsed_since_failure >= self.config.recovery_timeout_seconds {
                    if let Some(opened_at) = inner.last_open_time.take() {
                        inner.time_in_open_state += opened_at.elapsed();
                    }
                    inner.recovery_attempts += 1;
                    inner.state_transitions += 1;
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    info!(breaker = %self.name, "circuit breaker entering half-open for recovery probe");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Fails fast with a typed error if the breaker is not currently available.
    pub fn check_and_raise(&self) -> Result<(), CircuitBreakerError> {
        if self.is_available() {
            Ok(())
        } else {
            let state = self.inner.lock().unwrap().state;
            Err(CircuitBreakerError::Open {
                name: self.name.clone(),
                state,
            })
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_calls += 1;
        inner.total_successes += 1;
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.total_resets += 1;
                    inner.state_transitions += 1;
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.consecutive_failures = 0;
                    info!(breaker = %self.name, "circuit breaker closed after recovery");
                }
            }
            CircuitState::Open => {
                // A success landing while nominally open (e.g. a racing probe) is
                // treated the same as a half-open success.
                inner.success_count += 1;
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_calls += 1;
        inner.total_failures += 1;
        inner.consecutive_failures += 1;
        inner.last_failure_time = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.total_trips += 1;
                    inner.state_transitions += 1;
                    inner.state = CircuitState::Open;
                    inner.last_open_time = Some(Instant::now());
                    warn!(breaker = %self.name, failures = inner.failure_count, "circuit breaker tripped open");
                }
            }
            CircuitState::HalfOpen => {
                inner.total_trips += 1;
                inner.state_transitions += 1;
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                inner.last_open_time = Some(Instant::now());
                warn!(breaker = %self.name, "probe failed, circuit breaker reopened");
            }
            CircuitState::Open => {}
        }
    }

    /// Manual reset back to CLOSED, clearing all transient counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(opened_at) = inner.last_open_time.take() {
            inner.time_in_open_state += opened_at.elapsed();
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.consecutive_failures = 0;
        inner.total_resets += 1;
        inner.state_transitions += 1;
    }

    pub fn get_stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock().unwrap();
        let extra_open_time = match (inner.state, inner.last_open_time) {
            (CircuitState::Open, Some(opened_at)) => opened_at.elapsed(),
            _ => Duration::ZERO,
        };
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            consecutive_failures: inner.consecutive_failures,
            total_calls: inner.total_calls,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            state_transitions: inner.state_transitions,
            total_trips: inner.total_trips,
            total_resets: inner.total_resets,
            recovery_attempts: inner.recovery_attempts,
            time_in_open_state_seconds: (inner.time_in_open_state + extra_open_time).as_secs_f64(),
        }
    }

    pub fn get_metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock().unwrap();
        let success_rate = if inner.total_calls == 0 {
            1.0
        } else {
            inner.total_successes as f64 / inner.total_calls as f64
        };
        CircuitBreakerMetrics {
            trips: inner.total_trips as f64,
            resets: inner.total_resets as f64,
            state: inner.state.as_metric(),
            failures: inner.total_failures as f64,
            success_rate,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cb_with(threshold: u32, recovery_secs: f64, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout_seconds: recovery_secs,
                success_threshold,
                timeout_duration_seconds: 30.0,
            },
        )
    }

    #[test]
    fn opens_after_exactly_failure_threshold_consecutive_failures() {
        let cb = cb_with(3, 60.0, 3);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_available());
    }

    #[test]
    fn stays_closed_and_resets_failure_count_on_interleaved_success() {
        let cb = cb_with(3, 60.0, 3);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        // Only 2 consecutive since the success reset failure_count, so still closed.
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_requires_exactly_success_threshold_to_close() {
        let cb = cb_with(1, 0.0, 2);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.is_available()); // recovery_timeout_seconds = 0.0, immediately eligible
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn any_failure_in_half_open_reopens() {
        let cb = cb_with(1, 0.0, 3);
        cb.record_failure();
        assert!(cb.is_available());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn total_calls_equals_successes_plus_failures() {
        let cb = cb_with(100, 60.0, 3);
        cb.record_success();
        cb.record_failure();
        cb.record_success();
        let stats = cb.get_stats();
        assert_eq!(stats.total_calls, stats.total_successes + stats.total_failures);
    }

    #[test]
    fn success_rate_is_bounded_zero_one() {
        let cb = cb_with(100, 60.0, 3);
        for _ in 0..5 {
            cb.record_success();
        }
        for _ in 0..3 {
            cb.record_failure();
        }
        let metrics = cb.get_metrics();
        assert!(metrics.success_rate >= 0.0 && metrics.success_rate <= 1.0);
        assert!((metrics.success_rate - 5.0 / 8.0).abs() < 1e-9);
    }

    #[test]
    fn check_and_raise_fails_fast_when_open() {
        let cb = cb_with(1, 60.0, 3);
        cb.record_failure();
        assert!(cb.check_and_raise().is_err());
    }

    #[test]
    fn open_stays_unavailable_until_recovery_timeout_elapses() {
        let cb = cb_with(1, 0.05, 1);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_available(), "must not recover before recovery_timeout_seconds has elapsed");
        std::thread::sleep(std::time::Duration::from_millis(80));
        assert!(cb.is_available());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn manual_reset_returns_to_closed() {
        let cb = cb_with(1, 60.0, 3);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_available());
    }
}
