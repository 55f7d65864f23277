//! Per-endpoint circuit breaker for the client library.
//!
//! Implements the standard three-state pattern:
//! - **Closed**: normal operation, requests pass through
//! - **Open**: consecutive failures reached the threshold, requests
//!   fail fast without touching the IPC socket
//! - **Half-Open**: the cooldown elapsed, a single probe is allowed
//!
//! A success in any state closes the circuit and zeroes the failure
//! count; a failure in half-open reopens it immediately.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::types::{CircuitBreakerConfig, CircuitState};

/// Outcome of asking the breaker whether a request may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Circuit is closed, proceed normally.
    Allow,
    /// Circuit transitioned to half-open; this request is the probe.
    AllowProbe,
    /// Circuit is open; fail fast. Carries the time left in the window.
    Reject { retry_in: Duration },
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    /// Set while a half-open probe is in flight so concurrent callers
    /// do not all probe at once.
    probe_in_flight: bool,
}

/// Circuit breaker guarding one endpoint.
///
/// All methods are synchronous and cheap; the breaker is kept in a
/// concurrent map keyed by endpoint and shared across client calls.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    name: String,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker named for its endpoint (used in log fields).
    pub fn new(config: CircuitBreakerConfig, name: impl Into<String>) -> Self {
        Self {
            config,
            name: name.into(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Decide whether a request to this endpoint may proceed.
    ///
    /// Transitions Open → HalfOpen once the cooldown window has
    /// elapsed; the caller receiving [`BreakerDecision::AllowProbe`]
    /// carries the probe.
    pub fn check(&self) -> BreakerDecision {
        let cooldown = Duration::from_secs(self.config.cooldown_seconds);
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => BreakerDecision::Allow,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(cooldown);
                if elapsed >= cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(endpoint = %self.name, "Circuit breaker half-open, probing");
                    BreakerDecision::AllowProbe
                } else {
                    BreakerDecision::Reject {
                        retry_in: cooldown - elapsed,
                    }
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    // One probe at a time; everyone else still fails fast.
                    BreakerDecision::Reject { retry_in: cooldown }
                } else {
                    inner.probe_in_flight = true;
                    BreakerDecision::AllowProbe
                }
            }
        }
    }

    /// Give back an unused half-open probe slot.
    ///
    /// For callers that were granted [`BreakerDecision::AllowProbe`]
    /// but never reached the wire (e.g. the request was served from a
    /// cache); without this the slot would stay taken forever.
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Record a successful request: closed, failure count zeroed.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        let was = inner.state;
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.last_failure = None;
        inner.probe_in_flight = false;
        if was != CircuitState::Closed {
            info!(endpoint = %self.name, "Circuit breaker closed");
        }
    }

    /// Record a failed request.
    ///
    /// In closed state the failure count grows until the threshold
    /// opens the circuit; in half-open a failed probe reopens it.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.probe_in_flight = false;
        match inner.state {
            CircuitState::Closed if inner.failures >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                warn!(
                    endpoint = %self.name,
                    failures = inner.failures,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                warn!(endpoint = %self.name, "Circuit breaker reopened after failed probe");
            }
            _ => {}
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Consecutive failure count.
    pub fn failures(&self) -> u32 {
        self.inner.lock().expect("breaker lock poisoned").failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown_seconds: 1,
        }
    }

    #[test]
    fn starts_closed() {
        let cb = CircuitBreaker::new(test_config(), "t:1");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.check(), BreakerDecision::Allow);
    }

    #[test]
    fn opens_after_threshold() {
        let cb = CircuitBreaker::new(test_config(), "t:1");
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.check(), BreakerDecision::Reject { .. }));
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = CircuitBreaker::new(test_config(), "t:1");
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failures(), 0);
        assert_eq!(cb.check(), BreakerDecision::Allow);
    }

    #[test]
    fn half_open_probe_then_close() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig {
                failure_threshold: 1,
                cooldown_seconds: 0,
            },
            "t:1",
        );
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // Zero cooldown: next check is the half-open probe.
        assert_eq!(cb.check(), BreakerDecision::AllowProbe);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Concurrent caller while the probe is in flight still fails fast.
        assert!(matches!(cb.check(), BreakerDecision::Reject { .. }));

        // An abandoned probe slot can be handed back and retaken.
        cb.release_probe();
        assert_eq!(cb.check(), BreakerDecision::AllowProbe);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.check(), BreakerDecision::Allow);
    }

    #[test]
    fn failed_probe_reopens() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig {
                failure_threshold: 1,
                cooldown_seconds: 0,
            },
            "t:1",
        );
        cb.record_failure();
        assert_eq!(cb.check(), BreakerDecision::AllowProbe);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
