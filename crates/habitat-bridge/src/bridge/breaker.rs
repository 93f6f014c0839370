//! Per-protocol circuit breaker.
//!
//! The `open → half_open` transition is evaluated lazily in
//! [`CircuitBreaker::allow_request`]; nothing runs in the background.

use std::time::Duration;

use habitat_core::{CircuitBreakerConfig, Protocol};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow.
    Closed,
    /// Requests are rejected until the recovery timeout has passed.
    Open,
    /// Probing whether the protocol has recovered.
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    protocol: Protocol,
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_successes: u32,
    failure_threshold: u32,
    half_open_requests: u32,
    recovery_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(protocol: Protocol, config: &CircuitBreakerConfig) -> Self {
        Self {
            protocol,
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            half_open_successes: 0,
            failure_threshold: config.failure_threshold.max(1),
            half_open_requests: config.half_open_requests.max(1),
            recovery_timeout: config.recovery_timeout(),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Whether a call may go through at `now`.
    pub fn allow_request(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let recovered = self
                    .last_failure
                    .map_or(true, |at| now.saturating_duration_since(at) > self.recovery_timeout);
                if recovered {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_successes = 0;
                    debug!(protocol = %self.protocol, "Circuit breaker half-open (recovery timeout elapsed)");
                }
                recovered
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.half_open_requests {
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.half_open_successes = 0;
                    info!(protocol = %self.protocol, "Circuit breaker closed (recovered)");
                }
            }
            CircuitState::Closed => self.failure_count = 0,
            // A call admitted before the breaker opened.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.failure_count += 1;
        self.last_failure = Some(now);

        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.half_open_successes = 0;
                warn!(protocol = %self.protocol, "Circuit breaker open (failed while half-open)");
            }
            CircuitState::Closed if self.failure_count >= self.failure_threshold => {
                self.state = CircuitState::Open;
                warn!(
                    protocol = %self.protocol,
                    failures = self.failure_count,
                    threshold = self.failure_threshold,
                    "Circuit breaker open (threshold reached)"
                );
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, half_open: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            Protocol::custom("mock"),
            &CircuitBreakerConfig {
                enabled: true,
                failure_threshold: threshold,
                recovery_timeout_ms: recovery_ms,
                half_open_requests: half_open,
            },
        )
    }

    #[test]
    fn test_opens_at_threshold() {
        let mut cb = breaker(3, 1, 1000);
        let now = Instant::now();
        cb.record_failure(now);
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request(now + Duration::from_millis(1000)));
    }

    #[test]
    fn test_success_resets_failures_while_closed() {
        let mut cb = breaker(2, 1, 1000);
        let now = Instant::now();
        cb.record_failure(now);
        cb.record_success();
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 1);
    }

    #[test]
    fn test_half_open_after_recovery_timeout() {
        let mut cb = breaker(1, 2, 1000);
        let start = Instant::now();
        cb.record_failure(start);

        assert!(cb.allow_request(start + Duration::from_millis(1001)));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let mut cb = breaker(1, 2, 1000);
        let start = Instant::now();
        cb.record_failure(start);
        let later = start + Duration::from_millis(1500);
        assert!(cb.allow_request(later));

        cb.record_failure(later);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request(later + Duration::from_millis(500)));
    }

    #[test]
    fn test_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(CircuitState::HalfOpen).unwrap(),
            serde_json::json!("half_open")
        );
    }
}
