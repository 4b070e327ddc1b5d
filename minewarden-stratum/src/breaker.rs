//! Per-endpoint circuit breaker.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerConfig;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing fast until the cooldown elapses
    Open { until: Instant },
    /// Cooldown elapsed; one trial connection allowed
    HalfOpen,
}

/// Serializable view of [`CircuitState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Consecutive-failure breaker guarding one endpoint
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    trial_in_flight: bool,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            trial_in_flight: false,
            failure_threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown(),
        }
    }

    /// Current state, moving Open to HalfOpen once the cooldown has elapsed
    pub fn state(&mut self, now: Instant) -> CircuitState {
        if let CircuitState::Open { until } = self.state {
            if now >= until {
                info!("Circuit breaker half-open");
                self.state = CircuitState::HalfOpen;
                self.trial_in_flight = false;
            }
        }
        self.state
    }

    pub fn status(&self) -> BreakerStatus {
        match self.state {
            CircuitState::Closed => BreakerStatus::Closed,
            CircuitState::Open { .. } => BreakerStatus::Open,
            CircuitState::HalfOpen => BreakerStatus::HalfOpen,
        }
    }

    /// Whether a connection attempt may start now
    pub fn allows(&mut self, now: Instant) -> bool {
        match self.state(now) {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !self.trial_in_flight,
            CircuitState::Open { .. } => false,
        }
    }

    /// Note that a connection attempt started
    pub fn on_attempt(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.trial_in_flight = true;
        }
    }

    /// A trial ended without a verdict (closed on request)
    pub fn release_trial(&mut self) {
        self.trial_in_flight = false;
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            info!("Circuit breaker closed");
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.trial_in_flight = false;
    }

    /// Count a failure. Returns true if this opened the breaker.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.trial_in_flight = false;

        let trip = match self.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.consecutive_failures >= self.failure_threshold,
            CircuitState::Open { .. } => false,
        };

        if trip {
            warn!(
                failures = self.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Circuit breaker opened"
            );
            self.state = CircuitState::Open {
                until: now + self.cooldown,
            };
        }
        trip
    }

    /// Open immediately regardless of the failure count
    pub fn force_open(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.trial_in_flight = false;
        self.state = CircuitState::Open {
            until: now + self.cooldown,
        };
        warn!(cooldown_secs = self.cooldown.as_secs(), "Circuit breaker forced open");
    }

    /// When an open breaker becomes eligible again
    pub fn reopens_at(&self) -> Option<Instant> {
        match self.state {
            CircuitState::Open { until } => Some(until),
            _ => None,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(&BreakerConfig {
            failure_threshold: 5,
            cooldown_secs: 60,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let mut breaker = breaker();
        let now = Instant::now();

        for _ in 0..4 {
            assert!(!breaker.record_failure(now));
            assert!(breaker.allows(now));
        }
        assert!(breaker.record_failure(now));
        assert_eq!(breaker.status(), BreakerStatus::Open);
        assert!(!breaker.allows(now + Duration::from_secs(59)));
        assert_eq!(breaker.reopens_at(), Some(now + Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_single_trial() {
        let mut breaker = breaker();
        let now = Instant::now();
        breaker.force_open(now);

        let later = now + Duration::from_secs(60);
        assert!(breaker.allows(later));
        assert_eq!(breaker.status(), BreakerStatus::HalfOpen);

        breaker.on_attempt();
        assert!(!breaker.allows(later));

        // Trial failure reopens without reaching the threshold again
        assert!(breaker.record_failure(later));
        assert!(!breaker.allows(later + Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets() {
        let mut breaker = breaker();
        let now = Instant::now();
        breaker.record_failure(now);
        breaker.record_failure(now);
        breaker.record_success();

        assert_eq!(breaker.consecutive_failures(), 0);
        for _ in 0..4 {
            breaker.record_failure(now);
        }
        assert_eq!(breaker.status(), BreakerStatus::Closed);
    }
}
