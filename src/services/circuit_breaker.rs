//! Circuit breaker gating new remediation attempts.
//!
//! CLOSED counts consecutive failures; at the threshold the circuit
//! opens and new attempts are refused. After the timeout a single
//! HALF_OPEN probe is allowed: success closes the circuit, failure
//! reopens it and restarts the timeout.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    timeout: Duration,
    failure_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    state: CircuitState,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, timeout_seconds: u64) -> Self {
        Self {
            failure_threshold,
            timeout: Duration::seconds(timeout_seconds as i64),
            failure_count: 0,
            last_failure_time: None,
            state: CircuitState::Closed,
        }
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            info!("circuit breaker closed after successful probe");
        }
        self.failure_count = 0;
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure_time = Some(Utc::now());

        match self.state {
            CircuitState::HalfOpen => {
                warn!("circuit breaker probe failed, reopening");
                self.state = CircuitState::Open;
            }
            CircuitState::Closed if self.failure_count >= self.failure_threshold => {
                warn!(
                    failures = self.failure_count,
                    "circuit breaker open"
                );
                self.state = CircuitState::Open;
            }
            _ => {}
        }
    }

    /// Whether a new attempt may run. Transitions OPEN to HALF_OPEN
    /// once the timeout has elapsed.
    pub fn can_attempt(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if let Some(last) = self.last_failure_time {
                    if Utc::now() - last > self.timeout {
                        info!("circuit breaker half-open, allowing probe");
                        self.state = CircuitState::HalfOpen;
                        return true;
                    }
                }
                false
            }
            // One probe at a time; the probe's outcome resolves the state.
            CircuitState::HalfOpen => true,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn status(&self) -> CircuitStatus {
        CircuitStatus {
            state: self.state,
            failure_count: self.failure_count,
            last_failure_time: self.last_failure_time,
        }
    }
}
