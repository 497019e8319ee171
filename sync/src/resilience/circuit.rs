//! Circuit breaker state machine.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    /// `trial_started` is `None` while no trial holds the slot
    HalfOpen { trial_started: Option<Instant> },
}

/// Consecutive-failure breaker with a single half-open trial.
///
/// The trial is a lease: if its caller disappears without a verdict (the
/// future was dropped), the slot frees up one cooldown after it was taken.
#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub(crate) fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            threshold: threshold.max(1),
            cooldown,
        }
    }

    pub(crate) fn status(&self) -> CircuitStatus {
        match self.state {
            CircuitState::Closed => CircuitStatus::Closed,
            CircuitState::Open { .. } => CircuitStatus::Open,
            CircuitState::HalfOpen { .. } => CircuitStatus::HalfOpen,
        }
    }

    /// Whether a call may proceed. After the cooldown the first caller gets
    /// the half-open trial; everyone else is rejected until it settles or
    /// its lease runs out.
    pub(crate) fn try_acquire(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() < self.cooldown {
                    return false;
                }
                tracing::debug!("Circuit breaker half-open, allowing trial call");
                self.start_trial();
                true
            }
            CircuitState::HalfOpen { trial_started: None } => {
                self.start_trial();
                true
            }
            CircuitState::HalfOpen {
                trial_started: Some(started),
            } => {
                if started.elapsed() < self.cooldown {
                    return false;
                }
                tracing::warn!("Half-open trial never reported back, allowing a new one");
                self.start_trial();
                true
            }
        }
    }

    fn start_trial(&mut self) {
        self.state = CircuitState::HalfOpen {
            trial_started: Some(Instant::now()),
        };
    }

    pub(crate) fn record_success(&mut self) {
        if let CircuitState::HalfOpen { .. } = self.state {
            tracing::info!("Circuit breaker closed after successful trial");
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
    }

    /// Returns true when this failure opened the breaker.
    pub(crate) fn record_failure(&mut self) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            CircuitState::Closed if self.consecutive_failures >= self.threshold => {
                tracing::warn!(
                    failures = self.consecutive_failures,
                    "Circuit breaker opening"
                );
                self.state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                true
            }
            CircuitState::HalfOpen { .. } => {
                tracing::warn!("Circuit breaker reopening after failed trial");
                self.state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                true
            }
            _ => false,
        }
    }

    /// Release a half-open trial that ended without a verdict.
    pub(crate) fn release_trial(&mut self) {
        if let CircuitState::HalfOpen { .. } = self.state {
            self.state = CircuitState::HalfOpen {
                trial_started: None,
            };
        }
    }
}
