//! Circuit breaker guarding the sink.
//!
//! ```text
//!   Closed{n} --failure, n+1 == threshold--> Open
//!   Open --cooldown elapsed, try_acquire--> HalfOpen (single trial)
//!   HalfOpen --success--> Closed{0}
//!   HalfOpen --failure--> Open (cooldown restarts)
//! ```
//! Any success resets the breaker to `Closed{0}`.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls go through, `failures` consecutive failures so far.
    Closed { failures: usize },
    /// Calls are rejected until the cooldown has elapsed.
    Open { opened_at: Instant },
    /// One trial call is in flight.
    HalfOpen { since: Instant },
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The first call after the cooldown, its outcome decides whether the breaker closes.
    Trial,
}

/// Rejection while the breaker is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Open {
    /// Time until a trial call will be admitted.
    pub retry_in: Duration,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: usize,
    cooldown: Duration,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            threshold: config.threshold.max(1),
            cooldown: config.cooldown,
            state: Mutex::new(CircuitState::Closed { failures: 0 }),
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.lock()
    }

    /// Asks whether a call may go to the sink now.
    pub fn try_acquire(&self) -> Result<Admission, Open> {
        let mut state = self.state.lock();
        let now = Instant::now();
        match *state {
            CircuitState::Closed { .. } => Ok(Admission::Normal),
            CircuitState::Open { opened_at } => {
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.cooldown {
                    info!("Circuit breaker cooldown elapsed, admitting a trial call");
                    *state = CircuitState::HalfOpen { since: now };
                    Ok(Admission::Trial)
                } else {
                    Err(Open {
                        retry_in: self.cooldown - elapsed,
                    })
                }
            }
            // a trial that never reported back must not wedge the breaker
            CircuitState::HalfOpen { since }
                if now.saturating_duration_since(since) >= self.cooldown =>
            {
                *state = CircuitState::HalfOpen { since: now };
                Ok(Admission::Trial)
            }
            CircuitState::HalfOpen { since } => Err(Open {
                retry_in: self.cooldown - now.saturating_duration_since(since),
            }),
        }
    }

    pub fn on_success(&self) {
        let mut state = self.state.lock();
        if !matches!(*state, CircuitState::Closed { failures: 0 }) {
            info!("Circuit breaker closed");
        }
        *state = CircuitState::Closed { failures: 0 };
    }

    pub fn on_failure(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        *state = match *state {
            CircuitState::Closed { failures } if failures + 1 >= self.threshold => {
                warn!(
                    failures = failures + 1,
                    cooldown = ?self.cooldown,
                    "Circuit breaker opened"
                );
                CircuitState::Open { opened_at: now }
            }
            CircuitState::Closed { failures } => CircuitState::Closed {
                failures: failures + 1,
            },
            CircuitState::HalfOpen { .. } | CircuitState::Open { .. } => {
                warn!(cooldown = ?self.cooldown, "Circuit breaker trial failed, re-opened");
                CircuitState::Open { opened_at: now }
            }
        };
    }
}
