//! Circuit breaker state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Healthy; requests pass through.
    Closed,
    /// Tripped; requests are rejected without I/O.
    Open,
    /// Cooldown elapsed; a single probe is allowed through.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        };
        write!(f, "{s}")
    }
}

/// Decision returned by [`CircuitBreaker::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed; proceed normally.
    Allow,
    /// The caller owns the single half-open probe and must report its outcome.
    Probe,
    /// Breaker open, or a probe is already in flight.
    Reject,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open { since: Instant },
    HalfOpen { probe_in_flight: bool },
}

/// Per-department failure isolation.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    phase: Phase,
    consecutive_failures: u32,
    threshold: u32,
    cooldown: Duration,
    last_failure: Option<DateTime<Utc>>,
}

/// Serializable view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            phase: Phase::Closed,
            consecutive_failures: 0,
            threshold: threshold.max(1),
            cooldown,
            last_failure: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.phase {
            Phase::Closed => BreakerState::Closed,
            Phase::Open { .. } => BreakerState::Open,
            Phase::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.phase, Phase::Open { .. })
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Decide whether a connection attempt may proceed at `now`.
    ///
    /// An open breaker whose cooldown has elapsed moves to half-open and hands
    /// out exactly one probe.
    pub fn admit(&mut self, now: Instant) -> Admission {
        match self.phase {
            Phase::Closed => Admission::Allow,
            Phase::Open { since } => {
                if now.saturating_duration_since(since) >= self.cooldown {
                    self.phase = Phase::HalfOpen {
                        probe_in_flight: true,
                    };
                    Admission::Probe
                } else {
                    Admission::Reject
                }
            }
            Phase::HalfOpen {
                probe_in_flight: true,
            } => Admission::Reject,
            Phase::HalfOpen {
                probe_in_flight: false,
            } => {
                self.phase = Phase::HalfOpen {
                    probe_in_flight: true,
                };
                Admission::Probe
            }
        }
    }

    /// Give the probe slot back without an outcome (the probe was cancelled).
    pub fn release_probe(&mut self) {
        if let Phase::HalfOpen { .. } = self.phase {
            self.phase = Phase::HalfOpen {
                probe_in_flight: false,
            };
        }
    }

    /// Record a successful use. Returns `true` if this closed a half-open breaker.
    pub fn record_success(&mut self) -> bool {
        let recovered = matches!(self.phase, Phase::HalfOpen { .. });
        self.phase = Phase::Closed;
        self.consecutive_failures = 0;
        recovered
    }

    /// Record a failure at `now`. Returns `true` if the breaker tripped open.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(Utc::now());

        match self.phase {
            Phase::Closed if self.consecutive_failures >= self.threshold => {
                self.phase = Phase::Open { since: now };
                true
            }
            Phase::Closed => false,
            Phase::HalfOpen { .. } => {
                self.phase = Phase::Open { since: now };
                true
            }
            Phase::Open { .. } => {
                // Restart the cooldown clock.
                self.phase = Phase::Open { since: now };
                false
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state(),
            consecutive_failures: self.consecutive_failures,
            last_failure: self.last_failure,
        }
    }
}
