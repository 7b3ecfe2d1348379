//! Circuit Breaker (C): three-state per-provider supervisory state.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_label(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    /// True while a half-open probe call is outstanding, to cap in-flight
    /// probes at one.
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    open_duration: Duration,
    inner: Mutex<Inner>,
}

/// What the caller is allowed to do right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    AllowedAsProbe,
    Rejected,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            failure_threshold,
            open_duration,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                open_until: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Call before attempting a provider. Transitions open -> half-open when
    /// the open window has elapsed.
    pub fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let elapsed = inner.open_until.map(|u| Instant::now() >= u).unwrap_or(false);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!(from = "open", to = "half_open", "breaker transition");
                    Admission::AllowedAsProbe
                } else {
                    Admission::Rejected
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Rejected
                } else {
                    inner.probe_in_flight = true;
                    Admission::AllowedAsProbe
                }
            }
        }
    }

    pub fn record_success(&self, provider_id: &str) {
        let mut inner = self.inner.lock();
        let from = inner.state;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        inner.state = BreakerState::Closed;
        inner.open_until = None;
        if from != BreakerState::Closed {
            tracing::info!(from = from.as_label(), to = "closed", "breaker transition");
        }
        crate::metrics::set_breaker_state(provider_id, inner.state);
    }

    /// Record a failure that counts against the breaker (timeouts, 5xx,
    /// parse errors, and 429s that are the chain's last attempt). 4xx
    /// non-429 failures must never reach this method.
    pub fn record_failure(&self, provider_id: &str) {
        let mut inner = self.inner.lock();
        let from = inner.state;
        inner.probe_in_flight = false;
        match from {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.open_until = Some(Instant::now() + self.open_duration);
                    tracing::info!(from = "closed", to = "open", "breaker transition");
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.open_until = Some(Instant::now() + self.open_duration);
                tracing::info!(from = "half_open", to = "open", "breaker transition");
            }
            BreakerState::Open => {
                // Already open; refresh the window defensively.
                inner.open_until = Some(Instant::now() + self.open_duration);
            }
        }
        crate::metrics::set_breaker_state(provider_id, inner.state);
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }
}

/// Registry of breakers keyed by provider id, mirroring `RateLimiterRegistry`.
pub struct BreakerRegistry {
    breakers: HashMap<String, CircuitBreaker>,
}

impl BreakerRegistry {
    pub fn new(
        provider_ids: impl IntoIterator<Item = String>,
        failure_threshold: u32,
        open_duration: Duration,
    ) -> Self {
        let breakers = provider_ids
            .into_iter()
            .map(|id| (id, CircuitBreaker::new(failure_threshold, open_duration)))
            .collect();
        Self { breakers }
    }

    pub fn get(&self, provider_id: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(provider_id)
    }
}
