use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

use crate::errors::CallError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive composite failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit rejects before admitting one probe.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown: Duration::from_secs(60) }
    }
}

/// Admission ticket for one guarded call. Hand it back through
/// [`CircuitBreaker::record`] with the call's outcome; a dropped permit
/// would leave a half-open circuit waiting on its probe.
#[derive(Debug)]
pub struct CallPermit {
    probe: bool,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Consecutive-failure circuit breaker guarding one named dependency.
///
/// One retried call counts as one sample here; the breaker sits outside
/// the retry schedule. State is the only thing shared across runs.
pub struct CircuitBreaker {
    dependency: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(dependency: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            dependency: dependency.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Admits or rejects a call. An open circuit rejects instantly until
    /// its cooldown elapses, then admits exactly one probe; concurrent
    /// callers keep getting rejected while that probe is in flight.
    pub fn try_acquire(&self) -> Result<CallPermit, CallError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(CallPermit { probe: false }),
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|opened_at| opened_at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled_down {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probe_in_flight = true;
                    Ok(CallPermit { probe: true })
                } else {
                    Err(CallError::CircuitOpen { dependency: self.dependency.clone() })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(CallError::CircuitOpen { dependency: self.dependency.clone() })
                } else {
                    inner.probe_in_flight = true;
                    Ok(CallPermit { probe: true })
                }
            }
        }
    }

    /// Reports the composite outcome of an admitted call.
    pub fn record(&self, permit: CallPermit, success: bool) {
        let mut inner = self.lock();
        if permit.probe {
            inner.probe_in_flight = false;
        }

        if success {
            inner.consecutive_failures = 0;
            inner.opened_at = None;
            if inner.state != CircuitState::Closed {
                self.transition(&mut inner, CircuitState::Closed);
            }
            return;
        }

        if permit.probe {
            // A failed probe restarts the cooldown from now.
            inner.opened_at = Some(Instant::now());
            self.transition(&mut inner, CircuitState::Open);
            return;
        }

        inner.consecutive_failures += 1;
        if inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            inner.opened_at = Some(Instant::now());
            self.transition(&mut inner, CircuitState::Open);
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        info!(
            event_name = "resilience.breaker.transition",
            dependency = %self.dependency,
            from = from.as_str(),
            to = to.as_str(),
            consecutive_failures = inner.consecutive_failures,
            "circuit breaker changed state"
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
