//! Per-adapter circuit breaker (§4.1 Circuit breaker semantics).

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use shopper_proto::ErrorKind;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding for the `provider_circuit_breaker_state` gauge (§6.4).
    pub fn as_gauge_value(self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }
}

#[derive(Debug, Clone)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_state_change: DateTime<Utc>,
    consecutive_open_cycles: u32,
    /// `half_open` admits exactly one probe request; this guards it.
    half_open_probe_in_flight: bool,
}

pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub max_backoff: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            max_backoff: Duration::from_secs(120),
        }
    }
}

/// Gate in front of every adapter call. `closed` passes requests through;
/// `open` fails fast until `reset_timeout` elapses; `half_open` admits
/// exactly one probe.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: RwLock<Inner>,
    now: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Utc::now)
    }

    pub fn with_clock(config: CircuitBreakerConfig, now: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        let ts = now();
        Self {
            config,
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_state_change: ts,
                consecutive_open_cycles: 0,
                half_open_probe_in_flight: false,
            }),
            now: Box::new(now),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    /// Admit or reject a request. On `Open`, transitions to `HalfOpen` once
    /// `reset_timeout` has elapsed and admits that one probe; otherwise
    /// returns `Err` describing the remaining backoff.
    pub fn admit(&self) -> Result<(), Duration> {
        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                if inner.half_open_probe_in_flight {
                    Err(self.backoff_locked(&inner))
                } else {
                    inner.half_open_probe_in_flight = true;
                    Ok(())
                }
            }
            CircuitState::Open => {
                let elapsed = (self.now)() - inner.last_state_change;
                if elapsed.to_std().unwrap_or_default() >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.last_state_change = (self.now)();
                    inner.half_open_probe_in_flight = true;
                    Ok(())
                } else {
                    Err(self.backoff_locked(&inner))
                }
            }
        }
    }

    /// Record the outcome of an admitted request. `kind` is `None` for a
    /// success; cancellation (`ErrorKind::Cancelled`) must never reach
    /// here — callers should skip recording entirely for cancellations.
    pub fn record(&self, kind: Option<ErrorKind>) {
        let counts = kind.map(ErrorKind::counts_for_circuit_breaker).unwrap_or(false);
        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_probe_in_flight = false;
                if kind.is_none() {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_open_cycles = 0;
                    inner.last_state_change = (self.now)();
                } else if counts {
                    inner.state = CircuitState::Open;
                    inner.consecutive_open_cycles += 1;
                    inner.last_state_change = (self.now)();
                }
                // A non-counting failure (e.g. stale_inventory) on the probe
                // leaves the breaker half_open for the next caller.
            }
            CircuitState::Closed => {
                if kind.is_none() {
                    inner.consecutive_failures = 0;
                } else if counts {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        inner.state = CircuitState::Open;
                        inner.last_state_change = (self.now)();
                    }
                }
            }
            CircuitState::Open => {
                // Shouldn't normally record here since admit() rejected the
                // request, but stay defensive under races.
            }
        }
    }

    fn backoff_locked(&self, inner: &Inner) -> Duration {
        let cycles = inner.consecutive_open_cycles.max(1);
        let shift = cycles.saturating_sub(1).min(20);
        let base_secs = self.config.reset_timeout.as_secs_f64();
        let backoff_secs = base_secs * 2f64.powi(shift as i32);
        Duration::from_secs_f64(backoff_secs).min(self.config.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn breaker_with_clock(cfg: CircuitBreakerConfig) -> (CircuitBreaker, Arc<parking_lot::Mutex<DateTime<Utc>>>) {
        let clock = Arc::new(parking_lot::Mutex::new(Utc::now()));
        let clock_clone = clock.clone();
        let breaker = CircuitBreaker::with_clock(cfg, move || *clock_clone.lock());
        (breaker, clock)
    }

    #[test]
    fn test_opens_after_failure_threshold() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig { failure_threshold: 3, ..Default::default() });
        for _ in 0..2 {
            breaker.admit().unwrap();
            breaker.record(Some(ErrorKind::ServerError));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.admit().unwrap();
        breaker.record(Some(ErrorKind::ServerError));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.admit().is_err());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig { failure_threshold: 3, ..Default::default() });
        breaker.admit().unwrap();
        breaker.record(Some(ErrorKind::ServerError));
        breaker.admit().unwrap();
        breaker.record(None);
        breaker.admit().unwrap();
        breaker.record(Some(ErrorKind::ServerError));
        breaker.admit().unwrap();
        breaker.record(Some(ErrorKind::ServerError));
        // only 2 consecutive failures since the reset, threshold 3 not reached
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_non_counting_failure_does_not_open_circuit() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig { failure_threshold: 2, ..Default::default() });
        for _ in 0..5 {
            breaker.admit().unwrap();
            breaker.record(Some(ErrorKind::StaleInventory));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_then_close_on_success() {
        let (breaker, clock) = breaker_with_clock(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(10),
            max_backoff: Duration::from_secs(120),
        });
        breaker.admit().unwrap();
        breaker.record(Some(ErrorKind::ServerError));
        assert_eq!(breaker.state(), CircuitState::Open);

        *clock.lock() += chrono::Duration::seconds(11);
        breaker.admit().expect("half-open probe admitted");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // a second concurrent caller must not get another probe slot
        assert!(breaker.admit().is_err());

        breaker.record(None);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_failure_reopens_and_counts_cycle() {
        let (breaker, clock) = breaker_with_clock(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(10),
            max_backoff: Duration::from_secs(120),
        });
        breaker.admit().unwrap();
        breaker.record(Some(ErrorKind::ServerError));
        *clock.lock() += chrono::Duration::seconds(11);
        breaker.admit().unwrap();
        breaker.record(Some(ErrorKind::ServerError));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_backoff_is_capped() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(30),
            max_backoff: Duration::from_secs(120),
        });
        breaker.admit().unwrap();
        breaker.record(Some(ErrorKind::ServerError));
        for _ in 0..10 {
            let _ = breaker.admit();
            breaker.record(Some(ErrorKind::ServerError));
        }
        let err = breaker.admit().unwrap_err();
        assert!(err <= Duration::from_secs(120));
    }
}
