//! Per-source circuit breaker: closed → open at a consecutive-failure
//! threshold, cooldown doubling per successive open, half-open admits a
//! single probe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use nieuws_core::{Clock, Error, SystemClock};

const DEFAULT_THRESHOLD: u32 = 5;
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);
const MAX_COOLDOWN: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed {
        consecutive_failures: u32,
    },
    Open {
        since: DateTime<Utc>,
        cooldown: Duration,
        /// How often the breaker has opened without an intervening
        /// success; drives the cooldown doubling.
        open_count: u32,
    },
    HalfOpen {
        open_count: u32,
        cooldown: Duration,
        probe_admitted: bool,
    },
}

pub struct CircuitBreaker {
    source: String,
    threshold: u32,
    base_cooldown: Duration,
    max_cooldown: Duration,
    state: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(source: &str) -> Self {
        Self::with_clock(source, Arc::new(SystemClock))
    }

    pub fn with_clock(source: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            source: source.to_string(),
            threshold: DEFAULT_THRESHOLD,
            base_cooldown: DEFAULT_COOLDOWN,
            max_cooldown: MAX_COOLDOWN,
            state: Mutex::new(Inner::Closed { consecutive_failures: 0 }),
            clock,
        }
    }

    /// Admit or short-circuit a call. Open breakers whose cooldown has
    /// elapsed move to half-open and admit exactly one probe.
    pub fn check(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            Inner::Closed { .. } => Ok(()),
            Inner::Open { since, cooldown, open_count } => {
                let elapsed =
                    (self.clock.now() - *since).to_std().unwrap_or(Duration::ZERO);
                if elapsed >= *cooldown {
                    info!(source = %self.source, "Circuit half-open — admitting probe");
                    *state = Inner::HalfOpen {
                        open_count: *open_count,
                        cooldown: *cooldown,
                        probe_admitted: true,
                    };
                    Ok(())
                } else {
                    Err(Error::CircuitOpen(self.source.clone()))
                }
            }
            Inner::HalfOpen { probe_admitted, .. } => {
                if *probe_admitted {
                    // One probe at a time.
                    Err(Error::CircuitOpen(self.source.clone()))
                } else {
                    *probe_admitted = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        match &*state {
            Inner::Closed { consecutive_failures } if *consecutive_failures == 0 => {}
            Inner::Closed { .. } => {
                *state = Inner::Closed { consecutive_failures: 0 };
            }
            Inner::HalfOpen { .. } | Inner::Open { .. } => {
                info!(source = %self.source, "Circuit closed after successful probe");
                *state = Inner::Closed { consecutive_failures: 0 };
            }
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            Inner::Closed { consecutive_failures } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.threshold {
                    warn!(
                        source = %self.source,
                        failures = *consecutive_failures,
                        cooldown_secs = self.base_cooldown.as_secs(),
                        "Circuit opened"
                    );
                    *state = Inner::Open {
                        since: self.clock.now(),
                        cooldown: self.base_cooldown,
                        open_count: 1,
                    };
                }
            }
            Inner::HalfOpen { open_count, cooldown, .. } => {
                let next_cooldown = (*cooldown * 2).min(self.max_cooldown);
                warn!(
                    source = %self.source,
                    cooldown_secs = next_cooldown.as_secs(),
                    "Probe failed — circuit re-opened"
                );
                *state = Inner::Open {
                    since: self.clock.now(),
                    cooldown: next_cooldown,
                    open_count: *open_count + 1,
                };
            }
            Inner::Open { .. } => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        match &*self.state.lock().unwrap() {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }
}

/// One breaker per source, created on first use.
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    clock: Arc<dyn Clock>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn breaker(&self, source: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(source.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_clock(source, self.clock.clone()))
            })
            .clone()
    }

    /// State per source, for health reporting.
    pub fn snapshot(&self) -> HashMap<String, BreakerState> {
        let breakers = self.breakers.lock().unwrap();
        breakers.iter().map(|(k, v)| (k.clone(), v.state())).collect()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nieuws_core::clock::ManualClock;

    fn breaker_with_clock() -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (CircuitBreaker::with_clock("nu.nl", clock.clone()), clock)
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let (breaker, _clock) = breaker_with_clock();
        for _ in 0..DEFAULT_THRESHOLD {
            assert!(breaker.check().is_ok());
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(breaker.check(), Err(Error::CircuitOpen(_))));
    }

    #[test]
    fn success_resets_the_failure_count() {
        let (breaker, _clock) = breaker_with_clock();
        for _ in 0..DEFAULT_THRESHOLD - 1 {
            breaker.record_failure();
        }
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn short_circuits_within_cooldown_without_invoking() {
        let (breaker, clock) = breaker_with_clock();
        for _ in 0..DEFAULT_THRESHOLD {
            breaker.record_failure();
        }
        clock.advance(chrono::Duration::seconds(30));
        assert!(matches!(breaker.check(), Err(Error::CircuitOpen(_))));
    }

    #[test]
    fn admits_single_probe_after_cooldown() {
        let (breaker, clock) = breaker_with_clock();
        for _ in 0..DEFAULT_THRESHOLD {
            breaker.record_failure();
        }
        clock.advance(chrono::Duration::seconds(61));
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // A second caller is rejected while the probe is in flight.
        assert!(breaker.check().is_err());
    }

    #[test]
    fn probe_success_closes() {
        let (breaker, clock) = breaker_with_clock();
        for _ in 0..DEFAULT_THRESHOLD {
            breaker.record_failure();
        }
        clock.advance(chrono::Duration::seconds(61));
        breaker.check().unwrap();
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn probe_failure_doubles_cooldown() {
        let (breaker, clock) = breaker_with_clock();
        for _ in 0..DEFAULT_THRESHOLD {
            breaker.record_failure();
        }
        // First cooldown: 60s.
        clock.advance(chrono::Duration::seconds(61));
        breaker.check().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        // Second cooldown doubled to 120s: 61s is not enough...
        clock.advance(chrono::Duration::seconds(61));
        assert!(breaker.check().is_err());
        // ...but 120s total is.
        clock.advance(chrono::Duration::seconds(60));
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn cooldown_caps_at_ten_minutes() {
        let (breaker, clock) = breaker_with_clock();
        for _ in 0..DEFAULT_THRESHOLD {
            breaker.record_failure();
        }
        // Fail enough probes to push the doubling past the cap.
        let mut wait = 60i64;
        for _ in 0..6 {
            clock.advance(chrono::Duration::seconds(wait + 1));
            breaker.check().unwrap();
            breaker.record_failure();
            wait = (wait * 2).min(600);
        }
        // Cooldown is now capped: 10 minutes plus a second suffices.
        clock.advance(chrono::Duration::seconds(601));
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn registry_hands_out_one_breaker_per_source() {
        let registry = BreakerRegistry::new();
        let a = registry.breaker("nu.nl");
        let b = registry.breaker("nu.nl");
        assert!(Arc::ptr_eq(&a, &b));
        a.record_failure();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.get("nu.nl"), Some(&BreakerState::Closed));
    }
}
