//! Per-host request pacing. A map of last-request timestamps under a
//! short-held lock; the sleep itself happens outside the lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::trace;

use nieuws_core::{Clock, SystemClock};

pub struct HostRateLimiter {
    min_interval: Duration,
    last: Mutex<HashMap<String, chrono::DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
}

impl HostRateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self::with_clock(min_interval, Arc::new(SystemClock))
    }

    pub fn with_clock(min_interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            min_interval,
            last: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Compute the remaining wait for `host` and claim the slot. Clock
    /// jumps backwards produce a negative delta, which clamps to a full
    /// interval wait at most and never underflows.
    fn claim(&self, host: &str) -> Duration {
        let now = self.clock.now();
        let mut last = self.last.lock().unwrap();
        let wait = match last.get(host) {
            Some(prev) => {
                let elapsed = (now - *prev).to_std().unwrap_or(Duration::ZERO);
                self.min_interval.saturating_sub(elapsed)
            }
            None => Duration::ZERO,
        };
        // Claim the slot up front so concurrent callers queue behind us.
        let claimed_at = now
            + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero());
        last.insert(host.to_string(), claimed_at);
        wait
    }

    /// Block until the per-host minimum interval has passed. Callers
    /// wanting cancellation wrap this in `tokio::select!`.
    pub async fn wait(&self, host: &str) {
        let wait = self.claim(host);
        if !wait.is_zero() {
            trace!(host, wait_ms = wait.as_millis() as u64, "Rate limiter pacing");
            tokio::time::sleep(wait).await;
        }
    }

    /// Test hook: the delay the next call would incur, without claiming.
    pub fn peek_delay(&self, host: &str) -> Duration {
        let now = self.clock.now();
        let last = self.last.lock().unwrap();
        match last.get(host) {
            Some(prev) => {
                let elapsed = (now - *prev).to_std().unwrap_or(Duration::ZERO);
                self.min_interval.saturating_sub(elapsed)
            }
            None => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nieuws_core::clock::ManualClock;

    #[test]
    fn first_request_is_free() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = HostRateLimiter::with_clock(Duration::from_secs(2), clock);
        assert_eq!(limiter.claim("nu.nl"), Duration::ZERO);
    }

    #[test]
    fn second_request_waits_out_the_interval() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = HostRateLimiter::with_clock(Duration::from_secs(2), clock.clone());
        limiter.claim("nu.nl");
        clock.advance(chrono::Duration::milliseconds(500));
        let wait = limiter.claim("nu.nl");
        assert_eq!(wait, Duration::from_millis(1500));
    }

    #[test]
    fn hosts_are_independent() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = HostRateLimiter::with_clock(Duration::from_secs(2), clock);
        limiter.claim("nu.nl");
        assert_eq!(limiter.claim("nos.nl"), Duration::ZERO);
    }

    #[test]
    fn interval_elapsed_means_no_wait() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = HostRateLimiter::with_clock(Duration::from_secs(2), clock.clone());
        limiter.claim("nu.nl");
        clock.advance(chrono::Duration::seconds(3));
        assert_eq!(limiter.claim("nu.nl"), Duration::ZERO);
    }

    #[test]
    fn backwards_clock_jump_never_underflows() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = HostRateLimiter::with_clock(Duration::from_secs(2), clock.clone());
        limiter.claim("nu.nl");
        clock.advance(chrono::Duration::seconds(-30));
        let wait = limiter.peek_delay("nu.nl");
        assert!(wait <= Duration::from_secs(2));
    }
}
