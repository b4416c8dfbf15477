//! Rate Limit Governor - Translate remote API quota into safe work
//!
//! Each scheduling cycle probes the remote quota and converts what is left
//! above a safety reserve into a number of repositories that may be processed.
//! [`TokenBucket`] paces individual requests inside the client.

use crate::config::HostConfig;
use crate::error::Error;
use crate::host::ContentHost;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Remote quota snapshot and the cost model applied to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    pub remaining: u32,
    /// Calls kept in reserve for interactive use
    pub threshold: u32,
    /// Calls an average repository refresh consumes
    pub cost_per_repository: u32,
}

impl RateBudget {
    pub fn capacity(&self) -> u32 {
        compute(self.remaining, self.threshold, self.cost_per_repository)
    }
}

/// `floor((remaining - threshold) / cost_per_repository)`, clamped at zero.
pub fn compute(remaining: u32, threshold: u32, cost_per_repository: u32) -> u32 {
    if cost_per_repository == 0 {
        return 0;
    }
    remaining.saturating_sub(threshold) / cost_per_repository
}

/// Probes the host and reports how many repositories this cycle may touch
#[derive(Debug, Clone)]
pub struct Governor {
    threshold: u32,
    cost_per_repository: u32,
}

impl Governor {
    pub fn new(threshold: u32, cost_per_repository: u32) -> Self {
        Self {
            threshold,
            cost_per_repository,
        }
    }

    pub fn from_config(config: &HostConfig) -> Self {
        Self::new(config.api_threshold, config.cost_per_repository)
    }

    /// Safe operation count for this cycle.
    ///
    /// `None` means the probe itself failed (bad credentials, network), which
    /// callers handle differently from an exhausted quota (`Some(0)`).
    pub async fn capacity(&self, host: &dyn ContentHost) -> Option<u32> {
        match host.rate_limit().await {
            Ok(status) => {
                let budget = RateBudget {
                    remaining: status.remaining,
                    threshold: self.threshold,
                    cost_per_repository: self.cost_per_repository,
                };
                let capacity = budget.capacity();
                if capacity == 0 {
                    match status.reset {
                        Some(reset) => warn!(
                            "API quota exhausted ({} of {} left), resets at {}",
                            status.remaining, status.limit, reset
                        ),
                        None => warn!(
                            "API quota exhausted ({} of {} left)",
                            status.remaining, status.limit
                        ),
                    }
                } else {
                    debug!(
                        "API quota allows {} repositories ({} calls remaining)",
                        capacity, status.remaining
                    );
                }
                Some(capacity)
            }
            Err(Error::RateLimited { reset }) => {
                warn!("Rate limit probe was itself rate limited (reset: {:?})", reset);
                Some(0)
            }
            Err(e) => {
                warn!("Rate limit probe failed: {}", e);
                None
            }
        }
    }
}

/// Token bucket limiter with an injectable clock.
///
/// `try_acquire_at` is pure with respect to time so pacing can be tested
/// without sleeping; `acquire` waits on the tokio clock.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket holding `capacity` tokens, refilled continuously.
    pub fn new(capacity: u32, refill_per_second: f64) -> Self {
        Self::starting_at(capacity, refill_per_second, Instant::now())
    }

    pub fn starting_at(capacity: u32, refill_per_second: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_second: refill_per_second.max(f64::MIN_POSITIVE),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now.max(self.last_refill);
    }

    /// Take one token at `now`, or report how long until one is available.
    pub fn try_acquire_at(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_per_second))
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&mut self) {
        loop {
            match self.try_acquire_at(Instant::now()) {
                Ok(()) => return,
                Err(wait) => {
                    debug!("Request pacing: waiting {:?}", wait);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    pub fn available(&self) -> u32 {
        self.tokens.floor() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MockContentHost, RateStatus};

    #[test]
    fn test_compute() {
        assert_eq!(compute(2000, 1000, 15), 66);
        assert_eq!(compute(1000, 1000, 15), 0);
        assert_eq!(compute(500, 1000, 15), 0);
        assert_eq!(compute(1010, 1000, 10), 1);
        assert_eq!(compute(5000, 1000, 0), 0);
    }

    #[test]
    fn test_budget_capacity() {
        let budget = RateBudget {
            remaining: 5000,
            threshold: 1000,
            cost_per_repository: 10,
        };
        assert_eq!(budget.capacity(), 400);
    }

    #[tokio::test]
    async fn test_capacity_from_probe() {
        let mut host = MockContentHost::new();
        host.expect_rate_limit().returning(|| {
            Ok(RateStatus {
                remaining: 2000,
                limit: 5000,
                reset: None,
            })
        });

        let governor = Governor::new(1000, 15);
        assert_eq!(governor.capacity(&host).await, Some(66));
    }

    #[tokio::test]
    async fn test_probe_failure_is_none() {
        let mut host = MockContentHost::new();
        host.expect_rate_limit()
            .returning(|| Err(Error::Authentication("Bad credentials".to_string())));

        let governor = Governor::new(1000, 10);
        assert_eq!(governor.capacity(&host).await, None);
    }

    #[tokio::test]
    async fn test_rate_limited_probe_is_zero() {
        let mut host = MockContentHost::new();
        host.expect_rate_limit()
            .returning(|| Err(Error::RateLimited { reset: None }));

        let governor = Governor::new(1000, 10);
        assert_eq!(governor.capacity(&host).await, Some(0));
    }

    #[test]
    fn test_bucket_drains_and_refills_without_sleeping() {
        let start = Instant::now();
        let mut bucket = TokenBucket::starting_at(2, 1.0, start);

        assert!(bucket.try_acquire_at(start).is_ok());
        assert!(bucket.try_acquire_at(start).is_ok());

        let wait = bucket.try_acquire_at(start).unwrap_err();
        assert_eq!(wait, Duration::from_secs(1));

        let later = start + Duration::from_millis(500);
        let wait = bucket.try_acquire_at(later).unwrap_err();
        assert_eq!(wait, Duration::from_millis(500));

        assert!(bucket.try_acquire_at(start + Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_bucket_never_exceeds_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::starting_at(3, 10.0, start);
        bucket.try_acquire_at(start + Duration::from_secs(60)).unwrap();
        assert_eq!(bucket.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_on_tokio_clock() {
        let mut bucket = TokenBucket::new(1, 2.0);
        let start = Instant::now();

        bucket.acquire().await;
        bucket.acquire().await;

        assert!(Instant::now() - start >= Duration::from_millis(500));
    }
}
