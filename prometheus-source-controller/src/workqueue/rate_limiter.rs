use crate::key::ObjectKey;

use std::{collections::HashMap, time::Duration};
use tokio::time::Instant;

/// Decides how long a failed key has to wait before it is retried.
pub trait RateLimiter: Send {
    /// Delay for the next retry of `key`, recording the attempt.
    fn when(&mut self, key: &ObjectKey) -> Duration;
    /// Reset all retry state of `key`, e.g. after successful processing.
    fn forget(&mut self, key: &ObjectKey);
    /// Number of consecutive failures recorded for `key`.
    fn num_requeues(&self, key: &ObjectKey) -> u32;
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone)]
pub struct ItemExponentialRateLimiter {
    base: Duration,
    max: Duration,
    failures: HashMap<ObjectKey, u32>,
}

impl ItemExponentialRateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Default::default(),
        }
    }
}

impl RateLimiter for ItemExponentialRateLimiter {
    fn when(&mut self, key: &ObjectKey) -> Duration {
        let failures = self.failures.entry(key.clone()).or_insert(0);
        let exp = *failures;
        *failures = failures.saturating_add(1);
        if exp >= 64 {
            return self.max;
        }
        let backoff = self.base.as_nanos().saturating_mul(1u128 << exp);
        if backoff >= self.max.as_nanos() {
            self.max
        } else {
            Duration::from_nanos(backoff.min(u64::MAX as u128) as u64)
        }
    }

    fn forget(&mut self, key: &ObjectKey) {
        self.failures.remove(key);
    }

    fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

/// Overall token bucket shared by all keys, limiting the retry rate to `qps`
/// with bursts of up to `burst` retries.
#[derive(Debug, Clone)]
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            qps,
            burst,
            tokens: burst,
            last: Instant::now(),
        }
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&mut self, _key: &ObjectKey) -> Duration {
        if self.qps <= 0.0 {
            return Duration::ZERO;
        }
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst) - 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((-self.tokens / self.qps * 1e9).round() as u64)
        }
    }

    fn forget(&mut self, _key: &ObjectKey) {}

    fn num_requeues(&self, _key: &ObjectKey) -> u32 {
        0
    }
}

/// The default controller rate limiter: the larger delay of the per-key
/// exponential backoff and the overall token bucket.
#[derive(Debug, Clone)]
pub struct DefaultRateLimiter {
    item: ItemExponentialRateLimiter,
    bucket: BucketRateLimiter,
}

impl DefaultRateLimiter {
    pub fn new(item: ItemExponentialRateLimiter, bucket: BucketRateLimiter) -> Self {
        Self { item, bucket }
    }
}

impl Default for DefaultRateLimiter {
    fn default() -> Self {
        Self::new(
            ItemExponentialRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1000)),
            BucketRateLimiter::new(10.0, 100),
        )
    }
}

impl RateLimiter for DefaultRateLimiter {
    fn when(&mut self, key: &ObjectKey) -> Duration {
        self.item.when(key).max(self.bucket.when(key))
    }

    fn forget(&mut self, key: &ObjectKey) {
        self.item.forget(key);
        self.bucket.forget(key);
    }

    fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.item.num_requeues(key)
    }
}
