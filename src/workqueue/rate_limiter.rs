use super::QueueKey;
use crate::rate::{Limit, Limiter};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Decides how long an item has to wait before it is retried
pub trait QueueRateLimiter<T>: Send + Sync {
    /// Delay before `item` should be processed again. Counts as a failure.
    fn when(&self, item: &T) -> Duration;
    /// Stop tracking `item`, typically after it was processed successfully
    fn forget(&self, item: &T);
    /// Number of failures recorded for `item`
    fn num_requeues(&self, item: &T) -> u32;
}

/// Overall rate limit shared by every item, backed by a token bucket
pub struct BucketRateLimiter {
    limiter: Limiter,
}

impl BucketRateLimiter {
    pub fn new(limit: Limit, burst: u32) -> Self {
        Self {
            limiter: Limiter::new(limit, burst),
        }
    }
}

impl<T> QueueRateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        self.limiter.reserve().delay()
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`
pub struct ItemExponentialFailureRateLimiter<T> {
    failures: Mutex<HashMap<T, u32>>,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T: QueueKey> ItemExponentialFailureRateLimiter<T> {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            base_delay,
            max_delay,
        }
    }
}

impl<T: QueueKey> QueueRateLimiter<T> for ItemExponentialFailureRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        let exponent = {
            let mut failures = self.failures.lock();
            let count = failures.entry(item.clone()).or_insert(0);
            let exponent = *count;
            *count = count.saturating_add(1);
            exponent
        };

        // Computed in floating point so large exponents saturate instead of overflowing
        let backoff = self.base_delay.as_nanos() as f64 * 2f64.powi(exponent.min(i32::MAX as u32) as i32);
        if backoff >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(backoff as u64)
    }

    fn forget(&self, item: &T) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }
}

/// Combines several limiters; the longest delay wins
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn QueueRateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn QueueRateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> QueueRateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        // Every limiter must see the failure, so no short-circuiting
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Per-item backoff from 5ms up to 1000s combined with an overall 10 qps / 100 burst bucket
pub fn default_controller_rate_limiter<T: QueueKey>() -> MaxOfRateLimiter<T> {
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Box::new(BucketRateLimiter::new(Limit::per_second(10.0), 100)),
    ])
}
