use super::{DelayingQueue, QueueKey, QueueRateLimiter};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A [`DelayingQueue`] whose retries are spaced out by a [`QueueRateLimiter`]
pub struct RateLimitingQueue<T: QueueKey> {
    queue: DelayingQueue<T>,
    rate_limiter: Box<dyn QueueRateLimiter<T>>,
}

impl<T: QueueKey> RateLimitingQueue<T> {
    pub fn new(rate_limiter: Box<dyn QueueRateLimiter<T>>) -> Self {
        Self {
            queue: DelayingQueue::new(),
            rate_limiter,
        }
    }

    /// Add `item` after the delay the rate limiter assigns to it
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.rate_limiter.when(&item);
        self.queue.add_after(item, delay);
    }

    /// Clear the failure history of `item`. Does not remove it from the queue.
    pub fn forget(&self, item: &T) {
        self.rate_limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.rate_limiter.num_requeues(item)
    }

    pub fn add(&self, item: T) {
        self.queue.add(item);
    }

    pub fn add_after(&self, item: T, delay: Duration) {
        self.queue.add_after(item, delay);
    }

    pub async fn get(&self) -> Option<T> {
        self.queue.get().await
    }

    pub async fn get_cancellable(&self, cancel: &CancellationToken) -> Option<T> {
        self.queue.get_cancellable(cancel).await
    }

    pub fn done(&self, item: &T) {
        self.queue.done(item);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn waiting_len(&self) -> usize {
        self.queue.waiting_len()
    }

    pub fn shut_down(&self) {
        self.queue.shut_down();
    }

    pub fn shutting_down(&self) -> bool {
        self.queue.shutting_down()
    }
}
