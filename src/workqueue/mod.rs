//! Work queues used to schedule reconciliation
//!
//! Three layers, each wrapping the previous one:
//! - [`WorkQueue`]: deduplicating FIFO with in-flight tracking,
//! - [`DelayingQueue`]: adds items after a delay,
//! - [`RateLimitingQueue`]: delays items according to a [`QueueRateLimiter`].

mod delaying;
mod queue;
mod rate_limiter;
mod rate_limiting;

pub use delaying::DelayingQueue;
pub use queue::WorkQueue;
pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, QueueRateLimiter,
};
pub use rate_limiting::RateLimitingQueue;

use std::fmt::Debug;
use std::hash::Hash;

/// Anything usable as a work queue key. Keys are compared by value.
pub trait QueueKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> QueueKey for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}
