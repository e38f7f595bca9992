use super::{QueueKey, WorkQueue};
use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Heap entry ordered by `ready_at` only
struct WaitEntry<T> {
    item: T,
    ready_at: Instant,
    seq: u64,
}

impl<T> PartialEq for WaitEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<T> Eq for WaitEntry<T> {}

impl<T> PartialOrd for WaitEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for WaitEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ready_at
            .cmp(&other.ready_at)
            .then(self.seq.cmp(&other.seq))
    }
}

struct WaitingSet<T> {
    heap: BinaryHeap<Reverse<WaitEntry<T>>>,
    /// Earliest ready time per item. Heap entries that disagree with this map are stale.
    ready_at: HashMap<T, Instant>,
    next_seq: u64,
}

impl<T: QueueKey> WaitingSet<T> {
    /// Insert or move `item` earlier. Returns true if it became the head of the heap.
    fn insert(&mut self, item: T, ready_at: Instant) -> bool {
        if let Some(existing) = self.ready_at.get(&item) {
            if *existing <= ready_at {
                return false;
            }
        }

        let becomes_head = self
            .heap
            .peek()
            .map_or(true, |Reverse(head)| ready_at < head.ready_at);

        self.ready_at.insert(item.clone(), ready_at);
        self.next_seq += 1;
        self.heap.push(Reverse(WaitEntry {
            item,
            ready_at,
            seq: self.next_seq,
        }));
        becomes_head
    }

    /// Remove every entry due at `now`, returning the live ones
    fn pop_ready(&mut self, now: Instant) -> Vec<T> {
        let mut ready = Vec::new();
        while let Some(Reverse(head)) = self.heap.peek() {
            if head.ready_at > now {
                break;
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            if self.ready_at.get(&entry.item) == Some(&entry.ready_at) {
                self.ready_at.remove(&entry.item);
                ready.push(entry.item);
            }
        }
        ready
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(head)| head.ready_at)
    }

    fn clear(&mut self) {
        self.heap.clear();
        self.ready_at.clear();
    }
}

struct Shared<T> {
    queue: WorkQueue<T>,
    waiting: Mutex<WaitingSet<T>>,
    /// Signalled when a new head is inserted so the waiting loop resets its timer
    wake: Notify,
    stopped: CancellationToken,
}

/// A [`WorkQueue`] that can also add items after a delay.
///
/// A single background task sleeps until the earliest pending entry is due
/// and promotes it to the queue. Several pending delays for the same item
/// collapse to the earliest one. Must be created inside a tokio runtime.
pub struct DelayingQueue<T: QueueKey> {
    shared: Arc<Shared<T>>,
}

impl<T: QueueKey> DelayingQueue<T> {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            queue: WorkQueue::new(),
            waiting: Mutex::new(WaitingSet {
                heap: BinaryHeap::new(),
                ready_at: HashMap::new(),
                next_seq: 0,
            }),
            wake: Notify::new(),
            stopped: CancellationToken::new(),
        });

        tokio::spawn(waiting_loop(Arc::clone(&shared)));

        Self { shared }
    }

    /// Add `item` once `delay` has passed. A zero delay adds it immediately;
    /// a delay too long to schedule means the item is never added.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.shared.queue.shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.shared.queue.add(item);
            return;
        }

        let Some(ready_at) = Instant::now().checked_add(delay) else {
            warn!(item = ?item, delay_secs = delay.as_secs(), "Delay out of range, dropping item");
            return;
        };
        let new_head = self.shared.waiting.lock().insert(item, ready_at);
        if new_head {
            self.shared.wake.notify_one();
        }
    }

    pub fn add(&self, item: T) {
        self.shared.queue.add(item);
    }

    pub async fn get(&self) -> Option<T> {
        self.shared.queue.get().await
    }

    pub async fn get_cancellable(&self, cancel: &CancellationToken) -> Option<T> {
        self.shared.queue.get_cancellable(cancel).await
    }

    pub fn done(&self, item: &T) {
        self.shared.queue.done(item);
    }

    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    /// Number of items still waiting for their delay to expire
    pub fn waiting_len(&self) -> usize {
        self.shared.waiting.lock().ready_at.len()
    }

    /// Stop the waiting loop, drop delayed entries and shut down the queue
    pub fn shut_down(&self) {
        self.shared.stopped.cancel();
        self.shared.waiting.lock().clear();
        self.shared.queue.shut_down();
    }

    pub fn shutting_down(&self) -> bool {
        self.shared.queue.shutting_down()
    }
}

impl<T: QueueKey> Default for DelayingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: QueueKey> Drop for DelayingQueue<T> {
    fn drop(&mut self) {
        self.shared.stopped.cancel();
    }
}

async fn waiting_loop<T: QueueKey>(shared: Arc<Shared<T>>) {
    loop {
        let (ready, next) = {
            let mut waiting = shared.waiting.lock();
            let ready = waiting.pop_ready(Instant::now());
            (ready, waiting.next_ready_at())
        };

        for item in ready {
            trace!(item = ?item, "Promoting delayed item");
            shared.queue.add(item);
        }

        let sleep = async {
            match next {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = shared.stopped.cancelled() => break,
            _ = shared.wake.notified() => {}
            _ = sleep => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_promotes_when_due() {
        let queue = DelayingQueue::new();
        queue.add_after("a", ms(50));
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.waiting_len(), 1);

        tokio::time::sleep(ms(40)).await;
        assert_eq!(queue.len(), 0);

        tokio::time::sleep(ms(20)).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.waiting_len(), 0);
        assert_eq!(queue.get().await, Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_adds_inline() {
        let queue = DelayingQueue::new();
        queue.add_after("a", Duration::ZERO);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.waiting_len(), 0);

        // Same dedup behaviour as a plain add
        queue.add("a");
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_entry_interrupts_wait() {
        let queue = DelayingQueue::new();
        queue.add_after("slow", Duration::from_secs(10));

        // Let the loop go to sleep on the 10s deadline first
        tokio::time::sleep(ms(1)).await;
        queue.add_after("fast", ms(10));

        tokio::time::sleep(ms(20)).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("fast"));
        assert_eq!(queue.waiting_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_delays_collapse_to_earliest() {
        let queue = DelayingQueue::new();
        queue.add_after("a", Duration::from_secs(1));
        queue.add_after("a", ms(10));
        queue.add_after("a", Duration::from_secs(5));
        assert_eq!(queue.waiting_len(), 1);

        tokio::time::sleep(ms(20)).await;
        let item = queue.get().await.unwrap();
        queue.done(&item);

        // The superseded 1s and 5s entries must not fire again
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_items_promoted_in_ready_order() {
        let queue = DelayingQueue::new();
        queue.add_after(3, ms(30));
        queue.add_after(1, ms(10));
        queue.add_after(2, ms(20));

        tokio::time::sleep(ms(50)).await;
        assert_eq!(queue.get().await, Some(1));
        assert_eq!(queue.get().await, Some(2));
        assert_eq!(queue.get().await, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_discards_delayed_entries() {
        let queue = DelayingQueue::new();
        queue.add_after("a", ms(10));
        queue.add("b");
        queue.shut_down();

        assert_eq!(queue.waiting_len(), 0);
        tokio::time::sleep(ms(20)).await;

        assert_eq!(queue.get().await, Some("b"));
        assert_eq!(queue.get().await, None);

        queue.add_after("c", ms(1));
        assert_eq!(queue.waiting_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_wakes_on_promotion() {
        let queue = Arc::new(DelayingQueue::new());
        let getter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };

        queue.add_after("x", ms(100));
        let item = getter.await.unwrap();
        assert_eq!(item, Some("x"));
    }
}
