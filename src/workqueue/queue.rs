use super::QueueKey;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct QueueState<T> {
    /// Pending keys in processing order; never contains a key that is in `processing`
    queue: VecDeque<T>,
    /// Keys that need processing, including ones re-added while in flight
    dirty: HashSet<T>,
    /// Keys handed out by `get` and not yet `done`
    processing: HashSet<T>,
    shutting_down: bool,
}

/// Deduplicating FIFO queue with in-flight tracking.
///
/// - Adding a key that is already pending is a no-op.
/// - A key is never handed to two workers at once: adding a key while it is
///   being processed marks it dirty, and it is queued again (at the end) once
///   [`done`](WorkQueue::done) is called.
/// - After [`shut_down`](WorkQueue::shut_down) new adds are ignored and
///   [`get`](WorkQueue::get) drains what is left before returning `None`.
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T: QueueKey> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: QueueKey> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Mark `item` as needing processing
    pub fn add(&self, item: T) {
        {
            let mut state = self.state.lock();
            if state.shutting_down || state.dirty.contains(&item) {
                return;
            }
            state.dirty.insert(item.clone());
            if state.processing.contains(&item) {
                return;
            }
            state.queue.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Number of pending keys, not counting keys being processed
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the next key. Returns `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting the state so a concurrent add or
            // shutdown cannot slip between the check and the await
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.processing.insert(item.clone());
                    state.dirty.remove(&item);
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Like [`get`](WorkQueue::get), but returns `None` when `cancel` fires
    pub async fn get_cancellable(&self, cancel: &CancellationToken) -> Option<T> {
        tokio::select! {
            item = self.get() => item,
            _ = cancel.cancelled() => None,
        }
    }

    /// Mark `item` as finished. If it was added again while in flight it is
    /// queued at the end.
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(item);
            if state.dirty.contains(item) {
                state.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop accepting new keys and wake every waiter
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Number of keys handed out and not yet `done`
    pub fn processing_len(&self) -> usize {
        self.state.lock().processing.len()
    }
}
