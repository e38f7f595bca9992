use super::message::Message;
use crate::error::TargetError;
use crate::snapshot::ConfigSnapshot;
use hyper::body::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A subscriber that receives encoded configuration messages.
///
/// `send` must never block. The replay on attach runs with the dispatcher
/// lock held.
pub trait DispatchTarget: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn send(&self, message: Bytes) -> Result<(), TargetError>;

    /// Fired when the target is detached
    fn cancellation(&self) -> &CancellationToken;
}

/// Target backed by a bounded channel
pub struct ChannelTarget {
    id: String,
    sender: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl DispatchTarget for ChannelTarget {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, message: Bytes) -> Result<(), TargetError> {
        if self.cancel.is_cancelled() {
            return Err(TargetError::Closed);
        }
        self.sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TargetError::Full,
            mpsc::error::TrySendError::Closed(_) => TargetError::Closed,
        })
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Receiving half of a [`ChannelTarget`]
pub struct TargetReceiver {
    id: String,
    receiver: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
}

impl TargetReceiver {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next message, or `None` once the target has been detached
    pub async fn recv(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            message = self.receiver.recv() => message,
        }
    }
}

/// Create a target that buffers at most `buffer` undelivered messages
pub fn channel(buffer: usize) -> (Arc<ChannelTarget>, TargetReceiver) {
    let id = uuid::Uuid::new_v4().to_string();
    let (sender, receiver) = mpsc::channel(buffer.max(1));
    let cancel = CancellationToken::new();
    (
        Arc::new(ChannelTarget {
            id: id.clone(),
            sender,
            cancel: cancel.clone(),
        }),
        TargetReceiver {
            id,
            receiver,
            cancel,
        },
    )
}

#[derive(Default)]
struct DispatcherState {
    targets: Arc<Vec<Arc<dyn DispatchTarget>>>,
    last_message: Option<Bytes>,
}

/// Fans configuration messages out to every attached target
#[derive(Default)]
pub struct Dispatcher {
    state: Mutex<DispatcherState>,
    // Serializes fan-outs so every target sees messages in send order
    delivery: Mutex<()>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a target. It immediately receives the last message sent, if any.
    pub fn attach(&self, target: Arc<dyn DispatchTarget>) {
        let mut state = self.state.lock();

        if let Some(last) = &state.last_message {
            if let Err(e) = target.send(last.clone()) {
                warn!(target_id = target.id(), error = %e, "Failed to replay last message, not attaching");
                target.cancellation().cancel();
                return;
            }
        }

        let mut targets = Vec::with_capacity(state.targets.len() + 1);
        targets.extend(state.targets.iter().cloned());
        targets.push(Arc::clone(&target));
        state.targets = Arc::new(targets);

        debug!(target_id = target.id(), targets = state.targets.len(), "Dispatch target attached");
    }

    /// Detach a target by id. Returns false if it was not attached.
    pub fn detach(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(target) = state.targets.iter().find(|t| t.id() == id).cloned() else {
            return false;
        };

        state.targets = Arc::new(
            state
                .targets
                .iter()
                .filter(|t| t.id() != id)
                .cloned()
                .collect(),
        );
        target.cancellation().cancel();

        debug!(target_id = id, targets = state.targets.len(), "Dispatch target detached");
        true
    }

    /// Record `message` as the latest and deliver it to every target.
    /// Targets that cannot take it are detached; they resync on reattach.
    pub fn send(&self, message: Bytes) {
        let _delivery = self.delivery.lock();
        let targets = {
            let mut state = self.state.lock();
            state.last_message = Some(message.clone());
            Arc::clone(&state.targets)
        };

        let mut failed = Vec::new();
        for target in targets.iter() {
            if let Err(e) = target.send(message.clone()) {
                warn!(target_id = target.id(), error = %e, "Dropping dispatch target");
                target.cancellation().cancel();
                failed.push(target.id().to_string());
            }
        }

        if !failed.is_empty() {
            let mut state = self.state.lock();
            state.targets = Arc::new(
                state
                    .targets
                    .iter()
                    .filter(|t| !failed.iter().any(|id| id == t.id()))
                    .cloned()
                    .collect(),
            );
        }
    }

    /// Encode `snapshot` as an update message and send it
    pub fn send_snapshot(&self, key: &str, snapshot: &ConfigSnapshot) -> Result<(), serde_json::Error> {
        let line = Message::update(key, snapshot).to_line()?;
        info!(
            key,
            routes = snapshot.routes.len(),
            clusters = snapshot.clusters.len(),
            targets = self.target_count(),
            "Dispatching configuration"
        );
        self.send(line);
        Ok(())
    }

    /// Detach every target, ending their streams
    pub fn detach_all(&self) {
        let mut state = self.state.lock();
        for target in state.targets.iter() {
            target.cancellation().cancel();
        }
        state.targets = Arc::new(Vec::new());
    }

    pub fn target_count(&self) -> usize {
        self.state.lock().targets.len()
    }

    pub fn last_message(&self) -> Option<Bytes> {
        self.state.lock().last_message.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[tokio::test]
    async fn test_send_reaches_every_target() {
        let dispatcher = Dispatcher::new();
        let (a, mut rx_a) = channel(4);
        let (b, mut rx_b) = channel(4);
        dispatcher.attach(a);
        dispatcher.attach(b);

        dispatcher.send(bytes("one"));
        assert_eq!(rx_a.recv().await, Some(bytes("one")));
        assert_eq!(rx_b.recv().await, Some(bytes("one")));
        assert_eq!(dispatcher.target_count(), 2);
    }

    #[tokio::test]
    async fn test_late_target_receives_last_message() {
        let dispatcher = Dispatcher::new();
        dispatcher.send(bytes("old"));
        dispatcher.send(bytes("latest"));

        let (late, mut rx) = channel(4);
        dispatcher.attach(late);
        assert_eq!(rx.recv().await, Some(bytes("latest")));

        dispatcher.send(bytes("next"));
        assert_eq!(rx.recv().await, Some(bytes("next")));
    }

    #[test]
    fn test_no_replay_before_first_send() {
        let dispatcher = Dispatcher::new();
        let (target, mut rx) = channel(4);
        dispatcher.attach(target);
        assert!(rx.receiver.try_recv().is_err());
        assert!(dispatcher.last_message().is_none());
    }

    #[tokio::test]
    async fn test_detach_cancels_target() {
        let dispatcher = Dispatcher::new();
        let (target, mut rx) = channel(4);
        let id = target.id().to_string();
        dispatcher.attach(target);

        assert!(dispatcher.detach(&id));
        assert!(!dispatcher.detach(&id));
        assert_eq!(dispatcher.target_count(), 0);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_slow_target_dropped() {
        let dispatcher = Dispatcher::new();
        let (slow, mut slow_rx) = channel(1);
        let (fast, mut fast_rx) = channel(4);
        dispatcher.attach(slow);
        dispatcher.attach(fast);

        dispatcher.send(bytes("1"));
        dispatcher.send(bytes("2"));

        assert_eq!(dispatcher.target_count(), 1);
        assert_eq!(slow_rx.recv().await, None);
        assert_eq!(fast_rx.recv().await, Some(bytes("1")));
        assert_eq!(fast_rx.recv().await, Some(bytes("2")));
    }

    /// Target that looks at the dispatcher while it is being delivered to
    struct InspectingTarget {
        dispatcher: Arc<Dispatcher>,
        seen: Mutex<Vec<usize>>,
        cancel: CancellationToken,
    }

    impl DispatchTarget for InspectingTarget {
        fn id(&self) -> &str {
            "inspecting"
        }

        fn send(&self, _message: Bytes) -> Result<(), TargetError> {
            self.seen.lock().push(self.dispatcher.target_count());
            Err(TargetError::Full)
        }

        fn cancellation(&self) -> &CancellationToken {
            &self.cancel
        }
    }

    #[test]
    fn test_fan_out_does_not_hold_state_lock() {
        let dispatcher = Arc::new(Dispatcher::new());
        let target = Arc::new(InspectingTarget {
            dispatcher: Arc::clone(&dispatcher),
            seen: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        });
        let (other, _rx) = channel(4);
        dispatcher.attach(target.clone());
        dispatcher.attach(other);

        dispatcher.send(bytes("one"));

        assert_eq!(*target.seen.lock(), vec![2]);
        assert!(target.cancel.is_cancelled());
        assert_eq!(dispatcher.target_count(), 1);
        assert_eq!(dispatcher.last_message(), Some(bytes("one")));
    }

    #[tokio::test]
    async fn test_detach_all() {
        let dispatcher = Dispatcher::new();
        let (target, mut rx) = channel(4);
        dispatcher.attach(target);
        dispatcher.detach_all();
        assert_eq!(dispatcher.target_count(), 0);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_snapshot_encodes_update() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .send_snapshot("resync", &ConfigSnapshot::default())
            .unwrap();

        let last = dispatcher.last_message().unwrap();
        let message = Message::from_line(&last).unwrap();
        assert_eq!(message.message_type, crate::dispatch::MessageType::Update);
        assert_eq!(message.key, "resync");
    }
}
