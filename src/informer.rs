//! List-then-watch informer
//!
//! An [`Informer`] keeps a local copy of every resource of one kind by listing
//! the [`ResourceSource`] once and then following its watch stream. Every
//! change is delivered to the registered handlers. When the watch breaks the
//! informer relists (rate limited) and delivers the difference, so handlers
//! never miss a final state.

use crate::rate::{Limit, Limiter};
use crate::resources::{NamespacedName, Resource, WatchEvent};
use crate::source::ResourceSource;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Minimum spacing between two relists of the same informer
const RELIST_INTERVAL: Duration = Duration::from_secs(1);

pub type EventHandler<R> = Box<dyn Fn(WatchEvent<R>) + Send + Sync>;

/// A handler attached to an informer
pub struct Registration<R> {
    handler: EventHandler<R>,
    synced: AtomicBool,
    synced_notify: Notify,
}

impl<R> Registration<R> {
    /// Whether the handler has received the initial listing
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Wait until the initial listing has been delivered. Returns false if
    /// cancelled first.
    pub async fn wait_synced(&self, cancel: &CancellationToken) -> bool {
        loop {
            let notified = self.synced_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.has_synced() {
                return true;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return false,
            }
        }
    }

    fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
        self.synced_notify.notify_waiters();
    }
}

struct InformerState<R> {
    known: HashMap<NamespacedName, R>,
    handlers: Vec<Arc<Registration<R>>>,
    synced: bool,
}

/// Follows one resource kind and fans changes out to registered handlers
pub struct Informer<R: Resource> {
    source: Arc<dyn ResourceSource<R>>,
    state: Mutex<InformerState<R>>,
    relist_limiter: Limiter,
}

impl<R: Resource> Informer<R> {
    pub fn new(source: Arc<dyn ResourceSource<R>>) -> Self {
        Self {
            source,
            state: Mutex::new(InformerState {
                known: HashMap::new(),
                handlers: Vec::new(),
                synced: false,
            }),
            relist_limiter: Limiter::new(Limit::every(RELIST_INTERVAL), 1),
        }
    }

    /// Attach a handler. If the informer has already synced, the current
    /// contents are replayed to it as additions.
    pub fn register(&self, handler: impl Fn(WatchEvent<R>) + Send + Sync + 'static) -> Arc<Registration<R>> {
        let registration = Arc::new(Registration {
            handler: Box::new(handler),
            synced: AtomicBool::new(false),
            synced_notify: Notify::new(),
        });

        let replay = {
            let mut state = self.state.lock();
            state.handlers.push(Arc::clone(&registration));
            state.synced.then(|| state.known.values().cloned().collect::<Vec<_>>())
        };

        if let Some(items) = replay {
            for item in items {
                (registration.handler)(WatchEvent::Added(item));
            }
            registration.mark_synced();
        }

        registration
    }

    pub fn has_synced(&self) -> bool {
        self.state.lock().synced
    }

    /// Number of resources currently known
    pub fn len(&self) -> usize {
        self.state.lock().known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// List and watch until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!(kind = R::KIND, "Informer started");

        loop {
            if self.relist_limiter.wait(&cancel).await.is_err() {
                break;
            }

            let list = tokio::select! {
                result = self.source.list() => result,
                _ = cancel.cancelled() => break,
            };
            let list = match list {
                Ok(list) => list,
                Err(e) => {
                    warn!(kind = R::KIND, error = %e, "Failed to list resources");
                    continue;
                }
            };

            debug!(kind = R::KIND, count = list.items.len(), version = %list.resource_version, "Listed resources");
            self.replace(list.items);

            let watch = tokio::select! {
                result = self.source.watch(&list.resource_version) => result,
                _ = cancel.cancelled() => break,
            };
            let mut stream = match watch {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(kind = R::KIND, error = %e, "Failed to start watch, relisting");
                    continue;
                }
            };

            loop {
                tokio::select! {
                    event = stream.next() => match event {
                        Some(Ok(event)) => self.apply(event),
                        Some(Err(e)) => {
                            warn!(kind = R::KIND, error = %e, "Watch failed, relisting");
                            break;
                        }
                        None => {
                            debug!(kind = R::KIND, "Watch ended, relisting");
                            break;
                        }
                    },
                    _ = cancel.cancelled() => {
                        info!(kind = R::KIND, "Informer stopped");
                        return;
                    }
                }
            }
        }

        info!(kind = R::KIND, "Informer stopped");
    }

    /// Apply a full listing, emitting the difference to handlers
    fn replace(&self, items: Vec<R>) {
        let (events, handlers, first_sync) = {
            let mut state = self.state.lock();
            let next: HashMap<NamespacedName, R> =
                items.into_iter().map(|item| (item.key(), item)).collect();

            let mut events = Vec::new();
            for (key, old) in &state.known {
                match next.get(key) {
                    None => events.push(WatchEvent::Deleted(old.clone())),
                    Some(new) if new != old => events.push(WatchEvent::Modified(new.clone())),
                    Some(_) => {}
                }
            }
            for (key, new) in &next {
                if !state.known.contains_key(key) {
                    events.push(WatchEvent::Added(new.clone()));
                }
            }
            state.known = next;

            let first_sync = !state.synced;
            state.synced = true;
            (events, state.handlers.clone(), first_sync)
        };

        self.deliver(&handlers, events);

        if first_sync {
            for registration in &handlers {
                registration.mark_synced();
            }
        }
    }

    fn apply(&self, event: WatchEvent<R>) {
        let handlers = {
            let mut state = self.state.lock();
            let key = event.resource().key();
            match &event {
                WatchEvent::Added(r) | WatchEvent::Modified(r) => {
                    state.known.insert(key, r.clone());
                }
                WatchEvent::Deleted(_) => {
                    state.known.remove(&key);
                }
            }
            state.handlers.clone()
        };
        self.deliver(&handlers, vec![event]);
    }

    fn deliver(&self, handlers: &[Arc<Registration<R>>], events: Vec<WatchEvent<R>>) {
        for event in events {
            debug!(kind = R::KIND, key = %event.resource().key(), action = event.action(), "Resource changed");
            for registration in handlers {
                (registration.handler)(event.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{Service, ServicePort};
    use crate::source::ManifestSource;

    fn service(name: &str, port: u16) -> Service {
        Service {
            namespace: "default".into(),
            name: name.into(),
            ports: vec![ServicePort {
                name: None,
                port,
                target_port: None,
            }],
        }
    }

    fn recording_handler(
        informer: &Informer<Service>,
    ) -> (Arc<Registration<Service>>, Arc<Mutex<Vec<WatchEvent<Service>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let registration = informer.register(move |event| sink.lock().push(event));
        (registration, seen)
    }

    #[tokio::test]
    async fn test_initial_list_delivered_then_synced() {
        let source = Arc::new(ManifestSource::new(vec![service("a", 80), service("b", 80)]));
        let informer = Arc::new(Informer::new(source.clone() as Arc<dyn ResourceSource<Service>>));
        let (registration, seen) = recording_handler(&informer);
        assert!(!registration.has_synced());

        let cancel = CancellationToken::new();
        let task = {
            let informer = Arc::clone(&informer);
            let cancel = cancel.clone();
            tokio::spawn(async move { informer.run(cancel).await })
        };

        assert!(registration.wait_synced(&cancel).await);
        assert_eq!(seen.lock().len(), 2);
        assert!(seen.lock().iter().all(|e| matches!(e, WatchEvent::Added(_))));
        assert_eq!(informer.len(), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_events_reach_handlers() {
        let source = Arc::new(ManifestSource::new(vec![service("a", 80)]));
        let informer = Arc::new(Informer::new(source.clone() as Arc<dyn ResourceSource<Service>>));
        let (registration, seen) = recording_handler(&informer);

        let cancel = CancellationToken::new();
        let task = {
            let informer = Arc::clone(&informer);
            let cancel = cancel.clone();
            tokio::spawn(async move { informer.run(cancel).await })
        };
        assert!(registration.wait_synced(&cancel).await);
        tokio::time::timeout(Duration::from_secs(2), async {
            while source.watcher_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("watch should start");

        source.apply(service("a", 8080));
        source.delete(&NamespacedName::new("default", "a"));

        tokio::time::timeout(Duration::from_secs(2), async {
            while seen.lock().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("watch events should be delivered");

        let events = seen.lock().clone();
        assert_eq!(events[1], WatchEvent::Modified(service("a", 8080)));
        assert_eq!(events[2], WatchEvent::Deleted(service("a", 8080)));
        assert!(informer.is_empty());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_registration_replays_known_items() {
        let source = Arc::new(ManifestSource::new(vec![service("a", 80)]));
        let informer = Arc::new(Informer::new(source as Arc<dyn ResourceSource<Service>>));

        let cancel = CancellationToken::new();
        let (first, _) = recording_handler(&informer);
        let task = {
            let informer = Arc::clone(&informer);
            let cancel = cancel.clone();
            tokio::spawn(async move { informer.run(cancel).await })
        };
        assert!(first.wait_synced(&cancel).await);

        let (late, seen) = recording_handler(&informer);
        assert!(late.has_synced());
        assert_eq!(*seen.lock(), vec![WatchEvent::Added(service("a", 80))]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn test_relist_emits_only_differences() {
        let source = Arc::new(ManifestSource::<Service>::new(vec![]));
        let informer = Informer::new(source as Arc<dyn ResourceSource<Service>>);
        let (_registration, seen) = recording_handler(&informer);

        informer.replace(vec![service("a", 80), service("b", 80)]);
        seen.lock().clear();

        informer.replace(vec![service("a", 80), service("b", 81), service("c", 80)]);
        let events = seen.lock().clone();
        assert_eq!(events.len(), 2);
        assert!(events.contains(&WatchEvent::Modified(service("b", 81))));
        assert!(events.contains(&WatchEvent::Added(service("c", 80))));

        seen.lock().clear();
        informer.replace(vec![service("c", 80)]);
        assert_eq!(seen.lock().len(), 2);
        assert!(seen.lock().iter().all(|e| e.is_delete()));
    }

    #[tokio::test]
    async fn test_wait_synced_cancelled() {
        let source = Arc::new(ManifestSource::<Service>::new(vec![]));
        let informer = Informer::new(source as Arc<dyn ResourceSource<Service>>);
        let (registration, _) = recording_handler(&informer);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!registration.wait_synced(&cancel).await);
    }
}
