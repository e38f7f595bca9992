//! Reconciliation controller
//!
//! The controller follows ingresses, services and endpoints through one
//! informer each, keeps the [`Cache`] up to date and schedules reconciliation
//! of the affected ingresses on a rate limited work queue. Workers take keys
//! off the queue and hand them to the [`Reconciler`]; failures are retried
//! with per-key backoff.
//!
//! Lifecycle: `Initializing` while the informers deliver their initial
//! listings, `Ready` once all of them have synced, `Running` after the full
//! resync has been queued, `ShuttingDown` once cancelled. Notifications that
//! arrive before `Running` only update the cache; the resync covers them.

use crate::cache::Cache;
use crate::informer::{Informer, Registration};
use crate::reconciler::Reconciler;
use crate::resources::{Endpoints, Ingress, NamespacedName, Resource, Service, WatchEvent};
use crate::source::ResourceSource;
use crate::workqueue::RateLimitingQueue;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Initializing,
    Ready,
    Running,
    ShuttingDown,
}

struct ControllerInner {
    cache: Arc<Cache>,
    queue: RateLimitingQueue<NamespacedName>,
    reconciler: Arc<dyn Reconciler>,
    state: Mutex<ControllerState>,
}

impl ControllerInner {
    fn state(&self) -> ControllerState {
        *self.state.lock()
    }

    fn set_state(&self, next: ControllerState) {
        let mut state = self.state.lock();
        if *state != next {
            info!(from = ?*state, to = ?next, "Controller state changed");
            *state = next;
        }
    }

    fn enqueue(&self, keys: impl IntoIterator<Item = NamespacedName>) {
        if self.state() != ControllerState::Running {
            return;
        }
        for key in keys {
            debug!(key = %key, "Queueing reconcile");
            self.queue.add(key);
        }
    }

    fn on_ingress(&self, event: WatchEvent<Ingress>) {
        if self.cache.update_ingress(&event) {
            self.enqueue([event.resource().key()]);
        }
    }

    fn on_service(&self, event: WatchEvent<Service>) {
        let affected = self.cache.update_service(&event);
        self.enqueue(affected);
    }

    fn on_endpoints(&self, event: WatchEvent<Endpoints>) {
        let affected = self.cache.update_endpoints(&event);
        self.enqueue(affected);
    }

    async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        match self.reconciler.reconcile(&key).await {
            Ok(()) => {
                debug!(key = %key, "Reconciled");
                self.queue.forget(&key);
            }
            Err(e) => {
                warn!(
                    key = %key,
                    requeues = self.queue.num_requeues(&key),
                    error = %e,
                    "Reconcile failed, requeueing with backoff"
                );
                self.queue.add_rate_limited(key.clone());
            }
        }
        self.queue.done(&key);
        true
    }
}

/// Drives reconciliation from resource notifications
pub struct Controller {
    inner: Arc<ControllerInner>,
    ingresses: Arc<Informer<Ingress>>,
    services: Arc<Informer<Service>>,
    endpoints: Arc<Informer<Endpoints>>,
    workers: usize,
}

impl Controller {
    pub fn new(
        ingress_source: Arc<dyn ResourceSource<Ingress>>,
        service_source: Arc<dyn ResourceSource<Service>>,
        endpoints_source: Arc<dyn ResourceSource<Endpoints>>,
        cache: Arc<Cache>,
        queue: RateLimitingQueue<NamespacedName>,
        reconciler: Arc<dyn Reconciler>,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                cache,
                queue,
                reconciler,
                state: Mutex::new(ControllerState::Initializing),
            }),
            ingresses: Arc::new(Informer::new(ingress_source)),
            services: Arc::new(Informer::new(service_source)),
            endpoints: Arc::new(Informer::new(endpoints_source)),
            workers: 1,
        }
    }

    /// Number of concurrent reconcile workers (at least one)
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn state(&self) -> ControllerState {
        self.inner.state()
    }

    /// Keys currently waiting to be reconciled
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.inner.cache
    }

    pub fn on_ingress(&self, event: WatchEvent<Ingress>) {
        self.inner.on_ingress(event);
    }

    pub fn on_service(&self, event: WatchEvent<Service>) {
        self.inner.on_service(event);
    }

    pub fn on_endpoints(&self, event: WatchEvent<Endpoints>) {
        self.inner.on_endpoints(event);
    }

    /// Take one key off the queue and reconcile it. Returns false once the
    /// queue has shut down and drained.
    pub async fn process_next_item(&self) -> bool {
        self.inner.process_next_item().await
    }

    /// Run until `cancel` fires. In-flight reconciliations finish before
    /// this returns.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        info!(workers = self.workers, "Controller starting");

        let (ingresses_synced, services_synced, endpoints_synced) = self.register_handlers();

        let informer_cancel = cancel.child_token();
        let mut informers = JoinSet::new();
        {
            let informer = Arc::clone(&self.ingresses);
            let cancel = informer_cancel.clone();
            informers.spawn(async move { informer.run(cancel).await });
        }
        {
            let informer = Arc::clone(&self.services);
            let cancel = informer_cancel.clone();
            informers.spawn(async move { informer.run(cancel).await });
        }
        {
            let informer = Arc::clone(&self.endpoints);
            let cancel = informer_cancel.clone();
            informers.spawn(async move { informer.run(cancel).await });
        }

        let synced = ingresses_synced.wait_synced(&cancel).await
            && services_synced.wait_synced(&cancel).await
            && endpoints_synced.wait_synced(&cancel).await;

        let mut workers = JoinSet::new();
        if synced {
            self.inner.set_state(ControllerState::Ready);
            info!(ingresses = self.inner.cache.ingress_count(), "Caches synced");

            self.inner.queue.add(NamespacedName::default());
            self.inner.set_state(ControllerState::Running);

            for worker in 0..self.workers {
                let inner = Arc::clone(&self.inner);
                workers.spawn(async move {
                    debug!(worker, "Reconcile worker started");
                    while inner.process_next_item().await {}
                    debug!(worker, "Reconcile worker stopped");
                });
            }

            cancel.cancelled().await;
        }

        self.inner.set_state(ControllerState::ShuttingDown);
        informer_cancel.cancel();
        self.inner.queue.shut_down();

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Reconcile worker panicked");
            }
        }
        while let Some(result) = informers.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Informer task panicked");
            }
        }

        info!("Controller stopped");
        Ok(())
    }

    fn register_handlers(
        &self,
    ) -> (
        Arc<Registration<Ingress>>,
        Arc<Registration<Service>>,
        Arc<Registration<Endpoints>>,
    ) {
        let inner = Arc::clone(&self.inner);
        let ingresses = self.ingresses.register(move |event| inner.on_ingress(event));

        let inner = Arc::clone(&self.inner);
        let services = self.services.register(move |event| inner.on_service(event));

        let inner = Arc::clone(&self.inner);
        let endpoints = self.endpoints.register(move |event| inner.on_endpoints(event));

        (ingresses, services, endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReconcileError;
    use crate::resources::{IngressBackend, IngressPath, IngressRule, PathType};
    use crate::source::ManifestSource;
    use crate::workqueue::ItemExponentialFailureRateLimiter;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::time::Duration;

    /// Records every key; fails the first `failures` calls
    struct RecordingReconciler {
        keys: Mutex<Vec<NamespacedName>>,
        failures: Mutex<u32>,
    }

    impl RecordingReconciler {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                keys: Mutex::new(Vec::new()),
                failures: Mutex::new(failures),
            })
        }

        fn keys(&self) -> Vec<NamespacedName> {
            self.keys.lock().clone()
        }
    }

    #[async_trait]
    impl Reconciler for RecordingReconciler {
        async fn reconcile(&self, key: &NamespacedName) -> Result<(), ReconcileError> {
            self.keys.lock().push(key.clone());
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(ReconcileError::Conversion(vec![]));
            }
            Ok(())
        }
    }

    fn ingress(name: &str) -> Ingress {
        Ingress {
            namespace: "default".into(),
            name: name.into(),
            ingress_class_name: None,
            annotations: BTreeMap::new(),
            rules: vec![IngressRule {
                host: None,
                paths: vec![IngressPath {
                    path: "/".into(),
                    path_type: PathType::Prefix,
                    backend: IngressBackend {
                        service: "frontend".into(),
                        port: 80,
                    },
                }],
            }],
        }
    }

    struct Fixture {
        ingresses: Arc<ManifestSource<Ingress>>,
        controller: Arc<Controller>,
        reconciler: Arc<RecordingReconciler>,
    }

    fn fixture(initial: Vec<Ingress>, failures: u32) -> Fixture {
        let ingresses = Arc::new(ManifestSource::new(initial));
        let services = Arc::new(ManifestSource::<Service>::new(vec![]));
        let endpoints = Arc::new(ManifestSource::<Endpoints>::new(vec![]));
        let reconciler = RecordingReconciler::new(failures);
        let queue = RateLimitingQueue::new(Box::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(1),
            Duration::from_millis(10),
        )));

        let controller = Controller::new(
            ingresses.clone(),
            services,
            endpoints,
            Arc::new(Cache::new(None, false)),
            queue,
            reconciler.clone(),
        );

        Fixture {
            ingresses,
            controller: Arc::new(controller),
            reconciler,
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn start(controller: &Arc<Controller>) -> (CancellationToken, tokio::task::JoinHandle<anyhow::Result<()>>) {
        let cancel = CancellationToken::new();
        let task = {
            let controller = Arc::clone(controller);
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(cancel).await })
        };
        (cancel, task)
    }

    #[tokio::test]
    async fn test_notifications_before_ready_only_update_cache() {
        let f = fixture(vec![], 0);
        assert_eq!(f.controller.state(), ControllerState::Initializing);

        f.controller.on_ingress(WatchEvent::Added(ingress("early")));
        assert_eq!(f.controller.queue_len(), 0);
        assert!(f
            .controller
            .cache()
            .ingress(&NamespacedName::new("default", "early"))
            .is_some());
    }

    #[tokio::test]
    async fn test_startup_queues_exactly_one_resync() {
        let f = fixture(vec![ingress("a"), ingress("b")], 0);
        let (cancel, task) = start(&f.controller);

        eventually(|| !f.reconciler.keys().is_empty()).await;
        assert_eq!(f.controller.state(), ControllerState::Running);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let keys = f.reconciler.keys();
        assert_eq!(keys, vec![NamespacedName::default()]);
        assert_eq!(f.controller.cache().ingress_count(), 2);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(f.controller.state(), ControllerState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_changes_while_running_are_queued() {
        let f = fixture(vec![], 0);
        let (cancel, task) = start(&f.controller);
        eventually(|| f.controller.state() == ControllerState::Running).await;
        eventually(|| f.ingresses.watcher_count() > 0).await;

        f.ingresses.apply(ingress("web"));
        eventually(|| {
            f.reconciler
                .keys()
                .contains(&NamespacedName::new("default", "web"))
        })
        .await;

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_reconcile_is_retried() {
        let f = fixture(vec![], 2);
        let (cancel, task) = start(&f.controller);

        eventually(|| f.reconciler.keys().len() >= 3).await;
        let keys = f.reconciler.keys();
        assert!(keys[..3].iter().all(|k| k.is_empty()));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_before_sync_stops_cleanly() {
        let f = fixture(vec![], 0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        f.controller.run(cancel).await.unwrap();
        assert_eq!(f.controller.state(), ControllerState::ShuttingDown);
    }
}
