//! Reconciliation of cached state into dispatched proxy configuration

use crate::cache::Cache;
use crate::convert::build_snapshot;
use crate::dispatch::Dispatcher;
use crate::error::ReconcileError;
use crate::resources::NamespacedName;
use crate::snapshot::ConfigSnapshot;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Key recorded on messages produced by a full resync
pub const RESYNC_KEY: &str = "resync";

/// Brings the outside world in line with the cache for one work item
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, key: &NamespacedName) -> Result<(), ReconcileError>;
}

/// Converts the whole cache into one snapshot and dispatches it
pub struct DispatchReconciler {
    cache: Arc<Cache>,
    dispatcher: Arc<Dispatcher>,
    last_dispatched: Mutex<Option<ConfigSnapshot>>,
}

impl DispatchReconciler {
    pub fn new(cache: Arc<Cache>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            cache,
            dispatcher,
            last_dispatched: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Reconciler for DispatchReconciler {
    async fn reconcile(&self, key: &NamespacedName) -> Result<(), ReconcileError> {
        let (snapshot, failures) = build_snapshot(&self.cache);
        let trigger = if key.is_empty() {
            RESYNC_KEY.to_string()
        } else {
            key.to_string()
        };

        {
            let mut last = self.last_dispatched.lock();
            if last.as_ref() == Some(&snapshot) {
                debug!(key = %trigger, "Configuration unchanged, not dispatching");
            } else {
                self.dispatcher.send_snapshot(&trigger, &snapshot)?;
                *last = Some(snapshot);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ReconcileError::Conversion(failures))
        }
    }
}
