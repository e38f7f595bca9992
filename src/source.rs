//! Sources of cluster resources
//!
//! [`ResourceSource`] is the boundary to whatever stores cluster state: it
//! can list every resource of a kind and then stream changes from the
//! version the list was taken at. [`ManifestSource`] is an in-process
//! implementation fed from configuration manifests.

use crate::error::SourceError;
use crate::resources::{NamespacedName, Resource, WatchEvent};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::debug;

/// Snapshot returned by [`ResourceSource::list`]
#[derive(Debug, Clone)]
pub struct ResourceList<R> {
    pub items: Vec<R>,
    /// Version to start watching from
    pub resource_version: String,
}

pub type WatchStream<R> = BoxStream<'static, Result<WatchEvent<R>, SourceError>>;

#[async_trait]
pub trait ResourceSource<R: Resource>: Send + Sync + 'static {
    async fn list(&self) -> Result<ResourceList<R>, SourceError>;

    /// Stream changes made after `resource_version`. The stream ends or
    /// yields an error when the watch cannot continue; callers relist.
    async fn watch(&self, resource_version: &str) -> Result<WatchStream<R>, SourceError>;
}

/// Capacity of the change channel; a watcher that lags further must relist
const WATCH_CHANNEL_CAPACITY: usize = 256;

struct ManifestState<R> {
    items: BTreeMap<NamespacedName, R>,
    version: u64,
}

/// In-memory source whose contents are replaced wholesale, e.g. on config reload
pub struct ManifestSource<R: Resource> {
    state: Mutex<ManifestState<R>>,
    events: broadcast::Sender<(u64, WatchEvent<R>)>,
}

impl<R: Resource> ManifestSource<R> {
    pub fn new(items: Vec<R>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(ManifestState {
                items: items.into_iter().map(|item| (item.key(), item)).collect(),
                version: 1,
            }),
            events,
        }
    }

    /// Replace the contents, emitting one event per difference
    pub fn replace(&self, items: Vec<R>) -> usize {
        let mut state = self.state.lock();
        let next: BTreeMap<NamespacedName, R> =
            items.into_iter().map(|item| (item.key(), item)).collect();

        let mut changes = Vec::new();
        for (key, old) in &state.items {
            if !next.contains_key(key) {
                changes.push(WatchEvent::Deleted(old.clone()));
            }
        }
        for (key, new) in &next {
            match state.items.get(key) {
                None => changes.push(WatchEvent::Added(new.clone())),
                Some(old) if old != new => changes.push(WatchEvent::Modified(new.clone())),
                Some(_) => {}
            }
        }

        state.items = next;
        for change in &changes {
            state.version += 1;
            // No receivers is fine: nobody is watching yet
            let _ = self.events.send((state.version, change.clone()));
        }
        debug!(kind = R::KIND, changes = changes.len(), version = state.version, "Manifest source replaced");
        changes.len()
    }

    /// Add or update a single resource
    pub fn apply(&self, item: R) {
        let mut state = self.state.lock();
        let event = match state.items.insert(item.key(), item.clone()) {
            None => WatchEvent::Added(item),
            Some(old) if old == item => return,
            Some(_) => WatchEvent::Modified(item),
        };
        state.version += 1;
        let _ = self.events.send((state.version, event));
    }

    /// Number of open watch streams
    pub fn watcher_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Remove a single resource
    pub fn delete(&self, key: &NamespacedName) {
        let mut state = self.state.lock();
        if let Some(old) = state.items.remove(key) {
            state.version += 1;
            let _ = self.events.send((state.version, WatchEvent::Deleted(old)));
        }
    }
}

#[async_trait]
impl<R: Resource> ResourceSource<R> for ManifestSource<R> {
    async fn list(&self) -> Result<ResourceList<R>, SourceError> {
        let state = self.state.lock();
        Ok(ResourceList {
            items: state.items.values().cloned().collect(),
            resource_version: state.version.to_string(),
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<R>, SourceError> {
        let from: u64 = resource_version
            .parse()
            .map_err(|_| SourceError::Expired(resource_version.to_string()))?;

        // Subscribe under the lock so no change between the check and the subscription is lost
        let receiver = {
            let state = self.state.lock();
            if from != state.version {
                return Err(SourceError::Expired(resource_version.to_string()));
            }
            self.events.subscribe()
        };

        let stream = stream::unfold(Some(receiver), |receiver| async move {
            let mut receiver = receiver?;
            match receiver.recv().await {
                Ok((_, event)) => Some((Ok(event), Some(receiver))),
                Err(broadcast::error::RecvError::Lagged(missed)) => Some((
                    Err(SourceError::Expired(format!("lagged by {} events", missed))),
                    None,
                )),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Service;
    use futures::StreamExt;

    fn service(name: &str, port: u16) -> Service {
        Service {
            namespace: "default".into(),
            name: name.into(),
            ports: vec![crate::resources::ServicePort {
                name: None,
                port,
                target_port: None,
            }],
        }
    }

    #[tokio::test]
    async fn test_list_returns_items_and_version() {
        let source = ManifestSource::new(vec![service("a", 80), service("b", 80)]);
        let list = source.list().await.unwrap();
        assert_eq!(list.items.len(), 2);
        assert_eq!(list.resource_version, "1");
    }

    #[tokio::test]
    async fn test_replace_emits_diff_events() {
        let source = ManifestSource::new(vec![service("a", 80), service("b", 80)]);
        let list = source.list().await.unwrap();
        let mut watch = source.watch(&list.resource_version).await.unwrap();

        let changes = source.replace(vec![service("b", 8080), service("c", 80)]);
        assert_eq!(changes, 3);

        let mut events = Vec::new();
        for _ in 0..3 {
            events.push(watch.next().await.unwrap().unwrap());
        }
        assert_eq!(events[0], WatchEvent::Deleted(service("a", 80)));
        assert!(events.contains(&WatchEvent::Modified(service("b", 8080))));
        assert!(events.contains(&WatchEvent::Added(service("c", 80))));
    }

    #[tokio::test]
    async fn test_watch_from_stale_version_expires() {
        let source = ManifestSource::new(vec![service("a", 80)]);
        source.apply(service("b", 80));
        let err = source.watch("1").await.err().unwrap();
        assert!(matches!(err, SourceError::Expired(_)));
    }

    #[tokio::test]
    async fn test_apply_unchanged_is_silent() {
        let source = ManifestSource::new(vec![service("a", 80)]);
        source.apply(service("a", 80));
        assert_eq!(source.list().await.unwrap().resource_version, "1");

        source.delete(&NamespacedName::new("default", "a"));
        assert!(source.list().await.unwrap().items.is_empty());
    }
}
