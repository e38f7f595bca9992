//! Local cache of the resources that make up the proxy configuration
//!
//! The cache holds every ingress handled by this controller plus the services
//! and endpoints they may reference. A derived index maps each service to the
//! ingresses routing to it, so a service or endpoints change can be turned
//! into the set of affected ingresses.

use crate::resources::{Endpoints, Ingress, NamespacedName, Resource, Service, WatchEvent};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Default)]
struct CacheState {
    ingresses: HashMap<NamespacedName, Ingress>,
    services: HashMap<NamespacedName, Service>,
    endpoints: HashMap<NamespacedName, Endpoints>,
    /// service -> ingresses referencing it
    service_index: HashMap<NamespacedName, HashSet<NamespacedName>>,
}

impl CacheState {
    fn index_ingress(&mut self, ingress: &Ingress) {
        let key = ingress.key();
        for service in ingress.backend_services() {
            self.service_index.entry(service).or_default().insert(key.clone());
        }
    }

    fn unindex_ingress(&mut self, ingress: &Ingress) {
        let key = ingress.key();
        for service in ingress.backend_services() {
            if let Some(ingresses) = self.service_index.get_mut(&service) {
                ingresses.remove(&key);
                if ingresses.is_empty() {
                    self.service_index.remove(&service);
                }
            }
        }
    }

    fn remove_ingress(&mut self, key: &NamespacedName) -> bool {
        match self.ingresses.remove(key) {
            Some(old) => {
                self.unindex_ingress(&old);
                true
            }
            None => false,
        }
    }

    fn ingresses_for_service(&self, service: &NamespacedName) -> Vec<NamespacedName> {
        let mut keys: Vec<_> = self
            .service_index
            .get(service)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

/// Shared resource cache with ingress class filtering
pub struct Cache {
    ingress_class: Option<String>,
    default_class: bool,
    state: Mutex<CacheState>,
}

impl Cache {
    /// Create a cache handling ingresses of `ingress_class`. With
    /// `default_class` set, ingresses without a class are handled too. Without
    /// a configured class every ingress is handled.
    pub fn new(ingress_class: Option<String>, default_class: bool) -> Self {
        Self {
            ingress_class,
            default_class,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Whether this controller is responsible for `ingress`
    pub fn handles(&self, ingress: &Ingress) -> bool {
        match (&self.ingress_class, &ingress.ingress_class_name) {
            (None, _) => true,
            (Some(ours), Some(theirs)) => ours == theirs,
            (Some(_), None) => self.default_class,
        }
    }

    /// Apply an ingress change. Returns true if the cached set of handled
    /// ingresses changed, including an ingress moving to another class.
    pub fn update_ingress(&self, event: &WatchEvent<Ingress>) -> bool {
        let ingress = event.resource();
        let key = ingress.key();
        let mut state = self.state.lock();

        if event.is_delete() || !self.handles(ingress) {
            let removed = state.remove_ingress(&key);
            if removed && !event.is_delete() {
                debug!(ingress = %key, class = ?ingress.ingress_class_name, "Ingress no longer handled by this controller");
            }
            return removed;
        }

        if state.ingresses.get(&key) == Some(ingress) {
            return false;
        }
        state.remove_ingress(&key);
        state.index_ingress(ingress);
        state.ingresses.insert(key, ingress.clone());
        true
    }

    /// Apply a service change and return the ingresses routing to it
    pub fn update_service(&self, event: &WatchEvent<Service>) -> Vec<NamespacedName> {
        let service = event.resource();
        let key = service.key();
        let mut state = self.state.lock();

        let changed = if event.is_delete() {
            state.services.remove(&key).is_some()
        } else {
            state.services.insert(key.clone(), service.clone()).as_ref() != Some(service)
        };

        if changed {
            state.ingresses_for_service(&key)
        } else {
            Vec::new()
        }
    }

    /// Apply an endpoints change and return the ingresses routing to the
    /// service of the same name
    pub fn update_endpoints(&self, event: &WatchEvent<Endpoints>) -> Vec<NamespacedName> {
        let endpoints = event.resource();
        let key = endpoints.key();
        let mut state = self.state.lock();

        let changed = if event.is_delete() {
            state.endpoints.remove(&key).is_some()
        } else {
            state.endpoints.insert(key.clone(), endpoints.clone()).as_ref() != Some(endpoints)
        };

        if changed {
            state.ingresses_for_service(&key)
        } else {
            Vec::new()
        }
    }

    /// Every cached ingress, ordered by key
    pub fn ingresses(&self) -> Vec<Ingress> {
        let state = self.state.lock();
        let mut ingresses: Vec<_> = state.ingresses.values().cloned().collect();
        ingresses.sort_by_key(|ingress| ingress.key());
        ingresses
    }

    pub fn ingress(&self, key: &NamespacedName) -> Option<Ingress> {
        self.state.lock().ingresses.get(key).cloned()
    }

    pub fn service(&self, key: &NamespacedName) -> Option<Service> {
        self.state.lock().services.get(key).cloned()
    }

    pub fn endpoints(&self, key: &NamespacedName) -> Option<Endpoints> {
        self.state.lock().endpoints.get(key).cloned()
    }

    pub fn ingress_count(&self) -> usize {
        self.state.lock().ingresses.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{IngressBackend, IngressPath, IngressRule, PathType, ServicePort};
    use std::collections::BTreeMap;

    fn ingress(name: &str, class: Option<&str>, services: &[&str]) -> Ingress {
        Ingress {
            namespace: "default".into(),
            name: name.into(),
            ingress_class_name: class.map(String::from),
            annotations: BTreeMap::new(),
            rules: vec![IngressRule {
                host: Some(format!("{}.example.com", name)),
                paths: services
                    .iter()
                    .map(|svc| IngressPath {
                        path: format!("/{}", svc),
                        path_type: PathType::Prefix,
                        backend: IngressBackend {
                            service: svc.to_string(),
                            port: 80,
                        },
                    })
                    .collect(),
            }],
        }
    }

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

    fn key(name: &str) -> NamespacedName {
        NamespacedName::new("default", name)
    }

    #[test]
    fn test_class_filtering() {
        let cache = Cache::new(Some("gate".into()), false);
        assert!(cache.handles(&ingress("a", Some("gate"), &[])));
        assert!(!cache.handles(&ingress("b", Some("nginx"), &[])));
        assert!(!cache.handles(&ingress("c", None, &[])));

        let default_cache = Cache::new(Some("gate".into()), true);
        assert!(default_cache.handles(&ingress("c", None, &[])));

        let any = Cache::new(None, false);
        assert!(any.handles(&ingress("b", Some("nginx"), &[])));
    }

    #[test]
    fn test_update_ingress_reports_changes() {
        let cache = Cache::new(Some("gate".into()), false);
        let web = ingress("web", Some("gate"), &["frontend"]);

        assert!(cache.update_ingress(&WatchEvent::Added(web.clone())));
        assert!(!cache.update_ingress(&WatchEvent::Modified(web.clone())));
        assert!(!cache.update_ingress(&WatchEvent::Added(ingress("other", Some("nginx"), &[]))));
        assert_eq!(cache.ingress_count(), 1);

        assert!(cache.update_ingress(&WatchEvent::Deleted(web)));
        assert_eq!(cache.ingress_count(), 0);
    }

    #[test]
    fn test_ingress_leaving_class_is_removed() {
        let cache = Cache::new(Some("gate".into()), false);
        cache.update_ingress(&WatchEvent::Added(ingress("web", Some("gate"), &["frontend"])));

        let moved = ingress("web", Some("nginx"), &["frontend"]);
        assert!(cache.update_ingress(&WatchEvent::Modified(moved)));
        assert!(cache.ingress(&key("web")).is_none());

        cache.update_service(&WatchEvent::Added(service("frontend", 80)));
        assert!(cache
            .update_service(&WatchEvent::Modified(service("frontend", 81)))
            .is_empty());
    }

    #[test]
    fn test_service_changes_map_to_ingresses() {
        let cache = Cache::new(None, false);
        cache.update_ingress(&WatchEvent::Added(ingress("a", None, &["shared", "api"])));
        cache.update_ingress(&WatchEvent::Added(ingress("b", None, &["shared"])));

        let affected = cache.update_service(&WatchEvent::Added(service("shared", 80)));
        assert_eq!(affected, vec![key("a"), key("b")]);

        // Unchanged service is not a change
        assert!(cache
            .update_service(&WatchEvent::Modified(service("shared", 80)))
            .is_empty());

        let affected = cache.update_service(&WatchEvent::Added(service("api", 80)));
        assert_eq!(affected, vec![key("a")]);

        let affected = cache.update_service(&WatchEvent::Deleted(service("api", 80)));
        assert_eq!(affected, vec![key("a")]);
        assert!(cache.service(&key("api")).is_none());
    }

    #[test]
    fn test_reindex_on_ingress_update() {
        let cache = Cache::new(None, false);
        cache.update_ingress(&WatchEvent::Added(ingress("a", None, &["old"])));
        cache.update_ingress(&WatchEvent::Modified(ingress("a", None, &["new"])));

        assert!(cache.update_service(&WatchEvent::Added(service("old", 80))).is_empty());
        assert_eq!(
            cache.update_service(&WatchEvent::Added(service("new", 80))),
            vec![key("a")]
        );
    }

    #[test]
    fn test_endpoints_map_to_ingresses() {
        let cache = Cache::new(None, false);
        cache.update_ingress(&WatchEvent::Added(ingress("a", None, &["api"])));

        let endpoints = Endpoints {
            namespace: "default".into(),
            name: "api".into(),
            subsets: vec![],
        };
        assert_eq!(
            cache.update_endpoints(&WatchEvent::Added(endpoints.clone())),
            vec![key("a")]
        );
        assert!(cache.endpoints(&key("api")).is_some());
        assert!(cache
            .update_endpoints(&WatchEvent::Modified(endpoints))
            .is_empty());
    }

    #[test]
    fn test_ingresses_sorted() {
        let cache = Cache::new(None, false);
        cache.update_ingress(&WatchEvent::Added(ingress("z", None, &[])));
        cache.update_ingress(&WatchEvent::Added(ingress("a", None, &[])));
        let names: Vec<_> = cache.ingresses().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["a", "z"]);
    }
}
