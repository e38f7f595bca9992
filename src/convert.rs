//! Conversion of cached ingresses into a proxy configuration snapshot
//!
//! Every ingress rule path becomes one route and every distinct backend
//! service port becomes one cluster whose destinations are the ready
//! endpoint addresses of that service.

use crate::cache::Cache;
use crate::error::ConversionFailure;
use crate::resources::{Ingress, IngressPath, IngressRule, NamespacedName, PathType, Resource, ServicePort};
use crate::snapshot::{ClusterConfig, ConfigSnapshot, DestinationConfig, RouteConfig, RouteMatch};
use std::collections::BTreeMap;

/// Cluster load balancing policy for every backend of the ingress
pub const LOAD_BALANCING_ANNOTATION: &str = "ingressgate.io/load-balancing";
/// Order of the ingress routes; lower values match first
pub const ROUTE_ORDER_ANNOTATION: &str = "ingressgate.io/route-order";
/// Scheme used to reach backends, `http` or `https`
pub const BACKEND_PROTOCOL_ANNOTATION: &str = "ingressgate.io/backend-protocol";

/// Metadata key carrying the ingress a route was generated from
pub const INGRESS_METADATA_KEY: &str = "ingressgate.io/ingress";
/// Metadata key carrying the service a cluster points at
pub const SERVICE_METADATA_KEY: &str = "ingressgate.io/service";

const CATCH_ALL: &str = "{**catch-all}";

/// Settings read from ingress annotations
struct IngressOptions {
    load_balancing: Option<String>,
    order: Option<i32>,
    scheme: &'static str,
}

impl IngressOptions {
    fn from_ingress(ingress: &Ingress) -> Result<Self, String> {
        let order = match ingress.annotations.get(ROUTE_ORDER_ANNOTATION) {
            Some(value) => Some(
                value
                    .trim()
                    .parse::<i32>()
                    .map_err(|_| format!("invalid {} annotation: {:?}", ROUTE_ORDER_ANNOTATION, value))?,
            ),
            None => None,
        };

        let scheme = match ingress
            .annotations
            .get(BACKEND_PROTOCOL_ANNOTATION)
            .map(|v| v.trim().to_ascii_lowercase())
            .as_deref()
        {
            None | Some("http") => "http",
            Some("https") => "https",
            Some(other) => {
                return Err(format!(
                    "unsupported {} annotation: {:?}",
                    BACKEND_PROTOCOL_ANNOTATION, other
                ))
            }
        };

        Ok(Self {
            load_balancing: ingress.annotations.get(LOAD_BALANCING_ANNOTATION).cloned(),
            order,
            scheme,
        })
    }
}

/// Build a snapshot from every cached ingress. Ingresses that cannot be
/// converted are left out and reported alongside the snapshot.
pub fn build_snapshot(cache: &Cache) -> (ConfigSnapshot, Vec<ConversionFailure>) {
    let mut routes = Vec::new();
    let mut clusters: BTreeMap<String, ClusterConfig> = BTreeMap::new();
    let mut failures = Vec::new();

    for ingress in cache.ingresses() {
        match convert_ingress(&ingress, cache) {
            Ok((ingress_routes, ingress_clusters)) => {
                routes.extend(ingress_routes);
                for cluster in ingress_clusters {
                    // First ingress (by key) referencing a cluster decides its policy
                    clusters.entry(cluster.cluster_id.clone()).or_insert(cluster);
                }
            }
            Err(reason) => failures.push(ConversionFailure {
                ingress: ingress.key(),
                reason,
            }),
        }
    }

    (
        ConfigSnapshot {
            routes,
            clusters: clusters.into_values().collect(),
        },
        failures,
    )
}

/// Convert one ingress into its routes and the clusters they reference
pub fn convert_ingress(
    ingress: &Ingress,
    cache: &Cache,
) -> Result<(Vec<RouteConfig>, Vec<ClusterConfig>), String> {
    let options = IngressOptions::from_ingress(ingress)?;
    let key = ingress.key();

    let mut routes = Vec::new();
    let mut clusters = Vec::new();

    for (rule_index, rule) in ingress.rules.iter().enumerate() {
        for (path_index, path) in rule.paths.iter().enumerate() {
            let service_key = NamespacedName::new(ingress.namespace.clone(), path.backend.service.clone());
            let service = cache
                .service(&service_key)
                .ok_or_else(|| format!("service {} not found", service_key))?;
            let port = service
                .ports
                .iter()
                .find(|p| p.port == path.backend.port)
                .ok_or_else(|| format!("service {} has no port {}", service_key, path.backend.port))?;

            let cluster_id = cluster_id(&service_key, port.port);
            routes.push(route(&key, rule_index, rule, path_index, path, &cluster_id, options.order));

            if !clusters.iter().any(|c: &ClusterConfig| c.cluster_id == cluster_id) {
                clusters.push(ClusterConfig {
                    cluster_id,
                    destinations: destinations(cache, &service_key, port, options.scheme),
                    load_balancing_policy: options.load_balancing.clone(),
                    metadata: BTreeMap::from([(SERVICE_METADATA_KEY.to_string(), service_key.to_string())]),
                });
            }
        }
    }

    Ok((routes, clusters))
}

/// Cluster id of a service port, e.g. `frontend.default:80`
pub fn cluster_id(service: &NamespacedName, port: u16) -> String {
    format!("{}.{}:{}", service.name, service.namespace, port)
}

fn route(
    ingress: &NamespacedName,
    rule_index: usize,
    rule: &IngressRule,
    path_index: usize,
    path: &IngressPath,
    cluster_id: &str,
    order: Option<i32>,
) -> RouteConfig {
    RouteConfig {
        route_id: format!("{}:{}:{}", ingress, rule_index, path_index),
        cluster_id: cluster_id.to_string(),
        route_match: RouteMatch {
            hosts: rule.host.iter().cloned().collect(),
            path: Some(match_path(&path.path, path.path_type)),
        },
        order,
        metadata: BTreeMap::from([(INGRESS_METADATA_KEY.to_string(), ingress.to_string())]),
    }
}

/// Translate an ingress path into a route path pattern
fn match_path(path: &str, path_type: PathType) -> String {
    match path_type {
        PathType::Exact | PathType::ImplementationSpecific => path.to_string(),
        PathType::Prefix => {
            let trimmed = path.trim_end_matches('/');
            format!("{}/{}", trimmed, CATCH_ALL)
        }
    }
}

/// Ready endpoint addresses serving `port` of the service
fn destinations(
    cache: &Cache,
    service: &NamespacedName,
    port: &ServicePort,
    scheme: &str,
) -> BTreeMap<String, DestinationConfig> {
    let Some(endpoints) = cache.endpoints(service) else {
        return BTreeMap::new();
    };

    let mut destinations = BTreeMap::new();
    for subset in &endpoints.subsets {
        let endpoint_port = subset.ports.iter().find(|p| match &port.name {
            Some(name) => p.name.as_deref() == Some(name.as_str()),
            None => p.port == port.target_port(),
        });
        let Some(endpoint_port) = endpoint_port else {
            continue;
        };

        for address in &subset.addresses {
            let authority = format!("{}:{}", address, endpoint_port.port);
            destinations.insert(
                authority.clone(),
                DestinationConfig {
                    address: format!("{}://{}", scheme, authority),
                },
            );
        }
    }
    destinations
}
