use crate::rate::{Limit, Limiter};
use crate::resources::{Endpoints, Ingress, NamespacedName, Resource, Service};
use crate::workqueue::{BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter, QueueKey};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Global configuration for the control plane
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Dispatch server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Reconciliation settings
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Work queue retry settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Settings for the receiver binary
    #[serde(default)]
    pub receiver: ReceiverConfig,

    /// Ingress manifests
    #[serde(default)]
    pub ingresses: Vec<Ingress>,

    /// Service manifests
    #[serde(default)]
    pub services: Vec<Service>,

    /// Endpoints manifests
    #[serde(default)]
    pub endpoints: Vec<Endpoints>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port proxies subscribe on (default: 8090)
    #[serde(default = "default_dispatch_port")]
    pub dispatch_port: u16,

    /// Seconds between heartbeats on idle dispatch streams (default: 30)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Messages buffered per subscriber before it is dropped (default: 16)
    #[serde(default = "default_target_buffer")]
    pub target_buffer: usize,
}

impl ServerConfig {
    pub fn dispatch_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", self.bind, e))?;
        Ok(SocketAddr::new(ip, self.dispatch_port))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            dispatch_port: default_dispatch_port(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            target_buffer: default_target_buffer(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControllerConfig {
    /// Ingress class handled by this controller (default: "ingressgate").
    /// An empty string handles every ingress.
    #[serde(default = "default_ingress_class")]
    pub ingress_class: String,

    /// Also handle ingresses without a class (default: false)
    #[serde(default)]
    pub default_class: bool,

    /// Concurrent reconcile workers (default: 1)
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl ControllerConfig {
    pub fn ingress_class(&self) -> Option<String> {
        let class = self.ingress_class.trim();
        (!class.is_empty()).then(|| class.to_string())
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ingress_class: default_ingress_class(),
            default_class: false,
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Overall retry rate across all keys (default: 10/s)
    #[serde(default = "default_queue_qps")]
    pub qps: f64,

    /// Retries allowed back to back (default: 100)
    #[serde(default = "default_queue_burst")]
    pub burst: u32,

    /// First per-key retry delay in milliseconds (default: 5)
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Cap on the per-key retry delay in milliseconds (default: 1000s)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl QueueConfig {
    /// Per-key exponential backoff combined with an overall bucket
    pub fn rate_limiter<T: QueueKey>(&self) -> MaxOfRateLimiter<T> {
        MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(self.base_delay_ms),
                Duration::from_millis(self.max_delay_ms),
            )),
            Box::new(BucketRateLimiter::new(Limit::per_second(self.qps), self.burst)),
        ])
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            qps: default_queue_qps(),
            burst: default_queue_burst(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReceiverConfig {
    /// Dispatch stream to follow
    #[serde(default = "default_receiver_url")]
    pub url: String,

    /// Sustained connection attempts per second (default: 2)
    #[serde(default = "default_reconnect_qps")]
    pub reconnect_qps: f64,

    /// Connection attempts allowed back to back (default: 2)
    #[serde(default = "default_reconnect_burst")]
    pub reconnect_burst: u32,
}

impl ReceiverConfig {
    pub fn limiter(&self) -> Limiter {
        Limiter::new(Limit::per_second(self.reconnect_qps), self.reconnect_burst)
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            url: default_receiver_url(),
            reconnect_qps: default_reconnect_qps(),
            reconnect_burst: default_reconnect_burst(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_dispatch_port() -> u16 {
    8090
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_target_buffer() -> usize {
    16
}

fn default_ingress_class() -> String {
    "ingressgate".to_string()
}

fn default_workers() -> usize {
    1
}

fn default_queue_qps() -> f64 {
    10.0
}

fn default_queue_burst() -> u32 {
    100
}

fn default_base_delay() -> u64 {
    5
}

fn default_max_delay() -> u64 {
    1_000_000
}

fn default_receiver_url() -> String {
    "http://127.0.0.1:8090/api/dispatch".to_string()
}

fn default_reconnect_qps() -> f64 {
    2.0
}

fn default_reconnect_burst() -> u32 {
    2
}

fn check_rate(name: &str, value: f64, errors: &mut Vec<String>) {
    if !(value.is_finite() && value > 0.0) {
        errors.push(format!("'{}' must be a positive number, got {}", name, value));
    }
}

fn check_unique<R: Resource>(items: &[R], errors: &mut Vec<String>) {
    let mut seen: HashSet<NamespacedName> = HashSet::new();
    for item in items {
        let key = item.key();
        if key.name.is_empty() {
            errors.push(format!("{} in namespace '{}' has an empty name", R::KIND, key.namespace));
        } else if !seen.insert(key.clone()) {
            errors.push(format!("{} '{}' is defined more than once", R::KIND, key));
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.server.dispatch_addr() {
            errors.push(e.to_string());
        }
        if self.server.heartbeat_interval_secs == 0 {
            errors.push("'heartbeat_interval_secs' must be greater than 0".to_string());
        }
        if self.server.target_buffer == 0 {
            errors.push("'target_buffer' must be greater than 0".to_string());
        }

        if self.controller.workers == 0 {
            errors.push("'workers' must be greater than 0".to_string());
        }

        check_rate("queue.qps", self.queue.qps, &mut errors);
        if self.queue.burst == 0 {
            errors.push("'queue.burst' must be greater than 0".to_string());
        }
        if self.queue.base_delay_ms > self.queue.max_delay_ms {
            errors.push(format!(
                "'base_delay_ms' ({}) must not exceed 'max_delay_ms' ({})",
                self.queue.base_delay_ms, self.queue.max_delay_ms
            ));
        }

        check_rate("receiver.reconnect_qps", self.receiver.reconnect_qps, &mut errors);
        if self.receiver.reconnect_burst == 0 {
            errors.push("'receiver.reconnect_burst' must be greater than 0".to_string());
        }
        if !self.receiver.url.starts_with("http://") {
            errors.push(format!("Receiver url '{}' must start with http://", self.receiver.url));
        }

        check_unique(&self.ingresses, &mut errors);
        check_unique(&self.services, &mut errors);
        check_unique(&self.endpoints, &mut errors);

        for ingress in &self.ingresses {
            for path in ingress.rules.iter().flat_map(|rule| rule.paths.iter()) {
                if path.backend.service.is_empty() {
                    errors.push(format!("Ingress '{}': backend service must not be empty", ingress.key()));
                }
                if path.backend.port == 0 {
                    errors.push(format!("Ingress '{}': backend port must be greater than 0", ingress.key()));
                }
                if !path.path.starts_with('/') {
                    errors.push(format!("Ingress '{}': path '{}' must start with '/'", ingress.key(), path.path));
                }
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
