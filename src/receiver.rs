//! Remote side of configuration dispatch
//!
//! A [`Receiver`] keeps one streaming connection to the dispatch server at a
//! time and hands every configuration update to a [`ConfigSink`], which owns
//! the actual proxy. Connection attempts are rate limited so a dispatcher that
//! keeps dropping connections is not hammered.

use crate::dispatch::{Message, MessageType};
use crate::error::{LimiterError, ReceiverError};
use crate::rate::{Limit, Limiter};
use crate::snapshot::{ClusterConfig, RouteConfig};
use async_trait::async_trait;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection attempts allowed back to back
pub const DEFAULT_RECONNECT_BURST: u32 = 2;
/// Sustained spacing between connection attempts
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(500);

/// Applies configuration to the proxy this receiver serves
#[async_trait]
pub trait ConfigSink: Send + Sync + 'static {
    async fn apply_config(
        &self,
        routes: Vec<RouteConfig>,
        clusters: Vec<ClusterConfig>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Sink that only logs what it would apply
#[derive(Debug, Default)]
pub struct LoggingSink;

#[async_trait]
impl ConfigSink for LoggingSink {
    async fn apply_config(
        &self,
        routes: Vec<RouteConfig>,
        clusters: Vec<ClusterConfig>,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        info!(routes = routes.len(), clusters = clusters.len(), "Configuration received");
        for route in &routes {
            debug!(
                route_id = %route.route_id,
                cluster_id = %route.cluster_id,
                hosts = ?route.route_match.hosts,
                path = ?route.route_match.path,
                "Route"
            );
        }
        for cluster in &clusters {
            debug!(
                cluster_id = %cluster.cluster_id,
                destinations = cluster.destinations.len(),
                "Cluster"
            );
        }
        Ok(())
    }
}

/// Client loop following the dispatch stream
pub struct Receiver {
    uri: Uri,
    limiter: Limiter,
    sink: Arc<dyn ConfigSink>,
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl Receiver {
    pub fn new(url: &str, sink: Arc<dyn ConfigSink>) -> Result<Self, ReceiverError> {
        let invalid = |reason: &str| ReceiverError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let uri = url.parse::<Uri>().map_err(|e| invalid(e.to_string().as_str()))?;
        if uri.scheme_str() != Some("http") {
            return Err(invalid("only http is supported"));
        }
        if uri.host().is_none() {
            return Err(invalid("missing host"));
        }

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self {
            uri,
            limiter: Limiter::new(Limit::every(DEFAULT_RECONNECT_INTERVAL), DEFAULT_RECONNECT_BURST),
            sink,
            client,
        })
    }

    /// Replace the limiter spacing connection attempts
    pub fn with_limiter(mut self, limiter: Limiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Connect, follow the stream and reconnect until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!(url = %self.uri, "Receiver started");

        loop {
            match self.limiter.wait(&cancel).await {
                Ok(()) => {}
                Err(LimiterError::Cancelled) => break,
                Err(LimiterError::WouldExceedWait { max_wait }) => {
                    // Other receivers on this limiter hold the upcoming tokens
                    debug!(retry_ms = max_wait.as_millis() as u64, "Reconnect limiter busy");
                    tokio::select! {
                        _ = tokio::time::sleep(max_wait) => continue,
                        _ = cancel.cancelled() => break,
                    }
                }
                Err(e) => {
                    error!(error = %e, "Reconnect limiter misconfigured, stopping receiver");
                    break;
                }
            }

            match self.connect_once(&cancel).await {
                Ok(()) if cancel.is_cancelled() => break,
                Ok(()) => info!(url = %self.uri, "Dispatch stream ended, reconnecting"),
                Err(e) => warn!(url = %self.uri, error = %e, "Dispatch connection failed"),
            }
        }

        info!("Receiver stopped");
    }

    /// Follow one connection until the stream ends, fails or is cancelled
    pub async fn connect_once(&self, cancel: &CancellationToken) -> Result<(), ReceiverError> {
        let request = Request::get(self.uri.clone())
            .header("accept", "application/x-ndjson")
            .body(Empty::<Bytes>::new())
            .map_err(|e| ReceiverError::InvalidUrl {
                url: self.uri.to_string(),
                reason: e.to_string(),
            })?;

        let response = tokio::select! {
            result = self.client.request(request) => result?,
            _ = cancel.cancelled() => return Ok(()),
        };
        if !response.status().is_success() {
            return Err(ReceiverError::Status(response.status()));
        }
        info!(url = %self.uri, "Connected to dispatcher");

        let mut body = response.into_body();
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let frame = tokio::select! {
                frame = body.frame() => frame,
                _ = cancel.cancelled() => return Ok(()),
            };
            let Some(frame) = frame else {
                let rest = buffer.strip_suffix(b"\r").unwrap_or(&buffer[..]);
                if !rest.is_empty() {
                    self.handle_line(rest, cancel).await;
                }
                return Ok(());
            };
            let Ok(data) = frame?.into_data() else {
                continue;
            };
            buffer.extend_from_slice(&data);

            while let Some(end) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=end).collect();
                let line = &line[..end];
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                if line.is_empty() {
                    debug!("Dispatcher ended the stream");
                    return Ok(());
                }
                self.handle_line(line, cancel).await;
            }
        }
    }

    async fn handle_line(&self, line: &[u8], cancel: &CancellationToken) {
        let message = match Message::from_line(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Skipping malformed dispatch message");
                return;
            }
        };

        match message.message_type {
            MessageType::Update => {
                debug!(key = %message.key, "Applying configuration update");
                if let Err(e) = self
                    .sink
                    .apply_config(message.routes, message.cluster, cancel)
                    .await
                {
                    warn!(key = %message.key, error = %e, "Failed to apply configuration");
                }
            }
            MessageType::Remove => debug!(key = %message.key, "Remove notice received"),
            MessageType::Heartbeat => debug!("Heartbeat received"),
        }
    }
}
