use ingressgate::cache::Cache;
use ingressgate::config::Config;
use ingressgate::controller::Controller;
use ingressgate::dispatch::server::{PKG_NAME, VERSION};
use ingressgate::dispatch::{DispatchServer, Dispatcher};
use ingressgate::reconciler::DispatchReconciler;
use ingressgate::resources::{Endpoints, Ingress, NamespacedName, Service};
use ingressgate::source::ManifestSource;
use ingressgate::workqueue::RateLimitingQueue;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Sources fed from the manifest sections of the configuration file
struct ManifestSources {
    ingresses: Arc<ManifestSource<Ingress>>,
    services: Arc<ManifestSource<Service>>,
    endpoints: Arc<ManifestSource<Endpoints>>,
}

impl ManifestSources {
    fn new(config: &Config) -> Self {
        Self {
            ingresses: Arc::new(ManifestSource::new(config.ingresses.clone())),
            services: Arc::new(ManifestSource::new(config.services.clone())),
            endpoints: Arc::new(ManifestSource::new(config.endpoints.clone())),
        }
    }

    /// Reload manifests from `path`. Only the manifest sections take effect
    /// without a restart.
    fn reload(&self, path: &Path) -> anyhow::Result<(usize, usize, usize)> {
        let config = Config::load(path)?;
        Ok((
            self.ingresses.replace(config.ingresses),
            self.services.replace(config.services),
            self.endpoints.replace(config.endpoints),
        ))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ingressgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("ingressgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(
        path = %config_path.display(),
        name = PKG_NAME,
        version = VERSION,
        ingresses = config.ingresses.len(),
        services = config.services.len(),
        endpoints = config.endpoints.len(),
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();
    let sources = ManifestSources::new(&config);

    let dispatcher = Arc::new(Dispatcher::new());
    let dispatch_addr = config.server.dispatch_addr()?;
    let dispatch_server = DispatchServer::new(dispatch_addr, Arc::clone(&dispatcher), shutdown.clone())
        .with_heartbeat_interval(config.server.heartbeat_interval())
        .with_target_buffer(config.server.target_buffer);

    let cache = Arc::new(Cache::new(
        config.controller.ingress_class(),
        config.controller.default_class,
    ));
    info!(
        ingress_class = ?config.controller.ingress_class(),
        default_class = config.controller.default_class,
        "Ingress class filter configured"
    );

    let reconciler = Arc::new(DispatchReconciler::new(Arc::clone(&cache), Arc::clone(&dispatcher)));
    let queue = RateLimitingQueue::new(Box::new(config.queue.rate_limiter::<NamespacedName>()));
    let controller = Controller::new(
        sources.ingresses.clone(),
        sources.services.clone(),
        sources.endpoints.clone(),
        cache,
        queue,
        reconciler,
    )
    .with_workers(config.controller.workers);

    // Spawn dispatch server
    let server_handle = tokio::spawn(async move {
        if let Err(e) = dispatch_server.run().await {
            error!(error = %e, "Dispatch server error");
        }
    });

    // Spawn controller
    let controller_shutdown = shutdown.clone();
    let controller_handle = tokio::spawn(async move {
        if let Err(e) = controller.run(controller_shutdown).await {
            error!(error = %e, "Controller error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or manifest reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading manifests...");
                    match sources.reload(&config_path) {
                        Ok((ingresses, services, endpoints)) => {
                            info!(ingresses, services, endpoints, "Manifests reloaded");
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to reload manifests");
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    shutdown.cancel();

    // Wait for the controller and server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = controller_handle.await;
        let _ = server_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}
