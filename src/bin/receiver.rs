//! Follows a dispatch stream and logs every configuration it receives.
//!
//! Usage: `ingressgate-receiver [config.toml]`. Without a file the defaults
//! of the `[receiver]` section are used.

use ingressgate::config::Config;
use ingressgate::receiver::{LoggingSink, Receiver};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ingressgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path).map_err(|e| {
            error!(path = %path, error = %e, "Failed to load configuration");
            e
        })?,
        None => Config::default(),
    };

    let receiver = Receiver::new(&config.receiver.url, Arc::new(LoggingSink))?
        .with_limiter(config.receiver.limiter());
    info!(
        url = %receiver.uri(),
        reconnect_qps = config.receiver.reconnect_qps,
        reconnect_burst = config.receiver.reconnect_burst,
        "Receiver configured"
    );

    let shutdown = CancellationToken::new();
    let receiver_shutdown = shutdown.clone();
    let handle = tokio::spawn(async move { receiver.run(receiver_shutdown).await });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;

    info!("Shutdown complete");
    Ok(())
}
