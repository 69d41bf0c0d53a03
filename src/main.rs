//! Binary entry point: load configuration, build the service container, run
//! until SIGINT/SIGTERM, tear down in order.
//!
//! Grounded on `services/forwarder/src/main.rs`'s shape: a `tracing_subscriber`
//! `fmt()` layer built from `RUST_LOG` (default `info`), fatal startup errors
//! logged then mapped to `std::process::exit(1)`, and a `tokio::signal`-driven
//! graceful shutdown.

use edge_gateway::config::GatewayConfig;
use edge_gateway::ServiceContainer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match GatewayConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    tracing::info!(
        edge_name = %config.edge_name,
        site_id = %config.site_id,
        tcp_port = config.tcp_port,
        "starting edge gateway"
    );

    let container = match ServiceContainer::build(config).await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize service container");
            std::process::exit(1);
        }
    };

    let shutdown_tx = container.shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    if let Err(e) = container.run().await {
        tracing::error!(error = %e, "service container exited with error");
        std::process::exit(1);
    }

    tracing::info!("edge gateway stopped");
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
