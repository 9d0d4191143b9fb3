//! gpufleet control plane
//!
//! Serves the model and worker API, ingests worker heartbeats and runs the
//! model controller and the worker liveness monitor.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use gpufleet_control_plane::{
    agent_client::HttpAgentClient,
    config,
    runtime::{open_store, ControlPlane},
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to FLEET_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting gpufleet control plane");
    info!(
        listen_addr = %config.listen_addr,
        store = ?config.store,
        "Configuration loaded"
    );

    let store = match open_store(&config).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "Failed to open state store");
            return Err(e.into());
        }
    };
    let agents = Arc::new(HttpAgentClient::new(
        config.agent_timeout,
        config.agent_token.clone(),
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let control_plane = ControlPlane::new(store, agents, &config);
    let app = control_plane.router();
    let tasks = control_plane.spawn(shutdown_rx.clone());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    tasks.join(Duration::from_secs(10)).await;

    info!("Control plane shutdown complete");
    Ok(())
}
