//! gpufleet Proxy
//!
//! This service:
//! - Syncs the route table from the control plane event feed
//! - Accepts OpenAI-style inference requests and routes them by model
//! - Streams backend responses to the client

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gpufleet_proxy::config::Config;
use gpufleet_proxy::{create_router, Balancer, Forwarder, ProxyState, RouteSync, RouteTable};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to FLEET_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        listen_addr = %config.listen_addr,
        control_plane_url = %config.control_plane_url,
        policy = %config.policy,
        "Starting gpufleet proxy"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let table = Arc::new(RouteTable::new());
    let balancer = Arc::new(Balancer::new(config.policy, config.suspect_cooldown));
    let forwarder = Arc::new(Forwarder::new(
        Arc::clone(&table),
        Arc::clone(&balancer),
        config.forward.clone(),
    )?);

    let sync = RouteSync::new(
        &config.control_plane_url,
        config.control_plane_token.as_deref(),
        config.sync.clone(),
        Arc::clone(&table),
        balancer,
    )?;
    let ready = sync.ready_flag();
    let sync_handle = tokio::spawn(sync.run(shutdown_rx.clone()));

    let app = create_router(ProxyState::new(table, forwarder, ready));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Proxy listening");

    let mut server_shutdown = shutdown_rx;
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    if let Err(e) = sync_handle.await {
        error!(error = %e, "Route sync task panicked");
    }
    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Proxy server error"),
        Err(e) => error!(error = %e, "Proxy server task panicked"),
    }

    info!("Proxy shutdown complete");
    Ok(())
}
