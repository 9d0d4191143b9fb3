//! gpufleet Worker Agent
//!
//! ## Architecture
//!
//! - **RPC server**: accepts StartBackend/StopBackend from the control plane
//! - **Heartbeat loop**: reports capacity and backend state periodically
//! - **Supervisor**: probes backends and notices exits

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gpufleet_worker_agent::backend::BackendSet;
use gpufleet_worker_agent::client::ControlPlaneClient;
use gpufleet_worker_agent::config::Config;
use gpufleet_worker_agent::ports::PortAllocator;
use gpufleet_worker_agent::resources::HostResources;
use gpufleet_worker_agent::server::{create_router, AgentState};
use gpufleet_worker_agent::{heartbeat, InstanceManager, WorkerAgent};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        worker_id = %config.worker_id,
        name = %config.name,
        control_plane_url = %config.control_plane_url,
        gpus = config.gpus.len(),
        "Starting gpufleet worker agent"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let capacity = HostResources::measure().capacity(config.gpus.clone());
    let instances = Arc::new(InstanceManager::new(
        BackendSet::from_config(&config.binaries),
        PortAllocator::new(config.port_range.clone()),
        config.advertise_host.clone(),
        config.gpus.clone(),
        config.supervision.clone(),
    )?);
    let agent = Arc::new(WorkerAgent::new(
        config.worker_id,
        config.name.clone(),
        config.advertise_url.clone(),
        config.labels.clone(),
        capacity,
        Arc::clone(&instances),
    ));

    let supervisor_handle = tokio::spawn({
        let instances = Arc::clone(&instances);
        let shutdown_rx = shutdown_rx.clone();
        async move { instances.run(shutdown_rx).await }
    });

    let client = ControlPlaneClient::new(
        &config.control_plane_url,
        config.worker_id,
        config.agent_token.clone(),
    )?;
    let heartbeat_handle = tokio::spawn({
        let agent = Arc::clone(&agent);
        let interval = config.heartbeat_interval;
        let shutdown_rx = shutdown_rx.clone();
        async move { heartbeat::run_heartbeat_loop(agent, client, interval, shutdown_rx).await }
    });

    let app = create_router(AgentState::new(agent, config.agent_token.clone()));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Agent RPC server listening");

    let mut server_shutdown = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = heartbeat_handle => {
            match result {
                Ok(Ok(())) => info!("Heartbeat loop exited normally"),
                Ok(Err(e)) => error!(error = %e, "Heartbeat loop error"),
                Err(e) => error!(error = %e, "Heartbeat task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    // The supervisor stops every backend on its way out.
    if let Err(e) = supervisor_handle.await {
        error!(error = %e, "Supervisor task panicked");
    }
    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Agent server error"),
        Err(e) => error!(error = %e, "Agent server task panicked"),
    }

    info!("Worker agent shutdown complete");
    Ok(())
}
