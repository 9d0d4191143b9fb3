//! Heartbeat loop reporting this worker to the control plane.
//!
//! Every heartbeat carries the full state of every backend; the control plane
//! treats it as the only evidence that instances are alive.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use gpufleet_types::HeartbeatAck;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::agent::WorkerAgent;
use crate::client::ControlPlaneClient;

/// Sends one heartbeat and acts on the acknowledgement.
pub async fn beat(agent: &WorkerAgent, client: &ControlPlaneClient) -> Result<HeartbeatAck> {
    let report = agent.report().await;
    let ack = client.send_heartbeat(&report).await?;

    for instance_id in &ack.stop_instances {
        info!(instance_id = %instance_id, "Control plane disowned backend, stopping");
        agent.instances().stop(*instance_id).await;
    }
    Ok(ack)
}

/// Run the heartbeat loop until shutdown.
pub async fn run_heartbeat_loop(
    agent: Arc<WorkerAgent>,
    client: ControlPlaneClient,
    initial_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(
        worker_id = %agent.worker_id(),
        interval_secs = initial_interval.as_secs(),
        "Starting heartbeat loop"
    );

    let mut interval = initial_interval;
    let mut consecutive_failures = 0u32;
    // First heartbeat goes out immediately so the worker registers.
    let mut wait = Duration::ZERO;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                match beat(&agent, &client).await {
                    Ok(ack) => {
                        consecutive_failures = 0;
                        if ack.next_heartbeat_secs > 0 {
                            interval = Duration::from_secs(ack.next_heartbeat_secs);
                        }
                        debug!(
                            accepted = ack.accepted,
                            next_interval = ack.next_heartbeat_secs,
                            stopped = ack.stop_instances.len(),
                            "Heartbeat acknowledged"
                        );
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(
                                error = %e,
                                consecutive_failures,
                                "Heartbeat failed"
                            );
                        } else {
                            error!(
                                error = %e,
                                consecutive_failures,
                                "Heartbeat failed repeatedly"
                            );
                        }
                    }
                }
                wait = interval;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Heartbeat loop shutting down");
                    break;
                }
            }
        }
    }

    Ok(())
}
