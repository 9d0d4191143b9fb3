//! Control plane API client for the worker agent.

use std::time::Duration;

use anyhow::{Context, Result};
use gpufleet_id::WorkerId;
use gpufleet_types::{HeartbeatAck, HeartbeatReport};
use tracing::{debug, error};

/// Control plane API client.
#[derive(Clone)]
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    worker_id: WorkerId,
    token: Option<String>,
}

impl ControlPlaneClient {
    pub fn new(base_url: &str, worker_id: WorkerId, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            worker_id,
            token,
        })
    }

    /// Push a heartbeat; the acknowledgement carries the next interval and
    /// any backends the control plane wants gone.
    pub async fn send_heartbeat(&self, report: &HeartbeatReport) -> Result<HeartbeatAck> {
        let url = format!("{}/v1/workers/{}/heartbeat", self.base_url, self.worker_id);
        debug!(url = %url, instances = report.instances.len(), "Sending heartbeat");

        let mut request = self.client.post(&url).json(report);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Heartbeat rejected");
            anyhow::bail!("Heartbeat failed: {} - {}", status, body);
        }

        Ok(response.json().await?)
    }
}
