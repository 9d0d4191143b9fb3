//! Client for the worker agent RPC.
//!
//! Calls are at-least-once and idempotent per instance id on the agent side,
//! so the controller may retry any of them freely. A successful StartBackend
//! only means the agent accepted the request; liveness is confirmed by
//! heartbeats.

use std::time::Duration;

use async_trait::async_trait;
use gpufleet_id::InstanceId;
use gpufleet_types::{
    HeartbeatReport, StartBackendRequest, StartBackendResponse, StopBackendResponse, Worker,
};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent could not be reached; worth retrying on a later pass.
    #[error("worker agent unreachable: {0}")]
    Unreachable(String),

    /// The agent answered and refused the request.
    #[error("worker agent rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("worker agent request timed out")]
    Timeout,
}

impl AgentError {
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Unreachable(_) | AgentError::Timeout => true,
            AgentError::Rejected { status, .. } => *status >= 500,
        }
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AgentError::Timeout
        } else {
            AgentError::Unreachable(err.to_string())
        }
    }
}

#[async_trait]
pub trait WorkerAgentClient: Send + Sync + 'static {
    async fn start_backend(
        &self,
        worker: &Worker,
        request: &StartBackendRequest,
    ) -> Result<StartBackendResponse, AgentError>;

    async fn stop_backend(
        &self,
        worker: &Worker,
        instance_id: InstanceId,
    ) -> Result<StopBackendResponse, AgentError>;

    /// Pulls a fresh report, used to confirm a worker before declaring it
    /// lost.
    async fn heartbeat(&self, worker: &Worker) -> Result<HeartbeatReport, AgentError>;
}

/// [`WorkerAgentClient`] over HTTP/JSON.
#[derive(Clone)]
pub struct HttpAgentClient {
    client: reqwest::Client,
    token: Option<String>,
}

impl HttpAgentClient {
    pub fn new(timeout: Duration, token: Option<String>) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .build()
            .map_err(|e| AgentError::Unreachable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, token })
    }

    fn url(worker: &Worker, path: &str) -> String {
        format!("{}{}", worker.address.trim_end_matches('/'), path)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, AgentError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(AgentError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl WorkerAgentClient for HttpAgentClient {
    async fn start_backend(
        &self,
        worker: &Worker,
        request: &StartBackendRequest,
    ) -> Result<StartBackendResponse, AgentError> {
        let url = Self::url(worker, "/v1/backends");
        debug!(worker_id = %worker.id, instance_id = %request.instance_id, "StartBackend");

        let response = self
            .authorize(self.client.post(&url).json(request))
            .send()
            .await?;
        let body = Self::check(response).await?.json().await?;
        Ok(body)
    }

    async fn stop_backend(
        &self,
        worker: &Worker,
        instance_id: InstanceId,
    ) -> Result<StopBackendResponse, AgentError> {
        let url = Self::url(worker, &format!("/v1/backends/{instance_id}"));
        debug!(worker_id = %worker.id, %instance_id, "StopBackend");

        let response = self.authorize(self.client.delete(&url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(StopBackendResponse {
                instance_id,
                acknowledged: true,
            });
        }
        let body = Self::check(response).await?.json().await?;
        Ok(body)
    }

    async fn heartbeat(&self, worker: &Worker) -> Result<HeartbeatReport, AgentError> {
        let url = Self::url(worker, "/v1/heartbeat");
        let response = self.authorize(self.client.get(&url)).send().await?;
        let body = Self::check(response).await?.json().await?;
        Ok(body)
    }
}
