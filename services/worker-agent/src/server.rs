//! Agent RPC server.
//!
//! The control plane drives backends through these endpoints. Every
//! `/v1` route requires the shared bearer token when one is configured.

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts, Path, State},
    http::{header::CONTENT_TYPE, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use gpufleet_id::InstanceId;
use gpufleet_types::StartBackendRequest;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::agent::WorkerAgent;
use crate::instance::StartError;

#[derive(Clone)]
pub struct AgentState {
    agent: Arc<WorkerAgent>,
    token: Option<Arc<str>>,
}

impl AgentState {
    pub fn new(agent: Arc<WorkerAgent>, token: Option<String>) -> Self {
        Self {
            agent,
            token: token.map(Into::into),
        }
    }
}

#[derive(Debug, Serialize)]
struct Problem {
    status: u16,
    code: &'static str,
    detail: String,
}

#[derive(Debug)]
pub struct AgentApiError {
    status: StatusCode,
    code: &'static str,
    detail: String,
}

impl AgentApiError {
    fn new(status: StatusCode, code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            code,
            detail: detail.into(),
        }
    }
}

impl From<StartError> for AgentApiError {
    fn from(err: StartError) -> Self {
        let (status, code) = match &err {
            StartError::UnsupportedBackend(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "unsupported_backend")
            }
            StartError::UnknownGpu(_) => (StatusCode::UNPROCESSABLE_ENTITY, "unknown_gpu"),
            // Ports free up as backends stop; worth retrying.
            StartError::NoPort => (StatusCode::SERVICE_UNAVAILABLE, "ports_exhausted"),
            StartError::Launch(_) => (StatusCode::UNPROCESSABLE_ENTITY, "launch_failed"),
        };
        Self::new(status, code, err.to_string())
    }
}

impl IntoResponse for AgentApiError {
    fn into_response(self) -> Response {
        let body = Problem {
            status: self.status.as_u16(),
            code: self.code,
            detail: self.detail,
        };
        let mut response = (self.status, Json(body)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

/// Proof that the caller presented the agent token.
pub struct Authorized;

impl<S> FromRequestParts<S> for Authorized
where
    S: Send + Sync,
    AgentState: FromRef<S>,
{
    type Rejection = AgentApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AgentState::from_ref(state);
        let Some(expected) = state.token.as_deref() else {
            return Ok(Authorized);
        };
        let presented = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().strip_prefix("Bearer "))
            .map(str::trim);
        match presented {
            Some(token) if token == expected => Ok(Authorized),
            Some(_) => Err(AgentApiError::new(
                StatusCode::UNAUTHORIZED,
                "invalid_token",
                "bearer token rejected",
            )),
            None => Err(AgentApiError::new(
                StatusCode::UNAUTHORIZED,
                "missing_token",
                "a bearer token is required",
            )),
        }
    }
}

pub fn create_router(state: AgentState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/backends", post(start_backend))
        .route("/v1/backends/{instance_id}", delete(stop_backend))
        .route("/v1/heartbeat", get(heartbeat))
        .route("/v1/drain", put(set_drain))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// POST /v1/backends
async fn start_backend(
    State(state): State<AgentState>,
    _auth: Authorized,
    Json(request): Json<StartBackendRequest>,
) -> Result<impl IntoResponse, AgentApiError> {
    let response = state.agent.instances().start(request).await?;
    Ok(Json(response))
}

/// DELETE /v1/backends/{instance_id}
async fn stop_backend(
    State(state): State<AgentState>,
    _auth: Authorized,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, AgentApiError> {
    let instance_id: InstanceId = instance_id.parse().map_err(|_| {
        AgentApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_instance_id",
            "Invalid instance ID format",
        )
    })?;
    Ok(Json(state.agent.instances().stop(instance_id).await))
}

/// GET /v1/heartbeat
async fn heartbeat(State(state): State<AgentState>, _auth: Authorized) -> impl IntoResponse {
    Json(state.agent.report().await)
}

#[derive(Debug, Deserialize)]
struct DrainRequest {
    draining: bool,
}

/// PUT /v1/drain
async fn set_drain(
    State(state): State<AgentState>,
    _auth: Authorized,
    Json(request): Json<DrainRequest>,
) -> impl IntoResponse {
    state.agent.set_draining(request.draining);
    Json(serde_json::json!({ "draining": state.agent.is_draining() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{port, request};
    use crate::backend::{BackendSet, MockBackend};
    use crate::config::SupervisionConfig;
    use crate::instance::InstanceManager;
    use crate::ports::PortAllocator;
    use axum::body::Body;
    use axum::http::Request;
    use gpufleet_id::WorkerId;
    use gpufleet_types::{BackendKind, Capacity, GpuDevice, GpuVendor};
    use tower::ServiceExt;

    fn router(token: Option<&str>) -> (Arc<WorkerAgent>, Router) {
        let port = port();
        let gpus = vec![
            GpuDevice {
                index: 0,
                class: "L4".into(),
                vendor: GpuVendor::Nvidia,
                memory_bytes: 24 << 30,
            },
            GpuDevice {
                index: 1,
                class: "L4".into(),
                vendor: GpuVendor::Nvidia,
                memory_bytes: 24 << 30,
            },
        ];
        let instances = InstanceManager::new(
            BackendSet::default().with(Arc::new(MockBackend::default())),
            PortAllocator::new(port..=port),
            "127.0.0.1".into(),
            gpus.clone(),
            SupervisionConfig::default(),
        )
        .unwrap();
        let agent = Arc::new(WorkerAgent::new(
            WorkerId::new(),
            "gpu-1".into(),
            "http://127.0.0.1:9400".into(),
            Default::default(),
            Capacity {
                gpus,
                cpu_millis: 8000,
                memory_bytes: 32 << 30,
            },
            Arc::new(instances),
        ));
        let router = create_router(AgentState::new(agent.clone(), token.map(String::from)));
        (agent, router)
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn start(body: &StartBackendRequest, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/v1/backends")
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn start_is_idempotent_and_shows_in_heartbeat() {
        let (agent, router) = router(None);
        let req = request(BackendKind::Mock);

        let (status, first) = send(&router, start(&req, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["state"], "starting");
        let (_, second) = send(&router, start(&req, None)).await;
        assert_eq!(first["endpoint"], second["endpoint"]);

        let (status, report) = send(
            &router,
            Request::get("/v1/heartbeat").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["worker_id"], agent.worker_id().to_string());
        assert_eq!(report["instances"].as_array().unwrap().len(), 1);

        agent.instances().stop_all().await;
    }

    #[tokio::test]
    async fn stop_acknowledges_unknown_instances() {
        let (_, router) = router(None);
        let id = InstanceId::new();
        let (status, body) = send(
            &router,
            Request::delete(format!("/v1/backends/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["acknowledged"], true);
    }

    #[tokio::test]
    async fn token_is_enforced() {
        let (_, router) = router(Some("s3cret"));
        let req = request(BackendKind::Mock);

        let (status, problem) = send(&router, start(&req, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(problem["code"], "missing_token");
        let (status, _) = send(&router, start(&req, Some("wrong"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(
            &router,
            Request::get("/healthz").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_gpu_is_unprocessable() {
        let (_, router) = router(None);
        let mut req = request(BackendKind::Mock);
        req.gpu_indexes = vec![7];
        let (status, problem) = send(&router, start(&req, None)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(problem["code"], "unknown_gpu");
    }

    #[tokio::test]
    async fn drain_flag_reaches_the_report() {
        let (agent, router) = router(None);
        let (status, _) = send(
            &router,
            Request::put("/v1/drain")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"draining":true}"#))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(agent.report().await.draining);
    }
}
