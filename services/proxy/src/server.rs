//! Client-facing inference API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use gpufleet_id::RequestId;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::error::{ProblemResponse, ProxyError};
use crate::forward::{Forwarder, InferenceRequest, REQUEST_ID_HEADER, REVISION_HEADER};
use crate::routing::RouteTable;

#[derive(Clone)]
pub struct ProxyState {
    table: Arc<RouteTable>,
    forwarder: Arc<Forwarder>,
    ready: Arc<AtomicBool>,
}

impl ProxyState {
    pub fn new(table: Arc<RouteTable>, forwarder: Arc<Forwarder>, ready: Arc<AtomicBool>) -> Self {
        Self {
            table,
            forwarder,
            ready,
        }
    }
}

pub fn create_router(state: ProxyState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/v1/models", get(list_models))
        .route("/v1/{*path}", any(proxy_request))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Ready once the route table reflects control plane state.
async fn readyz(State(state): State<ProxyState>) -> impl IntoResponse {
    if state.ready.load(Ordering::Acquire) {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "route table not synced")
    }
}

#[derive(Debug, Serialize)]
struct ModelCard {
    id: String,
    object: &'static str,
    owned_by: &'static str,
}

#[derive(Debug, Serialize)]
struct ModelList {
    object: &'static str,
    data: Vec<ModelCard>,
}

/// GET /v1/models
///
/// Models with at least one running instance.
async fn list_models(State(state): State<ProxyState>) -> impl IntoResponse {
    let data = state
        .table
        .models()
        .into_iter()
        .map(|id| ModelCard {
            id,
            object: "model",
            owned_by: "gpufleet",
        })
        .collect();
    Json(ModelList {
        object: "list",
        data,
    })
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| RequestId::new().to_string())
}

fn revision(headers: &HeaderMap) -> Result<Option<u64>, ProxyError> {
    let Some(raw) = headers.get(REVISION_HEADER) else {
        return Ok(None);
    };
    raw.to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| {
            ProxyError::bad_request("invalid_revision", "x-model-revision must be an integer")
        })
}

/// The model a request is for: the `model` field of a JSON body, or the
/// `model` query parameter for body-less requests.
fn model_of(body: &[u8], query: Option<&str>) -> Result<String, ProxyError> {
    if body.is_empty() {
        return query
            .into_iter()
            .flat_map(|q| q.split('&'))
            .find_map(|pair| pair.strip_prefix("model="))
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ProxyError::bad_request("model_required", "request names no model"));
    }

    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|_| ProxyError::bad_request("invalid_json", "request body is not valid JSON"))?;
    match value.get("model") {
        Some(serde_json::Value::String(model)) if !model.is_empty() => Ok(model.clone()),
        Some(_) => Err(ProxyError::bad_request(
            "invalid_model",
            "the model field must be a non-empty string",
        )),
        None => Err(ProxyError::bad_request(
            "model_required",
            "request body has no model field",
        )),
    }
}

/// Any other /v1 call is an inference request for some model.
async fn proxy_request(State(state): State<ProxyState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let request_id = request_id(&parts.headers);

    match resolve_and_forward(&state, parts, body, &request_id).await {
        Ok(response) => response,
        Err(error) => {
            debug!(request_id = %request_id, code = error.code(), error = %error, "Request failed");
            ProblemResponse { error, request_id }.into_response()
        }
    }
}

async fn resolve_and_forward(
    state: &ProxyState,
    parts: axum::http::request::Parts,
    body: Body,
    request_id: &str,
) -> Result<Response, ProxyError> {
    let limit = state.forwarder.config().max_body_bytes;
    let body = axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| ProxyError::BodyTooLarge { limit })?;

    let revision = revision(&parts.headers)?;
    let model = model_of(&body, parts.uri.query())?;
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    state
        .forwarder
        .forward(InferenceRequest {
            model,
            revision,
            method: parts.method,
            path_and_query,
            headers: parts.headers,
            body,
            request_id: request_id.to_string(),
        })
        .await
}
