//! Worker API endpoints.
//!
//! Agents push heartbeats here; the first heartbeat registers the worker.

use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use gpufleet_id::WorkerId;
use gpufleet_types::{Capacity, HeartbeatReport, Reservation, Usage, Worker, WorkerHealth};
use serde::Serialize;
use std::collections::BTreeMap;

use super::list::ListParams;
use super::watch::{watch, Watched};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_workers))
        .route("/{worker_id}/heartbeat", post(heartbeat))
}

#[derive(Debug, Serialize)]
pub struct WorkerResponse {
    pub id: String,
    pub name: String,
    pub address: String,
    pub health: WorkerHealth,
    pub capacity: Capacity,
    pub labels: BTreeMap<String, String>,
    pub reserved: ReservedResources,
    pub last_heartbeat_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl WorkerResponse {
    /// Renders the worker with the sum of the reservations it holds.
    pub fn new(worker: Worker, reservations: &[Reservation]) -> Self {
        let usage =
            Usage::from_reservations(reservations.iter().filter(|r| r.worker_id == worker.id));
        Self {
            id: worker.id.to_string(),
            name: worker.name,
            address: worker.address,
            health: worker.health,
            capacity: worker.capacity,
            labels: worker.labels,
            reserved: usage.into(),
            last_heartbeat_at: worker.last_heartbeat_at,
            created_at: worker.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReservedResources {
    pub gpu_indexes: Vec<u32>,
    pub memory_bytes: u64,
    pub cpu_millis: u64,
}

impl From<Usage> for ReservedResources {
    fn from(usage: Usage) -> Self {
        Self {
            gpu_indexes: usage.gpu_indexes.into_iter().collect(),
            memory_bytes: usage.memory_bytes,
            cpu_millis: usage.cpu_millis,
        }
    }
}

/// POST /v1/workers/{worker_id}/heartbeat
async fn heartbeat(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(worker_id): Path<String>,
    Json(report): Json<HeartbeatReport>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.require_token(state.agent_token())?;
    let request_id = ctx.request_id;

    let worker_id: WorkerId = worker_id.parse().map_err(|_| {
        ApiError::bad_request("invalid_worker_id", "Invalid worker ID format")
            .with_request_id(request_id.clone())
    })?;
    if worker_id != report.worker_id {
        return Err(ApiError::bad_request(
            "worker_id_mismatch",
            "report worker_id does not match the path",
        )
        .with_request_id(request_id));
    }

    let ack = state
        .heartbeats()
        .ingest(&report, Utc::now())
        .await
        .map_err(|e| ApiError::store(e, &request_id))?;
    Ok(Json(ack))
}

/// GET /v1/workers?page=&perPage=&search=&watch=
async fn list_workers(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    let request_id = ctx.request_id;
    params.validate(&request_id)?;
    let store = state.store();
    if params.watch {
        let stream = watch(state.shared_store(), Watched::Workers, params.search)
            .await
            .map_err(|e| ApiError::store(e, &request_id))?;
        return Ok(stream.into_response());
    }

    let workers = store
        .list_workers()
        .await
        .map_err(|e| ApiError::store(e, &request_id))?;
    let reservations = store
        .list_reservations()
        .await
        .map_err(|e| ApiError::store(e, &request_id))?;

    let items: Vec<WorkerResponse> = workers
        .into_iter()
        .map(|w| WorkerResponse::new(w, &reservations))
        .collect();
    Ok(Json(params.paginate(items, |w| w.name.as_str())).into_response())
}
