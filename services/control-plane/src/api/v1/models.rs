//! Model API endpoints.
//!
//! Models are addressed by name: PUT creates or revises, DELETE marks the
//! model for deletion and the controller drains and purges it.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use gpufleet_types::{InstanceState, Model, ModelSpec, ModelStatus};
use serde::Serialize;
use tracing::info;

use super::list::{ListParams, Page};
use super::watch::{watch, Watched};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::db::ApplyOutcome;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_models))
        .route(
            "/{name}",
            get(get_model).put(apply_model).delete(delete_model),
        )
}

#[derive(Debug, Serialize)]
pub struct ModelResponse {
    pub id: String,
    pub name: String,
    pub revision: u64,
    pub template_hash: String,
    pub deleting: bool,
    pub spec: ModelSpec,
    pub status: ModelStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Model> for ModelResponse {
    fn from(model: Model) -> Self {
        Self {
            id: model.id.to_string(),
            name: model.spec.name.clone(),
            revision: model.revision,
            template_hash: model.template_hash,
            deleting: model.deleting,
            spec: model.spec,
            status: model.status,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApplyModelResponse {
    #[serde(flatten)]
    pub model: ModelResponse,
    /// "created", "revised" or "unchanged".
    pub outcome: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ModelDetailResponse {
    #[serde(flatten)]
    pub model: ModelResponse,
    pub instances: InstanceCounts,
}

#[derive(Debug, Default, Serialize)]
pub struct InstanceCounts {
    pub pending: u32,
    pub scheduled: u32,
    pub starting: u32,
    pub running: u32,
    pub unhealthy: u32,
    pub terminating: u32,
    pub failed: u32,
}

/// Parses the body as a spec; the path names the model and a `name` in the
/// body, when present, must agree with it.
fn parse_spec(name: &str, mut body: serde_json::Value, request_id: &str) -> Result<ModelSpec, ApiError> {
    let Some(fields) = body.as_object_mut() else {
        return Err(
            ApiError::bad_request("invalid_body", "model spec must be a JSON object")
                .with_request_id(request_id),
        );
    };
    match fields.get("name").and_then(|v| v.as_str()) {
        Some(given) if given != name => {
            return Err(ApiError::bad_request(
                "name_mismatch",
                format!("body names model '{given}' but the path names '{name}'"),
            )
            .with_request_id(request_id));
        }
        _ => {
            fields.insert("name".into(), serde_json::Value::String(name.to_string()));
        }
    }
    serde_json::from_value(body).map_err(|e| {
        ApiError::bad_request("invalid_spec", format!("invalid model spec: {e}"))
            .with_request_id(request_id)
    })
}

/// PUT /v1/models/{name}
async fn apply_model(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id.clone();
    let spec = parse_spec(&name, body, &request_id)?;
    spec.validate().map_err(|e| {
        ApiError::unprocessable("invalid_spec", e.to_string()).with_request_id(request_id.clone())
    })?;

    let result = state
        .store()
        .apply_model(spec, Utc::now())
        .await
        .map_err(|e| ApiError::store(e, &request_id))?;

    let (status, outcome) = match result.outcome {
        ApplyOutcome::Created => (StatusCode::CREATED, "created"),
        ApplyOutcome::Revised => (StatusCode::OK, "revised"),
        ApplyOutcome::Unchanged => (StatusCode::OK, "unchanged"),
    };
    if result.outcome != ApplyOutcome::Unchanged {
        info!(
            model = %name,
            revision = result.model.revision,
            outcome,
            request_id = %request_id,
            "Model applied"
        );
    }
    state.trigger().notify(result.model.id);

    Ok((
        status,
        Json(ApplyModelResponse {
            model: result.model.into(),
            outcome,
        }),
    ))
}

/// GET /v1/models?page=&perPage=&search=&watch=
async fn list_models(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    let request_id = ctx.request_id;
    params.validate(&request_id)?;
    if params.watch {
        let stream = watch(state.shared_store(), Watched::Models, params.search)
            .await
            .map_err(|e| ApiError::store(e, &request_id))?;
        return Ok(stream.into_response());
    }

    let models = state
        .store()
        .list_models()
        .await
        .map_err(|e| ApiError::store(e, &request_id))?;
    let items: Vec<ModelResponse> = models.into_iter().map(Into::into).collect();
    let page: Page<ModelResponse> = params.paginate(items, |m| m.name.as_str());
    Ok(Json(page).into_response())
}

/// GET /v1/models/{name}
async fn get_model(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    let model = state
        .store()
        .get_model_by_name(&name)
        .await
        .map_err(|e| ApiError::store(e, &request_id))?
        .ok_or_else(|| {
            ApiError::not_found("model_not_found", format!("model '{name}' not found"))
                .with_request_id(request_id.clone())
        })?;
    let instances = state
        .store()
        .list_instances(Some(model.id))
        .await
        .map_err(|e| ApiError::store(e, &request_id))?;

    let mut counts = InstanceCounts::default();
    for instance in &instances {
        let slot = match instance.state {
            InstanceState::Pending => &mut counts.pending,
            InstanceState::Scheduled => &mut counts.scheduled,
            InstanceState::Starting => &mut counts.starting,
            InstanceState::Running => &mut counts.running,
            InstanceState::Unhealthy => &mut counts.unhealthy,
            InstanceState::Terminating => &mut counts.terminating,
            InstanceState::Failed => &mut counts.failed,
        };
        *slot += 1;
    }

    Ok(Json(ModelDetailResponse {
        model: model.into(),
        instances: counts,
    }))
}

/// DELETE /v1/models/{name}
async fn delete_model(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    let model = state
        .store()
        .mark_model_deleting(&name, Utc::now())
        .await
        .map_err(|e| ApiError::store(e, &request_id))?
        .ok_or_else(|| {
            ApiError::not_found("model_not_found", format!("model '{name}' not found"))
                .with_request_id(request_id.clone())
        })?;

    info!(model = %name, request_id = %request_id, "Model marked for deletion");
    state.trigger().notify(model.id);
    Ok((StatusCode::ACCEPTED, Json(ModelResponse::from(model))))
}
