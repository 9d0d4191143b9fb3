//! Routing snapshot consumed by the proxy.

use std::collections::BTreeMap;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use gpufleet_types::{ModelInstance, RouteEntry, RoutesSnapshot};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(get_routes))
}

/// GET /v1/routes
///
/// The cursor is read before the instances, so replaying events after it
/// can only repeat changes the snapshot already holds, never skip one.
async fn get_routes(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    let store = state.store();

    let cursor = store
        .latest_event_id()
        .await
        .map_err(|e| ApiError::store(e, &request_id))?;
    let instances = store
        .list_instances(None)
        .await
        .map_err(|e| ApiError::store(e, &request_id))?;

    let mut by_model: BTreeMap<&str, Vec<&ModelInstance>> = BTreeMap::new();
    for instance in &instances {
        by_model
            .entry(instance.model_name.as_str())
            .or_default()
            .push(instance);
    }
    let routes = by_model
        .into_iter()
        .map(|(name, instances)| RouteEntry::from_instances(name, instances))
        .filter(|entry| !entry.endpoints.is_empty())
        .collect();

    Ok(Json(RoutesSnapshot { cursor, routes }))
}
