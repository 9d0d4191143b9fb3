//! Instance API endpoints (read-only; instances are owned by the controller).

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use super::list::ListParams;
use super::watch::{watch, Watched};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(list_instances))
}

#[derive(Debug, Deserialize)]
pub struct ListInstancesQuery {
    /// Model name; all models when absent.
    pub model: Option<String>,
}

/// GET /v1/instances?model=&page=&perPage=&search=&watch=
///
/// `search` matches the model name.
async fn list_instances(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<ListInstancesQuery>,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    let request_id = ctx.request_id;
    params.validate(&request_id)?;
    let store = state.store();

    let model_id = match &query.model {
        Some(name) => Some(
            store
                .get_model_by_name(name)
                .await
                .map_err(|e| ApiError::store(e, &request_id))?
                .ok_or_else(|| {
                    ApiError::not_found("model_not_found", format!("model '{name}' not found"))
                        .with_request_id(request_id.clone())
                })?
                .id,
        ),
        None => None,
    };

    if params.watch {
        let stream = watch(state.shared_store(), Watched::Instances(model_id), params.search)
            .await
            .map_err(|e| ApiError::store(e, &request_id))?;
        return Ok(stream.into_response());
    }

    let items = store
        .list_instances(model_id)
        .await
        .map_err(|e| ApiError::store(e, &request_id))?;
    Ok(Json(params.paginate(items, |i| i.model_name.as_str())).into_response())
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::{api, get, send};
    use crate::db::StateStore;
    use axum::http::StatusCode;
    use chrono::Utc;
    use gpufleet_types::ModelInstance;

    #[tokio::test]
    async fn lists_instances_of_one_model() {
        let t = api(None);
        let now = Utc::now();
        for name in ["qwen", "llama"] {
            let model = t
                .store
                .apply_model(crate::controller::testing::spec(name, 1, 1), now)
                .await
                .unwrap()
                .model;
            t.store
                .create_instance(&ModelInstance::pending(&model, now))
                .await
                .unwrap();
        }

        let (status, body) = send(&t.router, get("/v1/instances?model=qwen")).await;
        assert_eq!(status, StatusCode::OK);
        let items = body["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["model_name"], "qwen");
        assert_eq!(items[0]["state"], "pending");

        let (_, all) = send(&t.router, get("/v1/instances")).await;
        assert_eq!(all["items"].as_array().unwrap().len(), 2);

        let (status, _) = send(&t.router, get("/v1/instances?model=missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
