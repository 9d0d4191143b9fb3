//! Event log tailing.
//!
//! The proxy keeps its route table current by polling this endpoint with
//! the cursor of the last event it applied.

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use gpufleet_id::EventId;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 1000;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(list_events))
}

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    /// Return events with event_id > after_event_id.
    pub after_event_id: Option<i64>,
    pub limit: Option<u32>,
}

/// GET /v1/events?after_event_id=&limit=
async fn list_events(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<ListEventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    let after = query.after_event_id.unwrap_or(0);
    if after < 0 {
        return Err(ApiError::bad_request(
            "invalid_cursor",
            "after_event_id must not be negative",
        )
        .with_request_id(request_id));
    }
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let page = state
        .store()
        .events_after(EventId::new(after), limit)
        .await
        .map_err(|e| ApiError::store(e, &request_id))?;
    Ok(Json(page))
}
