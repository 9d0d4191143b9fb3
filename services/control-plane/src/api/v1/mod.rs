//! API v1 routes.

mod events;
mod instances;
mod list;
mod models;
mod routes;
mod watch;
mod workers;

use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/models", models::routes())
        .nest("/workers", workers::routes())
        .nest("/instances", instances::routes())
        .nest("/routes", routes::routes())
        .nest("/events", events::routes())
}
