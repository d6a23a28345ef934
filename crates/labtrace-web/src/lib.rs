pub mod api;
pub mod config;
pub mod state;
pub mod user;

use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    let max_upload_bytes = state.orchestrator.config().max_upload_bytes;

    Router::new()
        .nest("/api", api::router(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
