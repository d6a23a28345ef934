mod labs;
mod search;

use axum::Router;

use crate::state::AppState;

pub fn router(max_upload_bytes: u64) -> Router<AppState> {
    Router::new()
        .nest("/labs", labs::router(max_upload_bytes))
        .nest("/biomarkers", search::biomarker_router())
        .nest("/summaries", search::summary_router())
}
