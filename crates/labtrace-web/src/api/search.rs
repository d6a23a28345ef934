use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    routing::get,
};
use labtrace_core::{BiomarkerMatch, SummaryMatch};
use serde::Deserialize;

use crate::state::AppState;
use crate::user::CurrentUser;

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 200;

pub fn biomarker_router() -> Router<AppState> {
    Router::new().route("/search", get(search_biomarkers))
}

pub fn summary_router() -> Router<AppState> {
    Router::new().route("/search", get(search_summaries))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    q: String,
    limit: Option<usize>,
}

impl SearchQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

async fn search_biomarkers(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<BiomarkerMatch>>, (StatusCode, String)> {
    let matches = state
        .lookup
        .search_biomarkers(user_id, &query.q, query.limit())
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(matches))
}

async fn search_summaries(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<SummaryMatch>>, (StatusCode, String)> {
    let matches = state
        .lookup
        .search_summaries(user_id, &query.q, query.limit())
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(matches))
}
