//! REST API handlers

use crate::{ApiError, AppState, StreamView};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

/// Query parameters for result listing
#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    #[serde(default)]
    pub stream_id: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct StreamsResponse {
    pub streams: Vec<StreamView>,
}

#[derive(Debug, Serialize)]
pub struct ResultsResponse {
    pub results: Vec<vigil_db::AnalysisRecord>,
}

/// GET /api/streams
pub async fn get_streams(State(state): State<AppState>) -> Json<StreamsResponse> {
    Json(StreamsResponse {
        streams: state.directory.streams(),
    })
}

/// GET /api/streams/:id
pub async fn get_stream(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<StreamView>, ApiError> {
    state
        .directory
        .streams()
        .into_iter()
        .find(|s| s.id == id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("stream {}", id)))
}

/// GET /api/results
pub async fn get_results(
    State(state): State<AppState>,
    Query(params): Query<ResultsQuery>,
) -> Result<Json<ResultsResponse>, ApiError> {
    let limit = params.limit.unwrap_or(20);
    if limit < 1 {
        return Err(ApiError::BadRequest("limit must be positive".to_string()));
    }

    let db = state.db.lock()
        .map_err(|_| ApiError::Internal(anyhow::anyhow!("database lock poisoned")))?;

    let results = vigil_db::recent_analysis_results(&db, params.stream_id, limit.min(200))
        .map_err(|e| ApiError::Database(e.to_string()))?;

    Ok(Json(ResultsResponse { results }))
}
