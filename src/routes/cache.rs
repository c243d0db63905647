//! Dedup cache administration
//!
//! Endpoints:
//! - GET /api/v1/cache/stats - Cache statistics
//! - DELETE /api/v1/cache/:digest - Drop one entry
//! - DELETE /api/v1/cache - Drop every entry

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use serde::Serialize;

use crate::state::AppState;
use crate::upload::CacheStats;

#[derive(Serialize)]
struct ClearResponse {
    removed: usize,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", delete(clear_cache))
        .route("/stats", get(cache_stats))
        .route("/:digest", delete(invalidate_entry))
}

/// GET /api/v1/cache/stats
async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.uploads().cache_stats().await)
}

/// DELETE /api/v1/cache/:digest
async fn invalidate_entry(
    State(state): State<AppState>,
    Path(digest): Path<String>,
) -> impl IntoResponse {
    if state.uploads().invalidate_cache(&digest).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// DELETE /api/v1/cache
async fn clear_cache(State(state): State<AppState>) -> Json<ClearResponse> {
    Json(ClearResponse {
        removed: state.uploads().clear_cache().await,
    })
}
