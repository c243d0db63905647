//! Upload Routes
//!
//! HTTP endpoints for resumable chunked uploads.
//!
//! Endpoints:
//! - POST /api/v1/upload/init - Start an upload, or hit the dedup cache
//! - PUT /api/v1/upload/:upload_id/chunks/:index - Upload a chunk (optional X-Chunk-Hash)
//! - POST /api/v1/upload/:upload_id/finalize - Assemble the file
//! - POST /api/v1/upload/:upload_id/resume - List chunks still pending
//! - GET /api/v1/upload/:upload_id - Get session status
//! - DELETE /api/v1/upload/:upload_id - Cancel upload
//! - GET /api/v1/upload/sessions - List active sessions

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;

use crate::state::AppState;
use crate::upload::{
    ChunkUploadResponse, FinalizeRequest, FinalizeResponse, InitRequest, InitResponse,
    ResumeRequest, ResumeResponse, StatusResponse, UploadError,
};

/// Header carrying the SHA-256 of a chunk body
pub const CHUNK_HASH_HEADER: &str = "x-chunk-hash";

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error: String,
    code: &'static str,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    missing_chunks: Option<Vec<usize>>,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let missing_chunks = match &self {
            UploadError::MissingChunks(missing) => Some(missing.clone()),
            _ => None,
        };

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: self.code(),
            retryable: self.is_retryable(),
            missing_chunks,
        });

        (status, body).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router(max_chunk_bytes: u64) -> Router<AppState> {
    let body_limit = usize::try_from(max_chunk_bytes).unwrap_or(usize::MAX);

    Router::new()
        .route("/init", post(init_upload))
        .route("/sessions", get(list_sessions))
        .route(
            "/:upload_id/chunks/:index",
            put(upload_chunk).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/:upload_id/finalize", post(finalize_upload))
        .route("/:upload_id/resume", post(resume_upload))
        .route("/:upload_id", get(get_status).delete(cancel_upload))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/upload/init
///
/// 201 with an upload ID, or 200 with the existing artifact on a dedup hit.
async fn init_upload(
    State(state): State<AppState>,
    Json(request): Json<InitRequest>,
) -> Result<(StatusCode, Json<InitResponse>), UploadError> {
    let response = state.uploads().init_upload(request).await?;
    let status = if response.cached {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(response)))
}

/// PUT /api/v1/upload/:upload_id/chunks/:index
async fn upload_chunk(
    State(state): State<AppState>,
    Path((upload_id, index)): Path<(String, usize)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ChunkUploadResponse>, UploadError> {
    let chunk_hash = match headers.get(CHUNK_HASH_HEADER) {
        Some(value) => Some(value.to_str().map_err(|_| {
            UploadError::InvalidRequest("X-Chunk-Hash must be a hex string".to_string())
        })?),
        None => None,
    };

    let response = state
        .uploads()
        .upload_chunk(&upload_id, index, body, chunk_hash)
        .await?;
    Ok(Json(response))
}

/// POST /api/v1/upload/:upload_id/finalize
///
/// The body is optional; an empty body finalizes without extra checks.
async fn finalize_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    body: Bytes,
) -> Result<Json<FinalizeResponse>, UploadError> {
    let request = if body.is_empty() {
        FinalizeRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| UploadError::InvalidRequest(format!("invalid finalize body: {}", e)))?
    };

    let response = state.uploads().finalize_upload(&upload_id, request).await?;
    Ok(Json(response))
}

/// POST /api/v1/upload/:upload_id/resume
async fn resume_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    Json(request): Json<ResumeRequest>,
) -> Result<Json<ResumeResponse>, UploadError> {
    let response = state.uploads().resume_upload(&upload_id, request).await?;
    Ok(Json(response))
}

/// GET /api/v1/upload/:upload_id
async fn get_status(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Json<StatusResponse>, UploadError> {
    let response = state.uploads().get_status(&upload_id).await?;
    Ok(Json(response))
}

/// DELETE /api/v1/upload/:upload_id
async fn cancel_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Json<StatusResponse>, UploadError> {
    let response = state.uploads().cancel_upload(&upload_id).await?;
    Ok(Json(response))
}

/// GET /api/v1/upload/sessions
async fn list_sessions(State(state): State<AppState>) -> Json<Vec<StatusResponse>> {
    Json(state.uploads().list_sessions().await)
}
