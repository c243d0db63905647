//! Upload types for the resumable chunked upload protocol

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

/// Default chunk size: 2MB
pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// Maximum file size: 500MB
pub const MAX_FILE_SIZE: u64 = 500 * 1024 * 1024;

/// Files at or above this size keep their chunks on disk: 50MB
pub const DEFAULT_MEMORY_THRESHOLD: u64 = 50 * 1024 * 1024;

/// Session inactivity timeout: 24 hours
pub const SESSION_TIMEOUT_HOURS: i64 = 24;

/// Maximum concurrent upload sessions (0 = unlimited)
pub const MAX_CONCURRENT_UPLOADS: usize = 5;

/// Prefix required for pass-through metadata keys
pub const EXTRA_METADATA_PREFIX: &str = "x-";

// ============================================================================
// Init Types
// ============================================================================

/// Request to initiate (or short-circuit) a chunked upload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    /// Original file name
    pub file_name: String,

    /// Total file size in bytes
    pub file_size: u64,

    /// Chunk size in bytes (defaults to 2MB, or derived from `total_chunks`)
    #[serde(default)]
    pub chunk_size: Option<u64>,

    /// Expected number of chunks
    #[serde(default)]
    pub total_chunks: Option<usize>,

    /// SHA-256 of the complete source file, hex encoded
    #[serde(default)]
    pub checksum: Option<String>,

    /// Admission priority (higher first when listing)
    #[serde(default)]
    pub priority: i32,

    /// Wire metadata, validated into [`UploadMetadata`]
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Response to an init request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    /// Upload session ID (absent on a cache hit)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,

    /// Whether the content was already known (no chunks needed)
    pub cached: bool,

    /// The existing artifact, on a cache hit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,

    /// Chunk size the server expects
    pub chunk_size: u64,

    /// Total chunks expected
    pub total_chunks: usize,
}

/// Reference to a finished artifact handed back to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    /// SHA-256 of the assembled (plaintext) content
    pub digest: String,

    /// Size of the assembled content in bytes
    pub size: u64,

    /// Whether the stored artifact was encrypted
    pub encrypted: bool,
}

// ============================================================================
// Chunk Upload Types
// ============================================================================

/// Response after uploading a chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    /// Chunk index that was uploaded
    pub chunk_index: usize,

    /// Whether the chunk was accepted
    pub accepted: bool,

    /// Number of distinct chunks stored so far
    pub completed_count: usize,

    /// Total chunks expected
    pub total_chunks: usize,

    /// Whether all chunks have been received
    pub is_complete: bool,

    /// Set when auto-finalize assembled the file on this chunk
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
}

/// Session bookkeeping result of a successful chunk write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub completed_count: usize,
    pub total_chunks: usize,
    pub is_complete: bool,
}

// ============================================================================
// Status / Resume / Finalize Types
// ============================================================================

/// Upload progress snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub upload_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub status: SessionStatus,
    pub priority: i32,
    /// Percentage of chunks stored (0-100)
    pub progress: f64,
    pub chunks_received: usize,
    pub total_chunks: usize,
    pub failed_chunks: Vec<usize>,
    /// Seconds since the session started
    pub elapsed_secs: f64,
    /// Linear estimate from the observed chunk rate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_secs: Option<f64>,
}

/// Request to resume an interrupted upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
    pub checksum: String,
}

/// Chunks the caller still has to send
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeResponse {
    pub upload_id: String,
    pub pending_chunks: Vec<usize>,
    pub total_chunks: usize,
}

/// Explicit finalize request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    #[serde(default)]
    pub expected_chunks: Option<usize>,

    #[serde(default)]
    pub file_checksum: Option<String>,
}

/// Response after finalizing an upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub upload_id: String,
    pub artifact: ArtifactRef,
}

// ============================================================================
// Metadata
// ============================================================================

/// Validated session metadata passed through to collaborators
///
/// Recognised wire keys are `encrypt`, `ownerId`, `keyId` and `mimeType`.
/// Anything else must carry the `x-` prefix and lands in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetadata {
    #[serde(default)]
    pub encrypt: bool,

    #[serde(default)]
    pub owner_id: Option<String>,

    #[serde(default)]
    pub key_id: Option<String>,

    #[serde(default)]
    pub mime_type: Option<String>,

    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl UploadMetadata {
    /// Validate a wire key/value bag
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, UploadError> {
        let mut metadata = Self::default();

        for (key, value) in map {
            match key.as_str() {
                "encrypt" => {
                    metadata.encrypt = value.parse().map_err(|_| {
                        UploadError::InvalidRequest(format!(
                            "metadata.encrypt must be true or false, got {:?}",
                            value
                        ))
                    })?;
                }
                "ownerId" => metadata.owner_id = Some(value.clone()),
                "keyId" => metadata.key_id = Some(value.clone()),
                "mimeType" => metadata.mime_type = Some(value.clone()),
                other if other.starts_with(EXTRA_METADATA_PREFIX) => {
                    metadata.extra.insert(other.to_string(), value.clone());
                }
                other => {
                    return Err(UploadError::InvalidRequest(format!(
                        "unrecognized metadata key: {}",
                        other
                    )));
                }
            }
        }

        Ok(metadata)
    }
}

// ============================================================================
// Session Types
// ============================================================================

/// Upload session state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// Unique session ID
    pub id: Uuid,

    /// Original file name
    pub file_name: String,

    /// Total file size in bytes
    pub file_size: u64,

    /// Chunk size used for this upload
    pub chunk_size: u64,

    /// ceil(file_size / chunk_size)
    pub total_chunks: usize,

    /// Indices of chunks that have been stored
    pub completed_chunks: BTreeSet<usize>,

    /// Indices that errored and may be resent
    pub failed_chunks: BTreeSet<usize>,

    /// Current status
    pub status: SessionStatus,

    /// Admission priority
    pub priority: i32,

    /// SHA-256 of the complete source file
    pub checksum: Option<String>,

    /// Session creation time
    pub started_at: DateTime<Utc>,

    /// Last chunk activity, drives expiry
    pub last_activity: DateTime<Utc>,

    pub metadata: UploadMetadata,
}

impl UploadSession {
    /// Create a new session from a validated request
    pub fn new(
        file_name: String,
        file_size: u64,
        chunk_size: u64,
        checksum: Option<String>,
        priority: i32,
        metadata: UploadMetadata,
    ) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4(),
            file_name,
            file_size,
            chunk_size,
            total_chunks: total_chunks(file_size, chunk_size),
            completed_chunks: BTreeSet::new(),
            failed_chunks: BTreeSet::new(),
            status: SessionStatus::Initializing,
            priority,
            checksum,
            started_at: now,
            last_activity: now,
            metadata,
        }
    }

    /// Check whether the session has been idle longer than `timeout`
    pub fn is_expired(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_activity > timeout
    }

    /// Check if all chunks have been received
    pub fn is_complete(&self) -> bool {
        self.completed_chunks.len() == self.total_chunks
    }

    /// Indices of chunks that still need to be uploaded
    pub fn pending_chunks(&self) -> Vec<usize> {
        (0..self.total_chunks)
            .filter(|i| !self.completed_chunks.contains(i))
            .collect()
    }

    /// Expected byte length of chunk `index`
    pub fn chunk_len(&self, index: usize) -> u64 {
        let start = index as u64 * self.chunk_size;
        self.chunk_size.min(self.file_size.saturating_sub(start))
    }

    /// Mark a chunk as stored; returns false if it was already present
    pub fn mark_chunk_received(&mut self, index: usize) -> bool {
        self.failed_chunks.remove(&index);
        self.completed_chunks.insert(index)
    }

    /// Mark a chunk as failed and eligible for retry
    pub fn mark_chunk_failed(&mut self, index: usize) {
        if !self.completed_chunks.contains(&index) {
            self.failed_chunks.insert(index);
        }
    }

    /// Record chunk activity
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Calculate progress percentage
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        (self.completed_chunks.len() as f64 / self.total_chunks as f64) * 100.0
    }

    /// Build a status snapshot at `now`
    pub fn status_report(&self, now: DateTime<Utc>) -> StatusResponse {
        let elapsed = (now - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        let received = self.completed_chunks.len();
        let remaining = self.total_chunks - received;

        let estimated_remaining_secs = if received == 0 {
            None
        } else {
            Some(elapsed / received as f64 * remaining as f64)
        };

        StatusResponse {
            upload_id: self.id.to_string(),
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            status: self.status,
            priority: self.priority,
            progress: self.progress(),
            chunks_received: received,
            total_chunks: self.total_chunks,
            failed_chunks: self.failed_chunks.iter().copied().collect(),
            elapsed_secs: elapsed,
            estimated_remaining_secs,
        }
    }
}

/// ceil(file_size / chunk_size)
pub fn total_chunks(file_size: u64, chunk_size: u64) -> usize {
    file_size.div_ceil(chunk_size) as usize
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created, no chunk stored yet
    Initializing,
    /// Receiving chunks
    Receiving,
    /// All chunks present, artifact being written
    Assembling,
    /// Artifact stored and handed off
    Completed,
    /// Cancelled by the caller
    Cancelled,
    /// Storage or integrity failure
    Failed,
    /// Idle past the session timeout
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Receiving => "receiving",
            Self::Assembling => "assembling",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    /// No further operations are accepted once terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Failed | Self::Expired
        )
    }

    pub fn accepts_chunks(&self) -> bool {
        matches!(self, Self::Initializing | Self::Receiving)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "receiving" => Ok(Self::Receiving),
            "assembling" => Ok(Self::Assembling),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            other => Err(UploadError::InvalidRequest(format!(
                "unknown session status: {}",
                other
            ))),
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Too many concurrent uploads (max: {limit})")]
    Capacity { limit: usize },

    #[error("Chunk {index} hash mismatch: expected {expected}, got {actual}")]
    ChunkIntegrity {
        index: usize,
        expected: String,
        actual: String,
    },

    #[error("Checksum does not match upload {0}; start a new upload")]
    IntegrityMismatch(String),

    #[error("Assembled file hash mismatch: expected {expected}, got {actual}")]
    IntegrityFailure { expected: String, actual: String },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Storage I/O error while {context}")]
    StorageIo { context: &'static str },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Chunk index out of bounds: {index} (total: {total})")]
    ChunkIndexOutOfBounds { index: usize, total: usize },

    #[error("Chunk {index} has {actual} bytes, expected {expected}")]
    ChunkSizeMismatch {
        index: usize,
        expected: u64,
        actual: u64,
    },

    #[error("File too large: {size} bytes (max: {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Missing chunks: {0:?}")]
    MissingChunks(Vec<usize>),

    #[error("Upload {upload_id} is {status}")]
    InvalidState {
        upload_id: String,
        status: SessionStatus,
    },

    #[error("Threats detected: {}", .threats.join(", "))]
    ThreatDetected { threats: Vec<String> },

    #[error("Collaborator failure: {0}")]
    Collaborator(String),
}

impl UploadError {
    /// Log the full storage failure and return the caller-facing variant
    pub fn storage_io(context: &'static str, path: &Path, err: std::io::Error) -> Self {
        tracing::error!(
            path = %path.display(),
            error = %err,
            "Storage I/O failure while {}",
            context
        );
        Self::StorageIo { context }
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Capacity { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ChunkIntegrity { .. } => StatusCode::CONFLICT,
            Self::IntegrityMismatch(_) => StatusCode::CONFLICT,
            Self::IntegrityFailure { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::StorageIo { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::ChunkIndexOutOfBounds { .. } => StatusCode::BAD_REQUEST,
            Self::ChunkSizeMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::MissingChunks(_) => StatusCode::BAD_REQUEST,
            Self::InvalidState { .. } => StatusCode::CONFLICT,
            Self::ThreatDetected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Collaborator(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Capacity { .. } => "CAPACITY_EXCEEDED",
            Self::ChunkIntegrity { .. } => "CHUNK_INTEGRITY",
            Self::IntegrityMismatch(_) => "INTEGRITY_MISMATCH",
            Self::IntegrityFailure { .. } => "INTEGRITY_FAILURE",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::StorageIo { .. } => "STORAGE_ERROR",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::ChunkIndexOutOfBounds { .. } => "CHUNK_INDEX_OUT_OF_BOUNDS",
            Self::ChunkSizeMismatch { .. } => "CHUNK_SIZE_MISMATCH",
            Self::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Self::MissingChunks(_) => "MISSING_CHUNKS",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::ThreatDetected { .. } => "THREAT_DETECTED",
            Self::Collaborator(_) => "COLLABORATOR_ERROR",
        }
    }

    /// Whether the caller may retry the same operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Capacity { .. } | Self::ChunkIntegrity { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================
