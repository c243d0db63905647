//! Upload Session Manager
//!
//! Manages upload sessions with:
//! - Per-session locking (the table lock is only held to add or remove)
//! - Session-admission limit as a backpressure signal
//! - Dedup short-circuit before any session is created
//! - Session state persistence for crash recovery
//! - Inactivity expiry sweeps

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::join_all;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};
use uuid::Uuid;

use super::chunk_store::ChunkStore;
use super::dedup_cache::{CacheEntry, DedupCache};
use super::types::{
    total_chunks, ChunkProgress, InitRequest, SessionStatus, StatusResponse, UploadError,
    UploadMetadata, UploadSession, DEFAULT_CHUNK_SIZE, MAX_CONCURRENT_UPLOADS, MAX_FILE_SIZE,
    SESSION_TIMEOUT_HOURS,
};
use crate::db::SessionRepository;

// ============================================================================
// Limits
// ============================================================================

/// Admission and validation limits
#[derive(Debug, Clone)]
pub struct SessionLimits {
    /// Maximum concurrent sessions (0 = unlimited)
    pub max_concurrent: usize,
    /// Inactivity timeout before a session expires
    pub session_timeout: Duration,
    pub max_file_size: u64,
    pub default_chunk_size: u64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_concurrent: MAX_CONCURRENT_UPLOADS,
            session_timeout: Duration::hours(SESSION_TIMEOUT_HOURS),
            max_file_size: MAX_FILE_SIZE,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Result of `init`
#[derive(Debug, Clone)]
pub enum InitOutcome {
    /// A new session was admitted
    Created(UploadSession),
    /// The content is already stored; no session was created
    Cached(CacheEntry),
}

// ============================================================================
// Session Entry
// ============================================================================

/// One live session
pub struct SessionEntry {
    state: Mutex<UploadSession>,

    /// Chunk writes hold a read guard; retiring the session takes the write
    /// guard so storage is only released once in-flight writes drain.
    io_gate: RwLock<()>,
}

impl SessionEntry {
    fn new(session: UploadSession) -> Self {
        Self {
            state: Mutex::new(session),
            io_gate: RwLock::new(()),
        }
    }

    /// Copy of the current state
    pub async fn snapshot(&self) -> UploadSession {
        self.state.lock().await.clone()
    }

    /// Hold while writing chunk bytes for this session
    pub async fn io_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.io_gate.read().await
    }
}

// ============================================================================
// Session Manager
// ============================================================================

/// Manages upload sessions
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionManagerInner>,
}

struct SessionManagerInner {
    /// Active sessions indexed by ID
    sessions: RwLock<HashMap<Uuid, Arc<SessionEntry>>>,

    chunk_store: ChunkStore,
    cache: DedupCache,

    /// Absent when running without persistence
    repository: Option<SessionRepository>,

    limits: SessionLimits,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new(
        chunk_store: ChunkStore,
        cache: DedupCache,
        repository: Option<SessionRepository>,
        limits: SessionLimits,
    ) -> Self {
        Self {
            inner: Arc::new(SessionManagerInner {
                sessions: RwLock::new(HashMap::new()),
                chunk_store,
                cache,
                repository,
                limits,
            }),
        }
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.inner.limits
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Create a session, or short-circuit on a dedup cache hit
    pub async fn init(
        &self,
        request: &InitRequest,
        metadata: UploadMetadata,
    ) -> Result<InitOutcome, UploadError> {
        let limits = &self.inner.limits;

        if request.file_name.trim().is_empty() {
            return Err(UploadError::InvalidRequest("fileName is required".to_string()));
        }
        if request.file_size == 0 {
            return Err(UploadError::InvalidRequest("fileSize must be positive".to_string()));
        }
        if request.file_size > limits.max_file_size {
            return Err(UploadError::FileTooLarge {
                size: request.file_size,
                max: limits.max_file_size,
            });
        }

        let chunk_size = resolve_chunk_size(
            request.file_size,
            request.chunk_size,
            request.total_chunks,
            limits.default_chunk_size,
        )?;
        let checksum = request.checksum.as_ref().map(|c| c.to_ascii_lowercase());

        // Dedup short-circuit
        if let Some(checksum) = &checksum {
            if let Some(entry) = self.inner.cache.lookup(checksum).await {
                if tokio::fs::try_exists(&entry.artifact_path).await.unwrap_or(false) {
                    tracing::info!(
                        file_name = %request.file_name,
                        digest = %entry.digest,
                        "Duplicate file detected - instant upload"
                    );
                    return Ok(InitOutcome::Cached(entry));
                }

                tracing::warn!(digest = %entry.digest, "Cached artifact missing, invalidating");
                self.inner.cache.invalidate(checksum).await;
            }
        }

        let mut session = UploadSession::new(
            request.file_name.clone(),
            request.file_size,
            chunk_size,
            checksum,
            request.priority,
            metadata,
        );
        let id = session.id;

        // Admission check and insert under one write lock
        {
            let mut sessions = self.inner.sessions.write().await;
            if limits.max_concurrent > 0 && sessions.len() >= limits.max_concurrent {
                tracing::warn!(
                    active = sessions.len(),
                    limit = limits.max_concurrent,
                    "Upload session rejected: at capacity"
                );
                return Err(UploadError::Capacity {
                    limit: limits.max_concurrent,
                });
            }

            session.status = SessionStatus::Receiving;
            sessions.insert(id, Arc::new(SessionEntry::new(session.clone())));
        }

        if let Err(e) = self.inner.chunk_store.open(id, session.file_size).await {
            let mut sessions = self.inner.sessions.write().await;
            sessions.remove(&id);
            return Err(e);
        }

        self.persist(&session).await;

        tracing::info!(
            session_id = %id,
            file_name = %session.file_name,
            file_size = session.file_size,
            chunk_size = session.chunk_size,
            chunks = session.total_chunks,
            priority = session.priority,
            "Created upload session"
        );

        Ok(InitOutcome::Created(session))
    }

    /// Get the live entry for a session
    pub async fn entry(&self, id: Uuid) -> Result<Arc<SessionEntry>, UploadError> {
        let sessions = self.inner.sessions.read().await;
        sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| UploadError::SessionNotFound(id.to_string()))
    }

    /// Get a session by ID
    pub async fn get_session(&self, id: Uuid) -> Result<UploadSession, UploadError> {
        Ok(self.entry(id).await?.snapshot().await)
    }

    /// Validate a resume request and return the chunks still pending
    ///
    /// A session created without a checksum adopts the one supplied here.
    pub async fn resume(&self, id: Uuid, checksum: &str) -> Result<Vec<usize>, UploadError> {
        let entry = self.entry(id).await?;
        let mut session = entry.state.lock().await;
        if session.status.is_terminal() {
            return Err(UploadError::SessionNotFound(id.to_string()));
        }

        match &session.checksum {
            Some(expected) if !expected.eq_ignore_ascii_case(checksum) => {
                tracing::warn!(session_id = %id, "Resume rejected: checksum mismatch");
                return Err(UploadError::IntegrityMismatch(id.to_string()));
            }
            Some(_) => {}
            None => session.checksum = Some(checksum.to_ascii_lowercase()),
        }

        session.touch();
        self.persist(&session).await;

        let pending = session.pending_chunks();
        tracing::info!(
            session_id = %id,
            pending = pending.len(),
            total = session.total_chunks,
            "Upload session resumed"
        );

        Ok(pending)
    }

    /// Check that a chunk may be written to this session
    pub async fn validate_chunk(
        &self,
        entry: &SessionEntry,
        chunk_index: usize,
        len: u64,
    ) -> Result<(), UploadError> {
        let session = entry.state.lock().await;
        ensure_accepts_chunks(&session)?;

        if chunk_index >= session.total_chunks {
            return Err(UploadError::ChunkIndexOutOfBounds {
                index: chunk_index,
                total: session.total_chunks,
            });
        }

        let expected = session.chunk_len(chunk_index);
        if len != expected {
            return Err(UploadError::ChunkSizeMismatch {
                index: chunk_index,
                expected,
                actual: len,
            });
        }

        Ok(())
    }

    /// Record a stored chunk
    pub async fn record_chunk_success(
        &self,
        id: Uuid,
        chunk_index: usize,
    ) -> Result<ChunkProgress, UploadError> {
        let entry = self.entry(id).await?;
        let mut session = entry.state.lock().await;
        ensure_accepts_chunks(&session)?;

        if chunk_index >= session.total_chunks {
            return Err(UploadError::ChunkIndexOutOfBounds {
                index: chunk_index,
                total: session.total_chunks,
            });
        }

        let newly_stored = session.mark_chunk_received(chunk_index);
        session.status = SessionStatus::Receiving;
        session.touch();

        if newly_stored {
            self.persist(&session).await;
        }

        Ok(ChunkProgress {
            completed_count: session.completed_chunks.len(),
            total_chunks: session.total_chunks,
            is_complete: session.is_complete(),
        })
    }

    /// Record a chunk that failed verification or storage
    pub async fn record_chunk_failure(&self, id: Uuid, chunk_index: usize) -> Result<(), UploadError> {
        let entry = self.entry(id).await?;
        let mut session = entry.state.lock().await;
        ensure_accepts_chunks(&session)?;

        if chunk_index < session.total_chunks {
            session.mark_chunk_failed(chunk_index);
            session.touch();
            self.persist(&session).await;
        }

        Ok(())
    }

    /// Move a complete session into `assembling`
    ///
    /// Only one caller can win this transition, which makes the reassembly
    /// engine the single writer for the session's artifact.
    pub async fn begin_assembly(&self, id: Uuid) -> Result<UploadSession, UploadError> {
        let entry = self.entry(id).await?;
        let mut session = entry.state.lock().await;

        if session.status == SessionStatus::Assembling {
            return Err(UploadError::InvalidState {
                upload_id: id.to_string(),
                status: session.status,
            });
        }
        ensure_accepts_chunks(&session)?;

        if !session.is_complete() {
            return Err(UploadError::MissingChunks(session.pending_chunks()));
        }

        session.status = SessionStatus::Assembling;
        session.touch();
        self.persist(&session).await;

        tracing::info!(
            session_id = %id,
            file_name = %session.file_name,
            chunks = session.total_chunks,
            "Assembling file from chunks"
        );

        Ok(session.clone())
    }

    /// Mark a session completed and drop it
    pub async fn complete(&self, id: Uuid) -> Result<UploadSession, UploadError> {
        self.retire(id, SessionStatus::Completed).await
    }

    /// Mark a session failed and drop it
    pub async fn fail(&self, id: Uuid) -> Result<UploadSession, UploadError> {
        self.retire(id, SessionStatus::Failed).await
    }

    /// Cancel a session
    pub async fn cancel(&self, id: Uuid) -> Result<UploadSession, UploadError> {
        self.retire(id, SessionStatus::Cancelled).await
    }

    /// Move a session into a terminal state, release its chunks and forget it
    ///
    /// Removal from the table decides which caller retires the session; a
    /// concurrent second caller gets `SessionNotFound`.
    async fn retire(&self, id: Uuid, status: SessionStatus) -> Result<UploadSession, UploadError> {
        let entry = {
            let mut sessions = self.inner.sessions.write().await;
            sessions
                .remove(&id)
                .ok_or_else(|| UploadError::SessionNotFound(id.to_string()))?
        };

        let session = {
            let mut session = entry.state.lock().await;
            session.status = status;
            session.clone()
        };

        // Wait for in-flight chunk writes before freeing storage
        let _drained = entry.io_gate.write().await;

        if let Err(e) = self.inner.chunk_store.release(id).await {
            tracing::warn!(session_id = %id, error = %e, "Failed to release chunk storage");
        }
        self.forget(id).await;

        tracing::info!(
            session_id = %id,
            file_name = %session.file_name,
            status = %status,
            "Upload session closed"
        );

        Ok(session)
    }

    // ========================================================================
    // Query Methods
    // ========================================================================

    /// Status of every live session, highest priority first
    pub async fn list_sessions(&self) -> Vec<StatusResponse> {
        let now = Utc::now();
        let entries = self.entries().await;
        let mut sessions = join_all(entries.iter().map(|entry| entry.snapshot())).await;

        sessions.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.started_at.cmp(&b.started_at))
        });
        sessions.iter().map(|s| s.status_report(now)).collect()
    }

    /// Get active session count
    pub async fn active_session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    async fn entries(&self) -> Vec<Arc<SessionEntry>> {
        let sessions = self.inner.sessions.read().await;
        sessions.values().cloned().collect()
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Expire sessions idle longer than the session timeout
    ///
    /// Returns the sessions that were expired.
    pub async fn sweep_expired(&self) -> Vec<UploadSession> {
        let now = Utc::now();
        let timeout = self.inner.limits.session_timeout;
        let mut expired_ids = Vec::new();

        for entry in self.entries().await {
            let session = entry.state.lock().await;
            if !session.status.is_terminal() && session.is_expired(timeout, now) {
                expired_ids.push(session.id);
            }
        }

        let mut expired = Vec::with_capacity(expired_ids.len());
        for id in expired_ids {
            // Lost races (cancelled or completed meanwhile) are skipped
            if let Ok(session) = self.retire(id, SessionStatus::Expired).await {
                expired.push(session);
            }
        }

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Cleaned up expired upload sessions");
        }

        expired
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    async fn persist(&self, session: &UploadSession) {
        // Retired sessions have (or are about to have) their record deleted
        if session.status.is_terminal() {
            return;
        }
        if let Some(repository) = &self.inner.repository {
            if let Err(e) = repository.upsert(session).await {
                tracing::warn!(
                    session_id = %session.id,
                    error = %e,
                    "Failed to persist upload session"
                );
            }
        }
    }

    async fn forget(&self, id: Uuid) {
        if let Some(repository) = &self.inner.repository {
            if let Err(e) = repository.delete(id).await {
                tracing::warn!(session_id = %id, error = %e, "Failed to delete session record");
            }
        }
    }

    /// Write every live session to the repository
    pub async fn persist_all(&self) -> usize {
        if self.inner.repository.is_none() {
            return 0;
        }

        let entries = self.entries().await;
        for entry in &entries {
            let session = entry.state.lock().await;
            self.persist(&session).await;
        }
        entries.len()
    }

    /// Reload in-flight sessions after a restart
    ///
    /// Completed indices are trusted only if the chunk is still present in the
    /// chunk store; chunk files with no surviving session are removed.
    pub async fn recover(&self) -> Result<usize, UploadError> {
        let Some(repository) = &self.inner.repository else {
            return Ok(0);
        };

        let persisted = repository.load_active().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to load persisted upload sessions");
            UploadError::StorageIo {
                context: "loading sessions",
            }
        })?;

        let mut recovered = HashSet::new();
        for mut session in persisted {
            let id = session.id;
            self.inner.chunk_store.open(id, session.file_size).await?;
            let stored = self.inner.chunk_store.stored_indices(id).await?;

            let persisted_count = session.completed_chunks.len();
            session.total_chunks = total_chunks(session.file_size, session.chunk_size);
            let total = session.total_chunks;
            session
                .completed_chunks
                .retain(|i| *i < total && stored.contains(i));
            session.failed_chunks.retain(|i| *i < total && !stored.contains(i));
            session.status = SessionStatus::Receiving;

            tracing::info!(
                session_id = %id,
                file_name = %session.file_name,
                completed = session.completed_chunks.len(),
                lost = persisted_count - session.completed_chunks.len(),
                total = session.total_chunks,
                "Recovered upload session"
            );

            self.persist(&session).await;
            {
                let mut sessions = self.inner.sessions.write().await;
                sessions.insert(id, Arc::new(SessionEntry::new(session)));
            }
            recovered.insert(id);
        }

        for orphan in self.inner.chunk_store.sessions_on_disk().await? {
            if !recovered.contains(&orphan) {
                let freed = self.inner.chunk_store.release(orphan).await?;
                tracing::info!(session_id = %orphan, chunks = freed, "Removed orphaned chunks");
            }
        }

        Ok(recovered.len())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn ensure_accepts_chunks(session: &UploadSession) -> Result<(), UploadError> {
    if session.status.is_terminal() {
        return Err(UploadError::SessionNotFound(session.id.to_string()));
    }
    if !session.status.accepts_chunks() {
        return Err(UploadError::InvalidState {
            upload_id: session.id.to_string(),
            status: session.status,
        });
    }
    Ok(())
}

/// Work out the chunk size from whichever of chunk size / chunk count was sent
pub fn resolve_chunk_size(
    file_size: u64,
    chunk_size: Option<u64>,
    chunk_count: Option<usize>,
    default_chunk_size: u64,
) -> Result<u64, UploadError> {
    let chunk_size = match (chunk_size, chunk_count) {
        (Some(0), _) => {
            return Err(UploadError::InvalidRequest("chunkSize must be positive".to_string()));
        }
        (_, Some(0)) => {
            return Err(UploadError::InvalidRequest("totalChunks must be positive".to_string()));
        }
        (Some(size), _) => size,
        (None, Some(count)) => file_size.div_ceil(count as u64),
        (None, None) => default_chunk_size,
    };

    if let Some(count) = chunk_count {
        let derived = total_chunks(file_size, chunk_size);
        if derived != count {
            return Err(UploadError::InvalidRequest(format!(
                "totalChunks {} does not match fileSize {} / chunkSize {} ({} chunks)",
                count, file_size, chunk_size, derived
            )));
        }
    }

    Ok(chunk_size)
}

// ============================================================================
// Tests
// ============================================================================
