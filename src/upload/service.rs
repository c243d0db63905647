//! Upload Service
//!
//! The operation surface callers drive (init / chunk / status / cancel /
//! finalize / resume). Orchestrates the session manager, chunk store, dedup
//! cache and reassembly engine, and owns the background maintenance task.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use bytes::Bytes;
use serde_json::json;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::assembly::{AssemblyConfig, ReassemblyEngine};
use super::chunk_store::ChunkStore;
use super::collaborators::{AuditEvent, Auditor, Collaborators};
use super::dedup_cache::{CacheConfig, CacheStats, DedupCache};
use super::hasher::{compute_hash, verify_hash};
use super::session::{InitOutcome, SessionLimits, SessionManager};
use super::types::{
    ArtifactRef, ChunkUploadResponse, FinalizeRequest, FinalizeResponse, InitRequest,
    InitResponse, ResumeRequest, ResumeResponse, StatusResponse, UploadError, UploadMetadata,
};
use crate::config::{CacheSettings, UploadConfig};
use crate::db::SessionRepository;
use crate::error::AppError;

/// Upload façade
#[derive(Clone)]
pub struct UploadService {
    inner: Arc<UploadServiceInner>,
}

struct UploadServiceInner {
    sessions: SessionManager,
    chunk_store: ChunkStore,
    cache: DedupCache,
    engine: ReassemblyEngine,
    auditor: Auditor,

    /// Bounds concurrent chunk writes across all sessions
    chunk_workers: Semaphore,

    auto_finalize: bool,
    sweep_interval: StdDuration,

    shutdown: watch::Sender<bool>,
    maintenance: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl UploadService {
    /// Wire up the upload core
    ///
    /// Without a repository, sessions live in memory only and are lost on
    /// restart.
    pub fn new(
        upload: &UploadConfig,
        cache: &CacheSettings,
        repository: Option<SessionRepository>,
        collaborators: Collaborators,
    ) -> Result<Self, AppError> {
        let session_timeout = chrono::Duration::from_std(upload.session_timeout)
            .map_err(|e| AppError::Config(format!("session timeout out of range: {}", e)))?;
        let cache_ttl = chrono::Duration::from_std(cache.ttl)
            .map_err(|e| AppError::Config(format!("cache ttl out of range: {}", e)))?;

        let chunk_store = ChunkStore::new(upload.chunk_dir.clone(), upload.memory_threshold);
        let cache = DedupCache::new(CacheConfig {
            max_size: cache.max_size,
            max_entries: cache.max_entries,
            ttl: cache_ttl,
        });
        let sessions = SessionManager::new(
            chunk_store.clone(),
            cache.clone(),
            repository,
            SessionLimits {
                max_concurrent: upload.max_concurrent_sessions,
                session_timeout,
                max_file_size: upload.max_file_size,
                default_chunk_size: upload.default_chunk_size,
            },
        );

        let auditor = collaborators.auditor.clone();
        let engine = ReassemblyEngine::new(
            AssemblyConfig {
                artifact_dir: upload.artifact_dir.clone(),
                quarantine_dir: upload.quarantine_dir.clone(),
                max_buffered_bytes: upload.max_buffered_bytes,
            },
            sessions.clone(),
            chunk_store.clone(),
            cache.clone(),
            collaborators,
        );

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(UploadServiceInner {
                sessions,
                chunk_store,
                cache,
                engine,
                auditor,
                chunk_workers: Semaphore::new(upload.max_concurrent_chunks.max(1)),
                auto_finalize: upload.auto_finalize,
                sweep_interval: upload.sweep_interval,
                shutdown,
                maintenance: parking_lot::Mutex::new(None),
            }),
        })
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    // ========================================================================
    // Upload Operations
    // ========================================================================

    /// Start an upload, or short-circuit when the content is already stored
    pub async fn init_upload(&self, request: InitRequest) -> Result<InitResponse, UploadError> {
        let metadata = UploadMetadata::from_map(&request.metadata)?;
        if metadata.encrypt && !self.inner.engine.has_encryptor() {
            return Err(UploadError::InvalidRequest(
                "encryption requested but not available".to_string(),
            ));
        }

        match self.inner.sessions.init(&request, metadata).await? {
            InitOutcome::Cached(entry) => {
                self.inner.auditor.emit(
                    AuditEvent::DedupHit,
                    None,
                    json!({ "fileName": request.file_name, "digest": entry.digest }),
                );

                Ok(InitResponse {
                    upload_id: None,
                    cached: true,
                    artifact: Some(ArtifactRef {
                        digest: entry.digest,
                        size: entry.size,
                        encrypted: entry.encrypted,
                    }),
                    chunk_size: 0,
                    total_chunks: 0,
                })
            }
            InitOutcome::Created(session) => {
                self.inner.auditor.emit(
                    AuditEvent::UploadStarted,
                    Some(session.id),
                    json!({
                        "fileName": session.file_name,
                        "fileSize": session.file_size,
                        "ownerId": session.metadata.owner_id,
                    }),
                );

                Ok(InitResponse {
                    upload_id: Some(session.id.to_string()),
                    cached: false,
                    artifact: None,
                    chunk_size: session.chunk_size,
                    total_chunks: session.total_chunks,
                })
            }
        }
    }

    /// Store one chunk
    ///
    /// Re-sending an index that is already stored overwrites it and leaves
    /// the completion count unchanged. With auto-finalize enabled, the chunk
    /// that completes the session also assembles it.
    pub async fn upload_chunk(
        &self,
        upload_id: &str,
        chunk_index: usize,
        data: Bytes,
        chunk_hash: Option<&str>,
    ) -> Result<ChunkUploadResponse, UploadError> {
        let id = parse_upload_id(upload_id)?;
        let entry = self.inner.sessions.entry(id).await?;

        self.inner
            .sessions
            .validate_chunk(&entry, chunk_index, data.len() as u64)
            .await?;

        if let Some(expected) = chunk_hash {
            if !verify_hash(&data, expected) {
                let actual = compute_hash(&data);
                tracing::warn!(
                    session_id = %id,
                    chunk_index = chunk_index,
                    expected = %expected,
                    actual = %actual,
                    "Chunk hash mismatch"
                );
                self.inner.sessions.record_chunk_failure(id, chunk_index).await?;
                return Err(UploadError::ChunkIntegrity {
                    index: chunk_index,
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        let stored = {
            let _worker = self
                .inner
                .chunk_workers
                .acquire()
                .await
                .map_err(|_| UploadError::StorageIo {
                    context: "acquiring chunk worker",
                })?;
            let _io = entry.io_guard().await;
            self.inner.chunk_store.put(id, chunk_index, data).await
        };

        match stored {
            Ok(()) => {}
            Err(e @ UploadError::StorageIo { .. }) => {
                if self.inner.sessions.fail(id).await.is_ok() {
                    self.inner.auditor.emit(
                        AuditEvent::UploadFailed,
                        Some(id),
                        json!({ "chunkIndex": chunk_index, "code": e.code() }),
                    );
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        let progress = self
            .inner
            .sessions
            .record_chunk_success(id, chunk_index)
            .await?;

        tracing::debug!(
            session_id = %id,
            chunk_index = chunk_index,
            received = progress.completed_count,
            total = progress.total_chunks,
            "Chunk received"
        );

        let artifact = if progress.is_complete && self.inner.auto_finalize {
            match self.inner.engine.assemble(id, None).await {
                Ok(artifact) => Some(artifact),
                // Another request got there first
                Err(UploadError::InvalidState { .. }) | Err(UploadError::SessionNotFound(_)) => None,
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        Ok(ChunkUploadResponse {
            chunk_index,
            accepted: true,
            completed_count: progress.completed_count,
            total_chunks: progress.total_chunks,
            is_complete: progress.is_complete,
            artifact,
        })
    }

    /// Progress of a live session
    pub async fn get_status(&self, upload_id: &str) -> Result<StatusResponse, UploadError> {
        let id = parse_upload_id(upload_id)?;
        let session = self.inner.sessions.get_session(id).await?;
        Ok(session.status_report(chrono::Utc::now()))
    }

    /// Cancel a session and free its chunks
    pub async fn cancel_upload(&self, upload_id: &str) -> Result<StatusResponse, UploadError> {
        let id = parse_upload_id(upload_id)?;
        let session = self.inner.sessions.cancel(id).await?;

        self.inner.auditor.emit(
            AuditEvent::UploadCancelled,
            Some(id),
            json!({
                "fileName": session.file_name,
                "chunksReceived": session.completed_chunks.len(),
            }),
        );

        Ok(session.status_report(chrono::Utc::now()))
    }

    /// Assemble a complete session
    pub async fn finalize_upload(
        &self,
        upload_id: &str,
        request: FinalizeRequest,
    ) -> Result<FinalizeResponse, UploadError> {
        let id = parse_upload_id(upload_id)?;
        let session = self.inner.sessions.get_session(id).await?;

        if let Some(expected) = request.expected_chunks {
            if expected != session.total_chunks {
                return Err(UploadError::InvalidRequest(format!(
                    "expectedChunks {} does not match session total {}",
                    expected, session.total_chunks
                )));
            }
        }

        if let (Some(supplied), Some(stored)) = (&request.file_checksum, &session.checksum) {
            if !supplied.eq_ignore_ascii_case(stored) {
                return Err(UploadError::IntegrityMismatch(upload_id.to_string()));
            }
        }

        let artifact = self
            .inner
            .engine
            .assemble(id, request.file_checksum.as_deref())
            .await?;

        Ok(FinalizeResponse {
            upload_id: upload_id.to_string(),
            artifact,
        })
    }

    /// Chunks still missing for an interrupted upload
    pub async fn resume_upload(
        &self,
        upload_id: &str,
        request: ResumeRequest,
    ) -> Result<ResumeResponse, UploadError> {
        let id = parse_upload_id(upload_id)?;
        let pending_chunks = self.inner.sessions.resume(id, &request.checksum).await?;
        let session = self.inner.sessions.get_session(id).await?;

        Ok(ResumeResponse {
            upload_id: upload_id.to_string(),
            pending_chunks,
            total_chunks: session.total_chunks,
        })
    }

    /// Live sessions, highest priority first
    pub async fn list_sessions(&self) -> Vec<StatusResponse> {
        self.inner.sessions.list_sessions().await
    }

    // ========================================================================
    // Cache Administration
    // ========================================================================

    pub async fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats().await
    }

    /// Drop one cache entry; the artifact file is left alone
    pub async fn invalidate_cache(&self, digest: &str) -> bool {
        self.inner
            .cache
            .invalidate(&digest.to_ascii_lowercase())
            .await
            .is_some()
    }

    pub async fn clear_cache(&self) -> usize {
        self.inner.cache.clear().await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Reload sessions persisted by a previous process
    pub async fn recover(&self) -> Result<usize, UploadError> {
        let recovered = self.inner.sessions.recover().await?;
        if recovered > 0 {
            tracing::info!(count = recovered, "Recovered upload sessions");
        }
        Ok(recovered)
    }

    /// One maintenance pass: expire idle sessions, sweep the cache, flush state
    pub async fn run_maintenance(&self) {
        for session in self.inner.sessions.sweep_expired().await {
            self.inner.auditor.emit(
                AuditEvent::UploadExpired,
                Some(session.id),
                json!({
                    "fileName": session.file_name,
                    "chunksReceived": session.completed_chunks.len(),
                }),
            );
        }

        self.inner.cache.sweep_expired().await;

        let flushed = self.inner.sessions.persist_all().await;
        tracing::debug!(sessions = flushed, "Maintenance pass complete");
    }

    /// Spawn the periodic maintenance task; a second call is a no-op
    pub fn start_maintenance(&self) {
        let mut slot = self.inner.maintenance.lock();
        if slot.is_some() {
            return;
        }

        let service = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let period = self.inner.sweep_interval;

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => service.run_maintenance().await,
                    _ = shutdown.changed() => break,
                }
            }

            tracing::info!("Upload maintenance stopped");
        }));

        tracing::info!(interval_secs = period.as_secs(), "Upload maintenance started");
    }

    /// Stop maintenance and flush session state
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);

        let handle = self.inner.maintenance.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Maintenance task ended abnormally");
            }
        }

        let flushed = self.inner.sessions.persist_all().await;
        tracing::info!(sessions = flushed, "Upload service shut down");
    }
}

/// Parse an upload ID; malformed IDs cannot name a session
fn parse_upload_id(upload_id: &str) -> Result<Uuid, UploadError> {
    Uuid::parse_str(upload_id).map_err(|_| UploadError::SessionNotFound(upload_id.to_string()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service(temp_dir: &TempDir, auto_finalize: bool) -> UploadService {
        let upload = UploadConfig {
            chunk_dir: temp_dir.path().join("chunks"),
            artifact_dir: temp_dir.path().join("artifacts"),
            quarantine_dir: temp_dir.path().join("quarantine"),
            auto_finalize,
            ..Default::default()
        };
        UploadService::new(&upload, &CacheSettings::default(), None, Collaborators::default()).unwrap()
    }

    fn request(content: &[u8], chunk_size: u64) -> InitRequest {
        InitRequest {
            file_name: "doc.txt".to_string(),
            file_size: content.len() as u64,
            chunk_size: Some(chunk_size),
            checksum: Some(compute_hash(content)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_chunk_hash_mismatch_records_failure() {
        let temp_dir = TempDir::new().unwrap();
        let service = service(&temp_dir, false);
        let init = service.init_upload(request(b"ABCDEF", 2)).await.unwrap();
        let id = init.upload_id.unwrap();

        let result = service
            .upload_chunk(&id, 1, Bytes::from_static(b"CD"), Some(&compute_hash(b"XX")))
            .await;
        match result {
            Err(UploadError::ChunkIntegrity { index, .. }) => assert_eq!(index, 1),
            other => panic!("expected chunk integrity error, got {:?}", other),
        }

        let status = service.get_status(&id).await.unwrap();
        assert_eq!(status.failed_chunks, vec![1]);
        assert_eq!(status.chunks_received, 0);

        // A correct resend clears the failure
        service
            .upload_chunk(&id, 1, Bytes::from_static(b"CD"), Some(&compute_hash(b"CD")))
            .await
            .unwrap();
        let status = service.get_status(&id).await.unwrap();
        assert!(status.failed_chunks.is_empty());
        assert_eq!(status.chunks_received, 1);
    }

    #[tokio::test]
    async fn test_chunk_validation() {
        let temp_dir = TempDir::new().unwrap();
        let service = service(&temp_dir, false);
        let id = service
            .init_upload(request(b"ABCDE", 2))
            .await
            .unwrap()
            .upload_id
            .unwrap();

        assert!(matches!(
            service.upload_chunk(&id, 3, Bytes::from_static(b"AB"), None).await,
            Err(UploadError::ChunkIndexOutOfBounds { index: 3, total: 3 })
        ));
        assert!(matches!(
            service.upload_chunk(&id, 0, Bytes::from_static(b"A"), None).await,
            Err(UploadError::ChunkSizeMismatch { expected: 2, actual: 1, .. })
        ));
        // Last chunk carries the remainder
        service
            .upload_chunk(&id, 2, Bytes::from_static(b"E"), None)
            .await
            .unwrap();
        assert!(matches!(
            service.upload_chunk("not-a-uuid", 0, Bytes::from_static(b"AB"), None).await,
            Err(UploadError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_auto_finalize_on_last_chunk() {
        let temp_dir = TempDir::new().unwrap();
        let service = service(&temp_dir, true);
        let id = service
            .init_upload(request(b"ABCD", 2))
            .await
            .unwrap()
            .upload_id
            .unwrap();

        let first = service
            .upload_chunk(&id, 1, Bytes::from_static(b"CD"), None)
            .await
            .unwrap();
        assert!(first.artifact.is_none());

        let last = service
            .upload_chunk(&id, 0, Bytes::from_static(b"AB"), None)
            .await
            .unwrap();
        assert!(last.is_complete);
        assert_eq!(last.artifact.unwrap().digest, compute_hash(b"ABCD"));
        assert!(service.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_finalize_checks_expected_chunks_and_checksum() {
        let temp_dir = TempDir::new().unwrap();
        let service = service(&temp_dir, false);
        let id = service
            .init_upload(request(b"ABCD", 2))
            .await
            .unwrap()
            .upload_id
            .unwrap();
        service.upload_chunk(&id, 0, Bytes::from_static(b"AB"), None).await.unwrap();
        service.upload_chunk(&id, 1, Bytes::from_static(b"CD"), None).await.unwrap();

        let wrong_count = FinalizeRequest {
            expected_chunks: Some(3),
            file_checksum: None,
        };
        assert!(matches!(
            service.finalize_upload(&id, wrong_count).await,
            Err(UploadError::InvalidRequest(_))
        ));

        let wrong_checksum = FinalizeRequest {
            expected_chunks: Some(2),
            file_checksum: Some("ff".to_string()),
        };
        assert!(matches!(
            service.finalize_upload(&id, wrong_checksum).await,
            Err(UploadError::IntegrityMismatch(_))
        ));

        // Session survives rejected finalize attempts
        let response = service
            .finalize_upload(&id, FinalizeRequest::default())
            .await
            .unwrap();
        assert_eq!(response.artifact.digest, compute_hash(b"ABCD"));
    }

    #[tokio::test]
    async fn test_encrypt_rejected_without_encryptor() {
        let temp_dir = TempDir::new().unwrap();
        let service = service(&temp_dir, false);
        let mut init = request(b"ABCD", 2);
        init.metadata.insert("encrypt".to_string(), "true".to_string());

        assert!(matches!(
            service.init_upload(init).await,
            Err(UploadError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_maintenance_start_and_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let service = service(&temp_dir, false);

        service.start_maintenance();
        service.start_maintenance();
        service.shutdown().await;

        assert!(service.inner.maintenance.lock().is_none());
    }
}
