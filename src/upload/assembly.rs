//! Reassembly Engine
//!
//! Streams a complete session's chunks, strictly in index order, into a
//! single artifact while hashing incrementally. A reader task fetches chunk
//! slices of at most `max_buffered_bytes` from the chunk store and a writer
//! drains them to disk; the two are coupled through a byte-denominated
//! semaphore so that no more than `max_buffered_bytes` of fetched-but-unwritten
//! data exists at any time, whatever the chunk size.
//!
//! Finished artifacts are named by their digest under `artifact_dir`.
//! Failed or rejected output never reaches that name.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use super::chunk_store::ChunkStore;
use super::collaborators::{AuditEvent, Collaborators};
use super::dedup_cache::DedupCache;
use super::hasher::ContentHasher;
use super::session::SessionManager;
use super::types::{ArtifactRef, UploadError, UploadSession};

/// Default unwritten-byte budget during assembly
pub const DEFAULT_MAX_BUFFERED_BYTES: u64 = 8 * 1024 * 1024;

/// Key used when `metadata.keyId` is not set
pub const DEFAULT_KEY_ID: &str = "default";

/// Slices in flight between reader and writer (the semaphore is the real bound)
const PIPELINE_DEPTH: usize = 16;

/// Reassembly settings
#[derive(Debug, Clone)]
pub struct AssemblyConfig {
    /// Finished artifacts, named by digest
    pub artifact_dir: PathBuf,
    /// Artifacts the scanner rejected
    pub quarantine_dir: PathBuf,
    /// Upper bound on fetched-but-unwritten bytes
    pub max_buffered_bytes: u64,
}

/// Result of streaming chunks to the partial file
#[derive(Debug)]
struct Streamed {
    digest: String,
    bytes_written: u64,
    peak_buffered: u64,
}

type Fetched = Result<(Bytes, OwnedSemaphorePermit), UploadError>;

/// Bytes read from the chunk store but not yet written out
#[derive(Default)]
struct BufferGauge {
    held: AtomicU64,
    peak: AtomicU64,
}

impl BufferGauge {
    fn add(&self, bytes: u64) {
        let held = self.held.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.peak.fetch_max(held, Ordering::SeqCst);
    }

    fn sub(&self, bytes: u64) {
        self.held.fetch_sub(bytes, Ordering::SeqCst);
    }

    fn peak(&self) -> u64 {
        self.peak.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Reassembly Engine
// ============================================================================

/// Turns complete sessions into artifacts
#[derive(Clone)]
pub struct ReassemblyEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: AssemblyConfig,
    sessions: SessionManager,
    chunk_store: ChunkStore,
    cache: DedupCache,
    collaborators: Collaborators,
}

impl ReassemblyEngine {
    pub fn new(
        config: AssemblyConfig,
        sessions: SessionManager,
        chunk_store: ChunkStore,
        cache: DedupCache,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                sessions,
                chunk_store,
                cache,
                collaborators,
            }),
        }
    }

    pub fn has_encryptor(&self) -> bool {
        self.inner.collaborators.encryptor.is_some()
    }

    /// Assemble a complete session into an artifact
    ///
    /// `fallback_checksum` is only consulted when the session itself carries
    /// no checksum. On every failure path the session ends up `failed`, its
    /// chunks are released and no artifact is registered.
    pub async fn assemble(
        &self,
        session_id: Uuid,
        fallback_checksum: Option<&str>,
    ) -> Result<ArtifactRef, UploadError> {
        let session = self.inner.sessions.begin_assembly(session_id).await?;
        let expected = session
            .checksum
            .clone()
            .or_else(|| fallback_checksum.map(|c| c.to_ascii_lowercase()));

        let partial = self.partial_path(session_id);
        let streamed = match self.stream_chunks(&session, &partial).await {
            Ok(streamed) => streamed,
            Err(e) => {
                discard(&partial).await;
                return Err(self.abort(&session, e).await);
            }
        };

        tracing::info!(
            session_id = %session_id,
            digest = %streamed.digest,
            bytes = streamed.bytes_written,
            peak_buffered = streamed.peak_buffered,
            "Chunks streamed to artifact"
        );

        // Integrity
        if let Some(expected) = expected {
            if !expected.eq_ignore_ascii_case(&streamed.digest) {
                discard(&partial).await;
                tracing::warn!(
                    session_id = %session_id,
                    expected = %expected,
                    actual = %streamed.digest,
                    "Assembled file hash mismatch"
                );
                let error = UploadError::IntegrityFailure {
                    expected,
                    actual: streamed.digest,
                };
                return Err(self.abort(&session, error).await);
            }
        }

        // Scan before the artifact gets its content-addressed name
        let report = match self
            .inner
            .collaborators
            .scanner
            .scan(&partial, &session.file_name)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                discard(&partial).await;
                return Err(self.abort(&session, UploadError::Collaborator(e.to_string())).await);
            }
        };

        if !report.clean {
            self.quarantine(&session, &partial).await;
            self.inner.collaborators.auditor.emit(
                AuditEvent::ThreatDetected,
                Some(session_id),
                json!({ "fileName": session.file_name, "threats": report.threats }),
            );
            let error = UploadError::ThreatDetected {
                threats: report.threats,
            };
            return Err(self.abort(&session, error).await);
        }

        let artifact_path = self.inner.config.artifact_dir.join(&streamed.digest);
        if let Err(e) = tokio::fs::rename(&partial, &artifact_path).await {
            discard(&partial).await;
            let error = UploadError::storage_io("publishing artifact", &artifact_path, e);
            return Err(self.abort(&session, error).await);
        }

        let (stored_path, encrypted) = match self.encrypt(&session, &artifact_path).await {
            Ok(stored) => stored,
            Err(e) => {
                self.discard_unshared(&streamed.digest, &artifact_path).await;
                return Err(self.abort(&session, e).await);
            }
        };

        // Visible to dedup lookups before the session is marked completed
        let registered = self
            .inner
            .cache
            .insert(&streamed.digest, stored_path.clone(), session.file_size, encrypted)
            .await;

        // Cancelled while assembling: the session is gone, so is the artifact
        if let Err(e) = self.inner.sessions.complete(session_id).await {
            match registered {
                // Someone else registered the same content; it stays
                Some(registered) if registered.replaced => {}
                Some(registered) => {
                    self.inner.cache.retract(&registered.entry).await;
                    self.discard_unshared(&streamed.digest, &stored_path).await;
                }
                None => self.discard_unshared(&streamed.digest, &stored_path).await,
            }
            return Err(e);
        }

        self.inner.collaborators.auditor.emit(
            AuditEvent::UploadCompleted,
            Some(session_id),
            json!({
                "fileName": session.file_name,
                "digest": streamed.digest,
                "size": session.file_size,
                "encrypted": encrypted,
                "ownerId": session.metadata.owner_id,
            }),
        );

        tracing::info!(
            session_id = %session_id,
            file_name = %session.file_name,
            digest = %streamed.digest,
            size = session.file_size,
            encrypted = encrypted,
            "File assembled successfully"
        );

        Ok(ArtifactRef {
            digest: streamed.digest,
            size: session.file_size,
            encrypted,
        })
    }

    // ========================================================================
    // Streaming
    // ========================================================================

    fn partial_path(&self, session_id: Uuid) -> PathBuf {
        self.inner
            .config
            .artifact_dir
            .join(format!("{}.partial", session_id))
    }

    fn buffer_budget(&self) -> u32 {
        self.inner
            .config
            .max_buffered_bytes
            .clamp(1, u32::MAX as u64) as u32
    }

    async fn stream_chunks(
        &self,
        session: &UploadSession,
        partial: &Path,
    ) -> Result<Streamed, UploadError> {
        let artifact_dir = &self.inner.config.artifact_dir;
        tokio::fs::create_dir_all(artifact_dir)
            .await
            .map_err(|e| UploadError::storage_io("creating artifact directory", artifact_dir, e))?;

        let mut file = tokio::fs::File::create(partial)
            .await
            .map_err(|e| UploadError::storage_io("creating artifact", partial, e))?;
        let mut hasher = ContentHasher::new();

        let budget = self.buffer_budget();
        let buffer = Arc::new(Semaphore::new(budget as usize));
        let gauge = Arc::new(BufferGauge::default());
        let (tx, mut rx) = mpsc::channel::<Fetched>(PIPELINE_DEPTH);

        let reader = tokio::spawn(read_in_order(
            self.inner.chunk_store.clone(),
            session.clone(),
            buffer,
            budget,
            gauge.clone(),
            tx,
        ));

        let result: Result<Streamed, UploadError> = async {
            while let Some(fetched) = rx.recv().await {
                let (data, permit) = fetched?;

                hasher.update(&data);
                file.write_all(&data)
                    .await
                    .map_err(|e| UploadError::storage_io("writing artifact", partial, e))?;

                gauge.sub(data.len() as u64);
                drop(permit);
            }

            file.flush()
                .await
                .map_err(|e| UploadError::storage_io("writing artifact", partial, e))?;
            file.sync_all()
                .await
                .map_err(|e| UploadError::storage_io("syncing artifact", partial, e))?;

            let bytes_written = hasher.bytes_hashed();
            if bytes_written != session.file_size {
                tracing::error!(
                    session_id = %session.id,
                    bytes = bytes_written,
                    expected_bytes = session.file_size,
                    "Assembled artifact is short"
                );
                return Err(UploadError::StorageIo {
                    context: "assembling artifact",
                });
            }

            Ok(Streamed {
                digest: hasher.finalize(),
                bytes_written,
                peak_buffered: gauge.peak(),
            })
        }
        .await;

        reader.abort();
        result
    }

    // ========================================================================
    // Handoff
    // ========================================================================

    async fn encrypt(
        &self,
        session: &UploadSession,
        artifact_path: &Path,
    ) -> Result<(PathBuf, bool), UploadError> {
        if !session.metadata.encrypt {
            return Ok((artifact_path.to_path_buf(), false));
        }

        let Some(encryptor) = &self.inner.collaborators.encryptor else {
            return Err(UploadError::Collaborator(
                "encryption requested but no encryptor is configured".to_string(),
            ));
        };

        let key_id = session.metadata.key_id.as_deref().unwrap_or(DEFAULT_KEY_ID);
        let encrypted = encryptor
            .encrypt(artifact_path, key_id)
            .await
            .map_err(|e| UploadError::Collaborator(e.to_string()))?;

        tracing::info!(session_id = %session.id, key_id = %key_id, "Artifact encrypted");
        Ok((encrypted, true))
    }

    async fn quarantine(&self, session: &UploadSession, partial: &Path) {
        let dir = &self.inner.config.quarantine_dir;
        let target = dir.join(format!("{}_{}", session.id, safe_file_name(&session.file_name)));

        let moved = match tokio::fs::create_dir_all(dir).await {
            Ok(()) => tokio::fs::rename(partial, &target).await,
            Err(e) => Err(e),
        };

        match moved {
            Ok(()) => {
                tracing::warn!(
                    session_id = %session.id,
                    file_name = %session.file_name,
                    path = %target.display(),
                    "Artifact quarantined"
                );
            }
            Err(e) => {
                tracing::error!(
                    session_id = %session.id,
                    path = %target.display(),
                    error = %e,
                    "Failed to quarantine artifact, discarding"
                );
                discard(partial).await;
            }
        }
    }

    /// Mark the session failed and pick the error to return
    async fn abort(&self, session: &UploadSession, error: UploadError) -> UploadError {
        match self.inner.sessions.fail(session.id).await {
            Ok(_) => {
                tracing::error!(
                    session_id = %session.id,
                    file_name = %session.file_name,
                    error = %error,
                    "Assembly failed"
                );
                self.inner.collaborators.auditor.emit(
                    AuditEvent::UploadFailed,
                    Some(session.id),
                    json!({ "fileName": session.file_name, "code": error.code() }),
                );
                error
            }
            // Someone else retired it first (cancel or expiry)
            Err(not_found) => not_found,
        }
    }

    /// Remove an artifact unless the cache already points at it
    async fn discard_unshared(&self, digest: &str, path: &Path) {
        if !self.inner.cache.contains(digest).await {
            discard(path).await;
        }
    }
}

/// Fetch chunks in index order as slices of at most `budget` bytes,
/// reserving buffer budget before each read
async fn read_in_order(
    chunk_store: ChunkStore,
    session: UploadSession,
    buffer: Arc<Semaphore>,
    budget: u32,
    gauge: Arc<BufferGauge>,
    tx: mpsc::Sender<Fetched>,
) {
    for index in 0..session.total_chunks {
        let expected_len = session.chunk_len(index);
        let stored_len = match chunk_store.stored_len(session.id, index).await {
            Ok(len) => len,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        if stored_len != expected_len {
            tracing::error!(
                session_id = %session.id,
                chunk_index = index,
                expected = expected_len,
                actual = stored_len,
                "Stored chunk has wrong length"
            );
            let _ = tx
                .send(Err(UploadError::StorageIo {
                    context: "reading chunk",
                }))
                .await;
            return;
        }

        let mut offset = 0u64;
        while offset < expected_len {
            let len = (expected_len - offset).min(budget as u64) as u32;
            let permit = match buffer.clone().acquire_many_owned(len).await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let fetched = chunk_store
                .read_range(session.id, index, offset, len as usize)
                .await
                .map(|data| {
                    gauge.add(data.len() as u64);
                    (data, permit)
                });
            let failed = fetched.is_err();

            if tx.send(fetched).await.is_err() || failed {
                return;
            }
            offset += len as u64;
        }
    }
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to discard artifact");
        }
    }
}

/// Last path component of a client-supplied name
fn safe_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "upload".to_string())
}

// ============================================================================
// Tests
// ============================================================================
