//! Downstream collaborators
//!
//! Interfaces the reassembly engine hands finished artifacts to. Threat
//! scanning and encryption algorithms live outside this crate; only the
//! defaults needed to run standalone are provided here.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

/// Collaborator failure
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("Scanner unavailable: {0}")]
    ScannerUnavailable(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Audit sink unavailable: {0}")]
    AuditUnavailable(String),
}

// ============================================================================
// Scanner
// ============================================================================

/// Outcome of scanning an artifact
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub clean: bool,
    pub threats: Vec<String>,
}

impl ScanReport {
    pub fn clean() -> Self {
        Self {
            clean: true,
            threats: Vec::new(),
        }
    }
}

/// Content threat scanner
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self, artifact_path: &Path, original_name: &str)
        -> Result<ScanReport, CollaboratorError>;
}

/// Scanner that accepts everything
#[derive(Debug, Default)]
pub struct NoopScanner;

#[async_trait]
impl Scanner for NoopScanner {
    async fn scan(&self, _artifact_path: &Path, _original_name: &str) -> Result<ScanReport, CollaboratorError> {
        Ok(ScanReport::clean())
    }
}

// ============================================================================
// Encryptor
// ============================================================================

/// Payload encryption, requested per upload via `metadata.encrypt`
#[async_trait]
pub trait Encryptor: Send + Sync {
    /// Encrypt the artifact and return the path of the encrypted file
    async fn encrypt(&self, artifact_path: &Path, key_id: &str) -> Result<PathBuf, CollaboratorError>;
}

// ============================================================================
// Audit
// ============================================================================

/// Upload lifecycle events recorded for auditing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    UploadStarted,
    DedupHit,
    UploadCompleted,
    UploadCancelled,
    UploadExpired,
    UploadFailed,
    ThreatDetected,
}

/// A single audit record
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub event: AuditEvent,
    pub session_id: Option<Uuid>,
    pub details: serde_json::Value,
}

/// Fire-and-forget audit sink
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), CollaboratorError>;
}

/// Audit sink that emits tracing events
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), CollaboratorError> {
        tracing::info!(
            target: "chunkyard_server::audit",
            event = ?record.event,
            session_id = ?record.session_id,
            details = %record.details,
            "audit"
        );
        Ok(())
    }
}

/// Dispatches audit records without blocking the caller
#[derive(Clone)]
pub struct Auditor {
    sink: Arc<dyn AuditSink>,
}

impl Auditor {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Record an event on a background task; failures are only logged
    pub fn emit(&self, event: AuditEvent, session_id: Option<Uuid>, details: serde_json::Value) {
        let sink = self.sink.clone();
        let record = AuditRecord {
            event,
            session_id,
            details,
        };

        tokio::spawn(async move {
            if let Err(e) = sink.record(record).await {
                tracing::warn!(
                    event = ?event,
                    session_id = ?session_id,
                    error = %e,
                    "Audit record dropped"
                );
            }
        });
    }
}

impl Default for Auditor {
    fn default() -> Self {
        Self::new(Arc::new(TracingAuditSink))
    }
}

// ============================================================================
// Bundle
// ============================================================================

/// Collaborators wired into the reassembly engine
#[derive(Clone)]
pub struct Collaborators {
    pub scanner: Arc<dyn Scanner>,
    pub encryptor: Option<Arc<dyn Encryptor>>,
    pub auditor: Auditor,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            scanner: Arc::new(NoopScanner),
            encryptor: None,
            auditor: Auditor::default(),
        }
    }
}
