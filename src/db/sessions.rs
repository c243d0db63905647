//! Upload session persistence
//!
//! Stores index sets and bookkeeping only; chunk bytes live in the chunk
//! store.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::upload::{SessionStatus, UploadMetadata, UploadSession};

/// Upload session record as stored
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRecord {
    pub id: String,
    pub file_name: String,
    pub file_size: i64,
    pub chunk_size: i64,
    pub total_chunks: i64,
    pub completed_chunks: String,
    pub failed_chunks: String,
    pub checksum: Option<String>,
    pub status: String,
    pub priority: i64,
    pub metadata: String,
    pub started_at: String,
    pub last_activity: String,
}

impl SessionRecord {
    pub fn from_session(session: &UploadSession) -> Result<Self> {
        Ok(Self {
            id: session.id.to_string(),
            file_name: session.file_name.clone(),
            file_size: session.file_size as i64,
            chunk_size: session.chunk_size as i64,
            total_chunks: session.total_chunks as i64,
            completed_chunks: serde_json::to_string(&session.completed_chunks)?,
            failed_chunks: serde_json::to_string(&session.failed_chunks)?,
            checksum: session.checksum.clone(),
            status: session.status.as_str().to_string(),
            priority: session.priority as i64,
            metadata: serde_json::to_string(&session.metadata)?,
            started_at: session.started_at.to_rfc3339(),
            last_activity: session.last_activity.to_rfc3339(),
        })
    }

    pub fn into_session(self) -> Result<UploadSession> {
        let corrupt = |reason: String| AppError::CorruptRecord {
            id: self.id.clone(),
            reason,
        };

        let id = Uuid::parse_str(&self.id).map_err(|e| corrupt(e.to_string()))?;
        let status = self
            .status
            .parse::<SessionStatus>()
            .map_err(|e| corrupt(e.to_string()))?;
        let completed_chunks: BTreeSet<usize> = serde_json::from_str(&self.completed_chunks)?;
        let failed_chunks: BTreeSet<usize> = serde_json::from_str(&self.failed_chunks)?;
        let metadata: UploadMetadata = serde_json::from_str(&self.metadata)?;
        let started_at = parse_timestamp(&self.started_at).map_err(corrupt)?;
        let last_activity = parse_timestamp(&self.last_activity).map_err(corrupt)?;

        if self.file_size <= 0 || self.chunk_size <= 0 {
            return Err(corrupt("non-positive size".to_string()));
        }

        Ok(UploadSession {
            id,
            file_name: self.file_name.clone(),
            file_size: self.file_size as u64,
            chunk_size: self.chunk_size as u64,
            total_chunks: self.total_chunks as usize,
            completed_chunks,
            failed_chunks,
            status,
            priority: self.priority as i32,
            checksum: self.checksum.clone(),
            started_at,
            last_activity,
            metadata,
        })
    }
}

fn parse_timestamp(value: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp {:?}: {}", value, e))
}

/// Upload session repository
#[derive(Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update a session record
    pub async fn upsert(&self, session: &UploadSession) -> Result<()> {
        let record = SessionRecord::from_session(session)?;

        sqlx::query(
            r#"
            INSERT INTO upload_sessions (id, file_name, file_size, chunk_size, total_chunks,
                                         completed_chunks, failed_chunks, checksum, status,
                                         priority, metadata, started_at, last_activity)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                completed_chunks = excluded.completed_chunks,
                failed_chunks = excluded.failed_chunks,
                checksum = excluded.checksum,
                status = excluded.status,
                priority = excluded.priority,
                last_activity = excluded.last_activity
            "#,
        )
        .bind(&record.id)
        .bind(&record.file_name)
        .bind(record.file_size)
        .bind(record.chunk_size)
        .bind(record.total_chunks)
        .bind(&record.completed_chunks)
        .bind(&record.failed_chunks)
        .bind(&record.checksum)
        .bind(&record.status)
        .bind(record.priority)
        .bind(&record.metadata)
        .bind(&record.started_at)
        .bind(&record.last_activity)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete a session record
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM upload_sessions WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Load every session that has not reached a terminal state
    ///
    /// Corrupt rows are logged and skipped.
    pub async fn load_active(&self) -> Result<Vec<UploadSession>> {
        let records = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT id, file_name, file_size, chunk_size, total_chunks, completed_chunks,
                   failed_chunks, checksum, status, priority, metadata, started_at, last_activity
            FROM upload_sessions
            WHERE status IN ('initializing', 'receiving', 'assembling')
            ORDER BY started_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut sessions = Vec::with_capacity(records.len());
        for record in records {
            let id = record.id.clone();
            match record.into_session() {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "Skipping corrupt session record");
                }
            }
        }

        Ok(sessions)
    }
}
