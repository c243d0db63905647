//! Resumable Chunked Upload Module
//!
//! Implements reliable large file uploads with:
//! - Out-of-order, retryable chunk delivery
//! - Memory or temp-file chunk storage chosen by file size
//! - Ordered, bounded-memory reassembly with incremental SHA-256
//! - Content-addressed dedup cache with TTL and LRU eviction
//! - Crash recovery from persisted session state
//!
//! Flow:
//! 1. Client calls init with file size, chunking and (optionally) checksum
//! 2. A known checksum short-circuits to the cached artifact
//! 3. Client uploads chunks in any order, resending failures
//! 4. Once complete, the reassembly engine builds and hands off the artifact

pub mod assembly;
pub mod chunk_store;
pub mod collaborators;
pub mod dedup_cache;
pub mod hasher;
pub mod service;
pub mod session;
pub mod types;

pub use assembly::{AssemblyConfig, ReassemblyEngine};
pub use chunk_store::{Backing, ChunkStorage, ChunkStore};
pub use collaborators::{
    AuditEvent, AuditRecord, AuditSink, Auditor, CollaboratorError, Collaborators, Encryptor,
    NoopScanner, ScanReport, Scanner, TracingAuditSink,
};
pub use dedup_cache::{CacheConfig, CacheEntry, CacheStats, DedupCache, Registered};
pub use hasher::{compute_hash, verify_hash, ContentHasher};
pub use service::UploadService;
pub use session::{InitOutcome, SessionLimits, SessionManager};
pub use types::*;
