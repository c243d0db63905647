//! Chunkyard Server Library
//!
//! Resumable chunked uploads with content-addressed deduplication.
//! The server binary is in main.rs; the modules are exposed for
//! integration tests.
//!
//! # Modules
//!
//! - `upload`: Session manager, chunk store, reassembly engine, dedup cache
//! - `db`: SQLite persistence of session state for crash recovery
//! - `routes`: axum HTTP surface over the upload service

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod upload;
