//! Application state management

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::upload::UploadService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    uploads: UploadService,
    db: Option<SqlitePool>,
}

impl AppState {
    /// Create a new application state
    pub fn new(config: Config, uploads: UploadService, db: Option<SqlitePool>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                uploads,
                db,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the upload service
    pub fn uploads(&self) -> &UploadService {
        &self.inner.uploads
    }

    /// Get the database pool, when persistence is enabled
    pub fn db(&self) -> Option<&SqlitePool> {
        self.inner.db.as_ref()
    }
}
