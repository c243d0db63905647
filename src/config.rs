//! Configuration management for Chunkyard Server

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;
use crate::upload::assembly::DEFAULT_MAX_BUFFERED_BYTES;
use crate::upload::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MEMORY_THRESHOLD, MAX_CONCURRENT_UPLOADS, MAX_FILE_SIZE,
    SESSION_TIMEOUT_HOURS,
};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub upload: UploadConfig,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Temp directory for disk-backed chunks
    pub chunk_dir: PathBuf,
    pub artifact_dir: PathBuf,
    pub quarantine_dir: PathBuf,
    /// Files at or above this size keep their chunks on disk
    pub memory_threshold: u64,
    pub default_chunk_size: u64,
    pub max_file_size: u64,
    /// 0 disables the admission limit
    pub max_concurrent_sessions: usize,
    pub max_concurrent_chunks: usize,
    pub session_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_buffered_bytes: u64,
    /// Assemble as soon as the last chunk arrives
    pub auto_finalize: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    pub max_size: u64,
    pub max_entries: usize,
    pub ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./chunkyard.db".to_string(),
            },
            upload: UploadConfig::default(),
            cache: CacheSettings::default(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            chunk_dir: env::temp_dir().join("chunkyard").join("chunks"),
            artifact_dir: PathBuf::from("./data/artifacts"),
            quarantine_dir: PathBuf::from("./data/quarantine"),
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: MAX_FILE_SIZE,
            max_concurrent_sessions: MAX_CONCURRENT_UPLOADS,
            max_concurrent_chunks: 16,
            session_timeout: Duration::from_secs(SESSION_TIMEOUT_HOURS as u64 * 60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
            auto_finalize: false,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            max_size: 10 * 1024 * 1024 * 1024,
            max_entries: 10_000,
            ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let upload_defaults = UploadConfig::default();
        let cache_defaults = CacheSettings::default();

        let config = Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_var("SERVER_PORT", 3000),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:./chunkyard.db".to_string()),
            },
            upload: UploadConfig {
                chunk_dir: path_var("UPLOAD_CHUNK_DIR", upload_defaults.chunk_dir),
                artifact_dir: path_var("UPLOAD_ARTIFACT_DIR", upload_defaults.artifact_dir),
                quarantine_dir: path_var("UPLOAD_QUARANTINE_DIR", upload_defaults.quarantine_dir),
                memory_threshold: parse_var("UPLOAD_MEMORY_THRESHOLD", upload_defaults.memory_threshold),
                default_chunk_size: parse_var("UPLOAD_CHUNK_SIZE", upload_defaults.default_chunk_size),
                max_file_size: parse_var("UPLOAD_MAX_FILE_SIZE", upload_defaults.max_file_size),
                max_concurrent_sessions: parse_var(
                    "UPLOAD_MAX_SESSIONS",
                    upload_defaults.max_concurrent_sessions,
                ),
                max_concurrent_chunks: parse_var(
                    "UPLOAD_MAX_CHUNK_WORKERS",
                    upload_defaults.max_concurrent_chunks,
                ),
                session_timeout: secs_var("UPLOAD_SESSION_TIMEOUT_SECS", upload_defaults.session_timeout),
                sweep_interval: secs_var("UPLOAD_SWEEP_INTERVAL_SECS", upload_defaults.sweep_interval),
                max_buffered_bytes: parse_var(
                    "UPLOAD_MAX_BUFFERED_BYTES",
                    upload_defaults.max_buffered_bytes,
                ),
                auto_finalize: parse_var("UPLOAD_AUTO_FINALIZE", upload_defaults.auto_finalize),
            },
            cache: CacheSettings {
                max_size: parse_var("CACHE_MAX_SIZE", cache_defaults.max_size),
                max_entries: parse_var("CACHE_MAX_ENTRIES", cache_defaults.max_entries),
                ttl: secs_var("CACHE_TTL_SECS", cache_defaults.ttl),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the upload core cannot run with
    pub fn validate(&self) -> Result<(), AppError> {
        let upload = &self.upload;

        if upload.default_chunk_size == 0 {
            return Err(AppError::Config("UPLOAD_CHUNK_SIZE must be positive".to_string()));
        }
        if upload.max_file_size == 0 {
            return Err(AppError::Config("UPLOAD_MAX_FILE_SIZE must be positive".to_string()));
        }
        if upload.max_concurrent_chunks == 0 {
            return Err(AppError::Config("UPLOAD_MAX_CHUNK_WORKERS must be positive".to_string()));
        }
        if upload.max_buffered_bytes == 0 {
            return Err(AppError::Config("UPLOAD_MAX_BUFFERED_BYTES must be positive".to_string()));
        }
        if upload.sweep_interval.is_zero() {
            return Err(AppError::Config("UPLOAD_SWEEP_INTERVAL_SECS must be positive".to_string()));
        }

        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, "Unparseable config value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn secs_var(name: &str, default: Duration) -> Duration {
    Duration::from_secs(parse_var(name, default.as_secs()))
}

fn path_var(name: &str, default: PathBuf) -> PathBuf {
    env::var_os(name).map(PathBuf::from).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.upload.max_concurrent_sessions, 5);
        assert_eq!(config.upload.default_chunk_size, 2 * 1024 * 1024);
        assert!(!config.upload.auto_finalize);
    }

    #[test]
    fn test_validate_rejects_zero_buffer() {
        let mut config = Config::default();
        config.upload.max_buffered_bytes = 0;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_parse_var_falls_back() {
        env::set_var("CHUNKYARD_TEST_BAD_NUMBER", "not-a-number");
        assert_eq!(parse_var("CHUNKYARD_TEST_BAD_NUMBER", 42u64), 42);

        env::set_var("CHUNKYARD_TEST_GOOD_NUMBER", " 7 ");
        assert_eq!(parse_var("CHUNKYARD_TEST_GOOD_NUMBER", 42u64), 7);

        assert!(parse_var("CHUNKYARD_TEST_UNSET", true));
    }
}
