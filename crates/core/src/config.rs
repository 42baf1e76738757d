//! Centralized configuration management.
//!
//! All configuration is loaded from environment variables at startup.
//! This provides a single source of truth and fails fast if required config
//! is missing. Handles are passed explicitly through constructors; nothing
//! here is a process-wide global.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub staging: StagingConfig,
    pub secrets: SecretsConfig,
    pub pipeline: PipelineConfig,
    pub server: ServerConfig,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

/// Staging filesystem layout. Raw uploads land under `upload_base/<uuid>`,
/// converter output under `converted_base/<uuid>`, chunked-upload scratch
/// under `scratch_base/<session_id>`, and advisory process locks under
/// `lock_dir`.
#[derive(Debug, Clone)]
pub struct StagingConfig {
    pub upload_base: PathBuf,
    pub converted_base: PathBuf,
    pub scratch_base: PathBuf,
    pub lock_dir: PathBuf,
}

/// Secrets for third-party token decryption and OAuth refresh.
#[derive(Debug, Clone)]
pub struct SecretsConfig {
    /// First process-scoped secret; the AES key is derived from it.
    pub token_secret_key: String,
    /// Second process-scoped secret; the nonce is derived from it.
    pub token_secret_salt: String,
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
}

/// Scheduler, executor, and reaper tunables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// How often idle schedulers poll the store for claimable work.
    pub poll_interval: Duration,
    /// Per-phase retry budget (upload and conversion counted separately).
    pub max_retries: i32,
    /// Wall-clock budget for a single upload or conversion run.
    pub phase_timeout: Duration,
    pub reaper_interval: Duration,
    /// Claims older than this with no progress writes are considered stale.
    pub stale_threshold: Duration,
    pub max_file_size_bytes: u64,
    pub chunk_size_bytes: u64,
    /// Chunked-upload sessions not completed within this window are reaped.
    pub session_expiry: Duration,
    pub max_concurrent_jobs: usize,
    /// Converter executable invoked as `<cmd> <input> <output> <sensor>`.
    pub converter_command: String,
    /// Minimum spacing between progress writes for a single record.
    pub progress_write_interval: Duration,
}

/// Server configuration (API binary only)
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub hostname: String,
    pub port: u16,
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// This should be called once at application startup.
    /// It will fail fast if required configuration is missing.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database: DatabaseConfig::from_env()?,
            staging: StagingConfig::from_env()?,
            secrets: SecretsConfig::from_env()?,
            pipeline: PipelineConfig::from_env()?,
            server: ServerConfig::from_env()?,
        })
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("DATABASE_URL").context("DATABASE_URL is required")?,
            max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("DB_MAX_CONNECTIONS must be a number")?,
            min_connections: env::var("DB_MIN_CONNECTIONS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .context("DB_MIN_CONNECTIONS must be a number")?,
            acquire_timeout: Duration::from_secs(
                env::var("DB_ACQUIRE_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .context("DB_ACQUIRE_TIMEOUT_SECS must be a number")?,
            ),
        })
    }
}

impl StagingConfig {
    pub fn from_env() -> Result<Self> {
        let upload_base: PathBuf = env::var("UPLOAD_BASE_DIR")
            .context("UPLOAD_BASE_DIR is required")?
            .into();
        let converted_base: PathBuf = env::var("CONVERTED_BASE_DIR")
            .context("CONVERTED_BASE_DIR is required")?
            .into();
        let scratch_base: PathBuf = env::var("SCRATCH_BASE_DIR")
            .context("SCRATCH_BASE_DIR is required")?
            .into();
        let lock_dir: PathBuf = env::var("LOCK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| scratch_base.join("locks"));
        Ok(Self { upload_base, converted_base, scratch_base, lock_dir })
    }
}

impl SecretsConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            token_secret_key: env::var("TOKEN_SECRET_KEY")
                .context("TOKEN_SECRET_KEY is required")?,
            token_secret_salt: env::var("TOKEN_SECRET_SALT")
                .context("TOKEN_SECRET_SALT is required")?,
            google_client_id: env::var("GOOGLE_CLIENT_ID").ok().filter(|s| !s.is_empty()),
            google_client_secret: env::var("GOOGLE_CLIENT_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
        })
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            poll_interval: Duration::from_secs(
                env::var("POLL_INTERVAL_SECS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .context("POLL_INTERVAL_SECS must be a number")?,
            ),
            max_retries: env::var("MAX_RETRIES")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .context("MAX_RETRIES must be a number")?,
            phase_timeout: Duration::from_secs(
                env::var("PHASE_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "7200".to_string())
                    .parse()
                    .context("PHASE_TIMEOUT_SECS must be a number")?,
            ),
            reaper_interval: Duration::from_secs(
                env::var("REAPER_INTERVAL_SECS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .context("REAPER_INTERVAL_SECS must be a number")?,
            ),
            stale_threshold: Duration::from_secs(
                env::var("STALE_THRESHOLD_SECS")
                    .unwrap_or_else(|_| "1800".to_string())
                    .parse()
                    .context("STALE_THRESHOLD_SECS must be a number")?,
            ),
            max_file_size_bytes: env::var("MAX_FILE_SIZE_BYTES")
                .unwrap_or_else(|_| (10u64 * 1024 * 1024 * 1024 * 1024).to_string()) // 10 TiB
                .parse()
                .context("MAX_FILE_SIZE_BYTES must be a number")?,
            chunk_size_bytes: env::var("CHUNK_SIZE_BYTES")
                .unwrap_or_else(|_| (100 * 1024 * 1024).to_string()) // 100 MiB
                .parse()
                .context("CHUNK_SIZE_BYTES must be a number")?,
            session_expiry: Duration::from_secs(
                env::var("SESSION_EXPIRY_SECS")
                    .unwrap_or_else(|_| (7 * 24 * 3600).to_string()) // 7 days
                    .parse()
                    .context("SESSION_EXPIRY_SECS must be a number")?,
            ),
            max_concurrent_jobs: env::var("MAX_CONCURRENT_JOBS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .context("MAX_CONCURRENT_JOBS must be a number")?,
            converter_command: env::var("CONVERTER_COMMAND")
                .unwrap_or_else(|_| "run-conversion".to_string()),
            progress_write_interval: Duration::from_secs(
                env::var("PROGRESS_WRITE_INTERVAL_SECS")
                    .unwrap_or_else(|_| "1".to_string())
                    .parse()
                    .context("PROGRESS_WRITE_INTERVAL_SECS must be a number")?,
            ),
        })
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            hostname: env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a number")?,
        })
    }
}
