//! Configuration module
//!
//! Environment-driven configuration for the relay daemon: capture directory,
//! segment store path, remote storage backend, delivery/retry tuning and the
//! local buffer policy.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

const UPLOAD_WORKERS: usize = 4;
const CLAIM_BATCH_SIZE: i64 = 8;
const UPLOAD_TIMEOUT_SECS: u64 = 30;
const MAX_UPLOAD_ATTEMPTS: i32 = 5;
const RETRY_BASE_DELAY_SECS: u64 = 5;
const RETRY_MAX_DELAY_SECS: u64 = 600;
const RETRY_JITTER_RATIO: f64 = 0.2;
const POLL_INTERVAL_MS: u64 = 1000;
const SCAN_INTERVAL_SECS: u64 = 2;
const STABILITY_WINDOW_MS: u64 = 1500;
const BUFFER_RETENTION_MINUTES: i64 = 30;
const MAX_BUFFER_MB: u64 = 2000;
const EVICTION_INTERVAL_SECS: u64 = 60;
const RECORD_RETENTION_DAYS: i64 = 7;
const SERVER_PORT: u16 = 8080;

/// Remote storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    S3,
    Local,
}

/// Application configuration, loaded from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    pub camera_id: String,
    /// Directory the capture process writes segment files into.
    pub segments_dir: PathBuf,
    /// SQLite segment store path.
    pub db_path: PathBuf,

    // Remote storage
    pub storage_backend: StorageBackend,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    /// Key prefix ahead of the camera/date partition (default "cameras").
    pub remote_prefix: String,
    /// Destination directory for the local backend.
    pub local_remote_path: Option<PathBuf>,

    // Delivery
    pub upload_workers: usize,
    pub claim_batch_size: i64,
    pub upload_timeout: Duration,
    pub max_upload_attempts: i32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_jitter_ratio: f64,
    pub poll_interval: Duration,

    // Local buffer
    pub scan_interval: Duration,
    pub stability_window: Duration,
    pub buffer_retention_minutes: i64,
    pub max_buffer_bytes: i64,
    pub eviction_interval: Duration,
    /// Retention policy for failed segments: when true their local files are
    /// eligible for eviction, when false they are kept for inspection.
    pub discard_failed: bool,
    pub record_retention_days: i64,

    // Reconciliation
    /// 0 disables periodic runs; the startup run always happens.
    pub reconcile_interval_secs: u64,

    // HTTP surface
    pub server_enabled: bool,
    pub server_port: u16,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let camera_id = env::var("CAMERA_ID").unwrap_or_else(|_| "camera".to_string());

        let segments_dir: PathBuf = env::var("SEGMENTS_DIR")
            .map_err(|_| anyhow::anyhow!("SEGMENTS_DIR must be set"))?
            .into();

        let db_path: PathBuf = env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| segments_dir.join("camrelay.db"));

        let storage_backend = match env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "s3".to_string())
            .to_lowercase()
            .as_str()
        {
            "local" => StorageBackend::Local,
            _ => StorageBackend::S3,
        };

        let config = Config {
            camera_id,
            segments_dir,
            db_path,
            storage_backend,
            s3_bucket: env::var("S3_BUCKET").ok(),
            s3_region: env::var("S3_REGION").ok().or_else(|| env::var("AWS_REGION").ok()),
            s3_endpoint: env::var("S3_ENDPOINT").ok(),
            remote_prefix: env::var("REMOTE_PREFIX").unwrap_or_else(|_| "cameras".to_string()),
            local_remote_path: env::var("LOCAL_REMOTE_PATH").ok().map(PathBuf::from),
            upload_workers: env_parse("UPLOAD_WORKERS", UPLOAD_WORKERS),
            claim_batch_size: env_parse("CLAIM_BATCH_SIZE", CLAIM_BATCH_SIZE),
            upload_timeout: Duration::from_secs(env_parse(
                "UPLOAD_TIMEOUT_SECS",
                UPLOAD_TIMEOUT_SECS,
            )),
            max_upload_attempts: env_parse("MAX_UPLOAD_ATTEMPTS", MAX_UPLOAD_ATTEMPTS),
            retry_base_delay: Duration::from_secs(env_parse(
                "RETRY_BASE_DELAY_SECS",
                RETRY_BASE_DELAY_SECS,
            )),
            retry_max_delay: Duration::from_secs(env_parse(
                "RETRY_MAX_DELAY_SECS",
                RETRY_MAX_DELAY_SECS,
            )),
            retry_jitter_ratio: env_parse("RETRY_JITTER_RATIO", RETRY_JITTER_RATIO),
            poll_interval: Duration::from_millis(env_parse("POLL_INTERVAL_MS", POLL_INTERVAL_MS)),
            scan_interval: Duration::from_secs(env_parse("SCAN_INTERVAL_SECS", SCAN_INTERVAL_SECS)),
            stability_window: Duration::from_millis(env_parse(
                "STABILITY_WINDOW_MS",
                STABILITY_WINDOW_MS,
            )),
            buffer_retention_minutes: env_parse(
                "BUFFER_RETENTION_MINUTES",
                BUFFER_RETENTION_MINUTES,
            ),
            max_buffer_bytes: env_parse("MAX_BUFFER_MB", MAX_BUFFER_MB) as i64 * 1024 * 1024,
            eviction_interval: Duration::from_secs(env_parse(
                "EVICTION_INTERVAL_SECS",
                EVICTION_INTERVAL_SECS,
            )),
            discard_failed: env_parse("DISCARD_FAILED", true),
            record_retention_days: env_parse("RECORD_RETENTION_DAYS", RECORD_RETENTION_DAYS),
            reconcile_interval_secs: env_parse("RECONCILE_INTERVAL_SECS", 0),
            server_enabled: env_parse("SERVER_ENABLED", true),
            server_port: env_parse("SERVER_PORT", SERVER_PORT),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.camera_id.is_empty() {
            return Err(anyhow::anyhow!("CAMERA_ID must not be empty"));
        }
        if self.upload_workers == 0 {
            return Err(anyhow::anyhow!("UPLOAD_WORKERS must be at least 1"));
        }
        if self.claim_batch_size <= 0 {
            return Err(anyhow::anyhow!("CLAIM_BATCH_SIZE must be at least 1"));
        }
        if self.max_upload_attempts <= 0 {
            return Err(anyhow::anyhow!("MAX_UPLOAD_ATTEMPTS must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.retry_jitter_ratio) {
            return Err(anyhow::anyhow!("RETRY_JITTER_RATIO must be in [0, 1)"));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(anyhow::anyhow!(
                "RETRY_BASE_DELAY_SECS must not exceed RETRY_MAX_DELAY_SECS"
            ));
        }
        if self.max_buffer_bytes <= 0 {
            return Err(anyhow::anyhow!("MAX_BUFFER_MB must be positive"));
        }
        match self.storage_backend {
            StorageBackend::S3 => {
                if self.s3_bucket.is_none() {
                    return Err(anyhow::anyhow!(
                        "S3_BUCKET must be set when using the S3 storage backend"
                    ));
                }
                if self.s3_region.is_none() {
                    return Err(anyhow::anyhow!(
                        "S3_REGION or AWS_REGION must be set when using the S3 storage backend"
                    ));
                }
            }
            StorageBackend::Local => {
                if self.local_remote_path.is_none() {
                    return Err(anyhow::anyhow!(
                        "LOCAL_REMOTE_PATH must be set when using the local storage backend"
                    ));
                }
            }
        }
        Ok(())
    }
}
