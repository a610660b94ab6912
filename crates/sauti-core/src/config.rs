//! Queue configuration types.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::error::Result;

const APP_NAME_DIR: &str = "sauti";

/// Configuration for the queue, scheduler and blob store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// SQLite database backing the durable queue and state store
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Directory holding generated and uploaded blobs
    #[serde(default = "default_blob_dir")]
    pub blob_dir: PathBuf,

    /// Maximum number of items popped per scheduler cycle
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Sleep between polls of an empty queue (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Back-off after a failed scheduler cycle (milliseconds)
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,

    /// Age after which blobs are swept (seconds)
    #[serde(default = "default_blob_ttl_secs")]
    pub blob_ttl_secs: u64,

    /// Interval of the housekeeping sweep (seconds)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// How long finalized batch records are kept (seconds)
    #[serde(default = "default_record_retention_secs")]
    pub record_retention_secs: u64,

    /// Bound on joining background tasks at shutdown (seconds)
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Prefix used to build result urls from blob ids.
    #[serde(default = "default_result_url_prefix")]
    pub result_url_prefix: String,
}

fn default_data_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("data"))
        .join(APP_NAME_DIR)
}

fn default_db_path() -> PathBuf {
    default_data_root().join("sauti.sqlite3")
}

fn default_blob_dir() -> PathBuf {
    default_data_root().join("blobs")
}

fn default_max_batch_size() -> usize {
    8
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_error_backoff_ms() -> u64 {
    1_000
}

fn default_blob_ttl_secs() -> u64 {
    30 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_record_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

fn default_result_url_prefix() -> String {
    "/v1/files".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            blob_dir: default_blob_dir(),
            max_batch_size: default_max_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            blob_ttl_secs: default_blob_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            record_retention_secs: default_record_retention_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            result_url_prefix: default_result_url_prefix(),
        }
    }
}

impl QueueConfig {
    /// Load configuration from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                toml::from_str::<QueueConfig>(&content)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Override fields from `SAUTI_*` environment variables.
    ///
    /// Unparseable values are logged and ignored so a typo never prevents startup.
    pub fn apply_env_overrides(&mut self) {
        if let Some(path) = env_path("SAUTI_DB_PATH") {
            self.db_path = path;
        }
        if let Some(path) = env_path("SAUTI_BLOB_DIR") {
            self.blob_dir = path;
        }
        if let Some(size) = env_parse::<usize>("SAUTI_QUEUE_MAX_BATCH_SIZE") {
            self.max_batch_size = size;
        }
        if let Some(ms) = env_parse::<u64>("SAUTI_QUEUE_POLL_INTERVAL_MS") {
            self.poll_interval_ms = ms;
        }
        if let Some(secs) = env_parse::<u64>("SAUTI_BLOB_TTL_SECS") {
            self.blob_ttl_secs = secs;
        }
        if let Some(secs) = env_parse::<u64>("SAUTI_RECORD_RETENTION_SECS") {
            self.record_retention_secs = secs;
        }
    }

    /// Batch cap actually used by the scheduler (never zero).
    pub fn effective_batch_size(&self) -> usize {
        self.max_batch_size.max(1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn blob_ttl(&self) -> Duration {
        Duration::from_secs(self.blob_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn record_retention(&self) -> Duration {
        Duration::from_secs(self.record_retention_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().and_then(|raw| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(PathBuf::from(trimmed))
        }
    })
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Invalid {}='{}', keeping configured value", key, raw);
            None
        }
    }
}
