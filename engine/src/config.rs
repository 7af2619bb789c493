//! Configuration for the sync engine and the offline queue.
//!
//! Both structs deserialize from camelCase JSON with every field optional, and
//! can be loaded from `CAIRN_*` environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// How conflicts reported by the remote are settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Keep local data and re-push it above the remote version
    #[default]
    ClientWins,
    /// Take the remote record
    ServerWins,
    /// Hold the conflict until the application resolves it
    Manual,
}

impl FromStr for ConflictPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client-wins" => Ok(ConflictPolicy::ClientWins),
            "server-wins" => Ok(ConflictPolicy::ServerWins),
            "manual" => Ok(ConflictPolicy::Manual),
            other => Err(ConfigError::InvalidValue {
                key: "CAIRN_CONFLICT_RESOLUTION",
                value: other.to_string(),
            }),
        }
    }
}

/// Sync engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Remote sync endpoint URL
    pub endpoint: String,
    /// Bearer token sent with every push
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Records per push request
    pub batch_size: usize,
    /// Transport attempts per batch before the pass is aborted
    pub retry_attempts: u32,
    /// Base delay between transport attempts, multiplied by the attempt number
    #[serde(rename = "retryDelay")]
    pub retry_delay_ms: u64,
    /// Period of the background sync timer
    #[serde(rename = "syncInterval")]
    pub sync_interval_ms: u64,
    /// Per-request timeout
    #[serde(rename = "requestTimeout")]
    pub request_timeout_ms: u64,
    pub conflict_resolution: ConflictPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            auth_token: None,
            batch_size: 50,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            sync_interval_ms: 30_000,
            request_timeout_ms: 30_000,
            conflict_resolution: ConflictPolicy::ClientWins,
        }
    }
}

impl SyncConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Load from `CAIRN_*` environment variables. Only the endpoint is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let endpoint = env::var("CAIRN_SYNC_ENDPOINT").map_err(|_| ConfigError::MissingEndpoint)?;

        Ok(Self {
            endpoint,
            auth_token: env::var("CAIRN_AUTH_TOKEN").ok().filter(|t| !t.is_empty()),
            batch_size: parse_var("CAIRN_BATCH_SIZE", defaults.batch_size)?,
            retry_attempts: parse_var("CAIRN_RETRY_ATTEMPTS", defaults.retry_attempts)?,
            retry_delay_ms: parse_var("CAIRN_RETRY_DELAY_MS", defaults.retry_delay_ms)?,
            sync_interval_ms: parse_var("CAIRN_SYNC_INTERVAL_MS", defaults.sync_interval_ms)?,
            request_timeout_ms: parse_var("CAIRN_REQUEST_TIMEOUT_MS", defaults.request_timeout_ms)?,
            conflict_resolution: parse_var("CAIRN_CONFLICT_RESOLUTION", defaults.conflict_resolution)?,
        })
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_conflict_resolution(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_resolution = policy;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Offline queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    /// Maximum queued items; the oldest are evicted beyond this
    pub capacity: usize,
    /// Attempts per item before it moves to the failed set
    pub max_retries: u32,
    /// Base retry delay, multiplied by the item's retry count
    #[serde(rename = "retryBackoff")]
    pub retry_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            max_retries: 3,
            retry_backoff_ms: 5000,
        }
    }
}

impl QueueConfig {
    /// Load from `CAIRN_QUEUE_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            capacity: parse_var("CAIRN_QUEUE_CAPACITY", defaults.capacity)?,
            max_retries: parse_var("CAIRN_QUEUE_MAX_RETRIES", defaults.max_retries)?,
            retry_backoff_ms: parse_var("CAIRN_QUEUE_RETRY_BACKOFF_MS", defaults.retry_backoff_ms)?,
        })
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("CAIRN_SYNC_ENDPOINT environment variable is required")]
    MissingEndpoint,

    #[error("Invalid {key} value: {value}")]
    InvalidValue { key: &'static str, value: String },
}
