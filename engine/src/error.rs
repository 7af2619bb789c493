//! Error types for the Cairn engine.

use crate::{RecordId, SchemaVersion, StoreName, Version};
use thiserror::Error;

/// All possible errors from the Cairn engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Schema errors
    #[error("store not found: {0}")]
    StoreNotFound(StoreName),

    #[error("store already exists: {0}")]
    StoreExists(StoreName),

    #[error("index not found: {store}.{index}")]
    IndexNotFound { store: StoreName, index: String },

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    // Record errors
    #[error("duplicate key in store '{store}': {key}")]
    DuplicateKey { store: StoreName, key: String },

    #[error("record not found: {store}/{id}")]
    NotFound { store: StoreName, id: RecordId },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    // Storage errors
    #[error("transaction failed: {0}")]
    Transaction(String),

    // Sync errors
    #[error("network error: {0}")]
    Network(String),

    #[error("conflict on {store}/{id}: local version {local}, remote version {remote}")]
    Conflict {
        store: StoreName,
        id: RecordId,
        local: Version,
        remote: Version,
    },

    // Queue errors
    #[error("offline queue over capacity ({capacity}), evicted operation {evicted}")]
    QueueOverflow { capacity: usize, evicted: String },

    // Migration errors
    #[error("migration {version} failed: {reason}")]
    Migration {
        version: SchemaVersion,
        reason: String,
    },

    #[error("backup error: {0}")]
    Backup(String),

    #[error("crypto error: {0}")]
    Crypto(String),
}

impl Error {
    pub(crate) fn not_found(store: &str, id: &str) -> Self {
        Error::NotFound {
            store: store.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn migration(version: SchemaVersion, reason: impl Into<String>) -> Self {
        Error::Migration {
            version,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidPayload(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
