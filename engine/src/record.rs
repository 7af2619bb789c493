//! Record types for storing data.

use crate::{error::Result, RecordId, StoreName, Timestamp, Version};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// A versioned data record in a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Unique identifier within its store
    pub id: RecordId,
    /// The opaque payload (JSON value)
    pub data: serde_json::Value,
    /// Last modification time (milliseconds since epoch)
    #[serde(default)]
    pub timestamp: Timestamp,
    /// Version number, incremented on each update or delete
    #[serde(default)]
    pub version: Version,
    /// Soft delete flag (tombstone)
    #[serde(default)]
    pub deleted: bool,
    /// Whether the remote endpoint has accepted this version
    #[serde(default)]
    pub synced: bool,
}

impl Record {
    /// Create a new, unsynced record at version 0.
    pub fn new(id: impl Into<RecordId>, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            data,
            timestamp: 0,
            version: 0,
            deleted: false,
            synced: false,
        }
    }

    /// Create a record from any serializable payload.
    pub fn from_typed<T: Serialize>(id: impl Into<RecordId>, data: &T) -> Result<Self> {
        Ok(Self::new(id, serde_json::to_value(data)?))
    }

    /// Decode the payload into an application type.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Check if record is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Serialized size in bytes, used for storage statistics.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }

    /// Mark record as deleted (tombstone).
    pub(crate) fn mark_deleted(&mut self, timestamp: Timestamp) {
        self.deleted = true;
        self.synced = false;
        self.version += 1;
        self.timestamp = timestamp;
    }

    /// Replace the payload as a new local version.
    pub(crate) fn update_data(&mut self, data: serde_json::Value, timestamp: Timestamp) {
        self.data = data;
        self.synced = false;
        self.version += 1;
        self.timestamp = timestamp;
    }
}

/// Kind of mutation reported to change subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Notification emitted after every successful mutation of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub store: StoreName,
    pub id: RecordId,
    pub kind: ChangeKind,
}

/// A record tagged with the store it belongs to, as sent to the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreRecord {
    pub store: StoreName,
    #[serde(flatten)]
    pub record: Record,
}

impl StoreRecord {
    pub fn new(store: impl Into<StoreName>, record: Record) -> Self {
        Self {
            store: store.into(),
            record,
        }
    }
}
