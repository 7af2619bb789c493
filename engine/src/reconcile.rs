//! Conflict reconciliation between a local record and the remote's copy.
//!
//! Pure functions: given both versions of a record and a [`Resolution`], the
//! record to store locally is fully determined. The sync engine decides when
//! to call them and persists the outcome.

use crate::{Record, RecordId, StoreName, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// How a conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Keep local data, rebased above the remote version
    Local,
    /// Take the remote record as-is
    Remote,
    /// Combine both payloads, remote keys winning on collision
    Merge,
}

/// A divergence between the local and remote versions of one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    pub record_id: RecordId,
    /// Local store of the record. Filled in from the pushed batch when the
    /// remote omits it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreName>,
    pub local_version: Record,
    pub remote_version: Record,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

impl SyncConflict {
    pub fn new(store: impl Into<StoreName>, local: Record, remote: Record) -> Self {
        Self {
            record_id: local.id.clone(),
            store: Some(store.into()),
            local_version: local,
            remote_version: remote,
            resolution: None,
        }
    }

    /// The version a resolved record must exceed.
    pub fn base_version(&self) -> Version {
        self.local_version.version.max(self.remote_version.version)
    }
}

/// Produce the record to store locally for `resolution`.
///
/// `Remote` returns the remote record marked synced. `Local` and `Merge`
/// produce an unsynced record at `max(local, remote) + 1` so the next push
/// supersedes the remote copy.
pub fn resolve(conflict: &SyncConflict, resolution: Resolution, now: Timestamp) -> Record {
    match resolution {
        Resolution::Remote => {
            let mut record = conflict.remote_version.clone();
            record.id = conflict.record_id.clone();
            record.synced = true;
            record
        }
        Resolution::Local => {
            let mut record = conflict.local_version.clone();
            record.version = conflict.base_version() + 1;
            record.synced = false;
            record
        }
        Resolution::Merge => merge_records(&conflict.local_version, &conflict.remote_version, now),
    }
}

/// Merge two versions of a record.
///
/// Object payloads are combined key by key (shallow) with remote values
/// winning on collision; any other payload shape takes the remote value. The
/// tombstone flag follows the remote. Not a CRDT: concurrent edits to the
/// same key lose the local side.
pub fn merge_records(local: &Record, remote: &Record, now: Timestamp) -> Record {
    Record {
        id: local.id.clone(),
        data: merge_data(&local.data, &remote.data),
        timestamp: now.max(local.timestamp).max(remote.timestamp),
        version: local.version.max(remote.version) + 1,
        deleted: remote.deleted,
        synced: false,
    }
}

/// Shallow object merge with remote precedence.
pub fn merge_data(local: &serde_json::Value, remote: &serde_json::Value) -> serde_json::Value {
    match (local, remote) {
        (serde_json::Value::Object(l), serde_json::Value::Object(r)) => {
            let mut merged = l.clone();
            for (key, value) in r {
                merged.insert(key.clone(), value.clone());
            }
            serde_json::Value::Object(merged)
        }
        _ => remote.clone(),
    }
}
