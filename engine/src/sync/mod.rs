//! Synchronization with the remote endpoint.
//!
//! The [`SyncEngine`] pushes unsynced records in batches through a
//! [`SyncTransport`] and settles what the remote answers: accepted records are
//! marked synced, conflicts go through the configured policy, rejected records
//! are reported.

mod engine;
mod transport;

pub use engine::SyncEngine;
pub use transport::{HttpTransport, SyncTransport};

use crate::{reconcile::SyncConflict, RecordId, StoreName, StoreRecord, Timestamp};
use serde::{Deserialize, Serialize};

/// Body of a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub records: Vec<StoreRecord>,
}

/// The remote's answer to a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub success: bool,
    #[serde(default)]
    pub conflicts: Vec<SyncConflict>,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Records refused outright (validation, authorization)
    #[serde(default)]
    pub rejected: Vec<RejectedRecord>,
}

impl PushResponse {
    /// A response accepting every pushed record.
    pub fn accepted() -> Self {
        Self {
            success: true,
            conflicts: Vec::new(),
            errors: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

/// A record the remote refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedRecord {
    pub record_id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreName>,
    pub reason: String,
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    /// Records the remote accepted and that are now marked synced
    pub synced_records: usize,
    pub conflicts: Vec<SyncConflict>,
    pub errors: Vec<String>,
    pub timestamp: Timestamp,
}

impl SyncResult {
    pub(crate) fn failed(timestamp: Timestamp, error: impl Into<String>) -> Self {
        Self {
            success: false,
            synced_records: 0,
            conflicts: Vec::new(),
            errors: vec![error.into()],
            timestamp,
        }
    }
}

/// Snapshot of the engine's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub online: bool,
    pub syncing: bool,
    pub last_sync: Option<Timestamp>,
    /// Unsynced records across all stores, tombstones included
    pub pending_records: usize,
    /// Manual conflicts awaiting resolution
    pub conflicts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_fields_are_optional() {
        let response: PushResponse = serde_json::from_value(json!({"success": true})).unwrap();
        assert_eq!(response, PushResponse::accepted());

        let response: PushResponse = serde_json::from_value(json!({
            "success": false,
            "errors": ["quota exceeded"],
            "rejected": [{"recordId": "a", "reason": "too large"}]
        }))
        .unwrap();
        assert_eq!(response.errors, vec!["quota exceeded"]);
        assert_eq!(response.rejected[0].store, None);
    }

    #[test]
    fn request_carries_store_per_record() {
        let request = PushRequest {
            records: vec![StoreRecord::new("notes", crate::Record::new("a", json!({"t": 1})))],
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["records"][0]["store"], "notes");
        assert_eq!(value["records"][0]["id"], "a");
    }
}
