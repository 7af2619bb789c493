//! Snapshot types for persisting and restoring store state.
//!
//! A [`StoreSnapshot`] is the persisted form of one store; a
//! [`DatabaseSnapshot`] bundles every store for backups. Both use BTreeMap so
//! serialization order is deterministic.

use crate::{
    error::Result, Error, Record, RecordId, SchemaVersion, StoreDescriptor, StoreName, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Persisted contents of one store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Descriptor the records were written under
    pub descriptor: StoreDescriptor,
    /// All records, tombstones included, keyed by id
    pub records: BTreeMap<RecordId, Record>,
}

impl StoreSnapshot {
    /// Create an empty snapshot for a store.
    pub fn new(descriptor: StoreDescriptor) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            descriptor,
            records: BTreeMap::new(),
        }
    }

    /// Add a record to the snapshot.
    pub fn add_record(&mut self, record: Record) {
        self.records.insert(record.id.clone(), record);
    }

    /// Count active (non-deleted) records.
    pub fn active_record_count(&self) -> usize {
        self.records.values().filter(|r| r.is_active()).count()
    }

    /// Check the format version and the descriptor.
    pub fn validate(&self) -> Result<()> {
        check_format(self.format_version)?;
        self.descriptor.validate()
    }
}

/// Every store at one point in time, as handed to a backup provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Schema version the stores were at
    #[serde(default)]
    pub schema_version: SchemaVersion,
    /// When the snapshot was taken (milliseconds since epoch)
    pub created_at: Timestamp,
    /// Stores by name
    pub stores: BTreeMap<StoreName, StoreSnapshot>,
}

impl DatabaseSnapshot {
    /// Create an empty snapshot.
    pub fn new(created_at: Timestamp) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version: 0,
            created_at,
            stores: BTreeMap::new(),
        }
    }

    /// Count total records across all stores.
    pub fn record_count(&self) -> usize {
        self.stores.values().map(|s| s.records.len()).sum()
    }

    /// Check the format version of the snapshot and every store in it.
    pub fn validate(&self) -> Result<()> {
        check_format(self.format_version)?;
        for (name, store) in &self.stores {
            store.validate()?;
            if &store.descriptor.name != name {
                return Err(Error::Backup(format!(
                    "store '{}' filed under '{}'",
                    store.descriptor.name, name
                )));
            }
        }
        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Backup(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self = serde_json::from_str(json).map_err(|e| Error::Backup(e.to_string()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}

fn check_format(format_version: u32) -> Result<()> {
    if format_version > SNAPSHOT_FORMAT_VERSION {
        return Err(Error::Backup(format!(
            "unsupported snapshot format version: {} (max supported: {})",
            format_version, SNAPSHOT_FORMAT_VERSION
        )));
    }
    Ok(())
}
