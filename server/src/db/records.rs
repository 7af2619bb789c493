//! The authoritative copy of every record clients have pushed.

use cairn_engine::{Record, StoreRecord, SyncConflict};
use dashmap::{mapref::entry::Entry, DashMap};

/// Outcome of offering one record to the repository.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Accepted,
    /// The stored record wins; the client must reconcile against it
    Conflict(SyncConflict),
}

/// Latest accepted version per `(store, id)`.
#[derive(Debug, Default)]
pub struct RecordRepository {
    records: DashMap<(String, String), Record>,
}

impl RecordRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the record if it is new, newer than the stored one, or an exact
    /// replay of it. Anything else conflicts with the stored record.
    pub fn offer(&self, pushed: StoreRecord) -> PushOutcome {
        let StoreRecord { store, mut record } = pushed;
        record.synced = true;

        match self.records.entry((store.clone(), record.id.clone())) {
            Entry::Vacant(slot) => {
                tracing::debug!(store = %store, id = %record.id, version = record.version, "record created");
                slot.insert(record);
                PushOutcome::Accepted
            }
            Entry::Occupied(mut slot) => {
                let stored = slot.get();
                if record.version > stored.version {
                    tracing::debug!(store = %store, id = %record.id, version = record.version, "record updated");
                    slot.insert(record);
                    PushOutcome::Accepted
                } else if is_replay(stored, &record) {
                    PushOutcome::Accepted
                } else {
                    tracing::debug!(
                        store = %store,
                        id = %record.id,
                        pushed = record.version,
                        stored = stored.version,
                        "stale push"
                    );
                    PushOutcome::Conflict(SyncConflict::new(store, record, stored.clone()))
                }
            }
        }
    }

    /// Get a record by store and id.
    pub fn get(&self, store: &str, id: &str) -> Option<Record> {
        self.records
            .get(&(store.to_string(), id.to_string()))
            .map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn is_replay(stored: &Record, incoming: &Record) -> bool {
    stored.version == incoming.version
        && stored.deleted == incoming.deleted
        && stored.data == incoming.data
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pushed(id: &str, version: u64, data: serde_json::Value) -> StoreRecord {
        let mut record = Record::new(id, data);
        record.version = version;
        StoreRecord::new("todos", record)
    }

    #[test]
    fn accepts_new_and_newer_records() {
        let repo = RecordRepository::new();
        assert_eq!(repo.offer(pushed("t1", 0, json!({"a": 1}))), PushOutcome::Accepted);
        assert_eq!(repo.offer(pushed("t1", 1, json!({"a": 2}))), PushOutcome::Accepted);

        let stored = repo.get("todos", "t1").unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.data, json!({"a": 2}));
        assert!(stored.synced);
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn replay_is_idempotent() {
        let repo = RecordRepository::new();
        repo.offer(pushed("t1", 3, json!({"a": 1})));
        assert_eq!(repo.offer(pushed("t1", 3, json!({"a": 1}))), PushOutcome::Accepted);
    }

    #[test]
    fn stale_or_divergent_push_conflicts() {
        let repo = RecordRepository::new();
        repo.offer(pushed("t1", 2, json!({"a": 1})));

        for candidate in [pushed("t1", 1, json!({"a": 9})), pushed("t1", 2, json!({"a": 9}))] {
            match repo.offer(candidate) {
                PushOutcome::Conflict(conflict) => {
                    assert_eq!(conflict.store.as_deref(), Some("todos"));
                    assert_eq!(conflict.remote_version.version, 2);
                    assert_eq!(conflict.remote_version.data, json!({"a": 1}));
                    assert_eq!(conflict.local_version.data, json!({"a": 9}));
                }
                other => panic!("expected conflict, got {other:?}"),
            }
        }
        assert_eq!(repo.get("todos", "t1").unwrap().data, json!({"a": 1}));
    }

    #[test]
    fn stores_are_separate_namespaces() {
        let repo = RecordRepository::new();
        repo.offer(pushed("x", 0, json!(1)));
        repo.offer(StoreRecord::new("notes", Record::new("x", json!(2))));
        assert_eq!(repo.len(), 2);
        assert_eq!(repo.get("notes", "x").unwrap().data, json!(2));
    }
}
