//! Record store - durable keyed storage per named store.
//!
//! Every store sits behind its own async mutex: operations on one store are
//! serialized in submission order, operations on different stores proceed
//! concurrently. A mutation is persisted to [`Storage`] before it is
//! acknowledged; if persisting fails the in-memory change is rolled back and
//! the caller sees [`Error::Transaction`].

use crate::{
    clock::{Clock, SystemClock},
    error::Result,
    schema::{IndexDef, IndexKey, KeyRange, StoreDescriptor},
    snapshot::{DatabaseSnapshot, StoreSnapshot, SNAPSHOT_FORMAT_VERSION},
    storage::{load_json, save_json, Storage},
    ChangeEvent, ChangeKind, Error, Record, RecordId, StoreName, Version,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info};

/// Storage key of the list of store names.
const CATALOG_KEY: &str = "catalog";

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

fn store_key(name: &str) -> String {
    format!("stores/{name}")
}

/// Borrowed view of a store, serialized in the [`StoreSnapshot`] layout.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotRef<'a> {
    format_version: u32,
    descriptor: &'a StoreDescriptor,
    records: &'a BTreeMap<RecordId, Record>,
}

/// In-memory state of one store.
#[derive(Debug)]
struct StoreState {
    descriptor: StoreDescriptor,
    records: BTreeMap<RecordId, Record>,
    /// Index name -> ordered (key, id) entries. Tombstones are never indexed.
    indexes: HashMap<String, BTreeSet<(IndexKey, RecordId)>>,
}

impl StoreState {
    fn new(descriptor: StoreDescriptor) -> Self {
        let indexes = descriptor
            .indexes
            .iter()
            .map(|i| (i.name.clone(), BTreeSet::new()))
            .collect();
        Self {
            descriptor,
            records: BTreeMap::new(),
            indexes,
        }
    }

    fn from_snapshot(snapshot: StoreSnapshot) -> Result<Self> {
        let mut state = Self::new(snapshot.descriptor);
        state.records = snapshot.records;
        state.rebuild_indexes()?;
        Ok(state)
    }

    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            descriptor: self.descriptor.clone(),
            records: self.records.clone(),
        }
    }

    fn index_record(&mut self, record: &Record) {
        if !record.is_active() {
            return;
        }
        for def in &self.descriptor.indexes {
            if let (Some(key), Some(entries)) = (def.key_for(record), self.indexes.get_mut(&def.name)) {
                entries.insert((key, record.id.clone()));
            }
        }
    }

    fn unindex_record(&mut self, record: &Record) {
        for def in &self.descriptor.indexes {
            if let (Some(key), Some(entries)) = (def.key_for(record), self.indexes.get_mut(&def.name)) {
                entries.remove(&(key, record.id.clone()));
            }
        }
    }

    /// Fail if `record` would share a unique index key with another live record.
    fn check_unique(&self, record: &Record) -> Result<()> {
        if !record.is_active() {
            return Ok(());
        }
        for def in self.descriptor.indexes.iter().filter(|i| i.unique) {
            let (Some(key), Some(entries)) = (def.key_for(record), self.indexes.get(&def.name)) else {
                continue;
            };
            let taken = entries
                .range((Bound::Included((key.clone(), RecordId::new())), Bound::Unbounded))
                .take_while(|(k, _)| *k == key)
                .any(|(_, id)| *id != record.id);
            if taken {
                return Err(Error::DuplicateKey {
                    store: self.name().to_string(),
                    key: format!("{}={}", def.name, key),
                });
            }
        }
        Ok(())
    }

    /// Insert or replace a record, keeping indexes current. Returns the previous record.
    fn put(&mut self, record: Record) -> Option<Record> {
        let previous = self.records.remove(&record.id);
        if let Some(prev) = &previous {
            self.unindex_record(prev);
        }
        self.index_record(&record);
        self.records.insert(record.id.clone(), record);
        previous
    }

    /// Put back whatever was stored under `id` before a failed mutation.
    fn restore(&mut self, id: &str, previous: Option<Record>) {
        if let Some(current) = self.records.remove(id) {
            self.unindex_record(&current);
        }
        if let Some(prev) = previous {
            self.put(prev);
        }
    }

    fn rebuild_indexes(&mut self) -> Result<()> {
        let mut indexes: HashMap<String, BTreeSet<(IndexKey, RecordId)>> = HashMap::new();
        for def in &self.descriptor.indexes {
            let mut entries = BTreeSet::new();
            let mut last: Option<&IndexKey> = None;
            let mut keyed: Vec<(IndexKey, &RecordId)> = self
                .records
                .values()
                .filter(|r| r.is_active())
                .filter_map(|r| def.key_for(r).map(|k| (k, &r.id)))
                .collect();
            keyed.sort();
            for (key, id) in &keyed {
                if def.unique && last == Some(key) {
                    return Err(Error::DuplicateKey {
                        store: self.descriptor.name.clone(),
                        key: format!("{}={}", def.name, key),
                    });
                }
                last = Some(key);
                entries.insert((key.clone(), (*id).clone()));
            }
            indexes.insert(def.name.clone(), entries);
        }
        self.indexes = indexes;
        Ok(())
    }
}

type Predicate = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

/// Query over the live records of one store.
///
/// Records are visited in index order (primary key order without an index),
/// restricted to `range`, post-filtered, then paginated with `offset` and
/// `limit`. Not a live cursor: re-issue with a new offset to continue.
#[derive(Clone, Default)]
pub struct Query {
    index: Option<String>,
    range: Option<KeyRange>,
    limit: Option<usize>,
    offset: usize,
    filter: Option<Predicate>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk a secondary index instead of the primary key.
    pub fn index(mut self, name: impl Into<String>) -> Self {
        self.index = Some(name.into());
        self
    }

    /// Restrict the index (or primary key) to a range.
    pub fn range(mut self, range: KeyRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Keep only records matching `predicate`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(predicate));
        self
    }

    fn matches(&self, record: &Record) -> bool {
        record.is_active() && self.filter.as_ref().map_or(true, |f| f(record))
    }

    fn in_range(&self, key: &IndexKey) -> bool {
        self.range.as_ref().map_or(true, |r| r.contains(key))
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("index", &self.index)
            .field("range", &self.range)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// Size and count of one store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    /// Live records
    pub count: usize,
    /// Soft-deleted records still held for sync
    pub tombstones: usize,
    /// Sum of serialized live record sizes in bytes
    pub size: usize,
}

/// Storage health across all stores.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStats {
    pub stores: BTreeMap<StoreName, StoreStats>,
    pub total_size: usize,
}

/// Durable, versioned record storage organised in named stores.
pub struct RecordStore {
    stores: DashMap<StoreName, Arc<Mutex<StoreState>>>,
    /// Serializes catalog changes (define, drop, import).
    schema_lock: Mutex<()>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordStore")
            .field("stores", &self.store_names())
            .finish()
    }
}

impl RecordStore {
    /// Open the store, loading persisted state and creating missing stores.
    pub async fn open(storage: Arc<dyn Storage>, descriptors: Vec<StoreDescriptor>) -> Result<Self> {
        Self::open_with_clock(storage, descriptors, Arc::new(SystemClock)).await
    }

    /// Open the store with an explicit time source.
    pub async fn open_with_clock(
        storage: Arc<dyn Storage>,
        descriptors: Vec<StoreDescriptor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let store = Self {
            stores: DashMap::new(),
            schema_lock: Mutex::new(()),
            storage,
            clock,
            changes,
        };

        let mut provided: BTreeMap<StoreName, StoreDescriptor> = BTreeMap::new();
        for descriptor in descriptors {
            descriptor.validate()?;
            provided.insert(descriptor.name.clone(), descriptor);
        }

        let catalog: Vec<StoreName> = load_json(&*store.storage, CATALOG_KEY)
            .await?
            .unwrap_or_default();
        let names: BTreeSet<StoreName> = catalog.into_iter().chain(provided.keys().cloned()).collect();

        for name in names {
            let state = match load_json::<StoreSnapshot>(&*store.storage, &store_key(&name)).await? {
                Some(snapshot) => {
                    snapshot.validate()?;
                    StoreState::from_snapshot(snapshot)?
                }
                None => {
                    let descriptor = provided
                        .remove(&name)
                        .unwrap_or_else(|| StoreDescriptor::new(name.clone()));
                    let state = StoreState::new(descriptor);
                    store.persist(&state).await?;
                    state
                }
            };
            store.stores.insert(name, Arc::new(Mutex::new(state)));
        }
        store.save_catalog().await?;

        info!(stores = store.stores.len(), "record store opened");
        Ok(store)
    }

    /// Names of all stores, sorted.
    pub fn store_names(&self) -> Vec<StoreName> {
        let mut names: Vec<_> = self.stores.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// The time source used to stamp records.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Current descriptor of a store.
    pub async fn descriptor(&self, store: &str) -> Result<StoreDescriptor> {
        let handle = self.handle(store)?;
        let state = handle.lock().await;
        Ok(state.descriptor.clone())
    }

    /// Create a record at version 0. Fails if the id is taken, tombstones included.
    pub async fn create(&self, store: &str, mut record: Record) -> Result<RecordId> {
        if record.id.is_empty() {
            return Err(Error::InvalidPayload("record id must not be empty".into()));
        }

        let handle = self.handle(store)?;
        let mut state = handle.lock().await;
        if state.records.contains_key(&record.id) {
            return Err(Error::DuplicateKey {
                store: store.to_string(),
                key: record.id,
            });
        }

        record.version = 0;
        record.deleted = false;
        record.synced = false;
        record.timestamp = self.clock.now();
        state.check_unique(&record)?;

        let id = record.id.clone();
        let previous = state.put(record);
        self.commit(&mut state, vec![(id.clone(), previous)]).await?;
        drop(state);

        debug!(store, id = %id, "record created");
        self.notify(store, &id, ChangeKind::Created);
        Ok(id)
    }

    /// Read a live record. Soft-deleted and missing records both read as `None`.
    pub async fn read(&self, store: &str, id: &str) -> Result<Option<Record>> {
        let handle = self.handle(store)?;
        let state = handle.lock().await;
        Ok(state.records.get(id).filter(|r| r.is_active()).cloned())
    }

    /// Read a record including tombstones.
    pub async fn get_including_deleted(&self, store: &str, id: &str) -> Result<Option<Record>> {
        let handle = self.handle(store)?;
        let state = handle.lock().await;
        Ok(state.records.get(id).cloned())
    }

    /// Replace a record's payload, returning the new version.
    ///
    /// The stored version is incremented regardless of `record.version`.
    pub async fn update(&self, store: &str, record: Record) -> Result<Version> {
        let handle = self.handle(store)?;
        let mut state = handle.lock().await;
        let mut next = state
            .records
            .get(&record.id)
            .filter(|r| r.is_active())
            .cloned()
            .ok_or_else(|| Error::not_found(store, &record.id))?;

        next.update_data(record.data, self.clock.now());
        state.check_unique(&next)?;

        let (id, version) = (next.id.clone(), next.version);
        let previous = state.put(next);
        self.commit(&mut state, vec![(id.clone(), previous)]).await?;
        drop(state);

        debug!(store, id = %id, version, "record updated");
        self.notify(store, &id, ChangeKind::Updated);
        Ok(version)
    }

    /// Soft-delete a record. Missing or already deleted records are a no-op.
    pub async fn delete(&self, store: &str, id: &str) -> Result<()> {
        let handle = self.handle(store)?;
        let mut state = handle.lock().await;
        let Some(mut next) = state.records.get(id).filter(|r| r.is_active()).cloned() else {
            return Ok(());
        };

        next.mark_deleted(self.clock.now());
        let version = next.version;
        let previous = state.put(next);
        self.commit(&mut state, vec![(id.to_string(), previous)]).await?;
        drop(state);

        debug!(store, id, version, "record deleted");
        self.notify(store, id, ChangeKind::Deleted);
        Ok(())
    }

    /// Run a query over live records.
    pub async fn query(&self, store: &str, query: Query) -> Result<Vec<Record>> {
        let handle = self.handle(store)?;
        let state = handle.lock().await;

        let candidates: Vec<&Record> = match &query.index {
            Some(name) => {
                let entries = state.indexes.get(name).ok_or_else(|| Error::IndexNotFound {
                    store: store.to_string(),
                    index: name.clone(),
                })?;
                let start = match query.range.as_ref().map(KeyRange::lower) {
                    Some(Bound::Included(k)) | Some(Bound::Excluded(k)) => {
                        Bound::Included((k.clone(), RecordId::new()))
                    }
                    _ => Bound::Unbounded,
                };
                entries
                    .range((start, Bound::Unbounded))
                    .skip_while(|(k, _)| query.range.as_ref().is_some_and(|r| !r.above_lower(k)))
                    .take_while(|(k, _)| query.range.as_ref().map_or(true, |r| r.below_upper(k)))
                    .filter_map(|(_, id)| state.records.get(id))
                    .collect()
            }
            None => state
                .records
                .values()
                .filter(|r| query.in_range(&IndexKey::Text(r.id.clone())))
                .collect(),
        };

        Ok(candidates
            .into_iter()
            .filter(|r| query.matches(r))
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    /// Every record not yet accepted by the remote, tombstones included.
    pub async fn unsynced(&self, store: &str) -> Result<Vec<Record>> {
        let handle = self.handle(store)?;
        let state = handle.lock().await;
        Ok(state.records.values().filter(|r| !r.synced).cloned().collect())
    }

    /// Per-store counts and serialized sizes.
    pub async fn stats(&self) -> DatabaseStats {
        let mut stats = DatabaseStats::default();
        for name in self.store_names() {
            let Ok(handle) = self.handle(&name) else {
                continue;
            };
            let state = handle.lock().await;
            let mut entry = StoreStats::default();
            for record in state.records.values() {
                if record.is_active() {
                    entry.count += 1;
                    entry.size += record.encoded_len();
                } else {
                    entry.tombstones += 1;
                }
            }
            stats.total_size += entry.size;
            stats.stores.insert(name, entry);
        }
        stats
    }

    /// Mark records as accepted by the remote.
    ///
    /// Each entry is only marked if the stored version still equals the pushed
    /// one; a record edited while its push was in flight stays unsynced.
    /// Returns how many records were marked.
    pub async fn mark_synced(&self, store: &str, entries: &[(RecordId, Version)]) -> Result<usize> {
        let handle = self.handle(store)?;
        let mut state = handle.lock().await;

        let mut changes = Vec::new();
        for (id, version) in entries {
            let Some(mut next) = state
                .records
                .get(id)
                .filter(|r| r.version == *version && !r.synced)
                .cloned()
            else {
                continue;
            };
            next.synced = true;
            let previous = state.put(next);
            changes.push((id.clone(), previous));
        }

        let marked = changes.len();
        if marked > 0 {
            self.commit(&mut state, changes).await?;
        }
        Ok(marked)
    }

    /// Overwrite the local record with the remote's version, marked synced.
    pub async fn apply_remote(&self, store: &str, mut record: Record) -> Result<()> {
        record.synced = true;
        self.write_resolved(store, record).await
    }

    /// Store a conflict resolution verbatim (version, flags and payload as given).
    pub(crate) async fn write_resolved(&self, store: &str, record: Record) -> Result<()> {
        let handle = self.handle(store)?;
        let mut state = handle.lock().await;
        state.check_unique(&record)?;

        let id = record.id.clone();
        let kind = if record.deleted {
            ChangeKind::Deleted
        } else if state.records.contains_key(&id) {
            ChangeKind::Updated
        } else {
            ChangeKind::Created
        };
        let previous = state.put(record);
        self.commit(&mut state, vec![(id.clone(), previous)]).await?;
        drop(state);

        self.notify(store, &id, kind);
        Ok(())
    }

    /// Physically remove tombstones the remote has already accepted.
    pub async fn prune_tombstones(&self, store: &str) -> Result<usize> {
        let handle = self.handle(store)?;
        let mut state = handle.lock().await;

        let ids: Vec<RecordId> = state
            .records
            .values()
            .filter(|r| r.deleted && r.synced)
            .map(|r| r.id.clone())
            .collect();
        let mut changes = Vec::with_capacity(ids.len());
        for id in ids {
            let previous = state.records.remove(&id);
            changes.push((id, previous));
        }

        let pruned = changes.len();
        if pruned > 0 {
            self.commit(&mut state, changes).await?;
            info!(store, pruned, "tombstones pruned");
        }
        Ok(pruned)
    }

    // ------------------------------------------------------------------
    // Schema operations, used by migrations
    // ------------------------------------------------------------------

    /// Create a new store. Defining an identical store again is a no-op.
    pub async fn define_store(&self, descriptor: StoreDescriptor) -> Result<()> {
        descriptor.validate()?;
        let _schema = self.schema_lock.lock().await;

        if let Ok(existing) = self.handle(&descriptor.name) {
            let existing = existing.lock().await;
            if existing.descriptor == descriptor {
                return Ok(());
            }
            return Err(Error::StoreExists(descriptor.name));
        }

        let name = descriptor.name.clone();
        let state = StoreState::new(descriptor);
        self.persist(&state).await?;
        self.stores.insert(name.clone(), Arc::new(Mutex::new(state)));
        if let Err(e) = self.save_catalog().await {
            self.stores.remove(&name);
            return Err(e);
        }

        info!(store = %name, "store defined");
        Ok(())
    }

    /// Remove a store and everything in it.
    pub async fn drop_store(&self, store: &str) -> Result<()> {
        let _schema = self.schema_lock.lock().await;
        let handle = self.handle(store)?;
        let _state = handle.lock().await;

        self.stores.remove(store);
        if let Err(e) = self.save_catalog().await {
            self.stores.insert(store.to_string(), Arc::clone(&handle));
            return Err(e);
        }
        self.storage.remove(&store_key(store)).await?;

        info!(store, "store dropped");
        Ok(())
    }

    /// Add a secondary index, building it over existing records.
    pub async fn add_index(&self, store: &str, index: IndexDef) -> Result<()> {
        let handle = self.handle(store)?;
        let mut state = handle.lock().await;
        if state.descriptor.index(&index.name).is_some() {
            return Err(Error::InvalidSchema(format!(
                "store '{store}': index '{}' already exists",
                index.name
            )));
        }

        let name = index.name.clone();
        state.descriptor.indexes.push(index);
        let result = match state.rebuild_indexes() {
            Ok(()) => self.persist(&state).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            state.descriptor.indexes.retain(|i| i.name != name);
            state.rebuild_indexes()?;
            return Err(e);
        }

        info!(store, index = %name, "index added");
        Ok(())
    }

    /// Remove a secondary index.
    pub async fn remove_index(&self, store: &str, index: &str) -> Result<()> {
        let handle = self.handle(store)?;
        let mut state = handle.lock().await;
        let position = state
            .descriptor
            .indexes
            .iter()
            .position(|i| i.name == index)
            .ok_or_else(|| Error::IndexNotFound {
                store: store.to_string(),
                index: index.to_string(),
            })?;

        let def = state.descriptor.indexes.remove(position);
        let entries = state.indexes.remove(index);
        if let Err(e) = self.persist(&state).await {
            state.descriptor.indexes.insert(position, def);
            if let Some(entries) = entries {
                state.indexes.insert(index.to_string(), entries);
            }
            return Err(e);
        }

        info!(store, index, "index removed");
        Ok(())
    }

    /// Rewrite payloads in place. `transform` returns the new payload, or
    /// `None` to leave a record untouched. Versions and sync flags are kept.
    pub async fn rewrite<F>(&self, store: &str, mut transform: F) -> Result<usize>
    where
        F: FnMut(&Record) -> Option<serde_json::Value> + Send,
    {
        let handle = self.handle(store)?;
        let mut state = handle.lock().await;

        let backup = state.records.clone();
        let mut rewritten = 0;
        for record in state.records.values_mut() {
            if let Some(data) = transform(record) {
                record.data = data;
                rewritten += 1;
            }
        }

        let result = match state.rebuild_indexes() {
            Ok(()) => self.persist(&state).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            state.records = backup;
            state.rebuild_indexes()?;
            return Err(e);
        }

        info!(store, rewritten, "records rewritten");
        Ok(rewritten)
    }

    /// Capture every store.
    pub async fn export_snapshot(&self) -> DatabaseSnapshot {
        let _schema = self.schema_lock.lock().await;
        let mut snapshot = DatabaseSnapshot::new(self.clock.now());
        for name in self.store_names() {
            if let Ok(handle) = self.handle(&name) {
                let state = handle.lock().await;
                snapshot.stores.insert(name, state.snapshot());
            }
        }
        snapshot
    }

    /// Replace every store with the contents of a snapshot.
    ///
    /// Every incoming store is rebuilt before anything is replaced, so a
    /// snapshot that breaks a unique index leaves the database untouched.
    pub async fn import_snapshot(&self, snapshot: DatabaseSnapshot) -> Result<()> {
        snapshot.validate()?;
        let states = snapshot
            .stores
            .into_iter()
            .map(|(name, store_snapshot)| Ok((name, StoreState::from_snapshot(store_snapshot)?)))
            .collect::<Result<Vec<_>>>()?;
        let _schema = self.schema_lock.lock().await;

        for name in self.store_names() {
            if !states.iter().any(|(incoming, _)| *incoming == name) {
                self.stores.remove(&name);
                self.storage.remove(&store_key(&name)).await?;
            }
        }

        for (name, state) in states {
            self.persist(&state).await?;
            let existing = self.stores.get(&name).map(|e| Arc::clone(e.value()));
            match existing {
                Some(handle) => *handle.lock().await = state,
                None => {
                    self.stores.insert(name, Arc::new(Mutex::new(state)));
                }
            }
        }
        self.save_catalog().await?;

        info!(stores = self.stores.len(), "snapshot imported");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn handle(&self, store: &str) -> Result<Arc<Mutex<StoreState>>> {
        self.stores
            .get(store)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| Error::StoreNotFound(store.to_string()))
    }

    fn notify(&self, store: &str, id: &str, kind: ChangeKind) {
        // No subscribers is fine
        let _ = self.changes.send(ChangeEvent {
            store: store.to_string(),
            id: id.to_string(),
            kind,
        });
    }

    async fn persist(&self, state: &StoreState) -> Result<()> {
        let view = SnapshotRef {
            format_version: SNAPSHOT_FORMAT_VERSION,
            descriptor: &state.descriptor,
            records: &state.records,
        };
        save_json(&*self.storage, &store_key(state.name()), &view).await
    }

    async fn save_catalog(&self) -> Result<()> {
        save_json(&*self.storage, CATALOG_KEY, &self.store_names()).await
    }

    /// Persist the store, undoing `changes` if that fails.
    async fn commit(
        &self,
        state: &mut StoreState,
        changes: Vec<(RecordId, Option<Record>)>,
    ) -> Result<()> {
        if let Err(e) = self.persist(state).await {
            error!(store = %state.name(), error = %e, "persist failed, rolling back");
            for (id, previous) in changes.into_iter().rev() {
                state.restore(&id, previous);
            }
            return Err(e);
        }
        Ok(())
    }
}
