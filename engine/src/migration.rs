//! Schema migrations and backups.
//!
//! Migrations are registered by version and applied in ascending order from
//! the persisted schema version toward a target. The version is persisted
//! after every successful step, so a failed run resumes where it stopped.
//! Steps that already ran are not undone on failure; take a backup (done
//! automatically when a [`BackupProvider`] is attached) to be able to go back.

use crate::{
    error::Result,
    events::{Event, EventBus},
    snapshot::DatabaseSnapshot,
    storage::{load_json, save_json, Storage},
    BackupId, Error, RecordStore, SchemaVersion,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{error, info};

/// Storage key of the current schema version.
pub const SCHEMA_VERSION_KEY: &str = "schema_version";

/// A versioned change to stores or their data.
#[async_trait]
pub trait Migration: Send + Sync {
    fn version(&self) -> SchemaVersion;

    fn description(&self) -> &str;

    async fn up(&self, store: &RecordStore) -> Result<()>;

    /// Whether [`down`](Migration::down) is implemented.
    fn reversible(&self) -> bool {
        false
    }

    async fn down(&self, _store: &RecordStore) -> Result<()> {
        Err(Error::migration(self.version(), "migration is not reversible"))
    }
}

type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
type StepFn = Box<dyn for<'a> Fn(&'a RecordStore) -> StepFuture<'a> + Send + Sync>;

/// A [`Migration`] built from closures.
///
/// ```ignore
/// let script = MigrationScript::new(2, "add tags store", |store| {
///     Box::pin(async move { store.define_store(StoreDescriptor::new("tags")).await })
/// });
/// ```
pub struct MigrationScript {
    version: SchemaVersion,
    description: String,
    up: StepFn,
    down: Option<StepFn>,
}

impl MigrationScript {
    pub fn new<F>(version: SchemaVersion, description: impl Into<String>, up: F) -> Self
    where
        F: for<'a> Fn(&'a RecordStore) -> StepFuture<'a> + Send + Sync + 'static,
    {
        Self {
            version,
            description: description.into(),
            up: Box::new(up),
            down: None,
        }
    }

    /// Make the script reversible.
    pub fn with_down<F>(mut self, down: F) -> Self
    where
        F: for<'a> Fn(&'a RecordStore) -> StepFuture<'a> + Send + Sync + 'static,
    {
        self.down = Some(Box::new(down));
        self
    }
}

#[async_trait]
impl Migration for MigrationScript {
    fn version(&self) -> SchemaVersion {
        self.version
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn up(&self, store: &RecordStore) -> Result<()> {
        (self.up)(store).await
    }

    fn reversible(&self) -> bool {
        self.down.is_some()
    }

    async fn down(&self, store: &RecordStore) -> Result<()> {
        match &self.down {
            Some(down) => down(store).await,
            None => Err(Error::migration(self.version, "migration is not reversible")),
        }
    }
}

/// Stores and retrieves database snapshots.
#[async_trait]
pub trait BackupProvider: Send + Sync {
    async fn create(&self, snapshot: &DatabaseSnapshot) -> Result<BackupId>;

    async fn load(&self, id: &str) -> Result<DatabaseSnapshot>;
}

/// Keeps backups in a [`Storage`] under `backups/<id>`.
pub struct SnapshotBackup {
    storage: Arc<dyn Storage>,
}

impl SnapshotBackup {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn key(id: &str) -> String {
        format!("backups/{id}")
    }
}

#[async_trait]
impl BackupProvider for SnapshotBackup {
    async fn create(&self, snapshot: &DatabaseSnapshot) -> Result<BackupId> {
        let id = format!("backup-{}-{}", snapshot.created_at, uuid::Uuid::new_v4().simple());
        let json = snapshot.to_json()?;
        self.storage.put(&Self::key(&id), json.into_bytes()).await?;
        Ok(id)
    }

    async fn load(&self, id: &str) -> Result<DatabaseSnapshot> {
        let bytes = self
            .storage
            .get(&Self::key(id))
            .await?
            .ok_or_else(|| Error::Backup(format!("backup not found: {id}")))?;
        let json = String::from_utf8(bytes).map_err(|e| Error::Backup(e.to_string()))?;
        DatabaseSnapshot::from_json(&json)
    }
}

/// What a migration run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    /// Versions applied, in order
    pub applied: Vec<SchemaVersion>,
    /// Backup taken before the first step
    pub backup: Option<BackupId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    pub current_version: SchemaVersion,
    pub available_versions: Vec<SchemaVersion>,
    pub pending_migrations: Vec<SchemaVersion>,
}

/// Applies migrations to a [`RecordStore`] and tracks the schema version.
pub struct MigrationManager {
    store: Arc<RecordStore>,
    storage: Arc<dyn Storage>,
    migrations: BTreeMap<SchemaVersion, Arc<dyn Migration>>,
    current: SchemaVersion,
    backup: Option<Arc<dyn BackupProvider>>,
    events: EventBus,
}

impl std::fmt::Debug for MigrationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationManager")
            .field("current", &self.current)
            .field("migrations", &self.migrations.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MigrationManager {
    /// Load the persisted schema version (0 for a new database).
    pub async fn open(store: Arc<RecordStore>, storage: Arc<dyn Storage>) -> Result<Self> {
        let current = load_json(&*storage, SCHEMA_VERSION_KEY)
            .await?
            .unwrap_or(0);
        Ok(Self {
            store,
            storage,
            migrations: BTreeMap::new(),
            current,
            backup: None,
            events: EventBus::default(),
        })
    }

    pub fn with_backup(mut self, provider: Arc<dyn BackupProvider>) -> Self {
        self.backup = Some(provider);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn current_version(&self) -> SchemaVersion {
        self.current
    }

    /// Stamp the schema version without running anything, e.g. for a
    /// database created directly at the latest layout.
    pub async fn set_baseline(&mut self, version: SchemaVersion) -> Result<()> {
        self.save_version(version).await?;
        info!(version, "schema baseline set");
        Ok(())
    }

    /// Register a migration. Versions start at 1 and must be unique.
    pub fn add_migration(&mut self, migration: impl Migration + 'static) -> Result<()> {
        let version = migration.version();
        if version == 0 {
            return Err(Error::migration(0, "version 0 is the empty schema and cannot be a migration"));
        }
        if self.migrations.contains_key(&version) {
            return Err(Error::migration(version, "a migration with this version is already registered"));
        }
        self.migrations.insert(version, Arc::new(migration));
        Ok(())
    }

    /// Apply pending migrations up to `target` (default: the highest registered).
    pub async fn run_migrations(&mut self, target: Option<SchemaVersion>) -> Result<MigrationReport> {
        let from = self.current;
        let target = target.unwrap_or_else(|| self.latest_version());
        let mut report = MigrationReport {
            from,
            to: from,
            applied: Vec::new(),
            backup: None,
        };
        if target <= from {
            return Ok(report);
        }

        let steps: Vec<Arc<dyn Migration>> = self
            .migrations
            .range(from + 1..=target)
            .map(|(_, m)| Arc::clone(m))
            .collect();
        if steps.is_empty() {
            return Ok(report);
        }

        if self.backup.is_some() && self.store.stats().await.total_size > 0 {
            report.backup = Some(self.create_backup().await?);
        }

        info!(from, target, steps = steps.len(), "running migrations");
        for step in steps {
            let version = step.version();
            self.events.emit(Event::MigrationStarting {
                version,
                description: step.description().to_string(),
            });
            info!(version, description = step.description(), "applying migration");

            if let Err(e) = step.up(&self.store).await {
                let error = match e {
                    Error::Migration { .. } => e,
                    other => Error::migration(version, other.to_string()),
                };
                error!(version, error = %error, "migration failed");
                self.events.emit(Event::MigrationFailed {
                    version,
                    error: error.clone(),
                });
                return Err(error);
            }

            self.save_version(version).await?;
            report.applied.push(version);
            self.events.emit(Event::MigrationCompleted { version });
        }

        report.to = self.current;
        info!(from, to = report.to, "migrations completed");
        self.events.emit(Event::MigrationsCompleted {
            from,
            to: report.to,
        });
        Ok(report)
    }

    /// Undo an applied, reversible migration. The schema version becomes
    /// `version - 1`.
    pub async fn rollback_migration(&mut self, version: SchemaVersion) -> Result<()> {
        let migration = self
            .migrations
            .get(&version)
            .cloned()
            .ok_or_else(|| Error::migration(version, "no migration registered for this version"))?;
        if version > self.current {
            return Err(Error::migration(version, "migration has not been applied"));
        }
        let previous = version
            .checked_sub(1)
            .ok_or_else(|| Error::migration(version, "version 0 cannot be rolled back"))?;
        if !migration.reversible() {
            return Err(Error::migration(version, "migration is not reversible"));
        }

        info!(version, "rolling back migration");
        migration.down(&self.store).await.map_err(|e| match e {
            Error::Migration { .. } => e,
            other => Error::migration(version, other.to_string()),
        })?;

        self.save_version(previous).await?;
        self.events.emit(Event::RollbackCompleted { version });
        Ok(())
    }

    /// Snapshot every store through the backup provider.
    pub async fn create_backup(&self) -> Result<BackupId> {
        let provider = self.provider()?;
        let mut snapshot = self.store.export_snapshot().await;
        snapshot.schema_version = self.current;

        let id = provider.create(&snapshot).await?;
        info!(id = %id, records = snapshot.record_count(), "backup created");
        self.events.emit(Event::BackupCreated(id.clone()));
        Ok(id)
    }

    /// Replace every store with a backup and restore its schema version.
    pub async fn restore_backup(&mut self, id: &str) -> Result<()> {
        let provider = self.provider()?;
        let snapshot = provider.load(id).await?;
        let version = snapshot.schema_version;

        self.store.import_snapshot(snapshot).await?;
        self.save_version(version).await?;

        info!(id, version, "backup restored");
        self.events.emit(Event::BackupRestored(id.to_string()));
        Ok(())
    }

    pub fn status(&self) -> MigrationStatus {
        MigrationStatus {
            current_version: self.current,
            available_versions: self.migrations.keys().copied().collect(),
            pending_migrations: self
                .migrations
                .keys()
                .copied()
                .filter(|v| *v > self.current)
                .collect(),
        }
    }

    fn latest_version(&self) -> SchemaVersion {
        self.migrations
            .keys()
            .next_back()
            .copied()
            .unwrap_or(self.current)
    }

    fn provider(&self) -> Result<Arc<dyn BackupProvider>> {
        self.backup
            .clone()
            .ok_or_else(|| Error::Backup("no backup provider configured".into()))
    }

    async fn save_version(&mut self, version: SchemaVersion) -> Result<()> {
        save_json(&*self.storage, SCHEMA_VERSION_KEY, &version).await?;
        self.current = version;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::{IndexDef, Query, Record, StoreDescriptor};
    use serde_json::json;
    use std::sync::Mutex;

    /// Records the order in which steps ran.
    struct Step {
        version: SchemaVersion,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
        reversible: bool,
    }

    impl Step {
        fn new(version: SchemaVersion, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                version,
                log: Arc::clone(log),
                fail: false,
                reversible: false,
            }
        }
    }

    #[async_trait]
    impl Migration for Step {
        fn version(&self) -> SchemaVersion {
            self.version
        }

        fn description(&self) -> &str {
            "test step"
        }

        async fn up(&self, _store: &RecordStore) -> Result<()> {
            if self.fail {
                return Err(Error::InvalidSchema("bad step".into()));
            }
            self.log.lock().unwrap().push(format!("up {}", self.version));
            Ok(())
        }

        fn reversible(&self) -> bool {
            self.reversible
        }

        async fn down(&self, _store: &RecordStore) -> Result<()> {
            self.log.lock().unwrap().push(format!("down {}", self.version));
            Ok(())
        }
    }

    async fn setup() -> (Arc<RecordStore>, Arc<dyn Storage>) {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let store = RecordStore::open(storage.clone(), vec![StoreDescriptor::new("notes")])
            .await
            .unwrap();
        (Arc::new(store), storage)
    }

    #[tokio::test]
    async fn applies_in_order_and_is_idempotent() {
        let (store, storage) = setup().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = MigrationManager::open(store, storage.clone()).await.unwrap();
        manager.set_baseline(1).await.unwrap();
        manager.add_migration(Step::new(3, &log)).unwrap();
        manager.add_migration(Step::new(2, &log)).unwrap();

        let report = manager.run_migrations(Some(3)).await.unwrap();
        assert_eq!(report.from, 1);
        assert_eq!(report.to, 3);
        assert_eq!(report.applied, vec![2, 3]);
        assert_eq!(*log.lock().unwrap(), vec!["up 2", "up 3"]);

        let again = manager.run_migrations(Some(3)).await.unwrap();
        assert!(again.applied.is_empty());
        assert_eq!(log.lock().unwrap().len(), 2);

        let reopened = MigrationManager::open(manager.store.clone(), storage).await.unwrap();
        assert_eq!(reopened.current_version(), 3);
    }

    #[tokio::test]
    async fn duplicate_version_rejected() {
        let (store, storage) = setup().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = MigrationManager::open(store, storage).await.unwrap();
        manager.add_migration(Step::new(1, &log)).unwrap();
        let err = manager.add_migration(Step::new(1, &log)).unwrap_err();
        assert!(matches!(err, Error::Migration { version: 1, .. }));
    }

    #[tokio::test]
    async fn version_zero_is_not_a_migration() {
        let (store, storage) = setup().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = MigrationManager::open(store, storage).await.unwrap();

        let err = manager
            .add_migration(Step {
                reversible: true,
                ..Step::new(0, &log)
            })
            .unwrap_err();
        assert!(matches!(err, Error::Migration { version: 0, .. }));

        let err = manager.rollback_migration(0).await.unwrap_err();
        assert!(matches!(err, Error::Migration { version: 0, .. }));
        assert_eq!(manager.current_version(), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_halts_and_keeps_progress() {
        let (store, storage) = setup().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let mut manager = MigrationManager::open(store, storage).await.unwrap().with_events(events);
        manager.add_migration(Step::new(1, &log)).unwrap();
        manager
            .add_migration(Step {
                fail: true,
                ..Step::new(2, &log)
            })
            .unwrap();
        manager.add_migration(Step::new(3, &log)).unwrap();

        let err = manager.run_migrations(None).await.unwrap_err();
        assert_eq!(err, Error::migration(2, "invalid schema: bad step"));
        assert_eq!(manager.current_version(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["up 1"]);
        assert_eq!(manager.status().pending_migrations, vec![2, 3]);

        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if let Event::MigrationFailed { version, .. } = event {
                assert_eq!(version, 2);
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn rollback_requires_reversible_applied_step() {
        let (store, storage) = setup().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = MigrationManager::open(store, storage).await.unwrap();
        manager.add_migration(Step::new(1, &log)).unwrap();
        manager
            .add_migration(Step {
                reversible: true,
                ..Step::new(2, &log)
            })
            .unwrap();

        assert!(manager.rollback_migration(2).await.is_err());
        manager.run_migrations(None).await.unwrap();

        assert!(manager.rollback_migration(1).await.is_err());
        assert!(manager.rollback_migration(7).await.is_err());
        manager.rollback_migration(2).await.unwrap();
        assert_eq!(manager.current_version(), 1);
        assert_eq!(log.lock().unwrap().last().map(String::as_str), Some("down 2"));
    }

    #[tokio::test]
    async fn closure_scripts_change_schema() {
        let (store, storage) = setup().await;
        store.create("notes", Record::new("a", json!({"lang": "en"}))).await.unwrap();

        let mut manager = MigrationManager::open(store.clone(), storage).await.unwrap();
        manager
            .add_migration(
                MigrationScript::new(1, "index notes by language", |store| {
                    Box::pin(async move { store.add_index("notes", IndexDef::new("byLang", "lang")).await })
                })
                .with_down(|store| Box::pin(async move { store.remove_index("notes", "byLang").await })),
            )
            .unwrap();

        manager.run_migrations(None).await.unwrap();
        let english = store
            .query("notes", Query::new().index("byLang").range(crate::KeyRange::only("en")))
            .await
            .unwrap();
        assert_eq!(english.len(), 1);

        manager.rollback_migration(1).await.unwrap();
        assert!(store.descriptor("notes").await.unwrap().index("byLang").is_none());
        assert_eq!(manager.current_version(), 0);
    }

    #[tokio::test]
    async fn backup_before_migrating_and_restore() {
        let (store, storage) = setup().await;
        store.create("notes", Record::new("a", json!({"v": 1}))).await.unwrap();

        let mut manager = MigrationManager::open(store.clone(), storage.clone())
            .await
            .unwrap()
            .with_backup(Arc::new(SnapshotBackup::new(storage.clone())));
        manager
            .add_migration(MigrationScript::new(1, "wipe payloads", |store| {
                Box::pin(async move {
                    store.rewrite("notes", |_| Some(json!({}))).await?;
                    store.define_store(StoreDescriptor::new("extra")).await
                })
            }))
            .unwrap();

        let report = manager.run_migrations(None).await.unwrap();
        let backup = report.backup.unwrap();
        assert_eq!(store.read("notes", "a").await.unwrap().unwrap().data, json!({}));

        manager.restore_backup(&backup).await.unwrap();
        assert_eq!(manager.current_version(), 0);
        assert_eq!(store.read("notes", "a").await.unwrap().unwrap().data, json!({"v": 1}));
        assert_eq!(store.store_names(), vec!["notes"]);

        let err = manager.restore_backup("missing").await.unwrap_err();
        assert!(matches!(err, Error::Backup(_)));
    }

    #[tokio::test]
    async fn no_backup_for_empty_database_or_without_provider() {
        let (store, storage) = setup().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = MigrationManager::open(store, storage.clone())
            .await
            .unwrap()
            .with_backup(Arc::new(SnapshotBackup::new(storage.clone())));
        manager.add_migration(Step::new(1, &log)).unwrap();
        assert_eq!(manager.run_migrations(None).await.unwrap().backup, None);

        let plain = MigrationManager::open(manager.store.clone(), storage).await.unwrap();
        assert!(matches!(plain.create_backup().await, Err(Error::Backup(_))));
    }
}
