//! End-to-end flows: replicas syncing through a shared in-process remote,
//! the offline queue replaying on reconnect, and migrations on a file store.

use async_trait::async_trait;
use cairn_engine::{
    error::Result, ConflictPolicy, Event, EventBus, FileStorage, IndexDef, KeyRange,
    MemoryStorage, MigrationManager, MigrationScript, NetworkMonitor, OfflineQueue, OperationKind,
    PushRequest, PushResponse, Query, QueueConfig, Record, RecordStore, Resolution, StoreDescriptor,
    SyncConfig, SyncConflict, SyncEngine, SyncTransport,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A remote that keeps the latest accepted version of every record.
///
/// Accepts unknown records, newer versions and exact replays; anything else
/// comes back as a conflict carrying the stored record.
#[derive(Debug, Default)]
struct MemoryRemote {
    records: Mutex<HashMap<(String, String), Record>>,
}

impl MemoryRemote {
    fn get(&self, store: &str, id: &str) -> Option<Record> {
        self.records
            .lock()
            .unwrap()
            .get(&(store.to_string(), id.to_string()))
            .cloned()
    }
}

#[async_trait]
impl SyncTransport for MemoryRemote {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse> {
        let mut records = self.records.lock().unwrap();
        let mut response = PushResponse::accepted();
        for pushed in &request.records {
            let key = (pushed.store.clone(), pushed.record.id.clone());
            let incoming = &pushed.record;
            let accept = match records.get(&key) {
                None => true,
                Some(stored) => {
                    incoming.version > stored.version
                        || (incoming.version == stored.version
                            && incoming.data == stored.data
                            && incoming.deleted == stored.deleted)
                }
            };
            if accept {
                let mut stored = incoming.clone();
                stored.synced = true;
                records.insert(key, stored);
            } else {
                response.conflicts.push(SyncConflict::new(
                    pushed.store.clone(),
                    incoming.clone(),
                    records[&key].clone(),
                ));
            }
        }
        Ok(response)
    }
}

async fn replica() -> Arc<RecordStore> {
    Arc::new(
        RecordStore::open(
            Arc::new(MemoryStorage::new()),
            vec![StoreDescriptor::new("notes").with_index(IndexDef::new("byUser", "userId"))],
        )
        .await
        .unwrap(),
    )
}

fn engine(
    store: &Arc<RecordStore>,
    remote: &Arc<MemoryRemote>,
    policy: ConflictPolicy,
) -> Arc<SyncEngine> {
    let config = SyncConfig {
        retry_delay_ms: 1,
        ..SyncConfig::new("memory").with_conflict_resolution(policy)
    };
    Arc::new(SyncEngine::new(
        store.clone(),
        remote.clone(),
        Arc::new(NetworkMonitor::new(true)),
        config,
    ))
}

#[tokio::test]
async fn replicas_converge_under_server_wins() {
    let remote = Arc::new(MemoryRemote::default());
    let (a, b) = (replica().await, replica().await);
    let (sync_a, sync_b) = (
        engine(&a, &remote, ConflictPolicy::ServerWins),
        engine(&b, &remote, ConflictPolicy::ServerWins),
    );

    a.create("notes", Record::new("n1", json!({"text": "from a"}))).await.unwrap();
    let result = sync_a.perform_sync().await;
    assert!(result.success);
    assert_eq!(result.synced_records, 1);

    b.create("notes", Record::new("n1", json!({"text": "from b"}))).await.unwrap();
    let result = sync_b.perform_sync().await;
    assert!(result.success);
    assert_eq!(result.conflicts.len(), 1);

    let on_b = b.read("notes", "n1").await.unwrap().unwrap();
    assert_eq!(on_b.data["text"], "from a");
    assert!(on_b.synced);
    assert_eq!(remote.get("notes", "n1").unwrap().data["text"], "from a");

    // Nothing left to push on either side
    assert_eq!(sync_a.status().await.pending_records, 0);
    assert_eq!(sync_b.status().await.pending_records, 0);
}

#[tokio::test]
async fn client_wins_rebases_and_repushes() {
    let remote = Arc::new(MemoryRemote::default());
    let (a, b) = (replica().await, replica().await);
    let sync_a = engine(&a, &remote, ConflictPolicy::ServerWins);
    let sync_b = engine(&b, &remote, ConflictPolicy::ClientWins);

    a.create("notes", Record::new("n1", json!({"text": "from a"}))).await.unwrap();
    assert!(sync_a.perform_sync().await.success);

    b.create("notes", Record::new("n1", json!({"text": "from b"}))).await.unwrap();
    let result = sync_b.perform_sync().await;
    assert!(result.success, "{:?}", result.errors);

    let on_remote = remote.get("notes", "n1").unwrap();
    assert_eq!(on_remote.data["text"], "from b");
    assert_eq!(on_remote.version, 1);
    let on_b = b.read("notes", "n1").await.unwrap().unwrap();
    assert_eq!(on_b.version, 1);
    assert!(on_b.synced);

    // A's next edit is stale against the rebased record and yields to it
    a.update("notes", Record::new("n1", json!({"text": "a again"}))).await.unwrap();
    let result = sync_a.perform_sync().await;
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(a.read("notes", "n1").await.unwrap().unwrap().data["text"], "from b");
}

#[tokio::test]
async fn manual_conflict_waits_for_resolution() {
    let remote = Arc::new(MemoryRemote::default());
    let (a, b) = (replica().await, replica().await);
    let sync_a = engine(&a, &remote, ConflictPolicy::ServerWins);
    let sync_b = engine(&b, &remote, ConflictPolicy::Manual);

    a.create("notes", Record::new("n1", json!({"title": "A", "body": "x"}))).await.unwrap();
    sync_a.perform_sync().await;

    b.create("notes", Record::new("n1", json!({"title": "B", "tags": ["t"]}))).await.unwrap();
    let result = sync_b.perform_sync().await;
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(sync_b.pending_conflicts().len(), 1);

    // A pending conflict is not pushed again
    let again = sync_b.perform_sync().await;
    assert!(again.conflicts.is_empty());
    assert_eq!(again.synced_records, 0);

    let merged = sync_b
        .resolve_conflict("notes", "n1", Resolution::Merge)
        .await
        .unwrap();
    assert_eq!(merged.data["title"], "A");
    assert_eq!(merged.data["tags"], json!(["t"]));
    assert!(sync_b.pending_conflicts().is_empty());

    assert!(sync_b.perform_sync().await.success);
    assert_eq!(remote.get("notes", "n1").unwrap().data, merged.data);
}

#[tokio::test]
async fn deletes_propagate_as_tombstones() {
    let remote = Arc::new(MemoryRemote::default());
    let store = replica().await;
    let sync = engine(&store, &remote, ConflictPolicy::ServerWins);

    store.create("notes", Record::new("n1", json!({}))).await.unwrap();
    sync.perform_sync().await;
    store.delete("notes", "n1").await.unwrap();
    assert_eq!(sync.status().await.pending_records, 1);

    assert!(sync.perform_sync().await.success);
    assert!(remote.get("notes", "n1").unwrap().deleted);

    // Synced tombstones can go
    assert_eq!(store.prune_tombstones("notes").await.unwrap(), 1);
    assert!(store.get_including_deleted("notes", "n1").await.unwrap().is_none());
}

#[tokio::test]
async fn queue_replays_on_reconnect() {
    let storage = Arc::new(MemoryStorage::new());
    let store = Arc::new(
        RecordStore::open(storage.clone(), vec![StoreDescriptor::new("notes")])
            .await
            .unwrap(),
    );
    let network = Arc::new(NetworkMonitor::new(false));
    let events = EventBus::default();
    let mut rx = events.subscribe();

    let queue = OfflineQueue::open(
        storage.clone(),
        store.clone(),
        network.clone(),
        QueueConfig::default(),
        events,
    )
    .await
    .unwrap();

    queue
        .enqueue(OperationKind::Create, "notes", Record::new("n1", json!({"v": 1})))
        .await
        .unwrap();
    queue
        .enqueue(OperationKind::Update, "notes", Record::new("n1", json!({"v": 2})))
        .await
        .unwrap();
    assert_eq!(queue.status().await.queued, 2);
    assert!(store.read("notes", "n1").await.unwrap().is_none());

    network.set_online(true);
    assert_eq!(queue.process_queue().await, 2);

    let record = store.read("notes", "n1").await.unwrap().unwrap();
    assert_eq!(record.data["v"], 2);
    assert_eq!(record.version, 1);
    assert_eq!(queue.status().await.queued, 0);

    let mut completed = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, Event::OperationProcessed(_)) {
            completed += 1;
        }
    }
    assert_eq!(completed, 2);
}

#[tokio::test]
async fn migrations_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FileStorage::new(dir.path()));

    {
        let store = Arc::new(
            RecordStore::open(storage.clone(), vec![StoreDescriptor::new("notes")])
                .await
                .unwrap(),
        );
        store
            .create("notes", Record::new("n1", json!({"user": "u1"})))
            .await
            .unwrap();

        let mut manager = MigrationManager::open(store.clone(), storage.clone()).await.unwrap();
        manager
            .add_migration(MigrationScript::new(1, "rename user field", |store| {
                Box::pin(async move {
                    store
                        .rewrite("notes", |record| {
                            let user = record.data.get("user")?.clone();
                            Some(json!({"userId": user}))
                        })
                        .await?;
                    Ok(())
                })
            }))
            .unwrap();
        manager
            .add_migration(MigrationScript::new(2, "index by user", |store| {
                Box::pin(async move {
                    store
                        .add_index("notes", IndexDef::new("byUser", "userId"))
                        .await
                })
            }))
            .unwrap();

        let report = manager.run_migrations(None).await.unwrap();
        assert_eq!(report.applied, vec![1, 2]);
    }

    let store = Arc::new(RecordStore::open(storage.clone(), vec![]).await.unwrap());
    let manager = MigrationManager::open(store.clone(), storage).await.unwrap();
    assert_eq!(manager.current_version(), 2);

    let hits = store
        .query("notes", Query::new().index("byUser").range(KeyRange::only("u1")))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].data, json!({"userId": "u1"}));
}
