use super::{PushRequest, PushResponse, SyncResult, SyncStatus, SyncTransport};
use crate::{
    config::{ConflictPolicy, SyncConfig},
    error::Result,
    events::{Event, EventBus},
    network::NetworkStatus,
    queue::OfflineQueue,
    reconcile::{self, Resolution, SyncConflict},
    Error, Record, RecordId, RecordStore, StoreName, StoreRecord, Timestamp, Version,
};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

type ConflictKey = (StoreName, RecordId);

struct SyncTimer {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Clears the syncing flag when a pass ends, however it ends.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Accumulated outcome of the batches in one pass.
#[derive(Default)]
struct PassOutcome {
    synced: usize,
    conflicts: Vec<SyncConflict>,
    errors: Vec<String>,
    /// Client-wins resolutions to push again within the pass
    rebased: Vec<StoreRecord>,
}

/// Pushes unsynced records to the remote and settles conflicts.
pub struct SyncEngine {
    store: Arc<RecordStore>,
    transport: Arc<dyn SyncTransport>,
    network: Arc<dyn NetworkStatus>,
    queue: Option<Arc<OfflineQueue>>,
    config: SyncConfig,
    events: EventBus,
    syncing: AtomicBool,
    /// Time of the last successful pass, 0 if none
    last_sync: AtomicU64,
    /// Manual conflicts awaiting resolution
    conflicts: DashMap<ConflictKey, SyncConflict>,
    timer: Mutex<Option<SyncTimer>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("transport", &self.transport)
            .field("config", &self.config)
            .field("syncing", &self.is_syncing())
            .finish()
    }
}

impl SyncEngine {
    pub fn new(
        store: Arc<RecordStore>,
        transport: Arc<dyn SyncTransport>,
        network: Arc<dyn NetworkStatus>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            transport,
            network,
            queue: None,
            config,
            events: EventBus::default(),
            syncing: AtomicBool::new(false),
            last_sync: AtomicU64::new(0),
            conflicts: DashMap::new(),
            timer: Mutex::new(None),
        }
    }

    /// Build an engine that talks HTTP to `config.endpoint`.
    pub fn http(
        store: Arc<RecordStore>,
        network: Arc<dyn NetworkStatus>,
        config: SyncConfig,
    ) -> Result<Self> {
        let transport = Arc::new(super::HttpTransport::new(&config)?);
        Ok(Self::new(store, transport, network, config))
    }

    /// Flush this queue before syncing after reconnecting.
    pub fn with_queue(mut self, queue: Arc<OfflineQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Start the background timer. A first pass runs right away; calling
    /// this again replaces the running timer.
    pub fn start_sync(self: &Arc<Self>, interval: Duration) {
        self.stop_timer();

        let (stop, mut stop_rx) = oneshot::channel();
        let engine = Arc::clone(self);
        let mut net = self.network.watch();
        let period = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut was_online = *net.borrow_and_update();
            let mut watching = true;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if engine.network.is_online() && !engine.is_syncing() {
                            engine.perform_sync().await;
                        }
                    }
                    changed = net.changed(), if watching => {
                        if changed.is_err() {
                            watching = false;
                            continue;
                        }
                        let online = *net.borrow_and_update();
                        if online && !was_online {
                            info!("network back online");
                            engine.events.emit(Event::NetworkOnline);
                            if let Some(queue) = &engine.queue {
                                queue.process_queue().await;
                            }
                            engine.perform_sync().await;
                        } else if !online && was_online {
                            info!("network offline");
                            engine.events.emit(Event::NetworkOffline);
                        }
                        was_online = online;
                    }
                }
            }
            debug!("sync timer stopped");
        });

        self.set_timer(Some(SyncTimer { stop, handle }));
        info!(interval_ms = period.as_millis() as u64, "sync started");
        self.events.emit(Event::SyncStarted);
    }

    /// Stop the background timer. A pass already running is left to finish.
    pub fn stop_sync(&self) {
        if self.stop_timer() {
            info!("sync stopped");
            self.events.emit(Event::SyncStopped);
        }
    }

    /// Run one sync pass.
    pub async fn perform_sync(&self) -> SyncResult {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return SyncResult::failed(self.now(), "sync already in progress");
        }
        let _guard = SyncingGuard(&self.syncing);

        if !self.network.is_online() {
            let result = SyncResult::failed(self.now(), "network offline");
            self.events.emit(Event::SyncFailed(result.clone()));
            return result;
        }

        let outcome = self.sync_pass().await;
        let result = SyncResult {
            success: outcome.errors.is_empty(),
            synced_records: outcome.synced,
            conflicts: outcome.conflicts,
            errors: outcome.errors,
            timestamp: self.now(),
        };

        if result.success {
            self.last_sync.store(result.timestamp, Ordering::SeqCst);
            info!(
                synced = result.synced_records,
                conflicts = result.conflicts.len(),
                "sync completed"
            );
            self.events.emit(Event::SyncCompleted(result.clone()));
        } else {
            warn!(errors = ?result.errors, "sync failed");
            self.events.emit(Event::SyncFailed(result.clone()));
        }
        result
    }

    /// Settle a manual conflict. Returns the record now stored locally.
    ///
    /// Fails with [`Error::Conflict`] if the local record changed since the
    /// conflict was detected; the conflict is refreshed with the current
    /// local record and can be resolved again.
    pub async fn resolve_conflict(
        &self,
        store: &str,
        id: &str,
        resolution: Resolution,
    ) -> Result<Record> {
        let key = (store.to_string(), id.to_string());
        let mut conflict = self
            .conflicts
            .get(&key)
            .map(|c| c.value().clone())
            .ok_or_else(|| Error::not_found(store, id))?;

        if let Some(current) = self.store.get_including_deleted(store, id).await? {
            if current.version != conflict.local_version.version {
                let error = Error::Conflict {
                    store: store.to_string(),
                    id: id.to_string(),
                    local: current.version,
                    remote: conflict.remote_version.version,
                };
                conflict.local_version = current;
                self.conflicts.insert(key, conflict);
                return Err(error);
            }
        }

        let record = self.apply_resolution(store, &conflict, resolution).await?;
        self.conflicts.remove(&key);

        conflict.resolution = Some(resolution);
        info!(store, id, ?resolution, "conflict resolved");
        self.events.emit(Event::ConflictResolved(conflict));
        Ok(record)
    }

    /// Manual conflicts awaiting resolution.
    pub fn pending_conflicts(&self) -> Vec<SyncConflict> {
        let mut conflicts: Vec<_> = self.conflicts.iter().map(|c| c.value().clone()).collect();
        conflicts.sort_by(|a, b| (&a.store, &a.record_id).cmp(&(&b.store, &b.record_id)));
        conflicts
    }

    pub async fn status(&self) -> SyncStatus {
        let mut pending_records = 0;
        for store in self.store.store_names() {
            if let Ok(records) = self.store.unsynced(&store).await {
                pending_records += records.len();
            }
        }
        let last_sync = self.last_sync.load(Ordering::SeqCst);
        SyncStatus {
            online: self.network.is_online(),
            syncing: self.is_syncing(),
            last_sync: (last_sync > 0).then_some(last_sync),
            pending_records,
            conflicts: self.conflicts.len(),
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn now(&self) -> Timestamp {
        self.store.clock().now()
    }

    fn set_timer(&self, timer: Option<SyncTimer>) -> Option<SyncTimer> {
        let mut slot = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *slot, timer)
    }

    /// Returns whether a timer was running.
    fn stop_timer(&self) -> bool {
        match self.set_timer(None) {
            Some(timer) => {
                // The task may already have exited
                let _ = timer.stop.send(());
                drop(timer.handle);
                true
            }
            None => false,
        }
    }

    /// Push everything unsynced. A transport failure aborts the remaining
    /// batches; whatever earlier batches settled is still reported.
    async fn sync_pass(&self) -> PassOutcome {
        let mut outcome = PassOutcome::default();
        let pending = match self.collect_unsynced().await {
            Ok(pending) => pending,
            Err(e) => {
                outcome.errors.push(e.to_string());
                return outcome;
            }
        };
        if pending.is_empty() {
            debug!("nothing to sync");
            return outcome;
        }

        let batch_size = self.config.batch_size.max(1);
        debug!(records = pending.len(), batch_size, "pushing unsynced records");
        for batch in pending.chunks(batch_size) {
            if let Err(e) = self.push_batch(batch, true, &mut outcome).await {
                outcome.errors.push(e.to_string());
                return outcome;
            }
        }

        let rebased = std::mem::take(&mut outcome.rebased);
        if !rebased.is_empty() {
            debug!(records = rebased.len(), "pushing rebased records");
            for batch in rebased.chunks(batch_size) {
                if let Err(e) = self.push_batch(batch, false, &mut outcome).await {
                    outcome.errors.push(e.to_string());
                    return outcome;
                }
            }
        }
        outcome
    }

    async fn collect_unsynced(&self) -> Result<Vec<StoreRecord>> {
        let mut pending = Vec::new();
        for store in self.store.store_names() {
            for record in self.store.unsynced(&store).await? {
                if self.conflicts.contains_key(&(store.clone(), record.id.clone())) {
                    continue;
                }
                pending.push(StoreRecord::new(store.clone(), record));
            }
        }
        Ok(pending)
    }

    async fn push_batch(
        &self,
        batch: &[StoreRecord],
        repush: bool,
        outcome: &mut PassOutcome,
    ) -> Result<()> {
        if !self.network.is_online() {
            return Err(Error::Network("network offline".into()));
        }
        let response = self.push_with_retry(batch).await?;
        self.settle(batch, response, repush, outcome).await;
        Ok(())
    }

    async fn push_with_retry(&self, batch: &[StoreRecord]) -> Result<PushResponse> {
        let request = PushRequest {
            records: batch.to_vec(),
        };
        let attempts = self.config.retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.transport.push(&request).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < attempts => {
                    let delay = self.config.retry_delay() * attempt;
                    warn!(attempt, attempts, error = %e, delay_ms = delay.as_millis() as u64, "push failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Apply the remote's verdict on one batch.
    async fn settle(
        &self,
        batch: &[StoreRecord],
        response: PushResponse,
        repush: bool,
        outcome: &mut PassOutcome,
    ) {
        let mut unsettled: HashSet<ConflictKey> = HashSet::new();
        let store_of = |id: &str| {
            batch
                .iter()
                .find(|r| r.record.id == id)
                .map(|r| r.store.clone())
        };

        for mut conflict in response.conflicts {
            let Some(store) = conflict.store.clone().or_else(|| store_of(&conflict.record_id)) else {
                outcome
                    .errors
                    .push(format!("conflict reported for unknown record {}", conflict.record_id));
                continue;
            };
            conflict.store = Some(store.clone());
            unsettled.insert((store.clone(), conflict.record_id.clone()));
            self.handle_conflict(&store, conflict, repush, outcome).await;
        }

        for rejected in response.rejected {
            let Some(store) = rejected.store.clone().or_else(|| store_of(&rejected.record_id)) else {
                outcome
                    .errors
                    .push(format!("rejection reported for unknown record {}", rejected.record_id));
                continue;
            };
            warn!(store = %store, id = %rejected.record_id, reason = %rejected.reason, "record rejected by remote");
            outcome.errors.push(format!(
                "{store}/{} rejected: {}",
                rejected.record_id, rejected.reason
            ));
            unsettled.insert((store.clone(), rejected.record_id.clone()));
            self.events.emit(Event::RecordRejected {
                store,
                id: rejected.record_id,
                reason: rejected.reason,
            });
        }

        if !response.success {
            if response.errors.is_empty() {
                outcome.errors.push("Sync failed".into());
            } else {
                outcome.errors.extend(response.errors);
            }
            return;
        }

        let mut accepted: BTreeMap<&str, Vec<(RecordId, Version)>> = BTreeMap::new();
        for pushed in batch {
            if !unsettled.contains(&(pushed.store.clone(), pushed.record.id.clone())) {
                accepted
                    .entry(pushed.store.as_str())
                    .or_default()
                    .push((pushed.record.id.clone(), pushed.record.version));
            }
        }
        for (store, entries) in accepted {
            match self.store.mark_synced(store, &entries).await {
                Ok(marked) => outcome.synced += marked,
                Err(e) => outcome.errors.push(format!("{store}: {e}")),
            }
        }
    }

    async fn handle_conflict(
        &self,
        store: &str,
        mut conflict: SyncConflict,
        repush: bool,
        outcome: &mut PassOutcome,
    ) {
        // Resolve against what is stored now, not what was pushed
        match self.store.get_including_deleted(store, &conflict.record_id).await {
            Ok(Some(current)) => conflict.local_version = current,
            Ok(None) => {}
            Err(e) => {
                outcome.errors.push(e.to_string());
                return;
            }
        }
        debug!(
            store,
            id = %conflict.record_id,
            local = conflict.local_version.version,
            remote = conflict.remote_version.version,
            "conflict detected"
        );

        let resolution = match self.config.conflict_resolution {
            ConflictPolicy::ClientWins => Resolution::Local,
            ConflictPolicy::ServerWins => Resolution::Remote,
            ConflictPolicy::Manual => {
                self.conflicts.insert(
                    (store.to_string(), conflict.record_id.clone()),
                    conflict.clone(),
                );
                self.events.emit(Event::ConflictDetected(conflict.clone()));
                outcome.conflicts.push(conflict);
                return;
            }
        };

        match self.apply_resolution(store, &conflict, resolution).await {
            Ok(record) => {
                if repush && resolution == Resolution::Local {
                    outcome.rebased.push(StoreRecord::new(store, record));
                }
                conflict.resolution = Some(resolution);
                self.events.emit(Event::ConflictResolved(conflict.clone()));
            }
            Err(e) => outcome.errors.push(format!("{store}/{}: {e}", conflict.record_id)),
        }
        outcome.conflicts.push(conflict);
    }

    async fn apply_resolution(
        &self,
        store: &str,
        conflict: &SyncConflict,
        resolution: Resolution,
    ) -> Result<Record> {
        let record = reconcile::resolve(conflict, resolution, self.now());
        match resolution {
            Resolution::Remote => self.store.apply_remote(store, record.clone()).await?,
            Resolution::Local | Resolution::Merge => {
                self.store.write_resolved(store, record.clone()).await?
            }
        }
        Ok(record)
    }
}
