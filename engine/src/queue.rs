//! Offline operation queue.
//!
//! A durable FIFO of create/update/delete operations. Items run through an
//! [`OperationExecutor`] when the network is up; a failed item is retried
//! after `retry_backoff * retry_count` until it reaches its retry limit and
//! moves to the persisted failed set. The queue is bounded: past capacity the
//! oldest items are evicted, each eviction logged and reported as an event.

use crate::{
    clock::{Clock, SystemClock},
    config::QueueConfig,
    error::Result,
    events::{Event, EventBus},
    network::NetworkStatus,
    operation::{OperationExecutor, OperationId, OperationKind, QueueItem},
    storage::{load_json, save_json, Storage},
    Error, Record, StoreName,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Storage key of the active queue.
pub const QUEUE_KEY: &str = "offline_queue";
/// Storage key of the failed set.
pub const FAILED_KEY: &str = "offline_queue_failed";

/// Counts reported by [`OfflineQueue::status`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    /// Items in the active queue
    pub queued: usize,
    /// Active items waiting on a retry timer
    pub retrying: usize,
    /// Items that ran out of retries
    pub failed: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    failed: Vec<QueueItem>,
    /// Items currently executing
    in_flight: HashSet<OperationId>,
    /// Items with a pending retry timer
    waiting: HashSet<OperationId>,
}

impl QueueState {
    fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|i| i.id == id)
    }

    /// Mark an item as executing if it is present and idle.
    fn claim(&mut self, id: &str) -> Option<QueueItem> {
        if self.in_flight.contains(id) || self.waiting.contains(id) {
            return None;
        }
        let item = self.items.iter().find(|i| i.id == id)?.clone();
        self.in_flight.insert(item.id.clone());
        Some(item)
    }
}

/// Durable queue of operations waiting for connectivity.
pub struct OfflineQueue {
    state: Mutex<QueueState>,
    storage: Arc<dyn Storage>,
    executor: Arc<dyn OperationExecutor>,
    network: Arc<dyn NetworkStatus>,
    config: QueueConfig,
    events: EventBus,
    clock: Arc<dyn Clock>,
    interrupted: AtomicBool,
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("config", &self.config)
            .field("network", &self.network)
            .finish()
    }
}

impl OfflineQueue {
    /// Open the queue, restoring persisted items. Unreadable data is logged and dropped.
    pub async fn open(
        storage: Arc<dyn Storage>,
        executor: Arc<dyn OperationExecutor>,
        network: Arc<dyn NetworkStatus>,
        config: QueueConfig,
        events: EventBus,
    ) -> Result<Arc<Self>> {
        let items: VecDeque<QueueItem> = load_or_discard(&*storage, QUEUE_KEY).await?;
        let failed: Vec<QueueItem> = load_or_discard(&*storage, FAILED_KEY).await?;
        info!(queued = items.len(), failed = failed.len(), "offline queue opened");

        Ok(Arc::new(Self {
            state: Mutex::new(QueueState {
                items,
                failed,
                ..QueueState::default()
            }),
            storage,
            executor,
            network,
            config,
            events,
            clock: Arc::new(SystemClock),
            interrupted: AtomicBool::new(false),
        }))
    }

    /// Queue an operation and, when online, run it before returning.
    ///
    /// Returns the item id. A failed immediate attempt is not an error here;
    /// the item stays queued under the retry policy.
    pub async fn enqueue(
        self: &Arc<Self>,
        operation: OperationKind,
        store: impl Into<StoreName>,
        record: Record,
    ) -> Result<OperationId> {
        let item = QueueItem::new(operation, store, record, self.clock.now(), self.config.max_retries);
        let id = item.id.clone();
        let capacity = self.config.capacity.max(1);

        let evicted = {
            let mut state = self.state.lock().await;
            state.items.push_back(item.clone());
            let mut evicted = Vec::new();
            while state.items.len() > capacity {
                if let Some(oldest) = state.items.pop_front() {
                    state.waiting.remove(&oldest.id);
                    evicted.push(oldest);
                }
            }

            if let Err(e) = save_json(&*self.storage, QUEUE_KEY, &state.items).await {
                state.items.pop_back();
                for oldest in evicted.into_iter().rev() {
                    state.items.push_front(oldest);
                }
                return Err(e);
            }
            evicted
        };

        for oldest in evicted {
            warn!(id = %oldest.id, store = %oldest.store, capacity, "offline queue full, evicting oldest operation");
            let error = Error::QueueOverflow {
                capacity,
                evicted: oldest.id.clone(),
            };
            self.events.emit(Event::OperationEvicted { item: oldest, error });
        }

        debug!(id = %id, operation = %item.operation, store = %item.store, "operation queued");
        self.events.emit(Event::OperationQueued(item));

        if self.network.is_online() {
            let claimed = self.state.lock().await.claim(&id);
            if let Some(item) = claimed {
                self.process_item(item).await;
            }
        }
        Ok(id)
    }

    /// Replay queued items in FIFO order. Returns how many were attempted.
    ///
    /// Items already executing or waiting on a retry timer are skipped, as
    /// are items enqueued after the walk starts. The walk stops between items
    /// when the network drops or [`interrupt`] is called; an interrupt that
    /// lands before the walk starts stops it before the first item.
    ///
    /// [`interrupt`]: OfflineQueue::interrupt
    pub async fn process_queue(self: &Arc<Self>) -> usize {
        if !self.network.is_online() {
            return 0;
        }

        let ids: Vec<OperationId> = {
            let state = self.state.lock().await;
            state.items.iter().map(|i| i.id.clone()).collect()
        };

        let mut attempted = 0;
        for id in ids {
            if !self.network.is_online() {
                info!(attempted, "network lost, pausing queue flush");
                break;
            }
            if self.interrupted.load(Ordering::SeqCst) {
                info!(attempted, "queue flush interrupted");
                break;
            }

            let claimed = self.state.lock().await.claim(&id);
            if let Some(item) = claimed {
                self.process_item(item).await;
                attempted += 1;
            }
        }
        self.interrupted.store(false, Ordering::SeqCst);
        attempted
    }

    /// Stop the ongoing or next [`process_queue`](OfflineQueue::process_queue)
    /// after the current item.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub async fn status(&self) -> QueueStatus {
        let state = self.state.lock().await;
        QueueStatus {
            queued: state.items.len(),
            retrying: state.waiting.len(),
            failed: state.failed.len(),
        }
    }

    /// Items in the active queue, oldest first.
    pub async fn pending(&self) -> Vec<QueueItem> {
        self.state.lock().await.items.iter().cloned().collect()
    }

    /// Items that ran out of retries.
    pub async fn failed(&self) -> Vec<QueueItem> {
        self.state.lock().await.failed.clone()
    }

    /// Forget every failed item. Returns how many were dropped.
    pub async fn clear_failed(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let dropped = std::mem::take(&mut state.failed);
        if let Err(e) = save_json(&*self.storage, FAILED_KEY, &state.failed).await {
            state.failed = dropped;
            return Err(e);
        }
        info!(dropped = dropped.len(), "failed operations cleared");
        Ok(dropped.len())
    }

    /// Move a failed item back to the end of the queue with its retries reset.
    /// Returns `false` if no failed item has that id.
    pub async fn retry_failed(&self, id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(pos) = state.failed.iter().position(|i| i.id == id) else {
            return Ok(false);
        };

        let mut item = state.failed.remove(pos);
        item.retry_count = 0;
        item.last_error = None;
        state.items.push_back(item);

        let saved = match save_json(&*self.storage, QUEUE_KEY, &state.items).await {
            Ok(()) => save_json(&*self.storage, FAILED_KEY, &state.failed).await,
            Err(e) => Err(e),
        };
        if let Err(e) = saved {
            if let Some(item) = state.items.pop_back() {
                state.failed.insert(pos, item);
            }
            return Err(e);
        }

        info!(id, "failed operation requeued");
        Ok(true)
    }

    /// Execute one claimed item and settle its outcome.
    async fn process_item(self: &Arc<Self>, item: QueueItem) {
        let result = self.executor.execute(&item).await;

        let mut state = self.state.lock().await;
        state.in_flight.remove(&item.id);
        let Some(pos) = state.position(&item.id) else {
            // Evicted while executing
            return;
        };

        match result {
            Ok(()) => {
                let Some(done) = state.items.remove(pos) else {
                    return;
                };
                self.persist_items(&state).await;
                drop(state);

                debug!(id = %done.id, store = %done.store, "operation processed");
                self.events.emit(Event::OperationProcessed(done));
            }
            Err(e) => {
                let entry = &mut state.items[pos];
                entry.retry_count += 1;
                entry.last_error = Some(e.to_string());

                if entry.exhausted() {
                    let Some(failed) = state.items.remove(pos) else {
                        return;
                    };
                    state.failed.push(failed.clone());
                    self.persist_items(&state).await;
                    self.persist_failed(&state).await;
                    drop(state);

                    warn!(id = %failed.id, store = %failed.store, attempts = failed.retry_count, error = %e, "operation failed permanently");
                    self.events.emit(Event::OperationFailed {
                        item: failed,
                        error: e.to_string(),
                    });
                } else {
                    let retry_count = entry.retry_count;
                    let delay = self.config.retry_backoff() * retry_count;
                    state.waiting.insert(item.id.clone());
                    self.persist_items(&state).await;
                    drop(state);

                    warn!(id = %item.id, retry_count, delay_ms = delay.as_millis() as u64, error = %e, "operation failed, retry scheduled");
                    self.schedule_retry(item.id, delay);
                }
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, id: OperationId, delay: Duration) {
        let queue = Arc::clone(self);
        let task: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
            tokio::time::sleep(delay).await;
            queue.retry_due(&id).await;
        });
        tokio::spawn(task);
    }

    async fn retry_due(self: &Arc<Self>, id: &str) {
        let claimed = {
            let mut state = self.state.lock().await;
            state.waiting.remove(id);
            if !self.network.is_online() {
                debug!(id, "retry due while offline, left for next flush");
                return;
            }
            state.claim(id)
        };
        if let Some(item) = claimed {
            self.process_item(item).await;
        }
    }

    async fn persist_items(&self, state: &QueueState) {
        if let Err(e) = save_json(&*self.storage, QUEUE_KEY, &state.items).await {
            error!(error = %e, "failed to persist offline queue");
            self.events.emit(Event::QueuePersistFailed { error: e });
        }
    }

    async fn persist_failed(&self, state: &QueueState) {
        if let Err(e) = save_json(&*self.storage, FAILED_KEY, &state.failed).await {
            error!(error = %e, "failed to persist failed operations");
            self.events.emit(Event::QueuePersistFailed { error: e });
        }
    }
}

/// Load a persisted list, treating corrupt data as empty.
async fn load_or_discard<T>(storage: &dyn Storage, key: &str) -> Result<T>
where
    T: Default + serde::de::DeserializeOwned,
{
    match load_json(storage, key).await {
        Ok(value) => Ok(value.unwrap_or_default()),
        Err(Error::Transaction(reason)) if reason.starts_with("corrupt value") => {
            warn!(key, %reason, "discarding unreadable queue data");
            Ok(T::default())
        }
        Err(e) => Err(e),
    }
}
