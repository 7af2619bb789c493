//! Typed notifications from the sync engine, offline queue and migrations.
//!
//! Operations report their outcome through `Result`; events are for observers
//! (UI badges, logs, telemetry) that want to hear about background work.
//! Emitting with nobody subscribed is not an error, and a slow subscriber
//! only loses its own backlog.

use crate::{reconcile::SyncConflict, sync::SyncResult, BackupId, Error, QueueItem, RecordId, SchemaVersion, StoreName};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// A notification about background work.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    SyncStarted,
    SyncStopped,
    SyncCompleted(SyncResult),
    SyncFailed(SyncResult),
    NetworkOnline,
    NetworkOffline,
    ConflictDetected(SyncConflict),
    ConflictResolved(SyncConflict),
    /// The remote refused a record outright
    RecordRejected {
        store: StoreName,
        id: RecordId,
        reason: String,
    },
    OperationQueued(QueueItem),
    OperationProcessed(QueueItem),
    /// The item ran out of retries and moved to the failed set
    OperationFailed {
        item: QueueItem,
        error: String,
    },
    /// The queue hit its capacity and dropped its oldest item
    OperationEvicted {
        item: QueueItem,
        error: Error,
    },
    /// Writing the queue to storage failed; the stored queue no longer
    /// matches memory until the next successful write
    QueuePersistFailed {
        error: Error,
    },
    MigrationStarting {
        version: SchemaVersion,
        description: String,
    },
    MigrationCompleted {
        version: SchemaVersion,
    },
    MigrationFailed {
        version: SchemaVersion,
        error: Error,
    },
    MigrationsCompleted {
        from: SchemaVersion,
        to: SchemaVersion,
    },
    RollbackCompleted {
        version: SchemaVersion,
    },
    BackupCreated(BackupId),
    BackupRestored(BackupId),
}

/// Broadcast channel for [`Event`]s. Clones share the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus that buffers up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_a_channel() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let other = bus.clone();

        other.emit(Event::NetworkOnline);
        bus.emit(Event::BackupCreated("b-1".into()));

        assert_eq!(rx.recv().await.unwrap(), Event::NetworkOnline);
        assert_eq!(rx.recv().await.unwrap(), Event::BackupCreated("b-1".into()));
        assert_eq!(bus.receiver_count(), 1);
    }

    #[test]
    fn emit_without_subscribers() {
        let bus = EventBus::new(0);
        bus.emit(Event::SyncStarted);
        assert_eq!(bus.receiver_count(), 0);
    }
}
