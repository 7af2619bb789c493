//! # Cairn Engine
//!
//! The local-first persistence and synchronization core.
//!
//! Applications read and write a local [`RecordStore`]; a [`SyncEngine`]
//! pushes whatever the remote has not accepted yet and settles conflicts;
//! an [`OfflineQueue`] holds operations until they can run; a
//! [`MigrationManager`] brings the stores up to the current schema at
//! startup.
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! Data is stored as records with:
//! - Unique ID within a named store
//! - Opaque JSON payload
//! - Version number, incremented on every update and delete
//! - Soft delete flag (tombstone), kept until the remote has it
//! - Synced flag, cleared by every local change
//!
//! ### Storage
//!
//! Everything durable goes through the [`Storage`] trait. [`MemoryStorage`]
//! and [`FileStorage`] ship with the crate.
//!
//! ### Sync
//!
//! [`SyncEngine::perform_sync`] pushes unsynced records in batches and
//! applies the [`ConflictPolicy`]:
//! - [`ConflictPolicy::ClientWins`] - local data is rebased above the remote version (default)
//! - [`ConflictPolicy::ServerWins`] - the remote record replaces the local one
//! - [`ConflictPolicy::Manual`] - conflicts wait for [`SyncEngine::resolve_conflict`]
//!
//! ## Quick Start
//!
//! ```rust
//! use cairn_engine::{IndexDef, MemoryStorage, Query, KeyRange, Record, RecordStore, StoreDescriptor};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test_runtime(async {
//! let notes = StoreDescriptor::new("notes").with_index(IndexDef::new("byUser", "userId"));
//! let store = RecordStore::open(Arc::new(MemoryStorage::new()), vec![notes]).await.unwrap();
//!
//! store.create("notes", Record::new("n-1", json!({"userId": "u-1", "text": "hi"}))).await.unwrap();
//! let version = store.update("notes", Record::new("n-1", json!({"userId": "u-1", "text": "hello"}))).await.unwrap();
//! assert_eq!(version, 1);
//!
//! let mine = store
//!     .query("notes", Query::new().index("byUser").range(KeyRange::only("u-1")))
//!     .await
//!     .unwrap();
//! assert_eq!(mine.len(), 1);
//! # });
//! # fn tokio_test_runtime<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod migration;
pub mod network;
pub mod operation;
pub mod queue;
pub mod reconcile;
pub mod record;
pub mod schema;
pub mod secure;
pub mod snapshot;
pub mod storage;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ConflictPolicy, QueueConfig, SyncConfig};
pub use error::Error;
pub use events::{Event, EventBus};
pub use migration::{
    BackupProvider, Migration, MigrationManager, MigrationReport, MigrationScript, MigrationStatus,
    SnapshotBackup,
};
pub use network::{NetworkMonitor, NetworkStatus};
pub use operation::{OperationExecutor, OperationId, OperationKind, QueueItem};
pub use queue::{OfflineQueue, QueueStatus};
pub use reconcile::{Resolution, SyncConflict};
pub use record::{ChangeEvent, ChangeKind, Record, StoreRecord};
pub use schema::{IndexDef, IndexKey, KeyRange, StoreDescriptor};
pub use secure::{Cipher, SecureStore};
pub use snapshot::{DatabaseSnapshot, StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use store::{DatabaseStats, Query, RecordStore, StoreStats};
pub use sync::{
    HttpTransport, PushRequest, PushResponse, RejectedRecord, SyncEngine, SyncResult, SyncStatus,
    SyncTransport,
};

/// Type aliases for clarity
pub type RecordId = String;
pub type StoreName = String;
pub type Version = u64;
pub type Timestamp = u64;
pub type SchemaVersion = u32;
pub type BackupId = String;
