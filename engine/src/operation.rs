//! Queued operations and how they are executed.
//!
//! A [`QueueItem`] is a create, update or delete captured while it could not
//! (or should not) run directly. The offline queue hands items to an
//! [`OperationExecutor`]; the [`RecordStore`] is the stock executor and applies
//! the operation locally.

use crate::{error::Result, Record, RecordStore, StoreName, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Unique identifier for a queued operation.
pub type OperationId = String;

/// What a queued operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A pending operation in the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Operation ID
    pub id: OperationId,
    /// Kind of change
    pub operation: OperationKind,
    /// Target store
    pub store: StoreName,
    /// Record to write (only the id matters for deletes)
    pub record: Record,
    /// When the item was queued (milliseconds since epoch)
    pub enqueued_at: Timestamp,
    /// Failed attempts so far
    #[serde(default)]
    pub retry_count: u32,
    /// Attempts allowed before the item moves to the failed set
    pub max_retries: u32,
    /// Error from the most recent failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueueItem {
    /// Create a fresh item with a random id.
    pub fn new(
        operation: OperationKind,
        store: impl Into<StoreName>,
        record: Record,
        enqueued_at: Timestamp,
        max_retries: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            store: store.into(),
            record,
            enqueued_at,
            retry_count: 0,
            max_retries,
            last_error: None,
        }
    }

    /// Whether the item has used up its attempts.
    pub fn exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Something that can carry out a queued operation.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, item: &QueueItem) -> Result<()>;
}

#[async_trait]
impl OperationExecutor for RecordStore {
    async fn execute(&self, item: &QueueItem) -> Result<()> {
        match item.operation {
            OperationKind::Create => self.create(&item.store, item.record.clone()).await.map(|_| ()),
            OperationKind::Update => self.update(&item.store, item.record.clone()).await.map(|_| ()),
            OperationKind::Delete => self.delete(&item.store, &item.record.id).await,
        }
    }
}
