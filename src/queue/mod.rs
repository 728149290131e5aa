// # Work Queue
//
// Durable FIFO of document operations, backed by the store's queue
// collection. Items are leased to the worker one at a time; terminal
// transitions happen exactly once and stick.

pub mod worker;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::document::DocumentId;
use crate::error::Result;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueItemKind {
    AddDocument,
    DeleteDocument,
    AssociateDocument,
    Search,
    Switch,
}

impl fmt::Display for QueueItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueItemKind::AddDocument => "Add Document",
            QueueItemKind::DeleteDocument => "Delete Document",
            QueueItemKind::AssociateDocument => "Associate Document",
            QueueItemKind::Search => "Search",
            QueueItemKind::Switch => "Switch",
        };
        f.write_str(name)
    }
}

// Lifecycle: Queued -> Active -> Completed | Failed. The janitor may return
// an expired Active lease to Queued; terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    Queued,
    Active,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: u64,
    pub kind: QueueItemKind,
    pub target: Option<DocumentId>,
    pub source: Option<DocumentId>,
    // Opaque until dispatch; the queue itself never interprets it. Not
    // serialized outward: large payloads live in the payloads collection.
    #[serde(default, skip)]
    pub payload: Vec<u8>,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.queued + self.active + self.completed + self.failed
    }
}

#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn Store>,
}

impl Queue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Persist a new item with status Queued. Ids are monotonic; the store
    /// assigns them.
    pub async fn enqueue(
        &self,
        kind: QueueItemKind,
        target: Option<DocumentId>,
        source: Option<DocumentId>,
        payload: Vec<u8>,
    ) -> Result<QueueItem> {
        let item = self.store.insert_item(kind, target, source, payload).await?;
        debug!("enqueued {} as item {}", item.kind, item.id);
        Ok(item)
    }

    /// Atomically claim the oldest Queued item, moving it to Active.
    pub async fn lease(&self) -> Result<Option<QueueItem>> {
        self.store.lease_next().await
    }

    pub async fn complete(&self, id: u64) -> Result<()> {
        self.store.finish_item(id, QueueStatus::Completed, None).await
    }

    pub async fn fail(&self, id: u64, error: &str) -> Result<()> {
        self.store
            .finish_item(id, QueueStatus::Failed, Some(error.to_string()))
            .await
    }

    pub async fn get(&self, id: u64) -> Result<Option<QueueItem>> {
        self.store.get_item(id).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.store.queue_stats().await
    }

    /// Return expired Active leases to Queued so a crashed worker's items run
    /// again (at-least-once).
    pub async fn requeue_expired(&self, lease_timeout: Duration) -> Result<usize> {
        self.store.requeue_expired(lease_timeout).await
    }
}
