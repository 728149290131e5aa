// # Document Store
//
// Boundary to the persistent document database. Collections: documents
// (keyed by compound id), queue (keyed by monotonic item id, leased on
// (status, id) order), payloads (large result overflow) and associations.
// The embedded MemoryStore backs standalone mode and tests; server-backed
// stores plug in behind the same trait.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::document::{Document, DocumentId};
use crate::error::Result;
use crate::matcher::Association;
use crate::queue::{QueueItem, QueueItemKind, QueueStats, QueueStatus};
use crate::registry::DoctypeRange;

pub use memory::MemoryStore;

#[async_trait]
pub trait Store: Send + Sync {
    // documents
    async fn put_document(&self, doc: &Document) -> Result<()>;
    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>>;
    /// Returns false when the document was not present.
    async fn delete_document(&self, id: DocumentId) -> Result<bool>;
    async fn document_count(&self) -> Result<u64>;
    async fn list_documents(&self, range: &DoctypeRange) -> Result<Vec<Document>>;

    // queue
    async fn insert_item(
        &self,
        kind: QueueItemKind,
        target: Option<DocumentId>,
        source: Option<DocumentId>,
        payload: Vec<u8>,
    ) -> Result<QueueItem>;
    /// Claim the oldest Queued item atomically, or None when the queue is
    /// drained.
    async fn lease_next(&self) -> Result<Option<QueueItem>>;
    /// Terminal transition; only an Active item may finish, and only once.
    async fn finish_item(&self, id: u64, status: QueueStatus, error: Option<String>) -> Result<()>;
    async fn get_item(&self, id: u64) -> Result<Option<QueueItem>>;
    async fn queue_stats(&self) -> Result<QueueStats>;
    /// Return Active items whose lease started more than `lease_timeout` ago
    /// to Queued. Returns how many moved.
    async fn requeue_expired(&self, lease_timeout: Duration) -> Result<usize>;

    // payloads
    async fn put_payload(&self, item_id: u64, bytes: Vec<u8>) -> Result<()>;
    async fn get_payload(&self, item_id: u64) -> Result<Option<Vec<u8>>>;

    // associations
    async fn put_association(&self, association: &Association) -> Result<()>;
    async fn get_associations(&self, id: DocumentId) -> Result<Vec<Association>>;
}
