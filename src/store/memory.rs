// # In-Memory Store
//
// Embedded store for standalone mode and tests. The queue collection sits
// in an ordered map under one lock so leasing the oldest Queued item is a
// single critical section; documents and the side collections use
// per-entry locking.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::document::{Document, DocumentId};
use crate::error::{MatchError, Result};
use crate::matcher::Association;
use crate::queue::{QueueItem, QueueItemKind, QueueStats, QueueStatus};
use crate::registry::DoctypeRange;
use crate::store::Store;

#[derive(Default)]
pub struct MemoryStore {
    documents: DashMap<DocumentId, Document>,
    queue: RwLock<BTreeMap<u64, QueueItem>>,
    next_id: AtomicU64,
    payloads: DashMap<u64, Vec<u8>>,
    associations: DashMap<DocumentId, Vec<Association>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_document(&self, doc: &Document) -> Result<()> {
        self.documents.insert(doc.id, doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>> {
        Ok(self.documents.get(&id).map(|d| d.clone()))
    }

    async fn delete_document(&self, id: DocumentId) -> Result<bool> {
        Ok(self.documents.remove(&id).is_some())
    }

    async fn document_count(&self) -> Result<u64> {
        Ok(self.documents.len() as u64)
    }

    async fn list_documents(&self, range: &DoctypeRange) -> Result<Vec<Document>> {
        let mut docs: Vec<Document> = self
            .documents
            .iter()
            .filter(|entry| range.matches(entry.id.doctype))
            .map(|entry| entry.clone())
            .collect();
        docs.sort_by_key(|d| d.id);
        Ok(docs)
    }

    async fn insert_item(
        &self,
        kind: QueueItemKind,
        target: Option<DocumentId>,
        source: Option<DocumentId>,
        payload: Vec<u8>,
    ) -> Result<QueueItem> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let item = QueueItem {
            id,
            kind,
            target,
            source,
            payload,
            status: QueueStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        };
        self.queue.write().insert(id, item.clone());
        Ok(item)
    }

    async fn lease_next(&self) -> Result<Option<QueueItem>> {
        let mut queue = self.queue.write();
        // BTreeMap iterates in ascending id order, so the first Queued item
        // is the oldest; the write lock makes the claim atomic.
        let id = queue
            .values()
            .find(|item| item.status == QueueStatus::Queued)
            .map(|item| item.id);
        match id {
            Some(id) => {
                let item = queue
                    .get_mut(&id)
                    .ok_or_else(|| MatchError::Internal("leased item vanished".to_string()))?;
                item.status = QueueStatus::Active;
                item.started_at = Some(Utc::now());
                Ok(Some(item.clone()))
            }
            None => Ok(None),
        }
    }

    async fn finish_item(&self, id: u64, status: QueueStatus, error: Option<String>) -> Result<()> {
        if !status.is_terminal() {
            return Err(MatchError::Queue(format!(
                "{:?} is not a terminal status",
                status
            )));
        }
        let mut queue = self.queue.write();
        let item = queue
            .get_mut(&id)
            .ok_or_else(|| MatchError::NotFound(format!("queue item {}", id)))?;
        if item.status != QueueStatus::Active {
            return Err(MatchError::Queue(format!(
                "queue item {} is {:?}, not Active",
                id, item.status
            )));
        }
        item.status = status;
        item.finished_at = Some(Utc::now());
        item.error = error;
        Ok(())
    }

    async fn get_item(&self, id: u64) -> Result<Option<QueueItem>> {
        Ok(self.queue.read().get(&id).cloned())
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let queue = self.queue.read();
        let mut stats = QueueStats::default();
        for item in queue.values() {
            match item.status {
                QueueStatus::Queued => stats.queued += 1,
                QueueStatus::Active => stats.active += 1,
                QueueStatus::Completed => stats.completed += 1,
                QueueStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn requeue_expired(&self, lease_timeout: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(lease_timeout)
                .map_err(|e| MatchError::Configuration(e.to_string()))?;
        let mut queue = self.queue.write();
        let mut moved = 0;
        for item in queue.values_mut() {
            if item.status == QueueStatus::Active
                && item.started_at.map(|t| t < cutoff).unwrap_or(false)
            {
                item.status = QueueStatus::Queued;
                item.started_at = None;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn put_payload(&self, item_id: u64, bytes: Vec<u8>) -> Result<()> {
        self.payloads.insert(item_id, bytes);
        Ok(())
    }

    async fn get_payload(&self, item_id: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.payloads.get(&item_id).map(|b| b.clone()))
    }

    async fn put_association(&self, association: &Association) -> Result<()> {
        self.associations
            .entry(association.target)
            .or_default()
            .push(association.clone());
        Ok(())
    }

    async fn get_associations(&self, id: DocumentId) -> Result<Vec<Association>> {
        Ok(self
            .associations
            .get(&id)
            .map(|a| a.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(doctype: u32, docid: u32) -> Document {
        Document::new(DocumentId::new(doctype, docid), "t", "some text")
    }

    #[tokio::test]
    async fn test_document_round_trip() {
        let store = MemoryStore::new();
        store.put_document(&doc(1, 1)).await.unwrap();
        assert_eq!(store.document_count().await.unwrap(), 1);
        assert!(store
            .get_document(DocumentId::new(1, 1))
            .await
            .unwrap()
            .is_some());
        assert!(store.delete_document(DocumentId::new(1, 1)).await.unwrap());
        assert!(!store.delete_document(DocumentId::new(1, 1)).await.unwrap());
        assert_eq!(store.document_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_documents_filters_by_doctype() {
        let store = MemoryStore::new();
        for doctype in 1..=4 {
            store.put_document(&doc(doctype, 1)).await.unwrap();
        }
        let all = store.list_documents(&DoctypeRange::all()).await.unwrap();
        assert_eq!(all.len(), 4);
        let some = store
            .list_documents(&DoctypeRange::parse("2-3").unwrap())
            .await
            .unwrap();
        assert_eq!(some.len(), 2);
        assert!(some.iter().all(|d| (2..=3).contains(&d.id.doctype)));
    }

    #[tokio::test]
    async fn test_lease_order_and_terminal_transitions() {
        let store = MemoryStore::new();
        let first = store
            .insert_item(QueueItemKind::AddDocument, None, None, Vec::new())
            .await
            .unwrap();
        let second = store
            .insert_item(QueueItemKind::Search, None, None, Vec::new())
            .await
            .unwrap();
        assert!(first.id < second.id);

        let leased = store.lease_next().await.unwrap().expect("oldest item");
        assert_eq!(leased.id, first.id);
        assert_eq!(leased.status, QueueStatus::Active);

        store
            .finish_item(first.id, QueueStatus::Completed, None)
            .await
            .unwrap();
        // A terminal item never transitions again.
        assert!(store
            .finish_item(first.id, QueueStatus::Failed, Some("late".to_string()))
            .await
            .is_err());

        let leased = store.lease_next().await.unwrap().expect("second item");
        assert_eq!(leased.id, second.id);
        assert!(store.lease_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finish_requires_active() {
        let store = MemoryStore::new();
        let item = store
            .insert_item(QueueItemKind::AddDocument, None, None, Vec::new())
            .await
            .unwrap();
        assert!(store
            .finish_item(item.id, QueueStatus::Completed, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_requeue_expired_returns_stale_leases() {
        let store = MemoryStore::new();
        store
            .insert_item(QueueItemKind::AddDocument, None, None, Vec::new())
            .await
            .unwrap();
        let leased = store.lease_next().await.unwrap().expect("item");

        // A fresh lease stays Active.
        assert_eq!(
            store.requeue_expired(Duration::from_secs(60)).await.unwrap(),
            0
        );
        // With a zero timeout the lease is already stale.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(
            store.requeue_expired(Duration::from_millis(1)).await.unwrap(),
            1
        );
        let item = store.get_item(leased.id).await.unwrap().expect("item");
        assert_eq!(item.status, QueueStatus::Queued);
    }

    #[tokio::test]
    async fn test_stats_by_status() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store
                .insert_item(QueueItemKind::AddDocument, None, None, Vec::new())
                .await
                .unwrap();
        }
        let a = store.lease_next().await.unwrap().expect("a");
        let b = store.lease_next().await.unwrap().expect("b");
        store
            .finish_item(a.id, QueueStatus::Completed, None)
            .await
            .unwrap();
        store
            .finish_item(b.id, QueueStatus::Failed, Some("boom".to_string()))
            .await
            .unwrap();
        let stats = store.queue_stats().await.unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total(), 3);
    }
}
