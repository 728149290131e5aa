// Queue worker integration: a standalone process with two shards works a
// full add/delete cycle and fails malformed items, all through the durable
// queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use textmatch::document::DocumentId;
use textmatch::queue::{Queue, QueueItemKind, QueueStatus};
use textmatch::registry::{Flags, Mode, Registry};

async fn open_standalone() -> Arc<Registry> {
    let mut flags = Flags::default();
    flags.api_address = "127.0.0.1:0".to_string();
    flags.posting_addresses = vec!["127.0.0.1:0".to_string(), "127.0.0.1:0".to_string()];
    let registry = Registry::open(Mode::Standalone, flags).await.unwrap();
    registry.clone().start_services().await.unwrap();
    registry
}

// Poll until every enqueued item reached a terminal status.
async fn settle(queue: &Queue, terminal: u64) {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let stats = queue.stats().await.unwrap();
        if stats.completed + stats.failed >= terminal {
            return;
        }
        if Instant::now() > deadline {
            panic!("queue never settled: {:?}", stats);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_add_then_delete_twenty_documents() {
    let registry = open_standalone().await;
    let queue = registry.queue();

    for i in 1..=20u32 {
        queue
            .enqueue(
                QueueItemKind::AddDocument,
                Some(DocumentId::new(1, i)),
                None,
                b"title=Payload&text=PayloadWithsometextlongerthanwindowsize".to_vec(),
            )
            .await
            .unwrap();
    }
    settle(&queue, 20).await;

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.completed, 20);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.failed, 0);
    assert_eq!(registry.store.document_count().await.unwrap(), 20);

    for i in 1..=20u32 {
        queue
            .enqueue(
                QueueItemKind::DeleteDocument,
                Some(DocumentId::new(1, i)),
                None,
                Vec::new(),
            )
            .await
            .unwrap();
    }
    settle(&queue, 40).await;

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.completed, 40);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.failed, 0);
    assert_eq!(registry.store.document_count().await.unwrap(), 0);

    // Add/delete symmetry: no shard keeps a posting behind.
    let shards = registry.shard_set();
    for i in 0..shards.len() {
        let (_, postings, occupied_groups) = shards.client(i).status().await.unwrap();
        assert_eq!(postings, 0, "shard {} still has postings", i);
        assert_eq!(occupied_groups, 0);
    }

    registry.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_add_is_conflict() {
    let registry = open_standalone().await;
    let queue = registry.queue();
    let payload = b"title=Payload&text=PayloadWithsometextlongerthanwindowsize".to_vec();

    queue
        .enqueue(
            QueueItemKind::AddDocument,
            Some(DocumentId::new(1, 1)),
            None,
            payload.clone(),
        )
        .await
        .unwrap();
    settle(&queue, 1).await;

    let second = queue
        .enqueue(
            QueueItemKind::AddDocument,
            Some(DocumentId::new(1, 1)),
            None,
            payload,
        )
        .await
        .unwrap();
    settle(&queue, 2).await;

    let item = queue.get(second.id).await.unwrap().expect("item exists");
    assert_eq!(item.status, QueueStatus::Failed);
    assert!(item.error.unwrap().contains("already exists"));
    assert_eq!(registry.store.document_count().await.unwrap(), 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_malformed_payload_fails_with_invalid() {
    let registry = open_standalone().await;
    let queue = registry.queue();

    let item = queue
        .enqueue(
            QueueItemKind::AddDocument,
            Some(DocumentId::new(1, 1)),
            None,
            b"this is not a document payload".to_vec(),
        )
        .await
        .unwrap();
    settle(&queue, 1).await;

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 0);

    let failed = queue.get(item.id).await.unwrap().expect("item exists");
    assert_eq!(failed.status, QueueStatus::Failed);
    assert!(failed.started_at.is_some());
    assert!(failed.finished_at.is_some());
    assert!(failed.error.unwrap().contains("Invalid input"));
    assert_eq!(registry.store.document_count().await.unwrap(), 0);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_delete_of_absent_document_completes() {
    let registry = open_standalone().await;
    let queue = registry.queue();

    let item = queue
        .enqueue(
            QueueItemKind::DeleteDocument,
            Some(DocumentId::new(9, 9)),
            None,
            Vec::new(),
        )
        .await
        .unwrap();
    settle(&queue, 1).await;

    let done = queue.get(item.id).await.unwrap().expect("item exists");
    assert_eq!(done.status, QueueStatus::Completed);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_switch_rehomes_a_document() {
    let registry = open_standalone().await;
    let queue = registry.queue();

    queue
        .enqueue(
            QueueItemKind::AddDocument,
            Some(DocumentId::new(1, 1)),
            None,
            b"title=Payload&text=PayloadWithsometextlongerthanwindowsize".to_vec(),
        )
        .await
        .unwrap();
    settle(&queue, 1).await;

    queue
        .enqueue(
            QueueItemKind::Switch,
            Some(DocumentId::new(2, 7)),
            Some(DocumentId::new(1, 1)),
            Vec::new(),
        )
        .await
        .unwrap();
    settle(&queue, 2).await;

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.failed, 0);
    assert!(registry
        .store
        .get_document(DocumentId::new(1, 1))
        .await
        .unwrap()
        .is_none());
    let moved = registry
        .store
        .get_document(DocumentId::new(2, 7))
        .await
        .unwrap()
        .expect("moved document");
    assert_eq!(moved.text, "PayloadWithsometextlongerthanwindowsize");

    registry.shutdown().await;
}
