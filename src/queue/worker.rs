// # Queue Worker
//
// Leases items and dispatches them by kind. Success completes the item;
// any dispatch error fails it with the message preserved. No retries at
// this layer. The poll interval bounds how stale an idle worker can be;
// the janitor returns crashed leases to the pool.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::document::{self, canonicalize_bytes, Document, DocumentId, HashKey};
use crate::error::{MatchError, Result};
use crate::matcher::{find_matches, Association};
use crate::posting::client::ShardSet;
use crate::queue::{Queue, QueueItem, QueueItemKind};
use crate::store::Store;

#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn Store>,
    pub queue: Queue,
    pub shards: ShardSet,
    pub key: HashKey,
    pub match_threshold: u32,
    pub poll_interval: Duration,
    pub cancel: watch::Receiver<bool>,
}

/// Lease/dispatch loop. Drains everything leasable, then sleeps one poll
/// interval or exits on the stop signal.
pub async fn run(ctx: WorkerContext, mut stop: broadcast::Receiver<()>) {
    info!("queue worker started");
    loop {
        loop {
            if *ctx.cancel.borrow() {
                info!("queue worker cancelled");
                return;
            }
            match ctx.queue.lease().await {
                Ok(Some(item)) => process(&ctx, item).await,
                Ok(None) => break,
                Err(e) => {
                    warn!("lease failed: {}", e);
                    break;
                }
            }
        }
        tokio::select! {
            _ = stop.recv() => {
                info!("queue worker stopping");
                return;
            }
            _ = tokio::time::sleep(ctx.poll_interval) => {}
        }
    }
}

/// Periodically sweep Active items whose lease expired back to Queued.
pub async fn janitor(queue: Queue, lease_timeout: Duration, mut stop: broadcast::Receiver<()>) {
    let interval = (lease_timeout / 2).max(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = stop.recv() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        match queue.requeue_expired(lease_timeout).await {
            Ok(0) => {}
            Ok(n) => warn!("janitor returned {} expired leases to the queue", n),
            Err(e) => error!("janitor sweep failed: {}", e),
        }
    }
}

async fn process(ctx: &WorkerContext, item: QueueItem) {
    debug!("processing item {} ({})", item.id, item.kind);
    match dispatch(ctx, &item).await {
        Ok(()) => {
            if let Err(e) = ctx.queue.complete(item.id).await {
                error!("item {} finished but could not complete: {}", item.id, e);
            }
        }
        Err(e) => {
            warn!("item {} ({}) failed: {}", item.id, item.kind, e);
            if let Err(e2) = ctx.queue.fail(item.id, &e.to_string()).await {
                error!("item {} could not be failed: {}", item.id, e2);
            }
        }
    }
}

async fn dispatch(ctx: &WorkerContext, item: &QueueItem) -> Result<()> {
    if *ctx.cancel.borrow() {
        return Err(MatchError::Cancelled);
    }
    match item.kind {
        QueueItemKind::AddDocument => {
            let target = require_target(item)?;
            let (title, text, metadata) = parse_document_payload(&item.payload)?;
            let mut doc = Document::new(target, title, text);
            doc.metadata = metadata;
            document::put_document(ctx.store.as_ref(), &ctx.shards, ctx.key, doc).await
        }
        QueueItemKind::DeleteDocument => {
            let target = require_target(item)?;
            // Deleting an absent document is not an error.
            document::delete_document(ctx.store.as_ref(), &ctx.shards, ctx.key, target)
                .await
                .map(|_| ())
        }
        QueueItemKind::AssociateDocument => {
            let target = require_target(item)?;
            let doc = ctx
                .store
                .get_document(target)
                .await?
                .ok_or_else(|| MatchError::NotFound(format!("document {}", target)))?;
            let matches = find_matches(
                &ctx.shards,
                ctx.key,
                &doc.text,
                ctx.match_threshold,
                Some(target),
                &ctx.cancel,
            )
            .await?;
            ctx.store
                .put_association(&Association {
                    target,
                    matches,
                    created_at: Utc::now(),
                })
                .await
        }
        QueueItemKind::Search => {
            let text = canonicalize_bytes(&item.payload);
            let matches = find_matches(
                &ctx.shards,
                ctx.key,
                &text,
                ctx.match_threshold,
                None,
                &ctx.cancel,
            )
            .await?;
            ctx.store
                .put_payload(item.id, serde_json::to_vec(&matches)?)
                .await
        }
        QueueItemKind::Switch => {
            let source = item
                .source
                .ok_or_else(|| MatchError::Invalid("switch item without source".to_string()))?;
            let target = require_target(item)?;
            let doc = ctx
                .store
                .get_document(source)
                .await?
                .ok_or_else(|| MatchError::NotFound(format!("document {}", source)))?;
            document::delete_document(ctx.store.as_ref(), &ctx.shards, ctx.key, source).await?;
            let moved = Document { id: target, ..doc };
            document::put_document(ctx.store.as_ref(), &ctx.shards, ctx.key, moved).await
        }
    }
}

fn require_target(item: &QueueItem) -> Result<DocumentId> {
    item.target
        .ok_or_else(|| MatchError::Invalid(format!("{} item without target", item.kind)))
}

// Payloads arrive either as a JSON object or as form-style pairs
// (title=...&text=...); unknown form keys become metadata.
fn parse_document_payload(payload: &[u8]) -> Result<(String, String, BTreeMap<String, String>)> {
    let raw = String::from_utf8_lossy(payload);
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        #[derive(Deserialize)]
        struct Body {
            #[serde(default)]
            title: String,
            text: String,
            #[serde(default)]
            metadata: BTreeMap<String, String>,
        }
        let body: Body = serde_json::from_str(trimmed)
            .map_err(|e| MatchError::Invalid(format!("malformed document payload: {}", e)))?;
        return Ok((body.title, body.text, body.metadata));
    }

    let mut title = None;
    let mut text = None;
    let mut metadata = BTreeMap::new();
    for pair in trimmed.split('&') {
        let (name, value) = pair.split_once('=').ok_or_else(|| {
            MatchError::Invalid(format!("malformed document payload near {:?}", pair))
        })?;
        let value = urlencoding::decode(value)
            .map_err(|e| MatchError::Invalid(format!("malformed document payload: {}", e)))?
            .into_owned();
        match name {
            "title" => title = Some(value),
            "text" => text = Some(value),
            _ => {
                metadata.insert(name.to_string(), value);
            }
        }
    }
    let text = text.ok_or_else(|| MatchError::Invalid("document payload missing text".to_string()))?;
    Ok((title.unwrap_or_default(), text, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_form_payload() {
        let (title, text, metadata) =
            parse_document_payload(b"title=Payload&text=PayloadWithsometextlongerthanwindowsize")
                .unwrap();
        assert_eq!(title, "Payload");
        assert_eq!(text, "PayloadWithsometextlongerthanwindowsize");
        assert!(metadata.is_empty());
    }

    #[test]
    fn test_parse_form_payload_with_metadata_and_encoding() {
        let (title, text, metadata) =
            parse_document_payload(b"title=A%20Title&text=some%20text&author=me").unwrap();
        assert_eq!(title, "A Title");
        assert_eq!(text, "some text");
        assert_eq!(metadata.get("author").map(String::as_str), Some("me"));
    }

    #[test]
    fn test_parse_json_payload() {
        let (title, text, metadata) = parse_document_payload(
            br#"{"title": "T", "text": "body text", "metadata": {"source": "feed"}}"#,
        )
        .unwrap();
        assert_eq!(title, "T");
        assert_eq!(text, "body text");
        assert_eq!(metadata.get("source").map(String::as_str), Some("feed"));
    }

    #[test]
    fn test_malformed_payload_is_invalid() {
        assert!(matches!(
            parse_document_payload(b"garbage without separators"),
            Err(MatchError::Invalid(_))
        ));
        assert!(matches!(
            parse_document_payload(b"title=only&notext=here"),
            Err(MatchError::Invalid(_))
        ));
        assert!(matches!(
            parse_document_payload(b"{\"title\": \"broken\""),
            Err(MatchError::Invalid(_))
        ));
    }
}
