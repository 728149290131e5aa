// # Document Model
//
// Document identity, text canonicalization, and hash-stream materialization.
// Put/Delete fan posting tuples out to the shard set; Get is a plain store read.

pub mod hasher;

use std::collections::BTreeMap;
use std::fmt;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use crate::error::{MatchError, Result};
use crate::posting::client::ShardSet;
use crate::store::Store;

pub use hasher::{rolling_rabin_karp, rolling_rabin_karp3, HashKey, HasherFn};

// Compound document identifier: (doctype, docid). Immutable once assigned.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct DocumentId {
    pub doctype: u32,
    pub docid: u32,
}

impl DocumentId {
    pub fn new(doctype: u32, docid: u32) -> Self {
        Self { doctype, docid }
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.doctype, self.docid)
    }
}

// A stored document. Text is canonicalized before indexing so the rune count
// is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    pub fn new(id: DocumentId, title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            text: text.into(),
            metadata: BTreeMap::new(),
        }
    }

    // Number of hash windows this document produces under `key`.
    pub fn window_count(&self, key: HashKey) -> usize {
        window_count(&self.text, key)
    }
}

/// Canonicalize text for hashing: collapse whitespace runs to a single space,
/// trim the ends, preserve case. Idempotent.
pub fn canonicalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(c);
        }
    }
    out
}

/// Canonicalize raw bytes. Malformed UTF-8 sequences are replaced with U+FFFD
/// so hashing stays deterministic for any input.
pub fn canonicalize_bytes(bytes: &[u8]) -> String {
    canonicalize(&String::from_utf8_lossy(bytes))
}

/// Windows produced by `text` under `key`: R - W + 1 for R runes, 0 if R < W.
pub fn window_count(text: &str, key: HashKey) -> usize {
    let runes = text.chars().count();
    let window = key.window_size as usize;
    if runes < window {
        0
    } else {
        runes - window + 1
    }
}

/// Materialize the full hash stream of `text` as a vector.
pub fn hash_vector(text: &str, key: HashKey) -> Vec<u64> {
    let count = window_count(text, key);
    let mut hashes = Vec::with_capacity(count);
    rolling_rabin_karp(text, count, key, &mut |_, h| hashes.push(h));
    hashes
}

/// Index a new document: canonicalize, dispatch every (hash, id, pos) tuple to
/// the owning shard, then persist the record. A document that already exists
/// is a Conflict.
pub async fn put_document(
    store: &dyn Store,
    shards: &ShardSet,
    key: HashKey,
    mut doc: Document,
) -> Result<()> {
    if store.get_document(doc.id).await?.is_some() {
        return Err(MatchError::Conflict(format!(
            "document {} already exists",
            doc.id
        )));
    }
    doc.text = canonicalize(&doc.text);
    dispatch_postings(shards, key, &doc, Operation::Add).await?;
    store.put_document(&doc).await
}

/// Remove a document from the index and the store. Returns false when the
/// document was not present (non-fatal).
pub async fn delete_document(
    store: &dyn Store,
    shards: &ShardSet,
    key: HashKey,
    id: DocumentId,
) -> Result<bool> {
    let doc = match store.get_document(id).await? {
        Some(doc) => doc,
        None => return Ok(false),
    };
    dispatch_postings(shards, key, &doc, Operation::Remove).await?;
    store.delete_document(id).await?;
    Ok(true)
}

/// Fetch a document record. No hashing.
pub async fn get_document(store: &dyn Store, id: DocumentId) -> Result<Option<Document>> {
    store.get_document(id).await
}

#[derive(Clone, Copy)]
enum Operation {
    Add,
    Remove,
}

// Route every window hash to its owning shard, one batch per shard, shards in
// parallel. The stored text is already canonical so add and remove see the
// same stream.
async fn dispatch_postings(
    shards: &ShardSet,
    key: HashKey,
    doc: &Document,
    op: Operation,
) -> Result<()> {
    let hashes = hash_vector(&doc.text, key);
    let mut batches: Vec<Vec<(u64, u32)>> = vec![Vec::new(); shards.len()];
    for (pos, &hash) in hashes.iter().enumerate() {
        batches[shards.route(hash)].push((hash, pos as u32));
    }

    let id = doc.id;
    let tasks = batches.into_iter().enumerate().map(|(i, batch)| {
        let client = shards.client(i);
        async move {
            for (hash, pos) in batch {
                match op {
                    Operation::Add => client.add(hash, id, pos).await?,
                    Operation::Remove => {
                        client.delete(hash, id, pos).await?;
                    }
                }
            }
            Ok::<(), MatchError>(())
        }
    });
    try_join_all(tasks).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_collapses_whitespace() {
        assert_eq!(canonicalize("a  b\t\nc"), "a b c");
        assert_eq!(canonicalize("  leading and trailing  "), "leading and trailing");
        assert_eq!(canonicalize("Case Preserved"), "Case Preserved");
        assert_eq!(canonicalize(""), "");
        assert_eq!(canonicalize(" \t\n "), "");
    }

    #[test]
    fn test_canonicalize_idempotent() {
        let once = canonicalize("x \u{00a0} y\r\nz");
        assert_eq!(canonicalize(&once), once);
    }

    #[test]
    fn test_canonicalize_bytes_replaces_malformed() {
        let out = canonicalize_bytes(&[b'a', 0xff, b'b']);
        assert_eq!(out, "a\u{fffd}b");
    }

    #[test]
    fn test_window_count() {
        let key = HashKey::new(4, 10);
        assert_eq!(window_count("Text gobble! Text", key), 14);
        assert_eq!(window_count("abc", key), 0);
        assert_eq!(window_count("abcd", key), 1);
    }

    #[test]
    fn test_document_id_ordering() {
        let a = DocumentId::new(1, 2);
        let b = DocumentId::new(1, 10);
        let c = DocumentId::new(2, 1);
        assert!(a < b);
        assert!(b < c);
    }
}
