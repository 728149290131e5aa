// # Matcher
//
// Reconstructs contiguous match runs between a query text and the indexed
// corpus. Query hashes fan out to their owning shards in parallel; hits that
// share a (document, diagonal) pair belong to one alignment, and consecutive
// query positions on a diagonal coalesce into a run. A failing shard makes
// the result partial, never silently smaller.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

use crate::document::{hash_vector, DocumentId, HashKey};
use crate::error::{MatchError, Result};
use crate::posting::client::ShardSet;
use crate::posting::protocol::HashHits;

/// One maximal run of consecutive matching windows along a diagonal. A run
/// of k windows covers k + W - 1 runes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRun {
    pub doc: DocumentId,
    pub query_position: u32,
    pub doc_position: u32,
    pub length: u32,
}

/// Result envelope for one search. `partial` is set whenever any shard could
/// not answer; `failed_shards` lists them by topology index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchMatches {
    pub runs: Vec<MatchRun>,
    pub partial: bool,
    pub failed_shards: Vec<usize>,
}

/// A persisted association between a document and its matches at the time
/// the association was computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Association {
    pub target: DocumentId,
    pub matches: SearchMatches,
    pub created_at: DateTime<Utc>,
}

/// Search the corpus for text overlapping `text` (already canonical). Runs
/// longer than `threshold` runes are reported, sorted by descending length,
/// then document, then query position.
pub async fn find_matches(
    shards: &ShardSet,
    key: HashKey,
    text: &str,
    threshold: u32,
    exclude: Option<DocumentId>,
    cancel: &watch::Receiver<bool>,
) -> Result<SearchMatches> {
    let hashes = hash_vector(text, key);
    if hashes.is_empty() {
        return Ok(SearchMatches::default());
    }
    if *cancel.borrow() {
        return Err(MatchError::Cancelled);
    }

    // Per shard: the deduplicated hash batch, plus every query position for
    // each hash so hits can be mapped back.
    let mut batches: Vec<Vec<u64>> = vec![Vec::new(); shards.len()];
    let mut positions: HashMap<u64, Vec<u32>> = HashMap::new();
    for (position, &hash) in hashes.iter().enumerate() {
        let entry = positions.entry(hash).or_default();
        if entry.is_empty() {
            batches[shards.route(hash)].push(hash);
        }
        entry.push(position as u32);
    }

    let queried: Vec<usize> = (0..shards.len())
        .filter(|&i| !batches[i].is_empty())
        .collect();
    let window = key.window_size;
    let tasks = queried.iter().map(|&i| {
        let client = shards.client(i);
        let batch = std::mem::take(&mut batches[i]);
        async move { (i, client.search(batch, window).await) }
    });
    let responses = futures::future::join_all(tasks).await;

    if *cancel.borrow() {
        return Err(MatchError::Cancelled);
    }

    let mut failed_shards = Vec::new();
    let mut hits: Vec<HashHits> = Vec::new();
    for (shard_index, response) in responses {
        match response {
            Ok(mut shard_hits) => hits.append(&mut shard_hits),
            Err(e) => {
                warn!("shard {} failed during search: {}", shard_index, e);
                failed_shards.push(shard_index);
            }
        }
    }
    failed_shards.sort_unstable();

    let runs = assemble_runs(&hits, &positions, window, threshold, exclude);
    Ok(SearchMatches {
        runs,
        partial: !failed_shards.is_empty(),
        failed_shards,
    })
}

// Cluster hits by (document, diagonal), then coalesce consecutive query
// positions. The diagonal query_position - doc_position is constant along
// one aligned overlap.
fn assemble_runs(
    hits: &[HashHits],
    positions: &HashMap<u64, Vec<u32>>,
    window: u32,
    threshold: u32,
    exclude: Option<DocumentId>,
) -> Vec<MatchRun> {
    let mut diagonals: HashMap<(DocumentId, i64), Vec<u32>> = HashMap::new();
    for hit in hits {
        let query_positions = match positions.get(&hit.hash) {
            Some(list) => list,
            None => continue,
        };
        for posting in &hit.postings {
            if exclude == Some(posting.doc) {
                continue;
            }
            for &query_position in query_positions {
                let diagonal = query_position as i64 - posting.position as i64;
                diagonals
                    .entry((posting.doc, diagonal))
                    .or_default()
                    .push(query_position);
            }
        }
    }

    let mut runs = Vec::new();
    for ((doc, diagonal), mut query_positions) in diagonals {
        query_positions.sort_unstable();
        query_positions.dedup();

        let mut start = query_positions[0];
        let mut prev = query_positions[0];
        for &position in &query_positions[1..] {
            if position != prev + 1 {
                push_run(&mut runs, doc, diagonal, start, prev, window, threshold);
                start = position;
            }
            prev = position;
        }
        push_run(&mut runs, doc, diagonal, start, prev, window, threshold);
    }

    runs.sort_by(|a, b| {
        b.length
            .cmp(&a.length)
            .then(a.doc.cmp(&b.doc))
            .then(a.query_position.cmp(&b.query_position))
    });
    runs
}

fn push_run(
    runs: &mut Vec<MatchRun>,
    doc: DocumentId,
    diagonal: i64,
    start: u32,
    end: u32,
    window: u32,
    threshold: u32,
) {
    let length = (end - start + 1) + window - 1;
    if length > threshold {
        runs.push(MatchRun {
            doc,
            query_position: start,
            doc_position: (start as i64 - diagonal) as u32,
            length,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posting::Posting;

    fn hit(hash: u64, postings: Vec<Posting>) -> HashHits {
        HashHits { hash, postings }
    }

    fn positions_of(pairs: &[(u64, u32)]) -> HashMap<u64, Vec<u32>> {
        let mut map: HashMap<u64, Vec<u32>> = HashMap::new();
        for &(hash, position) in pairs {
            map.entry(hash).or_default().push(position);
        }
        map
    }

    #[test]
    fn test_consecutive_hits_form_one_run() {
        let doc = DocumentId::new(1, 1);
        // Query positions 3, 4, 5 all hit the same document at doc
        // positions 10, 11, 12: one diagonal, one run of three windows.
        let hits = vec![
            hit(100, vec![Posting::new(doc, 10)]),
            hit(101, vec![Posting::new(doc, 11)]),
            hit(102, vec![Posting::new(doc, 12)]),
        ];
        let positions = positions_of(&[(100, 3), (101, 4), (102, 5)]);
        let runs = assemble_runs(&hits, &positions, 4, 4, None);
        assert_eq!(
            runs,
            vec![MatchRun {
                doc,
                query_position: 3,
                doc_position: 10,
                length: 3 + 4 - 1,
            }]
        );
    }

    #[test]
    fn test_gap_splits_runs() {
        let doc = DocumentId::new(1, 1);
        let hits = vec![
            hit(100, vec![Posting::new(doc, 0)]),
            hit(101, vec![Posting::new(doc, 1)]),
            // Gap at query position 2, then the diagonal resumes.
            hit(103, vec![Posting::new(doc, 4)]),
            hit(104, vec![Posting::new(doc, 5)]),
            hit(105, vec![Posting::new(doc, 6)]),
        ];
        let positions = positions_of(&[(100, 0), (101, 1), (103, 4), (104, 5), (105, 6)]);
        let runs = assemble_runs(&hits, &positions, 4, 4, None);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].length, 6); // three windows
        assert_eq!(runs[0].query_position, 4);
        assert_eq!(runs[1].length, 5); // two windows
        assert_eq!(runs[1].query_position, 0);
    }

    #[test]
    fn test_different_diagonals_stay_separate() {
        let doc = DocumentId::new(1, 1);
        // Same query position matching two places in the document.
        let hits = vec![hit(
            100,
            vec![Posting::new(doc, 0), Posting::new(doc, 13)],
        )];
        let positions = positions_of(&[(100, 0)]);
        // Threshold 0 keeps single-window runs.
        let runs = assemble_runs(&hits, &positions, 4, 0, None);
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.length == 4));
    }

    #[test]
    fn test_threshold_filters_short_runs() {
        let doc = DocumentId::new(1, 1);
        let hits = vec![hit(100, vec![Posting::new(doc, 0)])];
        let positions = positions_of(&[(100, 0)]);
        // A single window of length W never exceeds the default threshold W.
        let runs = assemble_runs(&hits, &positions, 30, 30, None);
        assert!(runs.is_empty());
    }

    #[test]
    fn test_exclude_drops_self_matches() {
        let target = DocumentId::new(1, 1);
        let other = DocumentId::new(1, 2);
        let hits = vec![hit(
            100,
            vec![Posting::new(target, 0), Posting::new(other, 0)],
        )];
        let positions = positions_of(&[(100, 0)]);
        let runs = assemble_runs(&hits, &positions, 4, 0, Some(target));
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].doc, other);
    }

    #[test]
    fn test_output_ordering() {
        let a = DocumentId::new(1, 1);
        let b = DocumentId::new(1, 2);
        let hits = vec![
            hit(100, vec![Posting::new(b, 0), Posting::new(a, 0)]),
            hit(101, vec![Posting::new(a, 1)]),
        ];
        let positions = positions_of(&[(100, 0), (101, 1)]);
        let runs = assemble_runs(&hits, &positions, 4, 0, None);
        // a has the longer run; b ties on nothing and sorts after by length.
        assert_eq!(runs[0].doc, a);
        assert_eq!(runs[0].length, 5);
        assert_eq!(runs[1].doc, b);
        assert_eq!(runs[1].length, 4);
    }

    #[test]
    fn test_repeated_query_hash_maps_to_all_positions() {
        let doc = DocumentId::new(1, 1);
        // One hash occurring at two query positions; the posting pairs with
        // both, on two diagonals.
        let hits = vec![hit(100, vec![Posting::new(doc, 5)])];
        let positions = positions_of(&[(100, 0), (100, 13)]);
        let runs = assemble_runs(&hits, &positions, 4, 0, None);
        assert_eq!(runs.len(), 2);
    }
}
