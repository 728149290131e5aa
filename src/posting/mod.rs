// # Posting Layer
//
// Sharded inverted index over the hash space. Each shard owns a contiguous
// hash window and stores (document, position) postings in a sparse
// group-block table. One PostingServer hosts one shard behind a small
// length-framed TCP protocol; ShardClient/ShardSet are the caller side.

pub mod client;
pub mod protocol;
pub mod server;
pub mod shard;
pub mod snapshot;

use serde::{Deserialize, Serialize};

use crate::document::DocumentId;

pub use client::{ShardClient, ShardSet};
pub use protocol::{ShardRequest, ShardResponse, ShardState};
pub use server::PostingServer;
pub use shard::PostingShard;

// One occurrence of a hash: the document and the rune offset of the window.
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
pub struct Posting {
    pub doc: DocumentId,
    pub position: u32,
}

impl Posting {
    pub fn new(doc: DocumentId, position: u32) -> Self {
        Self { doc, position }
    }
}
