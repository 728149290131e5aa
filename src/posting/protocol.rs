// # Shard Wire Protocol
//
// Length-framed bincode messages over TCP: a u32 LE frame length followed by
// the encoded payload. One request, one response, pipelined per connection.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::document::DocumentId;
use crate::error::{MatchError, Result};
use crate::posting::Posting;

/// Maximum frame size (64MB). Snapshot transfers dominate; anything larger
/// is a corrupt or hostile frame.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Lifecycle of a posting server. Transitions are monotone; a Closed shard
/// needs operator intervention.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub enum ShardState {
    Loading,
    Ready,
    Draining,
    Closed,
}

impl std::fmt::Display for ShardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ShardState::Loading => "loading",
            ShardState::Ready => "ready",
            ShardState::Draining => "draining",
            ShardState::Closed => "closed",
        };
        f.write_str(name)
    }
}

// Shard request
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum ShardRequest {
    Add {
        hash: u64,
        doc: DocumentId,
        position: u32,
    },
    Delete {
        hash: u64,
        doc: DocumentId,
        position: u32,
    },
    DeleteDocument {
        doc: DocumentId,
    },
    Search {
        hashes: Vec<u64>,
        window_size: u32,
    },
    Snapshot,
    Load {
        bytes: Vec<u8>,
    },
    Status,
}

/// Postings found for one searched hash. Hashes with no postings are omitted
/// from the response.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct HashHits {
    pub hash: u64,
    pub postings: Vec<Posting>,
}

// Shard response
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum ShardResponse {
    Ok,
    NotFound,
    Hits(Vec<HashHits>),
    Snapshot { bytes: Vec<u8> },
    Status {
        state: ShardState,
        postings: u64,
        occupied_groups: u64,
    },
    Unavailable { reason: String },
    Invalid { reason: String },
    Internal { reason: String },
}

impl ShardResponse {
    /// Fold an error response into a MatchError; Ok-shaped responses pass
    /// through.
    pub fn into_result(self) -> Result<ShardResponse> {
        match self {
            ShardResponse::Unavailable { reason } => Err(MatchError::Unavailable(reason)),
            ShardResponse::Invalid { reason } => Err(MatchError::Invalid(reason)),
            ShardResponse::Internal { reason } => Err(MatchError::Internal(reason)),
            other => Ok(other),
        }
    }
}

impl From<&MatchError> for ShardResponse {
    fn from(e: &MatchError) -> Self {
        match e {
            MatchError::NotFound(_) => ShardResponse::NotFound,
            MatchError::Unavailable(reason) => ShardResponse::Unavailable {
                reason: reason.clone(),
            },
            MatchError::Invalid(reason) => ShardResponse::Invalid {
                reason: reason.clone(),
            },
            other => ShardResponse::Internal {
                reason: other.to_string(),
            },
        }
    }
}

/// Write one length-framed message.
pub async fn write_frame<T, W>(writer: &mut W, value: &T) -> Result<()>
where
    T: bincode::Encode,
    W: AsyncWrite + Unpin,
{
    let bytes = bincode::encode_to_vec(value, bincode::config::standard())?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(MatchError::Invalid(format!(
            "frame of {} bytes exceeds limit",
            bytes.len()
        )));
    }
    writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-framed message. Returns None on a clean close before the
/// next frame.
pub async fn read_frame<T, R>(reader: &mut R) -> Result<Option<T>>
where
    T: bincode::Decode<()>,
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(MatchError::Invalid(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    let (value, _) = bincode::decode_from_slice(&buf, bincode::config::standard())?;
    Ok(Some(value))
}
