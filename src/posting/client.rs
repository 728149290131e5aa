// # Shard Client
//
// Caller side of the shard wire protocol. One lazily-connected TCP stream
// per shard, one request in flight per connection, every call under the
// configured deadline. ShardSet routes hashes across the topology.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::document::{DocumentId, HashKey};
use crate::error::{MatchError, Result};
use crate::posting::protocol::{
    read_frame, write_frame, HashHits, ShardRequest, ShardResponse, ShardState,
};

/// Default per-RPC deadline.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ShardClient {
    address: String,
    timeout: Duration,
    conn: Mutex<Option<TcpStream>>,
}

impl ShardClient {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
            conn: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn call(&self, request: &ShardRequest) -> Result<ShardResponse> {
        tokio::time::timeout(self.timeout, self.call_inner(request)).await?
    }

    async fn call_inner(&self, request: &ShardRequest) -> Result<ShardResponse> {
        let mut guard = self.conn.lock().await;
        let stream = match guard.as_mut() {
            Some(stream) => stream,
            None => {
                let stream = TcpStream::connect(&self.address).await.map_err(|e| {
                    MatchError::Network(format!("connect {}: {}", self.address, e))
                })?;
                guard.insert(stream)
            }
        };
        match Self::exchange(stream, request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                // The stream state is unknown after a failure; reconnect on
                // the next call.
                *guard = None;
                Err(e)
            }
        }
    }

    async fn exchange(stream: &mut TcpStream, request: &ShardRequest) -> Result<ShardResponse> {
        write_frame(stream, request).await?;
        match read_frame::<ShardResponse, _>(stream).await? {
            Some(response) => Ok(response),
            None => Err(MatchError::Network("shard closed connection".to_string())),
        }
    }

    pub async fn add(&self, hash: u64, doc: DocumentId, position: u32) -> Result<()> {
        self.call(&ShardRequest::Add {
            hash,
            doc,
            position,
        })
        .await?
        .into_result()?;
        Ok(())
    }

    /// Returns false when the posting was not present.
    pub async fn delete(&self, hash: u64, doc: DocumentId, position: u32) -> Result<bool> {
        let response = self
            .call(&ShardRequest::Delete {
                hash,
                doc,
                position,
            })
            .await?
            .into_result()?;
        Ok(!matches!(response, ShardResponse::NotFound))
    }

    pub async fn delete_document(&self, doc: DocumentId) -> Result<()> {
        self.call(&ShardRequest::DeleteDocument { doc })
            .await?
            .into_result()?;
        Ok(())
    }

    pub async fn search(&self, hashes: Vec<u64>, window_size: u32) -> Result<Vec<HashHits>> {
        let response = self
            .call(&ShardRequest::Search {
                hashes,
                window_size,
            })
            .await?
            .into_result()?;
        match response {
            ShardResponse::Hits(hits) => Ok(hits),
            other => Err(MatchError::Internal(format!(
                "unexpected search response: {:?}",
                other
            ))),
        }
    }

    pub async fn status(&self) -> Result<(ShardState, u64, u64)> {
        let response = self.call(&ShardRequest::Status).await?.into_result()?;
        match response {
            ShardResponse::Status {
                state,
                postings,
                occupied_groups,
            } => Ok((state, postings, occupied_groups)),
            other => Err(MatchError::Internal(format!(
                "unexpected status response: {:?}",
                other
            ))),
        }
    }

    pub async fn snapshot(&self) -> Result<Vec<u8>> {
        let response = self.call(&ShardRequest::Snapshot).await?.into_result()?;
        match response {
            ShardResponse::Snapshot { bytes } => Ok(bytes),
            other => Err(MatchError::Internal(format!(
                "unexpected snapshot response: {:?}",
                other
            ))),
        }
    }

    pub async fn load(&self, bytes: Vec<u8>) -> Result<()> {
        self.call(&ShardRequest::Load { bytes })
            .await?
            .into_result()?;
        Ok(())
    }
}

/// The full shard topology from a caller's point of view. Routing follows
/// the registry partition: shard i owns [i * size, (i + 1) * size), with the
/// last shard extended to the top of the hash space.
#[derive(Clone)]
pub struct ShardSet {
    clients: Vec<Arc<ShardClient>>,
    base_size: u64,
}

impl ShardSet {
    pub fn new(addresses: &[String], key: HashKey, timeout: Duration) -> Self {
        let clients = addresses
            .iter()
            .map(|a| Arc::new(ShardClient::new(a.clone(), timeout)))
            .collect::<Vec<_>>();
        let base_size = if clients.len() <= 1 {
            u64::MAX
        } else {
            (key.space() / clients.len() as u128).max(1) as u64
        };
        Self { clients, base_size }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Index of the shard owning `hash`.
    pub fn route(&self, hash: u64) -> usize {
        if self.clients.len() <= 1 {
            return 0;
        }
        ((hash / self.base_size) as usize).min(self.clients.len() - 1)
    }

    pub fn client(&self, index: usize) -> Arc<ShardClient> {
        self.clients[index].clone()
    }

    pub fn for_hash(&self, hash: u64) -> Arc<ShardClient> {
        self.client(self.route(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_respects_partition() {
        let addresses = vec!["a".to_string(), "b".to_string()];
        let key = HashKey::new(30, 24);
        let set = ShardSet::new(&addresses, key, DEFAULT_RPC_TIMEOUT);
        assert_eq!(set.route(0), 0);
        assert_eq!(set.route((1 << 23) - 1), 0);
        assert_eq!(set.route(1 << 23), 1);
        assert_eq!(set.route((1 << 24) - 1), 1);
    }

    #[test]
    fn test_route_last_shard_absorbs_remainder() {
        // 2^24 / 3 leaves a remainder; the top hashes still land on shard 2.
        let addresses = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let key = HashKey::new(30, 24);
        let set = ShardSet::new(&addresses, key, DEFAULT_RPC_TIMEOUT);
        assert_eq!(set.route((1 << 24) - 1), 2);
    }

    #[test]
    fn test_single_shard_routes_everything() {
        let addresses = vec!["a".to_string()];
        let key = HashKey::new(30, 64);
        let set = ShardSet::new(&addresses, key, DEFAULT_RPC_TIMEOUT);
        assert_eq!(set.route(0), 0);
        assert_eq!(set.route(u64::MAX), 0);
    }
}
