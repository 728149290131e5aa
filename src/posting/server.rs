// # Posting Server
//
// Hosts one shard behind the wire protocol. Lifecycle: Loading (writes are
// queued, search is unavailable) -> Ready -> Draining -> Closed. The shard
// is loaded from its snapshot file when one exists, otherwise rebuilt from
// the document store, then queued writes drain and the server goes Ready.
//
// Lock discipline: `pending` before `state`; the write gate is only taken
// with neither held. Writers share the gate; snapshot and load take it
// exclusively to see a quiescent shard.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::document::{hash_vector, DocumentId, HashKey};
use crate::error::{MatchError, Result};
use crate::posting::protocol::{
    read_frame, write_frame, HashHits, ShardRequest, ShardResponse, ShardState,
};
use crate::posting::shard::PostingShard;
use crate::posting::snapshot::{read_snapshot, write_snapshot};
use crate::registry::{DoctypeRange, PostingConfig};
use crate::store::Store;

/// Group keys processed between cooperative yields during a full-shard scan.
const SCAN_CHUNK_GROUPS: usize = 512;

enum PendingWrite {
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
}

pub struct PostingServer {
    config: PostingConfig,
    key: HashKey,
    shard: PostingShard,
    state: RwLock<ShardState>,
    pending: Mutex<Vec<PendingWrite>>,
    write_gate: RwLock<()>,
    snapshot_path: Option<PathBuf>,
}

impl PostingServer {
    pub fn new(config: PostingConfig, key: HashKey, snapshot_dir: Option<&Path>) -> Result<Arc<Self>> {
        key.validate()?;
        let shard = PostingShard::new(config.offset, config.size, config.group_size)?;
        let snapshot_path =
            snapshot_dir.map(|dir| dir.join(format!("shard-{:016x}.sfm", config.offset)));
        Ok(Arc::new(Self {
            config,
            key,
            shard,
            state: RwLock::new(ShardState::Loading),
            pending: Mutex::new(Vec::new()),
            write_gate: RwLock::new(()),
            snapshot_path,
        }))
    }

    pub fn state(&self) -> ShardState {
        *self.state.read()
    }

    fn advance(&self, to: ShardState) {
        let mut state = self.state.write();
        if *state < to {
            info!(
                "shard {:#x}: {} -> {}",
                self.config.offset, *state, to
            );
            *state = to;
        }
    }

    /// Accept connections until the stop signal fires, then drain, persist
    /// the snapshot, and close.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        store: Option<Arc<dyn Store>>,
        initial: DoctypeRange,
        mut stop: broadcast::Receiver<()>,
        cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(
            "posting server for [{:#x}, {:#x}] listening on {}",
            self.config.offset,
            self.shard.end(),
            self.config.address
        );

        let init = {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.initialize(store, initial).await {
                    error!("shard {:#x} failed to initialize: {}", this.config.offset, e);
                }
            })
        };

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("shard {:#x}: connection from {}", self.config.offset, peer);
                            let this = self.clone();
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                if let Err(e) = this.handle_connection(stream, cancel).await {
                                    debug!("connection ended: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("accept failed: {}", e);
                        }
                    }
                }
            }
        }

        init.abort();
        self.advance(ShardState::Draining);
        if let Err(e) = self.persist_snapshot() {
            warn!("shard {:#x}: snapshot not persisted: {}", self.config.offset, e);
        }
        self.advance(ShardState::Closed);
        Ok(())
    }

    // Snapshot file first, then the store; queued writes drain before Ready.
    async fn initialize(
        &self,
        store: Option<Arc<dyn Store>>,
        initial: DoctypeRange,
    ) -> Result<()> {
        if let Some(path) = &self.snapshot_path {
            if path.exists() {
                match self.load_snapshot_file(path) {
                    Ok(()) => {
                        self.drain_pending()?;
                        return Ok(());
                    }
                    Err(e) => {
                        // A corrupt or mismatched snapshot is fatal to the
                        // shard; rebuilding would hide the corruption.
                        error!("shard {:#x}: snapshot {}: {}", self.config.offset, path.display(), e);
                        self.advance(ShardState::Closed);
                        return Err(e);
                    }
                }
            }
        }

        if let Some(store) = store {
            let docs = store.list_documents(&initial).await?;
            let mut indexed = 0u64;
            for doc in &docs {
                for (position, hash) in hash_vector(&doc.text, self.key).into_iter().enumerate() {
                    if hash >= self.config.offset && hash <= self.shard.end() {
                        self.shard.add(hash, doc.id, position as u32)?;
                        indexed += 1;
                    }
                }
            }
            info!(
                "shard {:#x}: indexed {} postings from {} stored documents",
                self.config.offset,
                indexed,
                docs.len()
            );
        }

        self.drain_pending()
    }

    fn load_snapshot_file(&self, path: &Path) -> Result<()> {
        let mut file = std::fs::File::open(path)?;
        let loaded = read_snapshot(
            &mut file,
            self.key,
            self.config.offset,
            self.config.size,
            self.config.group_size,
        )?;
        self.shard.install(loaded)?;
        info!(
            "shard {:#x}: loaded {} postings from {}",
            self.config.offset,
            self.shard.posting_count(),
            path.display()
        );
        Ok(())
    }

    // Apply queued writes in batches, then flip to Ready while holding the
    // pending lock so no write slips between drain and the state change.
    fn drain_pending(&self) -> Result<()> {
        loop {
            let batch = {
                let mut pending = self.pending.lock();
                if pending.is_empty() {
                    let mut state = self.state.write();
                    if *state == ShardState::Loading {
                        *state = ShardState::Ready;
                        info!("shard {:#x}: ready", self.config.offset);
                    }
                    return Ok(());
                }
                std::mem::take(&mut *pending)
            };
            for write in batch {
                // A write queued during Loading has no caller left to report
                // to; drop it with a trace instead of wedging startup.
                if let Err(e) = self.apply(write) {
                    warn!("shard {:#x}: queued write dropped: {}", self.config.offset, e);
                }
            }
        }
    }

    fn apply(&self, write: PendingWrite) -> Result<()> {
        match write {
            PendingWrite::Add {
                hash,
                doc,
                position,
            } => {
                self.shard.add(hash, doc, position)?;
            }
            PendingWrite::Delete {
                hash,
                doc,
                position,
            } => {
                self.shard.remove(hash, doc, position)?;
            }
            PendingWrite::DeleteDocument { doc } => {
                self.shard.remove_document(doc);
            }
        }
        Ok(())
    }

    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        while let Some(request) = read_frame::<ShardRequest, _>(&mut stream).await? {
            let response = match self.process(request, &cancel).await {
                Ok(response) => response,
                Err(e) => ShardResponse::from(&e),
            };
            write_frame(&mut stream, &response).await?;
        }
        Ok(())
    }

    async fn process(
        &self,
        request: ShardRequest,
        cancel: &watch::Receiver<bool>,
    ) -> Result<ShardResponse> {
        match request {
            ShardRequest::Add {
                hash,
                doc,
                position,
            } => self.write_op(
                PendingWrite::Add {
                    hash,
                    doc,
                    position,
                },
                |shard| {
                    shard.add(hash, doc, position)?;
                    Ok(ShardResponse::Ok)
                },
            ),
            ShardRequest::Delete {
                hash,
                doc,
                position,
            } => self.write_op(
                PendingWrite::Delete {
                    hash,
                    doc,
                    position,
                },
                |shard| {
                    if shard.remove(hash, doc, position)? {
                        Ok(ShardResponse::Ok)
                    } else {
                        Ok(ShardResponse::NotFound)
                    }
                },
            ),
            ShardRequest::DeleteDocument { doc } => {
                {
                    let mut pending = self.pending.lock();
                    match *self.state.read() {
                        ShardState::Loading => {
                            pending.push(PendingWrite::DeleteDocument { doc });
                            return Ok(ShardResponse::Ok);
                        }
                        ShardState::Ready => {}
                        state => {
                            return Err(MatchError::Unavailable(format!("shard is {}", state)))
                        }
                    }
                }
                let removed = self.delete_document_scan(doc, cancel).await?;
                debug!(
                    "shard {:#x}: removed {} postings for {}",
                    self.config.offset, removed, doc
                );
                Ok(ShardResponse::Ok)
            }
            ShardRequest::Search {
                hashes,
                window_size,
            } => {
                if window_size != self.key.window_size {
                    return Err(MatchError::Invalid(format!(
                        "window_size {} does not match shard window_size {}",
                        window_size, self.key.window_size
                    )));
                }
                match *self.state.read() {
                    ShardState::Ready => {}
                    state => {
                        return Err(MatchError::Unavailable(format!("shard is {}", state)));
                    }
                }
                let mut hits = Vec::new();
                for hash in hashes {
                    let postings = self.shard.lookup(hash)?;
                    if !postings.is_empty() {
                        hits.push(HashHits { hash, postings });
                    }
                }
                Ok(ShardResponse::Hits(hits))
            }
            ShardRequest::Snapshot => {
                match *self.state.read() {
                    ShardState::Ready => {}
                    state => {
                        return Err(MatchError::Unavailable(format!("shard is {}", state)));
                    }
                }
                let mut bytes = Vec::new();
                {
                    let _gate = self.write_gate.write();
                    write_snapshot(&self.shard, self.key, &mut bytes)?;
                }
                Ok(ShardResponse::Snapshot { bytes })
            }
            ShardRequest::Load { bytes } => {
                match *self.state.read() {
                    ShardState::Loading | ShardState::Ready => {}
                    state => {
                        return Err(MatchError::Unavailable(format!("shard is {}", state)));
                    }
                }
                {
                    let _gate = self.write_gate.write();
                    let loaded = match read_snapshot(
                        &mut bytes.as_slice(),
                        self.key,
                        self.config.offset,
                        self.config.size,
                        self.config.group_size,
                    ) {
                        Ok(loaded) => loaded,
                        Err(e @ MatchError::Internal(_)) => {
                            self.advance(ShardState::Closed);
                            return Err(e);
                        }
                        Err(e) => return Err(e),
                    };
                    self.shard.install(loaded)?;
                }
                self.drain_pending()?;
                Ok(ShardResponse::Ok)
            }
            ShardRequest::Status => Ok(ShardResponse::Status {
                state: *self.state.read(),
                postings: self.shard.posting_count(),
                occupied_groups: self.shard.occupied_groups() as u64,
            }),
        }
    }

    // Queue the write while Loading, apply it under the shared gate while
    // Ready, refuse it afterwards.
    fn write_op<F>(&self, queued: PendingWrite, apply: F) -> Result<ShardResponse>
    where
        F: FnOnce(&PostingShard) -> Result<ShardResponse>,
    {
        {
            let mut pending = self.pending.lock();
            match *self.state.read() {
                ShardState::Loading => {
                    pending.push(queued);
                    return Ok(ShardResponse::Ok);
                }
                ShardState::Ready => {}
                state => return Err(MatchError::Unavailable(format!("shard is {}", state))),
            }
        }
        let _gate = self.write_gate.read();
        apply(&self.shard)
    }

    // Full-shard scan in chunks with cooperative yields; honors the
    // cancellation token between chunks.
    async fn delete_document_scan(
        &self,
        doc: DocumentId,
        cancel: &watch::Receiver<bool>,
    ) -> Result<u64> {
        let keys = self.shard.group_keys();
        let mut removed = 0u64;
        for chunk in keys.chunks(SCAN_CHUNK_GROUPS) {
            if *cancel.borrow() {
                return Err(MatchError::Cancelled);
            }
            {
                let _gate = self.write_gate.read();
                removed += self.shard.remove_document_in_groups(chunk, doc);
            }
            tokio::task::yield_now().await;
        }
        Ok(removed)
    }

    fn persist_snapshot(&self) -> Result<()> {
        let path = match &self.snapshot_path {
            Some(path) => path,
            None => return Ok(()),
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("sfm.tmp");
        {
            let _gate = self.write_gate.write();
            let mut file = std::fs::File::create(&tmp)?;
            write_snapshot(&self.shard, self.key, &mut file)?;
        }
        std::fs::rename(&tmp, path)?;
        info!(
            "shard {:#x}: persisted {} postings to {}",
            self.config.offset,
            self.shard.posting_count(),
            path.display()
        );
        Ok(())
    }
}
