// # Registry
//
// Process-wide configuration and lifecycle root: mode, hash key, shard
// topology, store handle, stop signalling, and the set of tracked service
// tasks. Everything is frozen at open; shutdown is top-down from here.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::api::{self, ApiState};
use crate::document::HashKey;
use crate::error::{MatchError, Result};
use crate::posting::client::ShardSet;
use crate::posting::server::PostingServer;
use crate::queue::{worker, Queue};
use crate::store::{MemoryStore, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Standalone,
    Api,
    Posting,
    Queue,
    Client,
}

/// Split the process arguments into a mode and the arguments left for flag
/// parsing. No mode word means standalone; a client command word selects
/// client mode with the command kept in the remainder.
pub fn parse_mode(args: &[String]) -> (Mode, Vec<String>) {
    if args.len() <= 1 {
        return (Mode::Standalone, Vec::new());
    }
    match args[1].as_str() {
        "api" => (Mode::Api, args[2..].to_vec()),
        "posting" => (Mode::Posting, args[2..].to_vec()),
        "queue" => (Mode::Queue, args[2..].to_vec()),
        "standalone" => (Mode::Standalone, args[2..].to_vec()),
        "add" | "delete" | "associate" | "switch" | "search" => {
            (Mode::Client, args[1..].to_vec())
        }
        _ => (Mode::Standalone, args[1..].to_vec()),
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "textmatch",
    about = "Near-duplicate text detection engine",
    rename_all = "snake_case"
)]
pub struct Flags {
    /// Window size in runes for hashing.
    #[arg(long, default_value_t = 30)]
    pub window_size: u32,

    /// Number of hash bits.
    #[arg(long, default_value_t = 24)]
    pub hash_width: u32,

    /// Hashes per group in the sparse posting table.
    #[arg(long, default_value_t = 24)]
    pub group_size: u32,

    /// Address for the HTTP API to listen on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub api_address: String,

    /// Document store URL. mem:// is the embedded in-memory store.
    #[arg(long, default_value = "mem://")]
    pub db_url: String,

    /// Comma-separated posting server addresses; one shard each.
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "127.0.0.1:8090,127.0.0.1:8091"
    )]
    pub posting_addresses: Vec<String>,

    /// Doctype range to load into shards at startup; empty means all.
    #[arg(long, default_value = "")]
    pub initial_query: String,

    /// Path to a JSON feed configuration.
    #[arg(long, default_value = "")]
    pub feeds: String,

    /// Minimum run length in runes to report; 0 means the window size.
    #[arg(long, default_value_t = 0)]
    pub match_threshold: u32,

    /// Directory for shard snapshot files; empty disables persistence.
    #[arg(long, default_value = "")]
    pub snapshot_dir: String,

    /// Queue poll interval in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub poll_interval_ms: u64,

    /// Seconds before the janitor returns an Active lease to the queue.
    #[arg(long, default_value_t = 60)]
    pub lease_timeout_secs: u64,

    /// Per-shard RPC deadline in seconds.
    #[arg(long, default_value_t = 5)]
    pub rpc_timeout_secs: u64,
}

impl Default for Flags {
    fn default() -> Self {
        Flags::parse_from(["textmatch"])
    }
}

/// Doctype selector for the initial shard load: empty is all, "3" one
/// doctype, "1-5" an inclusive range.
#[derive(Debug, Clone, Default)]
pub struct DoctypeRange {
    range: Option<(u32, u32)>,
}

impl DoctypeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Self::all());
        }
        let (low, high) = match input.split_once('-') {
            Some((low, high)) => (low, high),
            None => (input, input),
        };
        let low: u32 = low
            .trim()
            .parse()
            .map_err(|_| MatchError::Configuration(format!("bad doctype range {:?}", input)))?;
        let high: u32 = high
            .trim()
            .parse()
            .map_err(|_| MatchError::Configuration(format!("bad doctype range {:?}", input)))?;
        if low > high {
            return Err(MatchError::Configuration(format!(
                "inverted doctype range {:?}",
                input
            )));
        }
        Ok(Self {
            range: Some((low, high)),
        })
    }

    pub fn matches(&self, doctype: u32) -> bool {
        match self.range {
            Some((low, high)) => (low..=high).contains(&doctype),
            None => true,
        }
    }
}

/// One shard's slice of the topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostingConfig {
    pub address: String,
    pub offset: u64,
    pub size: u64,
    pub group_size: u32,
}

/// Shard i owns [i * base, (i + 1) * base); the last shard is extended to
/// the top of the hash space to absorb the division remainder. A size that
/// wraps to 0 encodes the full u64 range.
pub fn build_partition(
    key: HashKey,
    addresses: &[String],
    group_size: u32,
) -> Result<Vec<PostingConfig>> {
    let n = addresses.len();
    if n == 0 {
        return Err(MatchError::Configuration(
            "at least one posting address is required".to_string(),
        ));
    }
    let space = key.space();
    if n as u128 > space {
        return Err(MatchError::Configuration(format!(
            "{} shards cannot partition {} hash values",
            n, space
        )));
    }
    let base = space / n as u128;
    let mut configs = Vec::with_capacity(n);
    for (i, address) in addresses.iter().enumerate() {
        let offset = (base * i as u128) as u64;
        let size = if i == n - 1 {
            (space - base * i as u128) as u64
        } else {
            base as u64
        };
        configs.push(PostingConfig {
            address: address.clone(),
            offset,
            size,
            group_size,
        });
    }
    Ok(configs)
}

pub struct Registry {
    pub mode: Mode,
    pub key: HashKey,
    pub api_address: String,
    pub posting_configs: Vec<PostingConfig>,
    pub store: Arc<dyn Store>,
    pub match_threshold: u32,
    pub poll_interval: Duration,
    pub lease_timeout: Duration,
    pub rpc_timeout: Duration,
    pub initial_query: DoctypeRange,
    pub snapshot_dir: Option<PathBuf>,
    pub feeds: String,
    pub cancel: watch::Receiver<bool>,
    cancel_tx: watch::Sender<bool>,
    stop: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    api_listener: Mutex<Option<TcpListener>>,
    posting_listeners: Mutex<Vec<(usize, TcpListener)>>,
}

impl Registry {
    /// Validate the configuration, open the store, and bind the listeners
    /// this mode needs. Nothing is spawned yet.
    pub async fn open(mode: Mode, flags: Flags) -> Result<Arc<Self>> {
        let key = HashKey::new(flags.window_size, flags.hash_width);
        key.validate()?;
        if flags.group_size == 0 || flags.group_size > 64 {
            return Err(MatchError::Configuration(format!(
                "group_size {} out of range [1, 64]",
                flags.group_size
            )));
        }
        let store = open_store(&flags.db_url)?;
        let initial_query = DoctypeRange::parse(&flags.initial_query)?;

        let mut addresses = flags.posting_addresses.clone();
        let mut posting_listeners = Vec::new();
        if matches!(mode, Mode::Posting | Mode::Standalone) {
            for (i, address) in flags.posting_addresses.iter().enumerate() {
                let listener = TcpListener::bind(address).await.map_err(|e| {
                    MatchError::Network(format!("bind posting address {}: {}", address, e))
                })?;
                // Rebind with the resolved address so port 0 works.
                addresses[i] = listener.local_addr()?.to_string();
                posting_listeners.push((i, listener));
            }
        }

        let mut api_address = flags.api_address.clone();
        let api_listener = if matches!(mode, Mode::Api | Mode::Standalone) {
            let listener = TcpListener::bind(&flags.api_address).await.map_err(|e| {
                MatchError::Network(format!("bind api address {}: {}", flags.api_address, e))
            })?;
            api_address = listener.local_addr()?.to_string();
            Some(listener)
        } else {
            None
        };

        let posting_configs = build_partition(key, &addresses, flags.group_size)?;
        let (stop, _) = broadcast::channel(8);
        let (cancel_tx, cancel) = watch::channel(false);
        let match_threshold = if flags.match_threshold == 0 {
            key.window_size
        } else {
            flags.match_threshold
        };
        let snapshot_dir = if flags.snapshot_dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(&flags.snapshot_dir))
        };

        Ok(Arc::new(Self {
            mode,
            key,
            api_address,
            posting_configs,
            store,
            match_threshold,
            poll_interval: Duration::from_millis(flags.poll_interval_ms),
            lease_timeout: Duration::from_secs(flags.lease_timeout_secs),
            rpc_timeout: Duration::from_secs(flags.rpc_timeout_secs),
            initial_query,
            snapshot_dir,
            feeds: flags.feeds,
            cancel,
            cancel_tx,
            stop,
            tasks: Mutex::new(Vec::new()),
            api_listener: Mutex::new(api_listener),
            posting_listeners: Mutex::new(posting_listeners),
        }))
    }

    pub fn queue(&self) -> Queue {
        Queue::new(self.store.clone())
    }

    pub fn shard_set(&self) -> ShardSet {
        let addresses: Vec<String> = self
            .posting_configs
            .iter()
            .map(|c| c.address.clone())
            .collect();
        ShardSet::new(&addresses, self.key, self.rpc_timeout)
    }

    pub fn subscribe_stop(&self) -> broadcast::Receiver<()> {
        self.stop.subscribe()
    }

    pub fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Spawn the listeners and background loops this mode runs.
    pub async fn start_services(self: Arc<Self>) -> Result<()> {
        if matches!(self.mode, Mode::Posting | Mode::Standalone) {
            let listeners = std::mem::take(&mut *self.posting_listeners.lock());
            for (i, listener) in listeners {
                let server = PostingServer::new(
                    self.posting_configs[i].clone(),
                    self.key,
                    self.snapshot_dir.as_deref(),
                )?;
                let store = Some(self.store.clone());
                let initial = self.initial_query.clone();
                let stop = self.stop.subscribe();
                let cancel = self.cancel.clone();
                self.track(tokio::spawn(async move {
                    if let Err(e) = server.serve(listener, store, initial, stop, cancel).await {
                        error!("posting server failed: {}", e);
                    }
                }));
            }
        }

        if matches!(self.mode, Mode::Queue | Mode::Standalone) {
            let ctx = worker::WorkerContext {
                store: self.store.clone(),
                queue: self.queue(),
                shards: self.shard_set(),
                key: self.key,
                match_threshold: self.match_threshold,
                poll_interval: self.poll_interval,
                cancel: self.cancel.clone(),
            };
            self.track(tokio::spawn(worker::run(ctx, self.stop.subscribe())));
            self.track(tokio::spawn(worker::janitor(
                self.queue(),
                self.lease_timeout,
                self.stop.subscribe(),
            )));
        }

        if matches!(self.mode, Mode::Api | Mode::Standalone) {
            let listener = self.api_listener.lock().take().ok_or_else(|| {
                MatchError::Internal("api listener already taken".to_string())
            })?;
            let state = ApiState {
                registry: self.clone(),
                queue: self.queue(),
                shards: self.shard_set(),
            };
            let stop = self.stop.subscribe();
            info!("api listening on {}", self.api_address);
            self.track(tokio::spawn(async move {
                if let Err(e) = api::serve(listener, state, stop).await {
                    error!("api server failed: {}", e);
                }
            }));
        }

        Ok(())
    }

    /// Top-down shutdown: cancel long operations, signal every loop, then
    /// wait for all tracked tasks.
    pub async fn shutdown(&self) {
        let _ = self.cancel_tx.send(true);
        let _ = self.stop.send(());
        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }
        info!("registry closed");
    }
}

fn open_store(db_url: &str) -> Result<Arc<dyn Store>> {
    match db_url {
        "" | "mem://" => Ok(Arc::new(MemoryStore::new())),
        other => Err(MatchError::Configuration(format!(
            "unsupported db_url {:?} (only mem:// is built in)",
            other
        ))),
    }
}
