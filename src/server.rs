//! Root server state: config, collections, hooks, the AOL, the outbox, and
//! pub/sub, bundled behind one `Arc` so every component shares it (spec §9
//! Design Notes).
//!
//! Grounded on the teacher's `SharedResources`/`StreamManager` pattern in
//! `stream_manager.rs`: one struct of `Arc`-wrapped shared state, passed by
//! clone into every task, rather than a sprawl of free-floating globals.

use crate::aol_manager::{AolManager, FsyncPolicy};
use crate::collection::Collection;
use crate::config::Config;
use crate::hook_registry::HookRegistry;
use crate::live_fixes::PubSub;
use crate::outbox::Outbox;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Every named collection, keyed by collection name (spec §3 "Collection").
#[derive(Default)]
pub struct CollectionRegistry(pub BTreeMap<String, Collection>);

impl CollectionRegistry {
    pub fn get_or_create(&mut self, key: &str) -> &mut Collection {
        self.0.entry(key.to_string()).or_default()
    }

    pub fn get(&self, key: &str) -> Option<&Collection> {
        self.0.get(key)
    }

    /// Drop a collection outright once it's empty, matching spec §3
    /// lifecycle note "an empty collection has no separate existence".
    pub fn drop_if_empty(&mut self, key: &str) {
        if self.0.get(key).is_some_and(Collection::is_empty) {
            self.0.remove(key);
        }
    }
}

/// Process-wide counters surfaced by `STATS`/`SERVER`, instrumented the
/// same way the teacher counts `socket.connections.*` in `socket_server.rs`.
#[derive(Default)]
pub struct Counters {
    pub connections_accepted: AtomicU64,
    pub commands_processed: AtomicU64,
    pub reads_rejected_oom: AtomicU64,
}

/// The single owned root of server state (spec §9 "single owned `Server`
/// root"). Mutating commands take `store.write()`; reads take
/// `store.read()` — the dispatcher is the only caller that locks this.
pub struct Server {
    pub config: RwLock<Config>,
    pub store: RwLock<CollectionRegistry>,
    pub hooks: RwLock<HookRegistry>,
    pub aol: AolManager,
    pub outbox: Arc<Outbox>,
    pub pubsub: PubSub,
    pub counters: Counters,
    pub shutdown: CancellationToken,
    pub read_only: std::sync::atomic::AtomicBool,
    pub authenticated_password: Option<String>,
    /// Cancellation handle per live outbox worker, so `SETHOOK`/`DELHOOK`
    /// can spawn/stop a worker without waiting for a server restart.
    pub outbox_workers: RwLock<HashMap<String, CancellationToken>>,
}

impl Server {
    pub async fn open(config: Config) -> Result<Arc<Self>> {
        let (aol, frames) = AolManager::open(config.aof_path(), FsyncPolicy::EverySecond)
            .await
            .context("opening append-only log")?;

        let outbox = Arc::new(Outbox::open(config.outbox_path()).await.context("opening outbox")?);

        let server = Arc::new(Server {
            authenticated_password: config.requirepass.clone(),
            config: RwLock::new(config),
            store: RwLock::new(CollectionRegistry::default()),
            hooks: RwLock::new(HookRegistry::new()),
            aol,
            outbox,
            pubsub: PubSub::new(),
            counters: Counters::default(),
            shutdown: CancellationToken::new(),
            read_only: std::sync::atomic::AtomicBool::new(false),
            outbox_workers: RwLock::new(HashMap::new()),
        });

        info!(frames = frames.len(), "replaying append-only log");
        crate::dispatcher::replay(&server, frames).await?;

        Ok(server)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub async fn shutdown_gracefully(&self) {
        self.shutdown.cancel();
        if let Err(e) = self.aol.flush().await {
            tracing::error!(error = %e, "final AOL flush failed during shutdown");
        }
    }

    /// Start (or restart) a webhook hook's delivery worker. Replaces any
    /// worker already running for `name`.
    pub async fn spawn_hook_worker(self: &Arc<Self>, name: String, endpoints: Vec<String>) {
        self.cancel_hook_worker(&name).await;
        let cancel = CancellationToken::new();
        self.outbox_workers.write().await.insert(name.clone(), cancel.clone());
        let outbox = self.outbox.clone();
        let client = reqwest::Client::new();
        tokio::spawn(crate::outbox::run_hook_worker(outbox, name, endpoints, client, 0, cancel));
    }

    /// Stop `name`'s delivery worker, if one is running.
    pub async fn cancel_hook_worker(&self, name: &str) {
        if let Some(cancel) = self.outbox_workers.write().await.remove(name) {
            cancel.cancel();
        }
    }
}
