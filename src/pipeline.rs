//! Per-vault pipeline wiring and the multi-vault service.
//!
//! ```text
//! submit -> IngestPool -+-> IndexUpdater -> SearchIndex
//!                       +-> Coalescer -> dispatch -> BroadcastHub -> sessions
//! ```
//!
//! Each vault runs its own stages; vaults share only the hub, the metadata
//! cache and the search index.

use std::{collections::HashMap, sync::Arc};

use parking_lot::{Mutex, RwLock};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
   Result,
   cache::MetadataCache,
   coalesce::Coalescer,
   config::Config,
   error::Error,
   extract::MetadataExtractor,
   hub::{BroadcastHub, Subscription},
   index::{IndexUpdater, SearchIndex},
   ingest::{Backpressure, IngestPool, IngestQueue, IngestStats},
   storage::{VaultReader, VaultStorage},
   types::{BulkUpdateMessage, RawChangeEvent, VaultId},
};

struct PipelineTasks {
   ingest:    IngestPool,
   updater:   JoinHandle<()>,
   coalescer: JoinHandle<()>,
   dispatch:  JoinHandle<()>,
}

/// Shared dependencies handed to every vault pipeline.
#[derive(Clone)]
pub struct PipelineDeps {
   pub hub:       BroadcastHub,
   pub cache:     MetadataCache,
   pub index:     Arc<dyn SearchIndex>,
   pub extractor: Arc<dyn MetadataExtractor>,
}

/// All stages of one vault, children of one cancellation token.
pub struct VaultPipeline {
   vault:         VaultId,
   storage:       Arc<dyn VaultStorage>,
   queue:         Arc<IngestQueue>,
   cache:         MetadataCache,
   extractor:     Arc<dyn MetadataExtractor>,
   cancel:        CancellationToken,
   ingest_cancel: CancellationToken,
   tasks:         Mutex<Option<PipelineTasks>>,
}

async fn dispatch(hub: BroadcastHub, mut messages: mpsc::UnboundedReceiver<BulkUpdateMessage>) {
   while let Some(msg) = messages.recv().await {
      let batch = msg.batch_sequence;
      let vault = msg.vault.clone();
      let report = hub.broadcast(msg).await;
      if report.evicted > 0 {
         tracing::info!("vault {} batch {}: evicted {} sessions", vault, batch, report.evicted);
      }
   }
}

impl VaultPipeline {
   pub fn spawn(
      vault: VaultId,
      cfg: &Config,
      storage: Arc<dyn VaultStorage>,
      deps: PipelineDeps,
      parent: &CancellationToken,
   ) -> Self {
      let cancel = parent.child_token();
      let ingest_cancel = cancel.child_token();

      let (index_tx, index_rx) = mpsc::unbounded_channel();
      let (coalesce_tx, coalesce_rx) = mpsc::unbounded_channel();
      let (bulk_tx, bulk_rx) = mpsc::unbounded_channel();

      let hook_hub = deps.hub.clone();
      let ingest = IngestPool::spawn(
         vault.clone(),
         cfg,
         Arc::clone(&storage),
         Arc::clone(&deps.extractor),
         vec![index_tx, coalesce_tx],
         Arc::new(move |v: &VaultId, edge: Backpressure| match edge {
            Backpressure::Overflowed => hook_hub.flag_resync(v),
            Backpressure::Recovered => hook_hub.clear_resync(v),
         }),
         &ingest_cancel,
      );
      let queue = ingest.queue();

      let updater = tokio::spawn(IndexUpdater::new(deps.index, cfg).run(index_rx, cancel.clone()));
      let coalescer =
         tokio::spawn(Coalescer::new(vault.clone(), cfg).run(coalesce_rx, bulk_tx, cancel.clone()));
      let dispatch = tokio::spawn(dispatch(deps.hub, bulk_rx));

      tracing::info!("vault {} pipeline started ({} ingest workers)", vault, cfg.ingest_workers);
      Self {
         vault,
         storage,
         queue,
         cache: deps.cache,
         extractor: deps.extractor,
         cancel,
         ingest_cancel,
         tasks: Mutex::new(Some(PipelineTasks { ingest, updater, coalescer, dispatch })),
      }
   }

   pub const fn vault(&self) -> &VaultId {
      &self.vault
   }

   /// Accepts one raw change. The cache entries it may have made stale are
   /// dropped before the event is sequenced. Returns the assigned sequence,
   /// or `None` if the event was dropped on a full queue.
   pub async fn submit(&self, raw: RawChangeEvent) -> Result<Option<u64>> {
      if raw.vault != self.vault {
         return Err(Error::UnknownVault(raw.vault.to_string()));
      }
      if self.ingest_cancel.is_cancelled() {
         return Err(Error::VaultClosed(self.vault.to_string()));
      }
      self.cache.invalidate_path(&self.vault, &raw.path).await;
      self.queue.enqueue(raw)
   }

   pub fn stats(&self) -> IngestStats {
      self.queue.stats()
   }

   /// On-demand fetch path over this vault's storage and the shared cache.
   pub fn reader(&self) -> VaultReader {
      VaultReader::new(
         self.vault.clone(),
         Arc::clone(&self.storage),
         Arc::clone(&self.extractor),
         self.cache.clone(),
      )
   }

   /// Stops the workers, lets the index updater and coalescer drain what
   /// they already hold (final best-effort flush) and waits for dispatch of
   /// the last batches.
   pub async fn shutdown(&self) {
      let Some(tasks) = self.tasks.lock().take() else {
         return;
      };
      self.ingest_cancel.cancel();
      tasks.ingest.join().await;

      for (stage, handle) in [("index updater", tasks.updater), ("coalescer", tasks.coalescer)] {
         if let Err(e) = handle.await {
            tracing::warn!("vault {} {} failed: {}", self.vault, stage, e);
         }
      }
      if let Err(e) = tasks.dispatch.await {
         tracing::warn!("vault {} dispatch failed: {}", self.vault, e);
      }
      self.cancel.cancel();
      tracing::info!("vault {} pipeline stopped", self.vault);
   }
}

/// Registry of running vault pipelines sharing one hub, cache and index.
pub struct SyncService {
   cfg:       Config,
   deps:      PipelineDeps,
   vaults:    RwLock<HashMap<VaultId, Arc<VaultPipeline>>>,
   cancel:    CancellationToken,
   keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl SyncService {
   /// Must be called inside a tokio runtime; starts the hub keep-alive.
   pub fn new(
      cfg: Config,
      index: Arc<dyn SearchIndex>,
      extractor: Arc<dyn MetadataExtractor>,
   ) -> Self {
      let hub = BroadcastHub::new(&cfg);
      let keepalive = hub.spawn_keepalive();
      let deps = PipelineDeps { cache: MetadataCache::new(&cfg), hub, index, extractor };
      Self {
         cfg,
         deps,
         vaults: RwLock::new(HashMap::new()),
         cancel: CancellationToken::new(),
         keepalive: Mutex::new(Some(keepalive)),
      }
   }

   pub const fn config(&self) -> &Config {
      &self.cfg
   }

   pub const fn hub(&self) -> &BroadcastHub {
      &self.deps.hub
   }

   pub const fn cache(&self) -> &MetadataCache {
      &self.deps.cache
   }

   fn pipeline(&self, vault: &VaultId) -> Result<Arc<VaultPipeline>> {
      self
         .vaults
         .read()
         .get(vault)
         .cloned()
         .ok_or_else(|| Error::UnknownVault(vault.to_string()))
   }

   /// Starts a pipeline for `vault`. Opening an already open vault is a
   /// no-op.
   pub fn open_vault(&self, vault: &VaultId, storage: Arc<dyn VaultStorage>) {
      let mut vaults = self.vaults.write();
      if vaults.contains_key(vault) {
         tracing::debug!("vault {} already open", vault);
         return;
      }
      let pipeline =
         VaultPipeline::spawn(vault.clone(), &self.cfg, storage, self.deps.clone(), &self.cancel);
      vaults.insert(vault.clone(), Arc::new(pipeline));
   }

   pub fn is_open(&self, vault: &VaultId) -> bool {
      self.vaults.read().contains_key(vault)
   }

   pub async fn submit(&self, raw: RawChangeEvent) -> Result<Option<u64>> {
      self.pipeline(&raw.vault)?.submit(raw).await
   }

   pub fn subscribe(&self, vault: &VaultId) -> Result<Subscription> {
      self.pipeline(vault)?;
      Ok(self.deps.hub.subscribe(vault))
   }

   pub fn reader(&self, vault: &VaultId) -> Result<VaultReader> {
      Ok(self.pipeline(vault)?.reader())
   }

   pub fn stats(&self, vault: &VaultId) -> Result<IngestStats> {
      Ok(self.pipeline(vault)?.stats())
   }

   /// Stops one vault's pipeline and releases everything it held.
   pub async fn shutdown_vault(&self, vault: &VaultId) -> Result<()> {
      let pipeline = self
         .vaults
         .write()
         .remove(vault)
         .ok_or_else(|| Error::UnknownVault(vault.to_string()))?;
      pipeline.shutdown().await;
      self.deps.hub.close_vault(vault);
      self.deps.cache.invalidate_vault(vault);
      Ok(())
   }

   /// Stops every vault and the hub.
   pub async fn shutdown(&self) {
      let vaults: Vec<VaultId> = self.vaults.read().keys().cloned().collect();
      for vault in vaults {
         if let Err(e) = self.shutdown_vault(&vault).await {
            tracing::warn!("shutdown of vault {} failed: {}", vault, e);
         }
      }
      self.cancel.cancel();
      self.deps.hub.shutdown();
      let keepalive = self.keepalive.lock().take();
      if let Some(handle) = keepalive
         && let Err(e) = handle.await
      {
         tracing::warn!("keep-alive task failed: {}", e);
      }
   }
}
