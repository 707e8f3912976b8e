//! TTL + LRU cache for metadata and directory-listing lookups.
//!
//! Entries are invalidated eagerly from the change stream: a change at `P`
//! drops the metadata for `P`, the listing of `P` (if it was a directory) and
//! the listing of every ancestor of `P`, whether or not any viewer is
//! connected.
//!
//! Each vault carries a generation that every invalidation bumps. A load that
//! started before the bump still answers its caller but is not kept.

use std::{collections::HashMap, future::Future, sync::Arc};

use moka::{future::Cache, policy::EvictionPolicy};
use parking_lot::Mutex;

use crate::{
   Result,
   config::Config,
   storage::ListingEntry,
   types::{NoteMetadata, VaultId, ancestors},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
   Metadata { vault: VaultId, path: String },
   Listing { vault: VaultId, dir: String },
}

impl CacheKey {
   const fn vault(&self) -> &VaultId {
      match self {
         Self::Metadata { vault, .. } | Self::Listing { vault, .. } => vault,
      }
   }
}

#[derive(Debug, Clone)]
enum CachedValue {
   Metadata(Option<NoteMetadata>),
   Listing(Arc<Vec<ListingEntry>>),
}

/// Shared handle; clones point at the same cache.
#[derive(Clone)]
pub struct MetadataCache {
   inner:       Cache<CacheKey, CachedValue>,
   generations: Arc<Mutex<HashMap<VaultId, u64>>>,
}

impl std::fmt::Debug for MetadataCache {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("MetadataCache")
         .field("entries", &self.inner.entry_count())
         .finish()
   }
}

impl MetadataCache {
   pub fn new(cfg: &Config) -> Self {
      let inner = Cache::builder()
         .max_capacity(cfg.cache_capacity)
         .time_to_live(cfg.cache_ttl())
         .eviction_policy(EvictionPolicy::lru())
         .support_invalidation_closures()
         .build();
      Self { inner, generations: Arc::default() }
   }

   fn generation(&self, vault: &VaultId) -> u64 {
      self.generations.lock().get(vault).copied().unwrap_or(0)
   }

   fn bump_generation(&self, vault: &VaultId) {
      *self.generations.lock().entry(vault.clone()).or_insert(0) += 1;
   }

   /// Loads through the cache, dropping the published value again if the
   /// vault was invalidated while `init` ran.
   async fn get_or_load<F>(&self, key: CacheKey, init: F) -> Result<CachedValue>
   where
      F: Future<Output = Result<CachedValue>>,
   {
      let generation = self.generation(key.vault());
      let value = self.inner.try_get_with(key.clone(), init).await?;
      if self.generation(key.vault()) != generation {
         tracing::debug!("not caching {:?}: invalidated during load", key);
         self.inner.invalidate(&key).await;
      }
      Ok(value)
   }

   /// Cached listing of `dir`, loading it with `load` on a miss.
   pub async fn listing_or_load<F>(
      &self,
      vault: &VaultId,
      dir: &str,
      load: F,
   ) -> Result<Arc<Vec<ListingEntry>>>
   where
      F: Future<Output = Result<Vec<ListingEntry>>>,
   {
      let key = CacheKey::Listing { vault: vault.clone(), dir: dir.to_string() };
      let value = self
         .get_or_load(key, async move { load.await.map(|l| CachedValue::Listing(Arc::new(l))) })
         .await?;
      match value {
         CachedValue::Listing(listing) => Ok(listing),
         CachedValue::Metadata(_) => unreachable!("listing key holds listing value"),
      }
   }

   /// Cached metadata of `path`, loading it with `load` on a miss.
   pub async fn metadata_or_load<F>(
      &self,
      vault: &VaultId,
      path: &str,
      load: F,
   ) -> Result<Option<NoteMetadata>>
   where
      F: Future<Output = Result<Option<NoteMetadata>>>,
   {
      let key = CacheKey::Metadata { vault: vault.clone(), path: path.to_string() };
      let value = self
         .get_or_load(key, async move { load.await.map(CachedValue::Metadata) })
         .await?;
      match value {
         CachedValue::Metadata(meta) => Ok(meta),
         CachedValue::Listing(_) => unreachable!("metadata key holds metadata value"),
      }
   }

   pub async fn cached_listing(&self, vault: &VaultId, dir: &str) -> Option<Arc<Vec<ListingEntry>>> {
      let key = CacheKey::Listing { vault: vault.clone(), dir: dir.to_string() };
      match self.inner.get(&key).await {
         Some(CachedValue::Listing(listing)) => Some(listing),
         _ => None,
      }
   }

   #[allow(clippy::option_option, reason = "outer is the cache hit, inner is file presence")]
   pub async fn cached_metadata(&self, vault: &VaultId, path: &str) -> Option<Option<NoteMetadata>> {
      let key = CacheKey::Metadata { vault: vault.clone(), path: path.to_string() };
      match self.inner.get(&key).await {
         Some(CachedValue::Metadata(meta)) => Some(meta),
         _ => None,
      }
   }

   /// Drops everything a change at `path` may have made stale.
   pub async fn invalidate_path(&self, vault: &VaultId, path: &str) {
      self.bump_generation(vault);
      self
         .inner
         .invalidate(&CacheKey::Metadata { vault: vault.clone(), path: path.to_string() })
         .await;
      self
         .inner
         .invalidate(&CacheKey::Listing { vault: vault.clone(), dir: path.to_string() })
         .await;
      for dir in ancestors(path) {
         self
            .inner
            .invalidate(&CacheKey::Listing { vault: vault.clone(), dir: dir.to_string() })
            .await;
      }
   }

   /// Drops every entry belonging to `vault`.
   pub fn invalidate_vault(&self, vault: &VaultId) {
      self.bump_generation(vault);
      let vault = vault.clone();
      if let Err(e) = self
         .inner
         .invalidate_entries_if(move |key, _| key.vault() == &vault)
      {
         tracing::warn!("vault cache invalidation failed: {e}");
      }
   }

   pub fn entry_count(&self) -> u64 {
      self.inner.entry_count()
   }

   /// Applies pending evictions and invalidations; mostly useful in tests.
   pub async fn run_pending_tasks(&self) {
      self.inner.run_pending_tasks().await;
   }
}
