//! Vault storage access used by ingest workers and on-demand listings.

use std::{
   io,
   path::{Path, PathBuf},
   sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
   Result,
   cache::MetadataCache,
   error::Error,
   extract::MetadataExtractor,
   types::{NodeId, NoteMetadata, VaultId, file_name, normalize_path, parent_path},
   viewer::TreeNode,
};

/// What storage currently holds at a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredEntry {
   File { content: Vec<u8>, modified: Option<DateTime<Utc>> },
   Directory,
   Missing,
}

/// One child in a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
   pub path:         String,
   pub is_directory: bool,
   pub size:         u64,
   pub modified:     Option<DateTime<Utc>>,
}

/// Read access to one vault's documents.
#[async_trait::async_trait]
pub trait VaultStorage: Send + Sync {
   async fn read(&self, path: &str) -> Result<StoredEntry>;

   /// Lists the direct children of `dir` (`""` for the root), sorted by path.
   async fn list_dir(&self, dir: &str) -> Result<Vec<ListingEntry>>;
}

/// Storage backed by a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalVaultStorage {
   root: PathBuf,
}

impl LocalVaultStorage {
   pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
      let root = root.into();
      if !root.is_dir() {
         return Err(Error::InvalidRoot(root));
      }
      Ok(Self { root: root.canonicalize().unwrap_or(root) })
   }

   pub fn root(&self) -> &Path {
      &self.root
   }

   /// Filesystem path for a vault-relative path, or `None` if it climbs out
   /// of the root.
   fn resolve(&self, path: &str) -> Option<PathBuf> {
      let rel = normalize_path(path);
      if rel.is_empty() {
         return Some(self.root.clone());
      }
      if rel.split('/').any(|seg| seg == "..") {
         tracing::warn!("rejecting path outside vault root: {}", path);
         return None;
      }
      Some(rel.split('/').fold(self.root.clone(), |acc, seg| acc.join(seg)))
   }
}

fn to_utc(time: io::Result<std::time::SystemTime>) -> Option<DateTime<Utc>> {
   time.ok().map(DateTime::<Utc>::from)
}

#[async_trait::async_trait]
impl VaultStorage for LocalVaultStorage {
   async fn read(&self, path: &str) -> Result<StoredEntry> {
      let Some(full) = self.resolve(path) else {
         return Ok(StoredEntry::Missing);
      };
      let metadata = match tokio::fs::metadata(&full).await {
         Ok(m) => m,
         Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StoredEntry::Missing),
         Err(e) => return Err(e.into()),
      };
      if metadata.is_dir() {
         return Ok(StoredEntry::Directory);
      }
      match tokio::fs::read(&full).await {
         Ok(content) => Ok(StoredEntry::File { content, modified: to_utc(metadata.modified()) }),
         Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(StoredEntry::Missing),
         Err(e) => Err(e.into()),
      }
   }

   async fn list_dir(&self, dir: &str) -> Result<Vec<ListingEntry>> {
      let dir = normalize_path(dir);
      let full = self.resolve(&dir).ok_or_else(|| Error::OutsideVault(dir.clone()))?;
      let mut reader = tokio::fs::read_dir(full).await?;
      let mut entries = Vec::new();

      while let Some(entry) = reader.next_entry().await? {
         let name = entry.file_name();
         let Some(name) = name.to_str() else {
            tracing::warn!("skipping non-utf8 entry in {}", entry.path().display());
            continue;
         };
         if name.starts_with('.') {
            continue;
         }
         let metadata = match entry.metadata().await {
            Ok(m) => m,
            Err(e) => {
               tracing::warn!("failed to stat {}: {}", entry.path().display(), e);
               continue;
            },
         };
         let path = if dir.is_empty() { name.to_string() } else { format!("{dir}/{name}") };
         entries.push(ListingEntry {
            path,
            is_directory: metadata.is_dir(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified: to_utc(metadata.modified()),
         });
      }

      entries.sort_by(|a, b| a.path.cmp(&b.path));
      Ok(entries)
   }
}

/// On-demand fetch path for viewers: directory listings and per-file
/// metadata, served through the metadata cache.
pub struct VaultReader {
   vault:     VaultId,
   storage:   Arc<dyn VaultStorage>,
   extractor: Arc<dyn MetadataExtractor>,
   cache:     MetadataCache,
}

impl VaultReader {
   pub fn new(
      vault: VaultId,
      storage: Arc<dyn VaultStorage>,
      extractor: Arc<dyn MetadataExtractor>,
      cache: MetadataCache,
   ) -> Self {
      Self { vault, storage, extractor, cache }
   }

   pub const fn vault(&self) -> &VaultId {
      &self.vault
   }

   /// Children of `dir` as tree nodes, ready for the reconciliation store.
   pub async fn list_directory(&self, dir: &str) -> Result<Vec<TreeNode>> {
      let dir = normalize_path(dir);
      let storage = Arc::clone(&self.storage);
      let load_dir = dir.clone();
      let listing = self
         .cache
         .listing_or_load(&self.vault, &dir, async move { storage.list_dir(&load_dir).await })
         .await?;

      let mut nodes = Vec::with_capacity(listing.len());
      for entry in listing.iter() {
         let metadata = if entry.is_directory {
            NoteMetadata::directory()
         } else {
            self
               .node_metadata(&entry.path)
               .await?
               .unwrap_or_else(|| NoteMetadata {
                  size: entry.size,
                  modified: entry.modified,
                  ..NoteMetadata::default()
               })
         };
         nodes.push(self.tree_node(&entry.path, entry.is_directory, metadata));
      }
      Ok(nodes)
   }

   /// Metadata of a single file, `None` if it is missing or unreadable.
   pub async fn node_metadata(&self, path: &str) -> Result<Option<NoteMetadata>> {
      let path = normalize_path(path);
      let storage = Arc::clone(&self.storage);
      let extractor = Arc::clone(&self.extractor);
      let key_path = path.clone();
      self
         .cache
         .metadata_or_load(&self.vault, &key_path, async move {
            Ok(match storage.read(&path).await? {
               StoredEntry::File { content, modified } => {
                  match extractor.extract(&path, &content, modified) {
                     Ok(meta) => Some(meta),
                     Err(e) => {
                        tracing::debug!("metadata unavailable for {}: {}", path, e);
                        None
                     },
                  }
               },
               StoredEntry::Directory => Some(NoteMetadata::directory()),
               StoredEntry::Missing => None,
            })
         })
         .await
   }

   fn tree_node(&self, path: &str, is_directory: bool, metadata: NoteMetadata) -> TreeNode {
      let parent_id = parent_path(path)
         .filter(|p| !p.is_empty())
         .map(|p| NodeId::for_path(&self.vault, p));
      TreeNode {
         id: NodeId::for_path(&self.vault, path),
         path: path.to_string(),
         name: file_name(path).to_string(),
         is_directory,
         parent_id,
         children_loaded: false,
         metadata: Some(metadata),
      }
   }
}
