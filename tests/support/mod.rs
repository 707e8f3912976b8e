#![allow(dead_code)]

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::watch;
use vaultsync::{
   storage::{ListingEntry, StoredEntry, VaultStorage},
   types::{
      ChangeKind, NodeId, NormalizedChangeEvent, NoteMetadata, RawChangeEvent, VaultId, file_name,
      parent_path,
   },
   viewer::TreeNode,
};

pub fn vault() -> VaultId {
   VaultId::new("default")
}

pub fn meta(title: &str) -> NoteMetadata {
   NoteMetadata { title: Some(title.to_string()), size: title.len() as u64, ..NoteMetadata::default() }
}

pub fn normalized(
   vault: &VaultId,
   sequence: u64,
   path: &str,
   kind: ChangeKind,
   metadata: Option<NoteMetadata>,
) -> NormalizedChangeEvent {
   NormalizedChangeEvent {
      raw: RawChangeEvent::new(vault.clone(), path, kind),
      node_id: NodeId::for_path(vault, path),
      metadata: if kind == ChangeKind::Deleted { None } else { metadata },
      sequence,
      low_water: 0,
   }
}

pub fn tree_node(vault: &VaultId, path: &str, is_directory: bool) -> TreeNode {
   TreeNode {
      id: NodeId::for_path(vault, path),
      path: path.to_string(),
      name: file_name(path).to_string(),
      is_directory,
      parent_id: parent_path(path)
         .filter(|p| !p.is_empty())
         .map(|p| NodeId::for_path(vault, p)),
      children_loaded: false,
      metadata: Some(if is_directory { NoteMetadata::directory() } else { meta(path) }),
   }
}

/// In-memory vault storage. Reads block while the gate is closed.
pub struct MemoryStorage {
   entries: Mutex<BTreeMap<String, StoredEntry>>,
   gate:    watch::Sender<bool>,
}

impl MemoryStorage {
   pub fn new() -> Arc<Self> {
      Arc::new(Self { entries: Mutex::new(BTreeMap::new()), gate: watch::Sender::new(true) })
   }

   pub fn write(&self, path: &str, content: impl Into<Vec<u8>>) {
      self
         .entries
         .lock()
         .insert(path.to_string(), StoredEntry::File { content: content.into(), modified: None });
   }

   pub fn mkdir(&self, path: &str) {
      self.entries.lock().insert(path.to_string(), StoredEntry::Directory);
   }

   pub fn remove(&self, path: &str) {
      self.entries.lock().remove(path);
   }

   pub fn close_gate(&self) {
      self.gate.send_replace(false);
   }

   pub fn open_gate(&self) {
      self.gate.send_replace(true);
   }
}

#[async_trait::async_trait]
impl VaultStorage for MemoryStorage {
   async fn read(&self, path: &str) -> vaultsync::Result<StoredEntry> {
      let mut gate = self.gate.subscribe();
      let _ = gate.wait_for(|open| *open).await;
      Ok(self
         .entries
         .lock()
         .get(path)
         .cloned()
         .unwrap_or(StoredEntry::Missing))
   }

   async fn list_dir(&self, dir: &str) -> vaultsync::Result<Vec<ListingEntry>> {
      Ok(self
         .entries
         .lock()
         .iter()
         .filter(|(p, _)| parent_path(p) == Some(dir))
         .map(|(p, e)| ListingEntry {
            path:         p.clone(),
            is_directory: matches!(e, StoredEntry::Directory),
            size:         match e {
               StoredEntry::File { content, .. } => content.len() as u64,
               _ => 0,
            },
            modified:     None,
         })
         .collect())
   }
}

pub fn set_temp_home(dir: &tempfile::TempDir) {
   // Must run before any config path is resolved.
   unsafe {
      std::env::set_var("HOME", dir.path());
   }
}
