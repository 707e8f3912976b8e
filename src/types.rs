//! Core records flowing through the change pipeline.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifier of one independently synchronized vault.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VaultId(Arc<str>);

impl VaultId {
   pub fn new(id: impl AsRef<str>) -> Self {
      Self(Arc::from(id.as_ref()))
   }

   pub fn as_str(&self) -> &str {
      &self.0
   }
}

impl fmt::Display for VaultId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

impl From<&str> for VaultId {
   fn from(s: &str) -> Self {
      Self::new(s)
   }
}

/// Stable node identity, derived from the vault and vault-relative path.
///
/// Ids in pushed deltas and ids produced by on-demand listings agree because
/// both derive them here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
   pub fn for_path(vault: &VaultId, path: &str) -> Self {
      let mut hasher = Sha256::new();
      hasher.update(vault.as_str().as_bytes());
      hasher.update([0u8]);
      hasher.update(path.as_bytes());
      let digest = hasher.finalize();
      Self(hex::encode(&digest[..16]))
   }

   pub fn from_raw(raw: impl Into<String>) -> Self {
      Self(raw.into())
   }

   pub fn as_str(&self) -> &str {
      &self.0
   }
}

impl fmt::Display for NodeId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

/// Identifier of one connected viewer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
   pub fn new() -> Self {
      Self(uuid::Uuid::new_v4())
   }
}

impl Default for SessionId {
   fn default() -> Self {
      Self::new()
   }
}

impl fmt::Display for SessionId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}", self.0)
   }
}

/// Kind of storage-level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
   Created,
   Modified,
   Deleted,
}

impl ChangeKind {
   pub const fn as_str(self) -> &'static str {
      match self {
         Self::Created => "created",
         Self::Modified => "modified",
         Self::Deleted => "deleted",
      }
   }
}

/// Metadata record attached to a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteMetadata {
   pub is_directory: bool,
   pub size:         u64,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub modified:     Option<DateTime<Utc>>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub title:        Option<String>,
   #[serde(default, skip_serializing_if = "Vec::is_empty")]
   pub tags:         Vec<String>,
   #[serde(default, skip_serializing_if = "Vec::is_empty")]
   pub links:        Vec<String>,
}

impl NoteMetadata {
   pub fn directory() -> Self {
      Self { is_directory: true, ..Self::default() }
   }
}

/// Change notification as emitted by a change source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChangeEvent {
   pub vault:       VaultId,
   pub path:        String,
   pub kind:        ChangeKind,
   pub observed_at: DateTime<Utc>,
}

impl RawChangeEvent {
   pub fn new(vault: VaultId, path: impl Into<String>, kind: ChangeKind) -> Self {
      Self { vault, path: normalize_path(&path.into()), kind, observed_at: Utc::now() }
   }
}

/// Raw change plus identity, metadata and its per-vault ordering sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedChangeEvent {
   pub raw:       RawChangeEvent,
   pub node_id:   NodeId,
   pub metadata:  Option<NoteMetadata>,
   pub sequence:  u64,
   /// Every other event with a lower sequence was emitted before this one,
   /// so nothing received after it can carry a sequence below this mark.
   pub low_water: u64,
}

impl NormalizedChangeEvent {
   pub fn path(&self) -> &str {
      &self.raw.path
   }

   pub const fn kind(&self) -> ChangeKind {
      self.raw.kind
   }

   pub fn to_delta(&self) -> NodeDelta {
      NodeDelta {
         node_id:  self.node_id.clone(),
         path:     self.raw.path.clone(),
         kind:     self.raw.kind,
         metadata: match self.raw.kind {
            ChangeKind::Deleted => None,
            _ => self.metadata.clone(),
         },
      }
   }
}

/// Net change for one node inside a bulk update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDelta {
   pub node_id:  NodeId,
   pub path:     String,
   pub kind:     ChangeKind,
   pub metadata: Option<NoteMetadata>,
}

impl NodeDelta {
   pub fn is_directory(&self) -> bool {
      self.metadata.as_ref().is_some_and(|m| m.is_directory)
   }
}

/// Per-kind counts of a bulk update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
   pub created:  usize,
   pub modified: usize,
   pub deleted:  usize,
}

impl ChangeSummary {
   pub fn of(nodes: &[NodeDelta]) -> Self {
      let mut summary = Self::default();
      for node in nodes {
         match node.kind {
            ChangeKind::Created => summary.created += 1,
            ChangeKind::Modified => summary.modified += 1,
            ChangeKind::Deleted => summary.deleted += 1,
         }
      }
      summary
   }

   pub const fn total(&self) -> usize {
      self.created + self.modified + self.deleted
   }
}

/// One batched push update for a vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkUpdateMessage {
   pub vault:          VaultId,
   pub summary:        ChangeSummary,
   pub nodes:          Vec<NodeDelta>,
   pub batch_sequence: u64,
}

impl BulkUpdateMessage {
   /// Builds a message whose summary always matches `nodes`.
   pub fn new(vault: VaultId, nodes: Vec<NodeDelta>, batch_sequence: u64) -> Self {
      Self { summary: ChangeSummary::of(&nodes), vault, nodes, batch_sequence }
   }
}

/// Normalizes a vault-relative path: `/` separators, no leading, trailing or
/// doubled slashes. The root is the empty string.
pub fn normalize_path(path: &str) -> String {
   path
      .split(['/', '\\'])
      .filter(|seg| !seg.is_empty() && *seg != ".")
      .collect::<Vec<_>>()
      .join("/")
}

/// Parent directory of `path`; top-level paths have the root (`""`) as parent.
pub fn parent_path(path: &str) -> Option<&str> {
   if path.is_empty() {
      return None;
   }
   Some(path.rfind('/').map_or("", |idx| &path[..idx]))
}

/// Last path segment.
pub fn file_name(path: &str) -> &str {
   path.rsplit('/').next().unwrap_or(path)
}

/// Ancestor directories of `path`, nearest first, ending with the root.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
   std::iter::successors(parent_path(path), |p| parent_path(*p))
}

/// Whether `path` lies strictly below directory `dir`.
pub fn is_descendant(path: &str, dir: &str) -> bool {
   if dir.is_empty() {
      return !path.is_empty();
   }
   path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}
