//! Viewer-side reconciliation of pushed deltas into a partially loaded tree.
//!
//! Each vault has a node arena (`id -> TreeNode`) plus a path index and the
//! set of walked directories, i.e. directories whose full child list is
//! known. Walked flags are only ever established by a listing fetch; pushed
//! deltas never create them.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::types::{
   BulkUpdateMessage, ChangeKind, NodeDelta, NodeId, NoteMetadata, VaultId, file_name,
   is_descendant, parent_path,
};

/// A file or directory known to the viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
   pub id:              NodeId,
   pub path:            String,
   pub name:            String,
   pub is_directory:    bool,
   pub parent_id:       Option<NodeId>,
   pub children_loaded: bool,
   pub metadata:        Option<NoteMetadata>,
}

/// A fetched subtree, registered recursively by
/// [`ReconciliationStore::register_nodes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTree {
   pub node:     TreeNode,
   pub children: Vec<NodeTree>,
}

impl NodeTree {
   pub const fn leaf(node: TreeNode) -> Self {
      Self { node, children: Vec::new() }
   }
}

/// What applying one bulk update did to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
   pub inserted: usize,
   pub updated:  usize,
   /// Nodes removed, cascaded descendants included.
   pub removed:  usize,
   /// Deltas with nothing to act on: unwalked parent or unknown node.
   pub skipped:  usize,
}

#[derive(Debug, Default)]
struct VaultTree {
   nodes:   HashMap<NodeId, TreeNode>,
   by_path: HashMap<String, NodeId>,
   walked:  HashSet<String>,
}

impl VaultTree {
   fn is_parent_walked(&self, path: &str) -> bool {
      match parent_path(path) {
         None | Some("") => true,
         Some(parent) => self.walked.contains(parent),
      }
   }

   fn parent_id(&self, path: &str) -> Option<NodeId> {
      parent_path(path)
         .filter(|p| !p.is_empty())
         .and_then(|p| self.by_path.get(p).cloned())
   }

   fn insert(&mut self, node: TreeNode) {
      if let Some(old) = self.by_path.insert(node.path.clone(), node.id.clone())
         && old != node.id
      {
         self.nodes.remove(&old);
      }
      if let Some(previous) = self.nodes.get(&node.id)
         && previous.path != node.path
      {
         let stale = previous.path.clone();
         self.by_path.remove(&stale);
      }
      self.nodes.insert(node.id.clone(), node);
   }

   /// Removes the node at `path` and everything registered below it, and
   /// clears the walked flags of the whole subtree.
   fn remove_subtree(&mut self, path: &str) -> usize {
      let doomed: Vec<String> = self
         .by_path
         .keys()
         .filter(|p| p.as_str() == path || is_descendant(p, path))
         .cloned()
         .collect();
      for p in &doomed {
         if let Some(id) = self.by_path.remove(p) {
            self.nodes.remove(&id);
         }
      }
      self
         .walked
         .retain(|w| w.as_str() != path && !is_descendant(w, path));
      doomed.len()
   }

   fn node_from_delta(&self, delta: &NodeDelta) -> TreeNode {
      TreeNode {
         id:              delta.node_id.clone(),
         path:            delta.path.clone(),
         name:            file_name(&delta.path).to_string(),
         is_directory:    delta.is_directory(),
         parent_id:       self.parent_id(&delta.path),
         children_loaded: false,
         metadata:        delta.metadata.clone(),
      }
   }

   fn apply(&mut self, delta: &NodeDelta, outcome: &mut ApplyOutcome) {
      match delta.kind {
         ChangeKind::Created | ChangeKind::Modified => {
            if let Some(node) = self.nodes.get_mut(&delta.node_id) {
               node.metadata.clone_from(&delta.metadata);
               if delta.metadata.is_some() {
                  node.is_directory = delta.is_directory();
               }
               outcome.updated += 1;
            } else if self.is_parent_walked(&delta.path) {
               let node = self.node_from_delta(delta);
               self.insert(node);
               outcome.inserted += 1;
            } else {
               tracing::debug!("skipping {} under unwalked parent", delta.path);
               outcome.skipped += 1;
            }
         },
         ChangeKind::Deleted => {
            let path = self
               .nodes
               .get(&delta.node_id)
               .map_or_else(|| delta.path.clone(), |n| n.path.clone());
            let removed = self.remove_subtree(&path);
            if removed == 0 {
               outcome.skipped += 1;
            }
            outcome.removed += removed;
         },
      }
   }
}

/// Per-viewer tree state for every vault the viewer has open.
#[derive(Debug, Default)]
pub struct ReconciliationStore {
   vaults: HashMap<VaultId, VaultTree>,
}

impl ReconciliationStore {
   pub fn new() -> Self {
      Self::default()
   }

   fn tree(&mut self, vault: &VaultId) -> &mut VaultTree {
      self.vaults.entry(vault.clone()).or_default()
   }

   /// Marks `path` as having its full child list registered. Callers must
   /// have registered every current child first; [`Self::apply_listing`]
   /// does both in one step.
   pub fn mark_path_walked(&mut self, vault: &VaultId, path: &str) {
      let tree = self.tree(vault);
      tree.walked.insert(path.to_string());
      if let Some(node) = tree
         .by_path
         .get(path)
         .cloned()
         .and_then(|id| tree.nodes.get_mut(&id))
      {
         node.children_loaded = true;
      }
   }

   pub fn mark_root_walked(&mut self, vault: &VaultId) {
      self.mark_path_walked(vault, "");
   }

   pub fn is_path_walked(&self, vault: &VaultId, path: &str) -> bool {
      self
         .vaults
         .get(vault)
         .is_some_and(|t| t.walked.contains(path))
   }

   /// Whether the parent of `path` is walked. The root counts as walked for
   /// top-level paths even before [`Self::mark_root_walked`].
   pub fn is_parent_walked(&self, vault: &VaultId, path: &str) -> bool {
      match self.vaults.get(vault) {
         Some(tree) => tree.is_parent_walked(path),
         None => matches!(parent_path(path), None | Some("")),
      }
   }

   pub fn register_node(&mut self, vault: &VaultId, node: TreeNode) {
      self.tree(vault).insert(node);
   }

   /// Registers fetched subtrees, parents before children.
   pub fn register_nodes(&mut self, vault: &VaultId, trees: Vec<NodeTree>) {
      let tree = self.tree(vault);
      let mut stack = trees;
      while let Some(NodeTree { node, children }) = stack.pop() {
         tree.insert(node);
         stack.extend(children);
      }
   }

   /// Registers the complete child list of `dir` and marks it walked.
   /// Previously registered children missing from the listing are removed.
   pub fn apply_listing(&mut self, vault: &VaultId, dir: &str, children: Vec<TreeNode>) {
      let tree = self.tree(vault);
      let listed: HashSet<&str> = children.iter().map(|c| c.path.as_str()).collect();
      let gone: Vec<String> = tree
         .by_path
         .keys()
         .filter(|p| parent_path(p) == Some(dir) && !listed.contains(p.as_str()))
         .cloned()
         .collect();
      for path in gone {
         tree.remove_subtree(&path);
      }
      for child in children {
         tree.insert(child);
      }
      self.mark_path_walked(vault, dir);
   }

   pub fn get_node_by_id(&self, vault: &VaultId, id: &NodeId) -> Option<&TreeNode> {
      self.vaults.get(vault)?.nodes.get(id)
   }

   pub fn get_node_by_path(&self, vault: &VaultId, path: &str) -> Option<&TreeNode> {
      let tree = self.vaults.get(vault)?;
      tree.nodes.get(tree.by_path.get(path)?)
   }

   /// Walked paths of `vault`, sorted.
   pub fn get_walked_paths(&self, vault: &VaultId) -> Vec<String> {
      let mut paths: Vec<String> = self
         .vaults
         .get(vault)
         .map(|t| t.walked.iter().cloned().collect())
         .unwrap_or_default();
      paths.sort();
      paths
   }

   /// Registered children of `dir`, sorted by path.
   pub fn children(&self, vault: &VaultId, dir: &str) -> Vec<&TreeNode> {
      let Some(tree) = self.vaults.get(vault) else {
         return Vec::new();
      };
      let mut out: Vec<&TreeNode> = tree
         .nodes
         .values()
         .filter(|n| parent_path(&n.path) == Some(dir))
         .collect();
      out.sort_by(|a, b| a.path.cmp(&b.path));
      out
   }

   pub fn node_count(&self, vault: &VaultId) -> usize {
      self.vaults.get(vault).map_or(0, |t| t.nodes.len())
   }

   pub fn clear_vault(&mut self, vault: &VaultId) {
      self.vaults.remove(vault);
   }

   pub fn reset(&mut self) {
      self.vaults.clear();
   }

   /// Applies every delta of `msg` in order.
   pub fn apply_bulk_update(&mut self, msg: &BulkUpdateMessage) -> ApplyOutcome {
      let mut outcome = ApplyOutcome::default();
      let tree = self.tree(&msg.vault);
      for delta in &msg.nodes {
         tree.apply(delta, &mut outcome);
      }
      outcome
   }
}
