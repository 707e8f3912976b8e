use std::{
   collections::HashMap,
   sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

use parking_lot::RwLock;

use super::{IndexOp, SearchIndex};
use crate::{
   error::IndexError,
   types::{NodeId, NoteMetadata},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedDoc {
   pub path:     String,
   pub metadata: NoteMetadata,
}

/// In-process index keyed by node id. Failures can be injected to exercise
/// the updater's retry path.
#[derive(Debug, Default)]
pub struct MemoryIndex {
   docs:      RwLock<HashMap<NodeId, IndexedDoc>>,
   batches:   RwLock<Vec<usize>>,
   fail_next: AtomicU32,
   rejected:  AtomicUsize,
}

impl MemoryIndex {
   pub fn new() -> Self {
      Self::default()
   }

   /// Makes the next `n` commits fail.
   pub fn fail_next(&self, n: u32) {
      self.fail_next.store(n, Ordering::SeqCst);
   }

   pub fn get(&self, id: &NodeId) -> Option<IndexedDoc> {
      self.docs.read().get(id).cloned()
   }

   pub fn len(&self) -> usize {
      self.docs.read().len()
   }

   pub fn is_empty(&self) -> bool {
      self.docs.read().is_empty()
   }

   /// Sizes of every successful commit, in order.
   pub fn batch_sizes(&self) -> Vec<usize> {
      self.batches.read().clone()
   }

   pub fn rejected_commits(&self) -> usize {
      self.rejected.load(Ordering::SeqCst)
   }

   /// Paths currently indexed with `tag`.
   pub fn search_tag(&self, tag: &str) -> Vec<String> {
      let mut hits: Vec<String> = self
         .docs
         .read()
         .values()
         .filter(|d| d.metadata.tags.iter().any(|t| t == tag))
         .map(|d| d.path.clone())
         .collect();
      hits.sort();
      hits
   }
}

#[async_trait::async_trait]
impl SearchIndex for MemoryIndex {
   async fn commit(&self, ops: &[IndexOp]) -> Result<(), IndexError> {
      let remaining = self.fail_next.load(Ordering::SeqCst);
      if remaining > 0 {
         self.fail_next.store(remaining - 1, Ordering::SeqCst);
         self.rejected.fetch_add(1, Ordering::SeqCst);
         return Err(IndexError::Commit { ops: ops.len(), reason: "injected failure".to_string() });
      }

      let mut docs = self.docs.write();
      for op in ops {
         match op {
            IndexOp::Upsert { node_id, path, metadata } => {
               docs.insert(node_id.clone(), IndexedDoc {
                  path:     path.clone(),
                  metadata: metadata.clone(),
               });
            },
            IndexOp::Delete { node_id } => {
               docs.remove(node_id);
            },
         }
      }
      self.batches.write().push(ops.len());
      Ok(())
   }
}
