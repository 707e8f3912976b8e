//! Search index adapter.
//!
//! The index engine itself is external; it only has to accept batches of
//! idempotent per-document upserts and deletes.

mod memory;
mod updater;

pub use memory::{IndexedDoc, MemoryIndex};
use serde::{Deserialize, Serialize};
pub use updater::IndexUpdater;

use crate::{
   error::IndexError,
   types::{NodeId, NoteMetadata},
};

/// One per-document index operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum IndexOp {
   Upsert { node_id: NodeId, path: String, metadata: NoteMetadata },
   Delete { node_id: NodeId },
}

impl IndexOp {
   pub const fn node_id(&self) -> &NodeId {
      match self {
         Self::Upsert { node_id, .. } | Self::Delete { node_id } => node_id,
      }
   }
}

/// Incremental search index. Commits must be idempotent: the updater may
/// replay a batch after a failure.
#[async_trait::async_trait]
pub trait SearchIndex: Send + Sync {
   async fn commit(&self, ops: &[IndexOp]) -> Result<(), IndexError>;
}
