use std::{collections::HashMap, sync::Arc};

use tokio::{
   sync::mpsc,
   time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

use super::{IndexOp, SearchIndex};
use crate::{
   config::Config,
   ingest::LatestSequences,
   types::{ChangeKind, NormalizedChangeEvent},
};

#[derive(Debug, Clone)]
struct PendingOp {
   op:       IndexOp,
   sequence: u64,
   since:    Instant,
}

/// Batches normalized events into index commits.
///
/// A batch is committed once `index_batch_size` paths are pending or the
/// oldest pending op is `index_flush_ms` old. A failed commit is merged
/// back into the pending set and retried after an exponential backoff.
/// Index freshness is independent from delivery: this loop never feeds the
/// coalescer.
pub struct IndexUpdater {
   index:          Arc<dyn SearchIndex>,
   cfg:            Config,
   pending:        HashMap<String, PendingOp>,
   last_committed: LatestSequences,
   failures:       u32,
   retry_at:       Option<Instant>,
}

impl IndexUpdater {
   pub fn new(index: Arc<dyn SearchIndex>, cfg: &Config) -> Self {
      Self {
         index,
         cfg: cfg.clone(),
         pending: HashMap::new(),
         last_committed: LatestSequences::default(),
         failures: 0,
         retry_at: None,
      }
   }

   pub fn pending_len(&self) -> usize {
      self.pending.len()
   }

   /// Paths whose last committed sequence is still remembered.
   pub fn tracked_paths(&self) -> usize {
      self.last_committed.len()
   }

   /// Adds an event to the pending batch unless a newer one for the same
   /// path is pending or already committed.
   pub fn accept(&mut self, event: NormalizedChangeEvent, now: Instant) {
      let path = event.path().to_string();
      let stale = self.last_committed.stale(&path, event.sequence).is_some();
      self.last_committed.advance(event.low_water);
      if stale {
         tracing::debug!("index skip stale {} seq {}", path, event.sequence);
         return;
      }

      let op = match (event.kind(), event.metadata) {
         (ChangeKind::Created | ChangeKind::Modified, Some(metadata)) => {
            IndexOp::Upsert { node_id: event.node_id, path: path.clone(), metadata }
         },
         _ => IndexOp::Delete { node_id: event.node_id },
      };

      match self.pending.get_mut(&path) {
         Some(existing) if existing.sequence >= event.sequence => {},
         Some(existing) => {
            existing.op = op;
            existing.sequence = event.sequence;
         },
         None => {
            self.pending.insert(path, PendingOp { op, sequence: event.sequence, since: now });
         },
      }
   }

   /// When the next commit attempt is due, if anything is pending.
   pub fn next_flush(&self) -> Option<Instant> {
      let oldest = self.pending.values().map(|p| p.since).min()?;
      let due = if self.pending.len() >= self.cfg.index_batch_size {
         oldest
      } else {
         oldest + self.cfg.index_flush_interval()
      };
      Some(self.retry_at.map_or(due, |retry| due.max(retry)))
   }

   /// Commits everything pending. Returns whether the commit succeeded.
   pub async fn flush(&mut self) -> bool {
      if self.pending.is_empty() {
         return true;
      }
      let mut batch: Vec<(String, PendingOp)> = self.pending.drain().collect();
      batch.sort_by_key(|(_, p)| p.sequence);
      let ops: Vec<IndexOp> = batch.iter().map(|(_, p)| p.op.clone()).collect();

      match self.index.commit(&ops).await {
         Ok(()) => {
            tracing::debug!("index committed {} ops", ops.len());
            for (path, p) in batch {
               self.last_committed.record(&path, p.sequence);
            }
            self.failures = 0;
            self.retry_at = None;
            true
         },
         Err(e) => {
            self.failures = self.failures.saturating_add(1);
            let backoff = self.cfg.index_retry_backoff(self.failures);
            tracing::warn!(
               "index commit failed (attempt {}), retrying in {:?}: {}",
               self.failures,
               backoff,
               e
            );
            for (path, p) in batch {
               self.pending.entry(path).or_insert(p);
            }
            self.retry_at = Some(Instant::now() + backoff);
            false
         },
      }
   }

   pub const fn consecutive_failures(&self) -> u32 {
      self.failures
   }

   /// Runs until `cancel` fires or the input closes. Whatever is pending at
   /// that point gets one last commit attempt.
   pub async fn run(
      mut self,
      mut events: mpsc::UnboundedReceiver<NormalizedChangeEvent>,
      cancel: CancellationToken,
   ) {
      loop {
         let next = self.next_flush();
         tokio::select! {
            biased;
            () = cancel.cancelled() => {
               while let Ok(event) = events.try_recv() {
                  self.accept(event, Instant::now());
               }
               break;
            },
            () = time::sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
               self.flush().await;
            },
            event = events.recv() => match event {
               Some(event) => self.accept(event, Instant::now()),
               None => break,
            },
         }
      }

      if !self.pending.is_empty() && !self.flush().await {
         tracing::warn!("dropping {} index ops on shutdown", self.pending.len());
      }
   }
}
