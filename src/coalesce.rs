//! Per-vault change coalescing.
//!
//! Normalized events are buffered per path and collapsed into one net delta
//! per path:
//!
//! | pending  | incoming | result                         |
//! |----------|----------|--------------------------------|
//! | created  | modified | created, metadata replaced     |
//! | created  | deleted  | entry removed, nothing emitted |
//! | modified | modified | modified, metadata replaced    |
//! | modified | deleted  | deleted                        |
//! | deleted  | created  | created                        |
//! | deleted  | modified | modified                       |
//! | modified | created  | modified, metadata replaced    |
//! | same     | same     | unchanged kind, latest metadata|
//!
//! The buffer flushes when it holds `coalesce_max_pending` entries, when the
//! oldest entry is `coalesce_window` old, and it force-flushes any entry
//! older than `coalesce_hard_cap` as soon as the loop gets to it. Emitted
//! deltas are ordered by the sequence of the change that last touched them
//! and chunked into messages of at most `max_deltas_per_message`.

use std::collections::HashMap;

use tokio::{
   sync::mpsc,
   time::{self, Duration, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
   config::Config,
   ingest::LatestSequences,
   types::{BulkUpdateMessage, ChangeKind, NodeDelta, NormalizedChangeEvent, VaultId},
};

#[derive(Debug, Clone)]
struct PendingEntry {
   delta:      NodeDelta,
   first_seen: Instant,
   sequence:   u64,
}

/// Collapses a pair of kinds; `None` means the entry cancels out.
const fn collapse(pending: ChangeKind, incoming: ChangeKind) -> Option<ChangeKind> {
   use ChangeKind::*;
   match (pending, incoming) {
      (Created, Deleted) => None,
      (Created, Created | Modified) => Some(Created),
      (Modified, Deleted) | (Deleted, Deleted) => Some(Deleted),
      (Modified, Created | Modified) | (Deleted, Modified) => Some(Modified),
      (Deleted, Created) => Some(Created),
   }
}

/// Time-agnostic coalescing state for one vault. The caller supplies `now`.
#[derive(Debug)]
pub struct CoalesceBuffer {
   vault:           VaultId,
   entries:         HashMap<String, PendingEntry>,
   latest:          LatestSequences,
   max_pending:     usize,
   window:          Duration,
   hard_cap:        Duration,
   max_per_message: usize,
   batch_sequence:  u64,
}

impl CoalesceBuffer {
   pub fn new(vault: VaultId, cfg: &Config) -> Self {
      Self {
         vault,
         entries: HashMap::new(),
         latest: LatestSequences::default(),
         max_pending: cfg.coalesce_max_pending,
         window: cfg.coalesce_window(),
         hard_cap: cfg.coalesce_hard_cap(),
         max_per_message: cfg.max_deltas_per_message,
         batch_sequence: 0,
      }
   }

   pub fn len(&self) -> usize {
      self.entries.len()
   }

   pub fn is_empty(&self) -> bool {
      self.entries.is_empty()
   }

   /// Paths whose latest sequence is still remembered for stale checks.
   pub fn tracked_paths(&self) -> usize {
      self.latest.len()
   }

   /// Pending kind for `path`, if any.
   pub fn pending_kind(&self, path: &str) -> Option<ChangeKind> {
      self.entries.get(path).map(|e| e.delta.kind)
   }

   /// When the window trigger fires for the current oldest entry.
   pub fn deadline(&self) -> Option<Instant> {
      self
         .entries
         .values()
         .map(|e| e.first_seen)
         .min()
         .map(|oldest| oldest + self.window)
   }

   /// Buffers one event and returns whatever the count and hard-cap
   /// triggers flush as a result.
   pub fn push(&mut self, event: NormalizedChangeEvent, now: Instant) -> Vec<BulkUpdateMessage> {
      let path = event.path().to_string();
      let stale = self.latest.stale(&path, event.sequence);
      if stale.is_none() {
         self.latest.record(&path, event.sequence);
      }
      self.latest.advance(event.low_water);
      if let Some(last) = stale {
         tracing::debug!("discarding stale event for {} (seq {} <= {})", path, event.sequence, last);
         return Vec::new();
      }

      let incoming = event.to_delta();
      match self.entries.get_mut(&path) {
         None => {
            self.entries.insert(path, PendingEntry {
               delta:      incoming,
               first_seen: now,
               sequence:   event.sequence,
            });
         },
         Some(entry) => match collapse(entry.delta.kind, incoming.kind) {
            None => {
               self.entries.remove(&path);
            },
            Some(kind) => {
               entry.delta.kind = kind;
               entry.delta.metadata = if kind == ChangeKind::Deleted { None } else { incoming.metadata };
               entry.delta.node_id = incoming.node_id;
               entry.sequence = event.sequence;
            },
         },
      }

      if self.entries.len() >= self.max_pending {
         return self.flush();
      }
      self.flush_aged(now)
   }

   /// Emits every pending entry.
   pub fn flush(&mut self) -> Vec<BulkUpdateMessage> {
      let drained: Vec<PendingEntry> = self.entries.drain().map(|(_, e)| e).collect();
      self.emit(drained)
   }

   /// Emits only entries that have been pending for at least the hard cap.
   pub fn flush_aged(&mut self, now: Instant) -> Vec<BulkUpdateMessage> {
      let hard_cap = self.hard_cap;
      let aged: Vec<String> = self
         .entries
         .iter()
         .filter(|(_, e)| now.saturating_duration_since(e.first_seen) >= hard_cap)
         .map(|(p, _)| p.clone())
         .collect();
      if aged.is_empty() {
         return Vec::new();
      }
      tracing::debug!("hard cap reached, partially flushing {} of {} entries", aged.len(), self.entries.len());
      let drained = aged
         .iter()
         .filter_map(|p| self.entries.remove(p))
         .collect();
      self.emit(drained)
   }

   fn emit(&mut self, mut entries: Vec<PendingEntry>) -> Vec<BulkUpdateMessage> {
      entries.sort_by_key(|e| e.sequence);
      let deltas: Vec<NodeDelta> = entries.into_iter().map(|e| e.delta).collect();
      deltas
         .chunks(self.max_per_message)
         .map(|chunk| {
            self.batch_sequence += 1;
            BulkUpdateMessage::new(self.vault.clone(), chunk.to_vec(), self.batch_sequence)
         })
         .collect()
   }
}

/// Serialized coalescing loop for one vault.
pub struct Coalescer {
   buffer: CoalesceBuffer,
}

impl Coalescer {
   pub fn new(vault: VaultId, cfg: &Config) -> Self {
      Self { buffer: CoalesceBuffer::new(vault, cfg) }
   }

   /// Runs until `cancel` fires or the input closes, then drains what is
   /// left with a final best-effort flush.
   pub async fn run(
      mut self,
      mut events: mpsc::UnboundedReceiver<NormalizedChangeEvent>,
      out: mpsc::UnboundedSender<BulkUpdateMessage>,
      cancel: CancellationToken,
   ) {
      let emit = |messages: Vec<BulkUpdateMessage>| {
         for msg in messages {
            tracing::debug!(
               "vault {} batch {}: {} deltas",
               msg.vault,
               msg.batch_sequence,
               msg.nodes.len()
            );
            if out.send(msg).is_err() {
               tracing::debug!("bulk update receiver closed");
            }
         }
      };

      loop {
         let deadline = self.buffer.deadline();
         tokio::select! {
            biased;
            () = cancel.cancelled() => {
               while let Ok(event) = events.try_recv() {
                  emit(self.buffer.push(event, Instant::now()));
               }
               break;
            },
            () = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
               emit(self.buffer.flush());
            },
            event = events.recv() => match event {
               Some(event) => emit(self.buffer.push(event, Instant::now())),
               None => break,
            },
         }
      }

      if !self.buffer.is_empty() {
         tracing::info!("final flush of {} pending entries", self.buffer.len());
         emit(self.buffer.flush());
      }
   }
}
