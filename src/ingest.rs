//! Event ingest pool.
//!
//! Sequences are assigned under one lock together with the enqueue, so the
//! per-vault order is fixed before any parallel work starts. A fixed set of
//! workers then read the content, extract metadata and fan the normalized
//! event out to the index updater and the coalescer.
//!
//! Every emitted event carries a low-water mark: the lowest sequence still
//! queued or in a worker. Downstream stages use it to forget per-path
//! sequences that nothing in flight can undercut any more.

use std::{
   collections::{BTreeSet, HashMap},
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicU64, Ordering},
   },
};

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
   Result,
   config::Config,
   error::Error,
   extract::MetadataExtractor,
   storage::{StoredEntry, VaultStorage},
   types::{ChangeKind, NodeId, NormalizedChangeEvent, NoteMetadata, RawChangeEvent, VaultId},
};

/// Edge of an overflow burst on a vault's ingest queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
   /// First event dropped after a successful enqueue.
   Overflowed,
   /// First successful enqueue after a drop.
   Recovered,
}

/// Callback run at both edges of an overflow burst.
pub type OverflowHook = Arc<dyn Fn(&VaultId, Backpressure) + Send + Sync>;

const MIN_PRUNE_AT: usize = 64;

/// Newest sequence seen per path, for discarding stale events.
///
/// Entries below the latest low-water mark are pruned, so the map only
/// covers paths touched by work that may still be in flight.
#[derive(Debug)]
pub struct LatestSequences {
   latest:    HashMap<String, u64>,
   low_water: u64,
   prune_at:  usize,
}

impl Default for LatestSequences {
   fn default() -> Self {
      Self { latest: HashMap::new(), low_water: 0, prune_at: MIN_PRUNE_AT }
   }
}

impl LatestSequences {
   /// The recorded sequence for `path` if `sequence` does not beat it.
   pub fn stale(&self, path: &str, sequence: u64) -> Option<u64> {
      self.latest.get(path).copied().filter(|&last| sequence <= last)
   }

   pub fn record(&mut self, path: &str, sequence: u64) {
      let entry = self.latest.entry(path.to_string()).or_insert(sequence);
      *entry = (*entry).max(sequence);
   }

   /// Raises the low-water mark. Must be called after the stale check of
   /// the event that carried it.
   pub fn advance(&mut self, low_water: u64) {
      if low_water <= self.low_water {
         return;
      }
      self.low_water = low_water;
      if self.latest.len() >= self.prune_at {
         self.latest.retain(|_, seq| *seq >= low_water);
         self.prune_at = (self.latest.len() * 2).max(MIN_PRUNE_AT);
      }
   }

   pub fn len(&self) -> usize {
      self.latest.len()
   }

   pub fn is_empty(&self) -> bool {
      self.latest.is_empty()
   }
}

#[derive(Debug)]
struct Job {
   raw:      RawChangeEvent,
   sequence: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
   pub enqueued:   u64,
   pub dropped:    u64,
   pub downgraded: u64,
}

/// Sequences assigned but not yet emitted by a worker.
type InFlight = Arc<Mutex<BTreeSet<u64>>>;

#[derive(Debug, Default)]
struct Counters {
   enqueued:   AtomicU64,
   dropped:    AtomicU64,
   downgraded: AtomicU64,
}

/// Producer side of a vault's ingest queue.
pub struct IngestQueue {
   vault:       VaultId,
   sequence:    Mutex<u64>,
   tx:          flume::Sender<Job>,
   in_flight:   InFlight,
   overflow:    OverflowHook,
   overflowing: AtomicBool,
   counters:    Arc<Counters>,
}

impl IngestQueue {
   pub const fn vault(&self) -> &VaultId {
      &self.vault
   }

   /// Assigns the next sequence and enqueues without waiting. Returns the
   /// sequence, or `None` if the queue was full and the event was dropped.
   ///
   /// The overflow hook runs once at each edge of an overflow burst: on the
   /// first drop after a successful enqueue, and on the first successful
   /// enqueue after a drop.
   pub fn enqueue(&self, raw: RawChangeEvent) -> Result<Option<u64>> {
      let mut next = self.sequence.lock();
      let sequence = *next + 1;
      self.in_flight.lock().insert(sequence);
      match self.tx.try_send(Job { raw, sequence }) {
         Ok(()) => {
            *next = sequence;
            drop(next);
            self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            if self.overflowing.swap(false, Ordering::Relaxed) {
               tracing::info!("ingest queue for vault {} accepting again", self.vault);
               (self.overflow)(&self.vault, Backpressure::Recovered);
            }
            Ok(Some(sequence))
         },
         Err(flume::TrySendError::Full(job)) => {
            self.in_flight.lock().remove(&sequence);
            drop(next);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("ingest queue full for vault {}, dropped {}", self.vault, job.raw.path);
            if !self.overflowing.swap(true, Ordering::Relaxed) {
               (self.overflow)(&self.vault, Backpressure::Overflowed);
            }
            Ok(None)
         },
         Err(flume::TrySendError::Disconnected(_)) => {
            self.in_flight.lock().remove(&sequence);
            Err(Error::VaultClosed(self.vault.to_string()))
         },
      }
   }

   pub fn stats(&self) -> IngestStats {
      IngestStats {
         enqueued:   self.counters.enqueued.load(Ordering::Relaxed),
         dropped:    self.counters.dropped.load(Ordering::Relaxed),
         downgraded: self.counters.downgraded.load(Ordering::Relaxed),
      }
   }

   /// Events waiting for a worker.
   pub fn len(&self) -> usize {
      self.tx.len()
   }

   pub fn is_empty(&self) -> bool {
      self.tx.is_empty()
   }
}

/// Everything a worker needs to normalize one event.
#[derive(Clone)]
struct Worker {
   storage:   Arc<dyn VaultStorage>,
   extractor: Arc<dyn MetadataExtractor>,
   outputs:   Vec<mpsc::UnboundedSender<NormalizedChangeEvent>>,
   in_flight: InFlight,
   counters:  Arc<Counters>,
}

impl Worker {
   async fn run(self, rx: flume::Receiver<Job>, cancel: CancellationToken) {
      loop {
         let job = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            job = rx.recv_async() => match job {
               Ok(job) => job,
               Err(_) => break,
            },
         };
         let event = self.normalize(job).await;
         self.emit(event);
      }
   }

   /// Sends under the in-flight lock, so an event is in every output before
   /// any later event can report a low-water mark above its sequence.
   fn emit(&self, mut event: NormalizedChangeEvent) {
      let mut in_flight = self.in_flight.lock();
      in_flight.remove(&event.sequence);
      event.low_water = in_flight.first().copied().unwrap_or(event.sequence + 1);
      for out in &self.outputs {
         if out.send(event.clone()).is_err() {
            tracing::debug!("ingest output closed");
         }
      }
   }

   async fn normalize(&self, job: Job) -> NormalizedChangeEvent {
      let Job { mut raw, sequence } = job;
      let node_id = NodeId::for_path(&raw.vault, &raw.path);

      let metadata = match raw.kind {
         ChangeKind::Deleted => None,
         ChangeKind::Created | ChangeKind::Modified => self.load_metadata(&raw.path).await,
      };
      if metadata.is_none() && raw.kind != ChangeKind::Deleted {
         self.counters.downgraded.fetch_add(1, Ordering::Relaxed);
         raw.kind = ChangeKind::Deleted;
      }

      NormalizedChangeEvent { raw, node_id, metadata, sequence, low_water: 0 }
   }

   /// Reads and extracts; `None` downgrades the event to a deletion.
   async fn load_metadata(&self, path: &str) -> Option<NoteMetadata> {
      match self.storage.read(path).await {
         Ok(StoredEntry::File { content, modified }) => {
            match self.extractor.extract(path, &content, modified) {
               Ok(meta) => Some(meta),
               Err(e) => {
                  tracing::warn!("metadata extraction failed, treating as deleted: {}", e);
                  None
               },
            }
         },
         Ok(StoredEntry::Directory) => Some(NoteMetadata::directory()),
         Ok(StoredEntry::Missing) => {
            tracing::debug!("{} vanished before ingest", path);
            None
         },
         Err(e) => {
            tracing::warn!("failed to read {}, treating as deleted: {}", path, e);
            None
         },
      }
   }
}

/// Fixed-size worker pool draining one vault's bounded queue.
pub struct IngestPool {
   queue:   Arc<IngestQueue>,
   workers: Vec<JoinHandle<()>>,
}

impl IngestPool {
   /// Spawns `cfg.ingest_workers` workers. Every normalized event is sent
   /// to each of `outputs`.
   pub fn spawn(
      vault: VaultId,
      cfg: &Config,
      storage: Arc<dyn VaultStorage>,
      extractor: Arc<dyn MetadataExtractor>,
      outputs: Vec<mpsc::UnboundedSender<NormalizedChangeEvent>>,
      overflow: OverflowHook,
      cancel: &CancellationToken,
   ) -> Self {
      let (tx, rx) = flume::bounded(cfg.ingest_queue_capacity);
      let counters = Arc::new(Counters::default());
      let in_flight = InFlight::default();
      let worker = Worker {
         storage,
         extractor,
         outputs,
         in_flight: Arc::clone(&in_flight),
         counters: Arc::clone(&counters),
      };

      let workers = (0..cfg.ingest_workers)
         .map(|_| tokio::spawn(worker.clone().run(rx.clone(), cancel.clone())))
         .collect();

      let queue = Arc::new(IngestQueue {
         vault,
         sequence: Mutex::new(0),
         tx,
         in_flight,
         overflow,
         overflowing: AtomicBool::new(false),
         counters,
      });
      Self { queue, workers }
   }

   pub fn queue(&self) -> Arc<IngestQueue> {
      Arc::clone(&self.queue)
   }

   /// Waits for every worker to exit after cancellation.
   pub async fn join(self) {
      for handle in self.workers {
         if let Err(e) = handle.await {
            tracing::warn!("ingest worker panicked: {}", e);
         }
      }
   }
}
