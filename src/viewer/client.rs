//! Viewer connection: push stream, reconnect policy and reconciliation.

use std::{
   sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
   },
   time::Duration,
};

use futures::{
   StreamExt,
   stream::{self, BoxStream},
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::{
   sse::{PushFrame, SseDecoder},
   store::{ApplyOutcome, ReconciliationStore, TreeNode},
};
use crate::{
   Result,
   config::Config,
   error::{Error, TransportError},
   hub::{BroadcastHub, PushEvent, Subscription},
   storage::VaultReader,
   types::{SessionId, VaultId},
};

pub type PushStream = BoxStream<'static, Result<PushFrame, TransportError>>;

/// Opens the named-event stream for a vault.
#[async_trait::async_trait]
pub trait PushTransport: Send + Sync {
   async fn connect(&self, vault: &VaultId) -> Result<PushStream, TransportError>;
}

/// Source of directory listings used to (re)walk the tree.
#[async_trait::async_trait]
pub trait ListingSource: Send + Sync {
   async fn list_directory(&self, dir: &str) -> Result<Vec<TreeNode>>;
}

#[async_trait::async_trait]
impl ListingSource for VaultReader {
   async fn list_directory(&self, dir: &str) -> Result<Vec<TreeNode>> {
      Self::list_directory(self, dir).await
   }
}

/// In-process transport: subscribes to a hub and passes every event through
/// the text encoding and [`SseDecoder`], exactly as a remote viewer would
/// see it.
#[derive(Clone, Debug)]
pub struct HubTransport {
   hub: BroadcastHub,
}

impl HubTransport {
   pub const fn new(hub: BroadcastHub) -> Self {
      Self { hub }
   }
}

#[async_trait::async_trait]
impl PushTransport for HubTransport {
   async fn connect(&self, vault: &VaultId) -> Result<PushStream, TransportError> {
      if self.hub.is_shut_down() {
         return Err(TransportError::Closed("hub is shut down".to_string()));
      }
      let sub = self.hub.subscribe(vault);
      let frames = stream::unfold(
         (sub, SseDecoder::new()),
         |(mut sub, mut decoder): (Subscription, SseDecoder)| async move {
            let event = sub.recv().await?;
            let batch: Vec<Result<PushFrame, TransportError>> = match event.to_sse_frame() {
               Ok(text) => decoder.push(text.as_bytes()).into_iter().map(Ok).collect(),
               Err(e) => vec![Err(TransportError::Malformed(e.to_string()))],
            };
            Some((stream::iter(batch), (sub, decoder)))
         },
      )
      .flatten();
      Ok(frames.boxed())
   }
}

/// Fixed-delay reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
   pub max_attempts: u32,
   pub delay:        Duration,
}

impl ReconnectPolicy {
   pub const fn from_config(cfg: &Config) -> Self {
      Self { max_attempts: cfg.reconnect_max_attempts, delay: cfg.reconnect_delay() }
   }
}

impl Default for ReconnectPolicy {
   fn default() -> Self {
      Self::from_config(&Config::default())
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
   Idle,
   Connecting,
   Connected,
   /// Waiting before reconnect attempt `n` (1-based).
   Reconnecting(u32),
   /// Gave up; the user has to act.
   Failed,
}

/// Notifications for whoever renders the viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerEvent {
   Connected { session_id: SessionId },
   Applied { batch_sequence: u64, outcome: ApplyOutcome },
   Resynced { root_children: usize },
   Lag { queue_depth: usize },
}

/// One viewer of one vault.
pub struct ViewerClient {
   vault:       VaultId,
   transport:   Arc<dyn PushTransport>,
   listings:    Option<Arc<dyn ListingSource>>,
   store:       Arc<Mutex<ReconciliationStore>>,
   policy:      ReconnectPolicy,
   state:       watch::Sender<ConnectionState>,
   queue_depth: AtomicUsize,
   session:     Mutex<Option<SessionId>>,
   events:      Option<mpsc::UnboundedSender<ViewerEvent>>,
}

impl ViewerClient {
   pub fn new(vault: VaultId, transport: Arc<dyn PushTransport>, policy: ReconnectPolicy) -> Self {
      Self {
         vault,
         transport,
         listings: None,
         store: Arc::new(Mutex::new(ReconciliationStore::new())),
         policy,
         state: watch::Sender::new(ConnectionState::Idle),
         queue_depth: AtomicUsize::new(0),
         session: Mutex::new(None),
         events: None,
      }
   }

   /// Enables root refetch on resync and [`Self::expand`].
   pub fn with_listings(mut self, listings: Arc<dyn ListingSource>) -> Self {
      self.listings = Some(listings);
      self
   }

   pub fn with_events(mut self, events: mpsc::UnboundedSender<ViewerEvent>) -> Self {
      self.events = Some(events);
      self
   }

   pub const fn vault(&self) -> &VaultId {
      &self.vault
   }

   pub fn store(&self) -> Arc<Mutex<ReconciliationStore>> {
      Arc::clone(&self.store)
   }

   pub fn state(&self) -> ConnectionState {
      *self.state.borrow()
   }

   pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
      self.state.subscribe()
   }

   /// Last queue depth reported by a server ping.
   pub fn queue_depth(&self) -> usize {
      self.queue_depth.load(Ordering::Relaxed)
   }

   pub fn session_id(&self) -> Option<SessionId> {
      *self.session.lock()
   }

   fn set_state(&self, state: ConnectionState) {
      self.state.send_replace(state);
   }

   fn notify(&self, event: ViewerEvent) {
      if let Some(tx) = &self.events {
         let _ = tx.send(event);
      }
   }

   /// Fetches the children of `dir` and registers them as its complete
   /// child list.
   pub async fn expand(&self, dir: &str) -> Result<usize> {
      let Some(listings) = &self.listings else {
         return Ok(0);
      };
      let children = listings.list_directory(dir).await?;
      let count = children.len();
      self.store.lock().apply_listing(&self.vault, dir, children);
      Ok(count)
   }

   /// Discards the local tree for the vault and walks the root again.
   pub async fn resync(&self) {
      self.store.lock().clear_vault(&self.vault);
      match self.expand("").await {
         Ok(root_children) => {
            tracing::info!("vault {} resynced ({} root entries)", self.vault, root_children);
            self.notify(ViewerEvent::Resynced { root_children });
         },
         Err(e) => tracing::warn!("root refetch for vault {} failed: {}", self.vault, e),
      }
   }

   async fn handle(&self, event: PushEvent) {
      match event {
         // The session is subscribed before this arrives, so walking the
         // root here cannot miss a change made between listing and subscribe.
         PushEvent::Connected { session_id, needs_resync, .. } => {
            *self.session.lock() = Some(session_id);
            if needs_resync {
               tracing::info!("vault {} missed changes while overloaded", self.vault);
            }
            self.resync().await;
            self.notify(ViewerEvent::Connected { session_id });
         },
         PushEvent::BulkUpdate(msg) => {
            if msg.vault != self.vault {
               tracing::debug!("ignoring update for vault {}", msg.vault);
               return;
            }
            let outcome = self.store.lock().apply_bulk_update(&msg);
            tracing::debug!("applied batch {}: {:?}", msg.batch_sequence, outcome);
            self.notify(ViewerEvent::Applied { batch_sequence: msg.batch_sequence, outcome });
         },
         PushEvent::Ping { queue_depth } => {
            self.queue_depth.store(queue_depth, Ordering::Relaxed);
            self.notify(ViewerEvent::Lag { queue_depth });
         },
         PushEvent::Resync { vault } if vault == self.vault => self.resync().await,
         PushEvent::Resync { .. } => {},
      }
   }

   /// Consumes frames until the stream ends or breaks. Returns `true` if it
   /// stopped because of `cancel`.
   async fn pump(&self, mut frames: PushStream, cancel: &CancellationToken) -> bool {
      loop {
         let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return true,
            next = frames.next() => next,
         };
         match next {
            Some(Ok(frame)) => match PushEvent::from_frame(&frame) {
               Ok(Some(event)) => self.handle(event).await,
               Ok(None) => tracing::debug!("ignoring unknown event {}", frame.event),
               Err(e) => tracing::warn!("ignoring push payload: {}", e),
            },
            Some(Err(e)) => {
               tracing::warn!("push stream for vault {} broke: {}", self.vault, e);
               return false;
            },
            None => {
               tracing::warn!("push stream for vault {} closed", self.vault);
               return false;
            },
         }
      }
   }

   /// Connects and keeps the store in sync until `cancel` fires. Every
   /// `connected` event rebuilds the tree from the root. Gives up
   /// with [`Error::ConnectionFailed`] after `max_attempts` consecutive
   /// failed reconnects.
   pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
      let mut attempt = 0u32;
      self.set_state(ConnectionState::Connecting);

      loop {
         match self.transport.connect(&self.vault).await {
            Ok(frames) => {
               self.set_state(ConnectionState::Connected);
               attempt = 0;
               if self.pump(frames, &cancel).await {
                  self.set_state(ConnectionState::Idle);
                  return Ok(());
               }
            },
            Err(e) => tracing::warn!("connect to vault {} failed: {}", self.vault, e),
         }

         attempt += 1;
         if attempt > self.policy.max_attempts {
            self.set_state(ConnectionState::Failed);
            tracing::error!(
               "giving up on vault {} after {} reconnect attempts",
               self.vault,
               self.policy.max_attempts
            );
            return Err(Error::ConnectionFailed { attempts: self.policy.max_attempts });
         }
         self.set_state(ConnectionState::Reconnecting(attempt));
         tokio::select! {
            () = cancel.cancelled() => {
               self.set_state(ConnectionState::Idle);
               return Ok(());
            },
            () = tokio::time::sleep(self.policy.delay) => {},
         }
      }
   }
}
