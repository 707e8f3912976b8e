//! Server-side handle for one connected viewer.

use std::{
   sync::{
      Arc, Weak,
      atomic::{AtomicU32, Ordering},
   },
   time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{HubInner, event::PushEvent};
use crate::types::{SessionId, VaultId};

/// Lifecycle of a session. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
   Connecting,
   Active,
   Degraded,
   Disconnected,
}

/// Result of one timed enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
   Delivered,
   TimedOut,
   Closed,
}

#[derive(Debug)]
pub struct ClientSession {
   id:                   SessionId,
   vault:                VaultId,
   tx:                   mpsc::Sender<PushEvent>,
   state:                Mutex<SessionState>,
   consecutive_timeouts: AtomicU32,
   last_ping_at:         Mutex<Option<DateTime<Utc>>>,
   cancel:               CancellationToken,
}

impl ClientSession {
   pub(super) fn new(
      vault: VaultId,
      depth: usize,
      parent: &CancellationToken,
   ) -> (Arc<Self>, mpsc::Receiver<PushEvent>) {
      let (tx, rx) = mpsc::channel(depth);
      let session = Arc::new(Self {
         id: SessionId::new(),
         vault,
         tx,
         state: Mutex::new(SessionState::Connecting),
         consecutive_timeouts: AtomicU32::new(0),
         last_ping_at: Mutex::new(None),
         cancel: parent.child_token(),
      });
      (session, rx)
   }

   pub const fn id(&self) -> SessionId {
      self.id
   }

   pub const fn vault(&self) -> &VaultId {
      &self.vault
   }

   pub fn state(&self) -> SessionState {
      *self.state.lock()
   }

   /// Events queued and not yet taken by the viewer.
   pub fn queue_depth(&self) -> usize {
      self.tx.max_capacity() - self.tx.capacity()
   }

   pub fn consecutive_timeouts(&self) -> u32 {
      self.consecutive_timeouts.load(Ordering::Relaxed)
   }

   pub fn last_ping_at(&self) -> Option<DateTime<Utc>> {
      *self.last_ping_at.lock()
   }

   pub(super) fn transition(&self, next: SessionState) {
      let mut state = self.state.lock();
      if *state != SessionState::Disconnected {
         *state = next;
      }
   }

   /// Enqueues `event`, waiting at most `deadline` for queue space.
   pub(super) async fn deliver(&self, event: PushEvent, deadline: Duration) -> Delivery {
      if self.cancel.is_cancelled() {
         return Delivery::Closed;
      }
      match tokio::time::timeout(deadline, self.tx.send(event)).await {
         Ok(Ok(())) => {
            self.consecutive_timeouts.store(0, Ordering::Relaxed);
            Delivery::Delivered
         },
         Ok(Err(_)) => Delivery::Closed,
         Err(_) => {
            self.consecutive_timeouts.fetch_add(1, Ordering::Relaxed);
            Delivery::TimedOut
         },
      }
   }

   /// Enqueues without waiting; `false` if the queue is full or closed.
   pub(super) fn try_deliver(&self, event: PushEvent) -> bool {
      !self.cancel.is_cancelled() && self.tx.try_send(event).is_ok()
   }

   pub(super) fn ping(&self) -> bool {
      let delivered = self.try_deliver(PushEvent::Ping { queue_depth: self.queue_depth() });
      if delivered {
         *self.last_ping_at.lock() = Some(Utc::now());
      }
      delivered
   }

   /// Tears the connection down; the viewer's stream ends immediately.
   pub(super) fn disconnect(&self) {
      *self.state.lock() = SessionState::Disconnected;
      self.cancel.cancel();
   }
}

/// Viewer end of a session. Dropping it unsubscribes.
pub struct Subscription {
   session: Arc<ClientSession>,
   rx:      mpsc::Receiver<PushEvent>,
   hub:     Weak<HubInner>,
}

impl Subscription {
   pub(super) fn new(
      session: Arc<ClientSession>,
      rx: mpsc::Receiver<PushEvent>,
      hub: Weak<HubInner>,
   ) -> Self {
      Self { session, rx, hub }
   }

   pub fn session_id(&self) -> SessionId {
      self.session.id()
   }

   pub fn session(&self) -> &Arc<ClientSession> {
      &self.session
   }

   /// Next pushed event, or `None` once the session is torn down.
   pub async fn recv(&mut self) -> Option<PushEvent> {
      tokio::select! {
         biased;
         () = self.session.cancel.cancelled() => None,
         event = self.rx.recv() => event,
      }
   }
}

impl Drop for Subscription {
   fn drop(&mut self) {
      if let Some(hub) = self.hub.upgrade() {
         hub.remove(self.session.vault(), self.session.id());
      }
      self.session.disconnect();
   }
}
