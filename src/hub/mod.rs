//! Broadcast hub: per-vault fan-out of push events to viewer sessions.
//!
//! Every session owns a bounded outbound queue. A bulk update is offered to
//! all sessions of the vault concurrently, each with its own write deadline;
//! a session that misses `session_max_timeouts` deadlines in a row is
//! evicted and its stream closed. There is no replay log, so an evicted
//! viewer has to resync when it comes back.

pub mod event;
pub mod session;

use std::{
   collections::HashMap,
   sync::{Arc, Weak},
};

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;

pub use self::{
   event::PushEvent,
   session::{ClientSession, Delivery, SessionState, Subscription},
};
use crate::{
   config::Config,
   types::{BulkUpdateMessage, SessionId, VaultId},
};

#[derive(Debug, Default)]
struct VaultSessions {
   sessions:     HashMap<SessionId, Arc<ClientSession>>,
   needs_resync: bool,
}

#[derive(Debug)]
pub(crate) struct HubInner {
   cfg:    Config,
   vaults: RwLock<HashMap<VaultId, VaultSessions>>,
   cancel: CancellationToken,
}

impl HubInner {
   fn remove(&self, vault: &VaultId, id: SessionId) -> Option<Arc<ClientSession>> {
      let mut vaults = self.vaults.write();
      let removed = vaults.get_mut(vault)?.sessions.remove(&id);
      if removed.is_some() {
         tracing::debug!("session {} left vault {}", id, vault);
      }
      removed
   }

   fn evict(&self, session: &ClientSession) {
      session.transition(SessionState::Degraded);
      self.remove(session.vault(), session.id());
      session.disconnect();
      tracing::warn!(
         "evicted session {} from vault {} after {} missed deadlines",
         session.id(),
         session.vault(),
         session.consecutive_timeouts()
      );
   }

   fn snapshot(&self, vault: &VaultId) -> Vec<Arc<ClientSession>> {
      self
         .vaults
         .read()
         .get(vault)
         .map(|v| v.sessions.values().cloned().collect())
         .unwrap_or_default()
   }

   fn all_sessions(&self) -> Vec<Arc<ClientSession>> {
      self
         .vaults
         .read()
         .values()
         .flat_map(|v| v.sessions.values().cloned())
         .collect()
   }
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
   pub delivered: usize,
   pub timed_out: usize,
   pub evicted:   usize,
}

/// Shared handle; clones refer to the same hub.
#[derive(Clone, Debug)]
pub struct BroadcastHub {
   inner: Arc<HubInner>,
}

impl BroadcastHub {
   pub fn new(cfg: &Config) -> Self {
      Self {
         inner: Arc::new(HubInner {
            cfg:    cfg.clone(),
            vaults: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
         }),
      }
   }

   fn downgrade(&self) -> Weak<HubInner> {
      Arc::downgrade(&self.inner)
   }

   /// Opens a session on `vault`. The first event on it is `connected`,
   /// carrying the vault's resync flag.
   pub fn subscribe(&self, vault: &VaultId) -> Subscription {
      let (session, rx) =
         ClientSession::new(vault.clone(), self.inner.cfg.session_queue_depth, &self.inner.cancel);

      let needs_resync = {
         let mut vaults = self.inner.vaults.write();
         let entry = vaults.entry(vault.clone()).or_default();
         entry.sessions.insert(session.id(), Arc::clone(&session));
         entry.needs_resync
      };

      let connected = PushEvent::Connected { session_id: session.id(), vault: vault.clone(), needs_resync };
      if session.try_deliver(connected) {
         session.transition(SessionState::Active);
      }
      if self.inner.cancel.is_cancelled() {
         self.inner.remove(vault, session.id());
         session.disconnect();
      }
      tracing::info!("session {} subscribed to vault {}", session.id(), vault);
      Subscription::new(session, rx, self.downgrade())
   }

   /// Removes a session and closes its stream.
   pub fn unsubscribe(&self, vault: &VaultId, id: SessionId) {
      if let Some(session) = self.inner.remove(vault, id) {
         session.disconnect();
      }
   }

   /// Offers `msg` to every session of its vault concurrently.
   pub async fn broadcast(&self, msg: BulkUpdateMessage) -> BroadcastReport {
      let sessions = self.inner.snapshot(&msg.vault);
      if sessions.is_empty() {
         return BroadcastReport::default();
      }
      let deadline = self.inner.cfg.session_write_timeout();
      let event = PushEvent::BulkUpdate(msg);

      let results = join_all(
         sessions
            .iter()
            .map(|s| s.deliver(event.clone(), deadline)),
      )
      .await;

      let mut report = BroadcastReport::default();
      for (session, result) in sessions.iter().zip(results) {
         match result {
            Delivery::Delivered => report.delivered += 1,
            Delivery::TimedOut => {
               report.timed_out += 1;
               if session.consecutive_timeouts() >= self.inner.cfg.session_max_timeouts {
                  self.inner.evict(session);
                  report.evicted += 1;
               }
            },
            Delivery::Closed => {
               self.inner.remove(session.vault(), session.id());
               session.disconnect();
            },
         }
      }
      report
   }

   /// Marks `vault` as needing a full refetch and tells its current
   /// sessions. Sessions opened while the flag is up see it in `connected`.
   /// The pipeline lowers it with [`Self::clear_resync`] once its ingest
   /// queue accepts events again. A session whose queue cannot take the
   /// notice is evicted, which forces the same resync on reconnect.
   pub fn flag_resync(&self, vault: &VaultId) {
      self
         .inner
         .vaults
         .write()
         .entry(vault.clone())
         .or_default()
         .needs_resync = true;
      tracing::warn!("vault {} flagged for resync", vault);
      for session in self.inner.snapshot(vault) {
         if !session.try_deliver(PushEvent::Resync { vault: vault.clone() }) {
            self.inner.evict(&session);
         }
      }
   }

   pub fn needs_resync(&self, vault: &VaultId) -> bool {
      self
         .inner
         .vaults
         .read()
         .get(vault)
         .is_some_and(|v| v.needs_resync)
   }

   pub fn clear_resync(&self, vault: &VaultId) {
      if let Some(v) = self.inner.vaults.write().get_mut(vault) {
         v.needs_resync = false;
      }
   }

   pub fn subscriber_count(&self, vault: &VaultId) -> usize {
      self
         .inner
         .vaults
         .read()
         .get(vault)
         .map_or(0, |v| v.sessions.len())
   }

   pub fn is_subscribed(&self, vault: &VaultId, id: SessionId) -> bool {
      self
         .inner
         .vaults
         .read()
         .get(vault)
         .is_some_and(|v| v.sessions.contains_key(&id))
   }

   /// Sends one keep-alive to every session. Returns how many were queued.
   pub fn ping_all(&self) -> usize {
      self
         .inner
         .all_sessions()
         .iter()
         .filter(|s| {
            let sent = s.ping();
            if !sent {
               tracing::debug!("ping skipped for session {}: queue full", s.id());
            }
            sent
         })
         .count()
   }

   /// Pings every `ping_interval` until the hub shuts down.
   pub fn spawn_keepalive(&self) -> JoinHandle<()> {
      let hub = self.clone();
      let cancel = self.inner.cancel.clone();
      let period = self.inner.cfg.ping_interval();
      tokio::spawn(async move {
         let mut ticker = time::interval_at(time::Instant::now() + period, period);
         ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
         loop {
            tokio::select! {
               () = cancel.cancelled() => break,
               _ = ticker.tick() => {
                  hub.ping_all();
               },
            }
         }
      })
   }

   /// Disconnects every session of `vault` and forgets its state.
   pub fn close_vault(&self, vault: &VaultId) {
      let removed = self.inner.vaults.write().remove(vault);
      if let Some(v) = removed {
         for session in v.sessions.values() {
            session.disconnect();
         }
      }
   }

   /// Disconnects everything and stops the keep-alive task.
   pub fn shutdown(&self) {
      self.inner.cancel.cancel();
      let drained: Vec<VaultSessions> = self.inner.vaults.write().drain().map(|(_, v)| v).collect();
      for v in drained {
         for session in v.sessions.values() {
            session.disconnect();
         }
      }
      tracing::info!("broadcast hub shut down");
   }

   pub fn is_shut_down(&self) -> bool {
      self.inner.cancel.is_cancelled()
   }
}
