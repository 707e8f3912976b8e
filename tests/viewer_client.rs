mod support;

use std::{
   collections::{HashMap, VecDeque},
   sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
   },
   time::Duration,
};

use futures::{StreamExt, stream};
use parking_lot::Mutex;
use support::{meta, tree_node, vault};
use tokio::{
   sync::mpsc,
   task::JoinHandle,
   time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use vaultsync::{
   Error, Result,
   config::Config,
   error::TransportError,
   hub::{BroadcastHub, PushEvent},
   types::{BulkUpdateMessage, ChangeKind, NodeDelta, NodeId, SessionId, VaultId},
   viewer::{
      ConnectionState, HubTransport, ListingSource, PushFrame, PushStream, PushTransport,
      ReconnectPolicy, TreeNode, ViewerClient, ViewerEvent,
   },
};

type FrameTx = mpsc::UnboundedSender<Result<PushFrame, TransportError>>;
type FrameRx = mpsc::UnboundedReceiver<Result<PushFrame, TransportError>>;

/// Hands out pre-arranged streams in order, then refuses to connect.
#[derive(Default)]
struct ScriptedTransport {
   streams:  Mutex<VecDeque<FrameRx>>,
   connects: AtomicUsize,
}

impl ScriptedTransport {
   fn add_stream(&self) -> FrameTx {
      let (tx, rx) = mpsc::unbounded_channel();
      self.streams.lock().push_back(rx);
      tx
   }

   fn connects(&self) -> usize {
      self.connects.load(Ordering::SeqCst)
   }
}

#[async_trait::async_trait]
impl PushTransport for ScriptedTransport {
   async fn connect(&self, _vault: &VaultId) -> Result<PushStream, TransportError> {
      self.connects.fetch_add(1, Ordering::SeqCst);
      let next = self.streams.lock().pop_front();
      match next {
         Some(rx) => Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
         })
         .boxed()),
         None => Err(TransportError::Connect("connection refused".to_string())),
      }
   }
}

#[derive(Default)]
struct StaticListings {
   dirs: Mutex<HashMap<String, Vec<TreeNode>>>,
}

impl StaticListings {
   fn set(&self, dir: &str, nodes: Vec<TreeNode>) {
      self.dirs.lock().insert(dir.to_string(), nodes);
   }
}

#[async_trait::async_trait]
impl ListingSource for StaticListings {
   async fn list_directory(&self, dir: &str) -> Result<Vec<TreeNode>> {
      Ok(self.dirs.lock().get(dir).cloned().unwrap_or_default())
   }
}

fn frame(event: &PushEvent) -> Result<PushFrame, TransportError> {
   Ok(PushFrame { event: event.event_name().to_string(), data: event.data_json().unwrap() })
}

fn connected(vault: &VaultId, needs_resync: bool) -> PushEvent {
   PushEvent::Connected { session_id: SessionId::new(), vault: vault.clone(), needs_resync }
}

fn created(vault: &VaultId, path: &str, batch: u64) -> BulkUpdateMessage {
   let nodes = vec![NodeDelta {
      node_id:  NodeId::for_path(vault, path),
      path:     path.to_string(),
      kind:     ChangeKind::Created,
      metadata: Some(meta(path)),
   }];
   BulkUpdateMessage::new(vault.clone(), nodes, batch)
}

async fn wait_for(
   rx: &mut mpsc::UnboundedReceiver<ViewerEvent>,
   pred: impl Fn(&ViewerEvent) -> bool,
) -> ViewerEvent {
   loop {
      let event = time::timeout(Duration::from_secs(60), rx.recv())
         .await
         .expect("viewer event")
         .expect("viewer alive");
      if pred(&event) {
         return event;
      }
   }
}

fn spawn_run(client: &Arc<ViewerClient>, cancel: &CancellationToken) -> JoinHandle<Result<()>> {
   let client = Arc::clone(client);
   let cancel = cancel.clone();
   tokio::spawn(async move { client.run(cancel).await })
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_reconnects() {
   let transport = Arc::new(ScriptedTransport::default());
   let client = ViewerClient::new(vault(), transport.clone(), ReconnectPolicy::default());
   let start = Instant::now();

   let err = client.run(CancellationToken::new()).await.unwrap_err();
   assert!(matches!(err, Error::ConnectionFailed { attempts: 5 }));
   assert_eq!(transport.connects(), 6);
   assert!(start.elapsed() >= Duration::from_secs(15));
   assert!(start.elapsed() < Duration::from_secs(16));
   assert_eq!(client.state(), ConnectionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn reconnect_state_is_observable() {
   let transport = Arc::new(ScriptedTransport::default());
   let policy = ReconnectPolicy { max_attempts: 2, delay: Duration::from_secs(1) };
   let client = Arc::new(ViewerClient::new(vault(), transport, policy));
   let mut states = client.watch_state();
   let cancel = CancellationToken::new();
   let run = spawn_run(&client, &cancel);

   states
      .wait_for(|s| *s == ConnectionState::Reconnecting(2))
      .await
      .unwrap();
   assert!(matches!(run.await.unwrap(), Err(Error::ConnectionFailed { attempts: 2 })));
}

#[tokio::test(start_paused = true)]
async fn malformed_and_unknown_frames_are_ignored() {
   let v = vault();
   let transport = Arc::new(ScriptedTransport::default());
   let tx = transport.add_stream();
   let (events_tx, mut events) = mpsc::unbounded_channel();
   let client = Arc::new(
      ViewerClient::new(v.clone(), transport.clone(), ReconnectPolicy::default()).with_events(events_tx),
   );
   let cancel = CancellationToken::new();
   let run = spawn_run(&client, &cancel);

   tx.send(frame(&connected(&v, false))).unwrap();
   tx.send(Ok(PushFrame { event: "bulk_update".into(), data: "{not json".into() }))
      .unwrap();
   tx.send(Ok(PushFrame { event: "file_created".into(), data: "{}".into() }))
      .unwrap();
   tx.send(frame(&PushEvent::BulkUpdate(created(&v, "a.md", 1))))
      .unwrap();
   tx.send(frame(&PushEvent::Ping { queue_depth: 7 })).unwrap();

   wait_for(&mut events, |e| matches!(e, ViewerEvent::Lag { queue_depth: 7 })).await;
   assert_eq!(client.queue_depth(), 7);
   assert_eq!(client.state(), ConnectionState::Connected);
   assert!(client.session_id().is_some());
   assert!(client.store().lock().get_node_by_path(&v, "a.md").is_some());
   assert_eq!(transport.connects(), 1);

   cancel.cancel();
   run.await.unwrap().unwrap();
   assert_eq!(client.state(), ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn reconnect_discards_tree_and_refetches_root() {
   let v = vault();
   let transport = Arc::new(ScriptedTransport::default());
   let first = transport.add_stream();
   let second = transport.add_stream();
   let listings = Arc::new(StaticListings::default());
   listings.set("", vec![tree_node(&v, "b.md", false)]);

   let (events_tx, mut events) = mpsc::unbounded_channel();
   let client = Arc::new(
      ViewerClient::new(v.clone(), transport.clone(), ReconnectPolicy::default())
         .with_listings(listings)
         .with_events(events_tx),
   );
   let cancel = CancellationToken::new();
   let run = spawn_run(&client, &cancel);

   first.send(frame(&connected(&v, false))).unwrap();
   first
      .send(frame(&PushEvent::BulkUpdate(created(&v, "a.md", 1))))
      .unwrap();
   wait_for(&mut events, |e| matches!(e, ViewerEvent::Applied { .. })).await;
   assert!(client.store().lock().get_node_by_path(&v, "a.md").is_some());

   second.send(frame(&connected(&v, false))).unwrap();
   let dropped_at = Instant::now();
   drop(first);
   let resynced = wait_for(&mut events, |e| matches!(e, ViewerEvent::Resynced { .. })).await;
   assert_eq!(resynced, ViewerEvent::Resynced { root_children: 1 });
   assert!(dropped_at.elapsed() >= Duration::from_secs(3));
   assert_eq!(transport.connects(), 2);

   {
      let store = client.store();
      let store = store.lock();
      assert!(store.get_node_by_path(&v, "a.md").is_none());
      assert!(store.get_node_by_path(&v, "b.md").is_some());
      assert!(store.is_path_walked(&v, ""));
   }
   assert_eq!(client.state(), ConnectionState::Connected);

   cancel.cancel();
   run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn resync_request_clears_vault_tree() {
   let v = vault();
   let transport = Arc::new(ScriptedTransport::default());
   let tx = transport.add_stream();
   let listings = Arc::new(StaticListings::default());
   listings.set("", vec![tree_node(&v, "fresh.md", false)]);
   let (events_tx, mut events) = mpsc::unbounded_channel();
   let client = Arc::new(
      ViewerClient::new(v.clone(), transport, ReconnectPolicy::default())
         .with_listings(listings)
         .with_events(events_tx),
   );
   client.store().lock().register_node(&v, tree_node(&v, "stale.md", false));
   let cancel = CancellationToken::new();
   let run = spawn_run(&client, &cancel);

   tx.send(frame(&connected(&v, true))).unwrap();
   wait_for(&mut events, |e| matches!(e, ViewerEvent::Resynced { .. })).await;
   assert!(client.store().lock().get_node_by_path(&v, "stale.md").is_none());

   client.store().lock().register_node(&v, tree_node(&v, "stale.md", false));
   tx.send(frame(&PushEvent::Resync { vault: VaultId::new("elsewhere") }))
      .unwrap();
   tx.send(frame(&PushEvent::Resync { vault: v.clone() })).unwrap();
   wait_for(&mut events, |e| matches!(e, ViewerEvent::Resynced { .. })).await;
   let store = client.store();
   assert!(store.lock().get_node_by_path(&v, "stale.md").is_none());
   assert!(store.lock().get_node_by_path(&v, "fresh.md").is_some());

   cancel.cancel();
   run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn hub_eviction_leads_to_reconnect_with_new_session() {
   let v = vault();
   let hub = BroadcastHub::new(&Config::default());
   let (events_tx, mut events) = mpsc::unbounded_channel();
   let client = Arc::new(
      ViewerClient::new(v.clone(), Arc::new(HubTransport::new(hub.clone())), ReconnectPolicy::default())
         .with_events(events_tx),
   );
   let cancel = CancellationToken::new();
   let run = spawn_run(&client, &cancel);

   let ViewerEvent::Connected { session_id: first } =
      wait_for(&mut events, |e| matches!(e, ViewerEvent::Connected { .. })).await
   else {
      unreachable!()
   };
   hub.broadcast(created(&v, "x.md", 1)).await;
   wait_for(&mut events, |e| matches!(e, ViewerEvent::Applied { batch_sequence: 1, .. })).await;
   assert!(client.store().lock().get_node_by_path(&v, "x.md").is_some());

   hub.close_vault(&v);
   let ViewerEvent::Connected { session_id: second } =
      wait_for(&mut events, |e| matches!(e, ViewerEvent::Connected { .. })).await
   else {
      unreachable!()
   };
   assert_ne!(first, second);
   assert!(hub.is_subscribed(&v, second));
   assert!(client.store().lock().get_node_by_path(&v, "x.md").is_none());

   cancel.cancel();
   run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn change_before_subscribe_is_picked_up_on_connect() {
   let v = vault();
   let hub = BroadcastHub::new(&Config::default());
   let listings = Arc::new(StaticListings::default());
   listings.set("", vec![tree_node(&v, "a.md", false)]);
   let (events_tx, mut events) = mpsc::unbounded_channel();
   let client = Arc::new(
      ViewerClient::new(v.clone(), Arc::new(HubTransport::new(hub.clone())), ReconnectPolicy::default())
         .with_listings(listings.clone())
         .with_events(events_tx),
   );
   assert_eq!(client.expand("").await.unwrap(), 1);

   // Nobody is subscribed yet, so this update reaches no one.
   listings.set("", vec![tree_node(&v, "a.md", false), tree_node(&v, "b.md", false)]);
   assert_eq!(hub.broadcast(created(&v, "b.md", 1)).await.delivered, 0);

   let cancel = CancellationToken::new();
   let run = spawn_run(&client, &cancel);
   wait_for(&mut events, |e| matches!(e, ViewerEvent::Connected { .. })).await;
   {
      let store = client.store();
      let store = store.lock();
      assert!(store.get_node_by_path(&v, "a.md").is_some());
      assert!(store.get_node_by_path(&v, "b.md").is_some());
   }

   cancel.cancel();
   run.await.unwrap().unwrap();
}

#[tokio::test]
async fn hub_transport_refuses_after_shutdown() {
   let hub = BroadcastHub::new(&Config::default());
   let transport = HubTransport::new(hub.clone());
   assert!(transport.connect(&vault()).await.is_ok());

   hub.shutdown();
   assert!(matches!(transport.connect(&vault()).await, Err(TransportError::Closed(_))));
}
