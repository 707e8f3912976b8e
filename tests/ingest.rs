mod support;

use std::{
   sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
   },
   time::Duration,
};

use support::{MemoryStorage, vault};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vaultsync::{
   config::Config,
   extract::MarkdownExtractor,
   hub::{BroadcastHub, PushEvent, SessionState},
   ingest::{Backpressure, IngestPool, OverflowHook},
   types::{ChangeKind, NormalizedChangeEvent, RawChangeEvent, VaultId},
};

fn noop_hook() -> OverflowHook {
   Arc::new(|_: &VaultId, _: Backpressure| {})
}

async fn collect(
   rx: &mut mpsc::UnboundedReceiver<NormalizedChangeEvent>,
   n: usize,
) -> Vec<NormalizedChangeEvent> {
   let mut out = Vec::with_capacity(n);
   for _ in 0..n {
      let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
         .await
         .expect("ingest output")
         .expect("channel open");
      out.push(event);
   }
   out.sort_by_key(|e| e.sequence);
   out
}

#[tokio::test]
async fn sequences_follow_enqueue_order() {
   let v = vault();
   let storage = MemoryStorage::new();
   storage.write("a.md", "# A");
   storage.write("b.md", "# B");
   let (tx, mut rx) = mpsc::unbounded_channel();
   let cancel = CancellationToken::new();
   let pool = IngestPool::spawn(
      v.clone(),
      &Config { ingest_workers: 4, ..Config::default() },
      storage,
      Arc::new(MarkdownExtractor::default()),
      vec![tx],
      noop_hook(),
      &cancel,
   );
   let queue = pool.queue();

   let seqs: Vec<_> = ["a.md", "b.md", "a.md"]
      .iter()
      .map(|p| {
         queue
            .enqueue(RawChangeEvent::new(v.clone(), *p, ChangeKind::Modified))
            .unwrap()
      })
      .collect();
   assert_eq!(seqs, vec![Some(1), Some(2), Some(3)]);

   let events = collect(&mut rx, 3).await;
   let paths: Vec<_> = events.iter().map(|e| (e.sequence, e.path())).collect();
   assert_eq!(paths, vec![(1, "a.md"), (2, "b.md"), (3, "a.md")]);
   assert_eq!(events[1].metadata.as_ref().unwrap().title.as_deref(), Some("B"));

   cancel.cancel();
   pool.join().await;
}

#[tokio::test]
async fn full_queue_flags_resync_until_the_burst_ends() {
   let v = vault();
   let hub = BroadcastHub::new(&Config::default());
   let mut viewer = hub.subscribe(&v);
   assert!(matches!(viewer.recv().await, Some(PushEvent::Connected { needs_resync: false, .. })));

   let calls = Arc::new(AtomicUsize::new(0));
   let hook: OverflowHook = {
      let hub = hub.clone();
      let calls = Arc::clone(&calls);
      Arc::new(move |vault: &VaultId, edge: Backpressure| {
         calls.fetch_add(1, Ordering::SeqCst);
         match edge {
            Backpressure::Overflowed => hub.flag_resync(vault),
            Backpressure::Recovered => hub.clear_resync(vault),
         }
      })
   };

   let (tx, _rx) = mpsc::unbounded_channel();
   let cancel = CancellationToken::new();
   let pool = IngestPool::spawn(
      v.clone(),
      &Config { ingest_workers: 1, ingest_queue_capacity: 2, ..Config::default() },
      MemoryStorage::new(),
      Arc::new(MarkdownExtractor::default()),
      vec![tx],
      hook,
      &cancel,
   );
   let queue = pool.queue();
   let raw = |p: &str| RawChangeEvent::new(v.clone(), p, ChangeKind::Created);

   // Workers have not run yet: the third and fourth events find the queue full.
   assert_eq!(queue.enqueue(raw("1.md")).unwrap(), Some(1));
   assert_eq!(queue.enqueue(raw("2.md")).unwrap(), Some(2));
   assert_eq!(queue.enqueue(raw("3.md")).unwrap(), None);
   assert_eq!(queue.enqueue(raw("4.md")).unwrap(), None);

   let stats = queue.stats();
   assert_eq!(stats.enqueued, 2);
   assert_eq!(stats.dropped, 2);
   assert_eq!(calls.load(Ordering::SeqCst), 1);
   assert!(hub.needs_resync(&v));
   assert_eq!(viewer.recv().await, Some(PushEvent::Resync { vault: v.clone() }));

   let mut late = hub.subscribe(&v);
   assert_eq!(late.session().state(), SessionState::Active);
   assert!(matches!(late.recv().await, Some(PushEvent::Connected { needs_resync: true, .. })));

   while !queue.is_empty() {
      tokio::task::yield_now().await;
   }
   assert_eq!(queue.enqueue(raw("5.md")).unwrap(), Some(3));
   assert_eq!(calls.load(Ordering::SeqCst), 2);
   assert!(!hub.needs_resync(&v));
   let mut after = hub.subscribe(&v);
   assert!(matches!(after.recv().await, Some(PushEvent::Connected { needs_resync: false, .. })));

   cancel.cancel();
   pool.join().await;
}

#[tokio::test]
async fn unreadable_content_becomes_deletion() {
   let v = vault();
   let storage = MemoryStorage::new();
   storage.write("good.md", "---\ntitle: Good\ntags: [a, b]\n---\nbody #c [[other]]");
   storage.write("binary.md", vec![0xff, 0xfe, 0x00]);
   storage.write("broken.md", "---\ntitle: never closed\n");
   storage.mkdir("folder");
   let (tx, mut rx) = mpsc::unbounded_channel();
   let cancel = CancellationToken::new();
   let pool = IngestPool::spawn(
      v.clone(),
      &Config::default(),
      storage,
      Arc::new(MarkdownExtractor::default()),
      vec![tx],
      noop_hook(),
      &cancel,
   );
   let queue = pool.queue();
   for (path, kind) in [
      ("good.md", ChangeKind::Created),
      ("binary.md", ChangeKind::Modified),
      ("broken.md", ChangeKind::Created),
      ("gone.md", ChangeKind::Modified),
      ("folder", ChangeKind::Created),
      ("old.md", ChangeKind::Deleted),
   ] {
      queue.enqueue(RawChangeEvent::new(v.clone(), path, kind)).unwrap();
   }

   let events = collect(&mut rx, 6).await;
   let good = &events[0];
   assert_eq!(good.kind(), ChangeKind::Created);
   let meta = good.metadata.as_ref().unwrap();
   assert_eq!(meta.title.as_deref(), Some("Good"));
   assert_eq!(meta.tags, vec!["a", "b", "c"]);
   assert_eq!(meta.links, vec!["other"]);

   for downgraded in &events[1..4] {
      assert_eq!(downgraded.kind(), ChangeKind::Deleted, "{}", downgraded.path());
      assert!(downgraded.metadata.is_none());
   }

   let folder = &events[4];
   assert_eq!(folder.kind(), ChangeKind::Created);
   assert!(folder.metadata.as_ref().unwrap().is_directory);

   assert_eq!(events[5].kind(), ChangeKind::Deleted);
   assert_eq!(queue.stats().downgraded, 3);

   cancel.cancel();
   pool.join().await;
}

#[tokio::test]
async fn every_output_receives_each_event() {
   let v = vault();
   let storage = MemoryStorage::new();
   storage.write("a.md", "# A");
   let (tx1, mut rx1) = mpsc::unbounded_channel();
   let (tx2, mut rx2) = mpsc::unbounded_channel();
   let cancel = CancellationToken::new();
   let pool = IngestPool::spawn(
      v.clone(),
      &Config::default(),
      storage,
      Arc::new(MarkdownExtractor::default()),
      vec![tx1, tx2],
      noop_hook(),
      &cancel,
   );
   pool
      .queue()
      .enqueue(RawChangeEvent::new(v.clone(), "a.md", ChangeKind::Created))
      .unwrap();

   let a = collect(&mut rx1, 1).await;
   let b = collect(&mut rx2, 1).await;
   assert_eq!(a, b);

   cancel.cancel();
   pool.join().await;
}
