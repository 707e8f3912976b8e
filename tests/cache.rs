mod support;

use std::{
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use support::{MemoryStorage, meta, vault};
use tempfile::TempDir;
use tokio::sync::Notify;
use vaultsync::{
   cache::MetadataCache,
   config::Config,
   extract::MarkdownExtractor,
   storage::{ListingEntry, LocalVaultStorage, VaultReader},
   types::VaultId,
};

fn entry(path: &str) -> ListingEntry {
   ListingEntry { path: path.to_string(), is_directory: false, size: 0, modified: None }
}

async fn seed(cache: &MetadataCache, vault: &VaultId) {
   for dir in ["", "notes", "notes/deep", "other"] {
      cache
         .listing_or_load(vault, dir, async { Ok(vec![entry("x")]) })
         .await
         .unwrap();
   }
   cache
      .metadata_or_load(vault, "notes/deep/a.md", async { Ok(Some(meta("a"))) })
      .await
      .unwrap();
   cache
      .metadata_or_load(vault, "other/b.md", async { Ok(Some(meta("b"))) })
      .await
      .unwrap();
}

#[tokio::test]
async fn change_invalidates_path_and_ancestor_listings() {
   let v = vault();
   let cache = MetadataCache::new(&Config::default());
   seed(&cache, &v).await;

   cache.invalidate_path(&v, "notes/deep/a.md").await;

   assert!(cache.cached_metadata(&v, "notes/deep/a.md").await.is_none());
   for dir in ["", "notes", "notes/deep"] {
      assert!(cache.cached_listing(&v, dir).await.is_none(), "listing of {dir:?} survived");
   }
   assert!(cache.cached_listing(&v, "other").await.is_some());
   assert_eq!(cache.cached_metadata(&v, "other/b.md").await, Some(Some(meta("b"))));
}

#[tokio::test]
async fn directory_change_drops_its_own_listing() {
   let v = vault();
   let cache = MetadataCache::new(&Config::default());
   seed(&cache, &v).await;

   cache.invalidate_path(&v, "other").await;
   assert!(cache.cached_listing(&v, "other").await.is_none());
   assert!(cache.cached_listing(&v, "").await.is_none());
   assert!(cache.cached_listing(&v, "notes").await.is_some());
}

#[tokio::test]
async fn invalidation_during_load_is_not_cached() {
   let v = vault();
   let cache = MetadataCache::new(&Config::default());
   let gate = Arc::new(Notify::new());
   let started = Arc::new(AtomicBool::new(false));

   let load = tokio::spawn({
      let (cache, v, gate, started) = (cache.clone(), v.clone(), gate.clone(), started.clone());
      async move {
         cache
            .metadata_or_load(&v, "a.md", async move {
               started.store(true, Ordering::SeqCst);
               gate.notified().await;
               Ok(Some(meta("old")))
            })
            .await
      }
   });
   while !started.load(Ordering::SeqCst) {
      tokio::task::yield_now().await;
   }

   cache.invalidate_path(&v, "a.md").await;
   gate.notify_one();

   assert_eq!(load.await.unwrap().unwrap(), Some(meta("old")));
   assert!(cache.cached_metadata(&v, "a.md").await.is_none());

   let fresh = cache
      .metadata_or_load(&v, "a.md", async { Ok(Some(meta("new"))) })
      .await
      .unwrap();
   assert_eq!(fresh, Some(meta("new")));
   assert_eq!(cache.cached_metadata(&v, "a.md").await, Some(Some(meta("new"))));
}

#[tokio::test]
async fn vault_invalidation_is_scoped() {
   let a = VaultId::new("a");
   let b = VaultId::new("b");
   let cache = MetadataCache::new(&Config::default());
   seed(&cache, &a).await;
   seed(&cache, &b).await;

   cache.invalidate_vault(&a);
   cache.run_pending_tasks().await;

   assert!(cache.cached_listing(&a, "notes").await.is_none());
   assert!(cache.cached_listing(&b, "notes").await.is_some());
}

#[tokio::test]
async fn absent_files_are_cached_as_none() {
   let v = vault();
   let cache = MetadataCache::new(&Config::default());
   let meta = cache
      .metadata_or_load(&v, "missing.md", async { Ok(None) })
      .await
      .unwrap();
   assert_eq!(meta, None);
   assert_eq!(cache.cached_metadata(&v, "missing.md").await, Some(None));
}

#[tokio::test]
async fn entries_expire_after_ttl() {
   let v = vault();
   let cache = MetadataCache::new(&Config { cache_ttl_secs: 1, ..Config::default() });
   seed(&cache, &v).await;
   assert!(cache.cached_listing(&v, "notes").await.is_some());

   tokio::time::sleep(Duration::from_millis(1200)).await;
   assert!(cache.cached_listing(&v, "notes").await.is_none());
}

#[tokio::test]
async fn reader_serves_stale_listing_until_invalidated() {
   let v = vault();
   let dir = TempDir::new().unwrap();
   std::fs::create_dir(dir.path().join("notes")).unwrap();
   std::fs::write(dir.path().join("notes/a.md"), "# Alpha\n#tag").unwrap();

   let cache = MetadataCache::new(&Config::default());
   let reader = VaultReader::new(
      v.clone(),
      Arc::new(LocalVaultStorage::new(dir.path()).unwrap()),
      Arc::new(MarkdownExtractor::default()),
      cache.clone(),
   );

   let first = reader.list_directory("notes").await.unwrap();
   assert_eq!(first.len(), 1);
   let a = first[0].metadata.as_ref().unwrap();
   assert_eq!(a.title.as_deref(), Some("Alpha"));
   assert_eq!(a.tags, vec!["tag"]);

   std::fs::write(dir.path().join("notes/b.md"), "# Beta").unwrap();
   assert_eq!(reader.list_directory("notes").await.unwrap().len(), 1);

   cache.invalidate_path(&v, "notes/b.md").await;
   let fresh = reader.list_directory("notes").await.unwrap();
   let paths: Vec<_> = fresh.iter().map(|n| n.path.as_str()).collect();
   assert_eq!(paths, vec!["notes/a.md", "notes/b.md"]);
   assert_eq!(fresh[1].parent_id, Some(vaultsync::types::NodeId::for_path(&v, "notes")));
}

#[tokio::test]
async fn reader_lists_directories_with_directory_metadata() {
   let v = vault();
   let storage = MemoryStorage::new();
   storage.mkdir("notes");
   storage.write("readme.md", "# Readme");
   let reader = VaultReader::new(
      v,
      storage,
      Arc::new(MarkdownExtractor::default()),
      MetadataCache::new(&Config::default()),
   );

   let root = reader.list_directory("").await.unwrap();
   let notes = root.iter().find(|n| n.path == "notes").unwrap();
   assert!(notes.is_directory);
   assert!(notes.metadata.as_ref().unwrap().is_directory);
   let readme = root.iter().find(|n| n.path == "readme.md").unwrap();
   assert_eq!(readme.metadata.as_ref().unwrap().title.as_deref(), Some("Readme"));
   assert_eq!(readme.parent_id, None);
}
