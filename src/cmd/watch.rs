//! Watch command.
//!
//! Runs the full pipeline over a local vault directory with one in-process
//! viewer attached, and prints what the viewer receives.

use std::{path::PathBuf, sync::Arc};

use console::style;
use tokio::{signal, sync::mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
   Result,
   config::Config,
   error::Error,
   extract::MarkdownExtractor,
   index::MemoryIndex,
   pipeline::SyncService,
   source::LocalChangeSource,
   storage::LocalVaultStorage,
   types::{RawChangeEvent, VaultId},
   viewer::{HubTransport, ReconnectPolicy, ViewerClient, ViewerEvent},
};

fn default_vault_name(root: &std::path::Path) -> String {
   root
      .file_name()
      .and_then(|n| n.to_str())
      .map_or_else(|| "default".to_string(), str::to_string)
}

fn print_event(vault: &VaultId, event: &ViewerEvent) {
   match event {
      ViewerEvent::Connected { session_id } => {
         println!("{} {} session {}", style("●").green(), vault, style(session_id).dim());
      },
      ViewerEvent::Applied { batch_sequence, outcome } => {
         println!(
            "{} batch {}: +{} ~{} -{} ({} skipped)",
            style("↻").cyan(),
            batch_sequence,
            outcome.inserted,
            outcome.updated,
            outcome.removed,
            outcome.skipped
         );
      },
      ViewerEvent::Resynced { root_children } => {
         println!("{} resynced, {} root entries", style("!").yellow(), root_children);
      },
      ViewerEvent::Lag { queue_depth } => {
         if *queue_depth > 0 {
            println!("{} sync lag: {} queued", style("…").dim(), queue_depth);
         }
      },
   }
}

/// Executes the watch command until interrupted.
pub async fn execute(root: PathBuf, vault: Option<String>) -> Result<()> {
   if !root.is_dir() {
      return Err(Error::InvalidRoot(root));
   }
   let root = root.canonicalize()?;
   let cfg = Config::load_with_root(Some(&root))?;
   let vault = VaultId::new(vault.unwrap_or_else(|| default_vault_name(&root)));

   let index = Arc::new(MemoryIndex::new());
   let extractor = Arc::new(MarkdownExtractor::new(cfg.max_extract_bytes));
   let service = Arc::new(SyncService::new(cfg.clone(), index.clone(), extractor));
   service.open_vault(&vault, Arc::new(LocalVaultStorage::new(&root)?));

   let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<RawChangeEvent>();
   let _source = LocalChangeSource::start(vault.clone(), &root, move |raw| {
      let _ = raw_tx.send(raw);
   })?;

   let forward_service = Arc::clone(&service);
   let forward = tokio::spawn(async move {
      while let Some(raw) = raw_rx.recv().await {
         if let Err(e) = forward_service.submit(raw).await {
            tracing::warn!("submit failed: {}", e);
         }
      }
   });

   let (event_tx, mut event_rx) = mpsc::unbounded_channel();
   let viewer = Arc::new(
      ViewerClient::new(
         vault.clone(),
         Arc::new(HubTransport::new(service.hub().clone())),
         ReconnectPolicy::from_config(&cfg),
      )
      .with_listings(Arc::new(service.reader(&vault)?))
      .with_events(event_tx),
   );
   println!("{} {} at {}", style("Watching").green().bold(), vault, root.display());

   let cancel = CancellationToken::new();
   let run_viewer = Arc::clone(&viewer);
   let run_cancel = cancel.clone();
   let viewer_task = tokio::spawn(async move { run_viewer.run(run_cancel).await });

   loop {
      tokio::select! {
         _ = signal::ctrl_c() => {
            println!("\n{}", style("Shutting down...").yellow());
            break;
         },
         event = event_rx.recv() => match event {
            Some(event) => print_event(&vault, &event),
            None => break,
         },
      }
   }

   cancel.cancel();
   service.shutdown().await;
   forward.abort();
   let viewer_result = viewer_task.await.map_err(|e| Error::Io(std::io::Error::other(e)))?;

   let store = viewer.store();
   let known = store.lock().node_count(&vault);
   println!(
      "{} ({} nodes known to viewer, {} documents indexed)",
      style("Stopped").green(),
      known,
      index.len()
   );
   viewer_result
}
