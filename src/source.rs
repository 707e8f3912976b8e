//! Filesystem change source for a local vault.

use std::path::{Path, PathBuf};

use notify::{
   Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
   event::{ModifyKind, RenameMode},
};

use crate::{
   Result,
   error::Error,
   types::{ChangeKind, RawChangeEvent, VaultId},
};

/// Watches a vault root recursively and pushes raw changes into a sink.
///
/// No ordering or deduplication is promised; renames surface as a deletion
/// of the old path and a creation of the new one.
pub struct LocalChangeSource {
   _watcher: RecommendedWatcher,
   root:     PathBuf,
}

impl LocalChangeSource {
   pub fn start<F>(vault: VaultId, root: &Path, mut sink: F) -> Result<Self>
   where
      F: FnMut(RawChangeEvent) + Send + 'static,
   {
      if !root.is_dir() {
         return Err(Error::InvalidRoot(root.to_path_buf()));
      }
      let root = root.canonicalize()?;
      let watch_root = root.clone();

      let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
         Ok(event) => {
            for raw in translate(&vault, &watch_root, &event) {
               sink(raw);
            }
         },
         Err(e) => tracing::warn!("watch error: {}", e),
      })?;
      watcher.watch(&root, RecursiveMode::Recursive)?;
      tracing::info!("watching {}", root.display());

      Ok(Self { _watcher: watcher, root })
   }

   pub fn root(&self) -> &Path {
      &self.root
   }
}

/// Vault-relative `/`-separated path, or `None` for paths outside the root,
/// the root itself, and hidden entries.
fn relative(root: &Path, path: &Path) -> Option<String> {
   let rel = path.strip_prefix(root).ok()?;
   let mut parts = Vec::new();
   for comp in rel.components() {
      let part = comp.as_os_str().to_str()?;
      if part.starts_with('.') {
         return None;
      }
      parts.push(part);
   }
   (!parts.is_empty()).then(|| parts.join("/"))
}

/// Maps one notify event to raw change events.
pub fn translate(vault: &VaultId, root: &Path, event: &Event) -> Vec<RawChangeEvent> {
   let mk = |path: &PathBuf, kind: ChangeKind| {
      relative(root, path).map(|rel| RawChangeEvent::new(vault.clone(), rel, kind))
   };
   let all = |kind: ChangeKind| -> Vec<RawChangeEvent> {
      event.paths.iter().filter_map(|p| mk(p, kind)).collect()
   };

   match event.kind {
      EventKind::Create(_) => all(ChangeKind::Created),
      EventKind::Remove(_) => all(ChangeKind::Deleted),
      EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
         [mk(&event.paths[0], ChangeKind::Deleted), mk(&event.paths[1], ChangeKind::Created)]
            .into_iter()
            .flatten()
            .collect()
      },
      EventKind::Modify(ModifyKind::Name(RenameMode::From)) => all(ChangeKind::Deleted),
      EventKind::Modify(ModifyKind::Name(RenameMode::To)) => all(ChangeKind::Created),
      EventKind::Modify(ModifyKind::Name(_)) => event
         .paths
         .iter()
         .filter_map(|p| {
            let kind = if p.exists() { ChangeKind::Created } else { ChangeKind::Deleted };
            mk(p, kind)
         })
         .collect(),
      EventKind::Modify(_) => all(ChangeKind::Modified),
      EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
   }
}
