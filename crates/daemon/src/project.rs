//! A registered project: file manager, indexer handle, source root.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ignore::WalkBuilder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use cnav_ipc::ProjectKind;
use cnav_store::ProjectStores;

use crate::{
  event::ServerEvent,
  index::{Indexer, IndexerSnapshot},
};

// ============================================================================
// FileManager
// ============================================================================

/// The set of files a project spans, populated by walking the source root.
#[derive(Default)]
pub struct FileManager {
  root: Option<PathBuf>,
  files: BTreeSet<PathBuf>,
}

impl FileManager {
  /// Walk `root` and adopt every file under it (gitignore respected).
  pub fn init(&mut self, root: &Path) {
    self.root = Some(root.to_path_buf());
    self.files.clear();
    for entry in WalkBuilder::new(root).build().flatten() {
      if entry.file_type().is_some_and(|t| t.is_file()) {
        self.files.insert(entry.into_path());
      }
    }
    debug!(root = %root.display(), files = self.files.len(), "file manager populated");
  }

  /// True for a managed file, or for a directory some managed file sits in.
  pub fn contains(&self, path: &Path) -> bool {
    if self.files.contains(path) {
      return true;
    }
    self.files.iter().any(|f| f.starts_with(path))
  }

  /// Managed files matching `pattern` (substring, or regex when given).
  pub fn matching(&self, pattern: &str, regex: Option<&Regex>) -> Vec<PathBuf> {
    self
      .files
      .iter()
      .filter(|f| {
        let text = f.to_string_lossy();
        match regex {
          Some(regex) => regex.is_match(&text),
          None => pattern.is_empty() || text.contains(pattern),
        }
      })
      .cloned()
      .collect()
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty()
  }

  pub fn len(&self) -> usize {
    self.files.len()
  }

  fn snapshot(&self) -> Vec<PathBuf> {
    self.files.iter().cloned().collect()
  }

  fn restore(&mut self, root: Option<PathBuf>, files: Vec<PathBuf>) {
    self.root = root;
    self.files = files.into_iter().collect();
  }

  pub fn clear(&mut self) {
    self.root = None;
    self.files.clear();
  }
}

// ============================================================================
// Project
// ============================================================================

/// Serialized project state inside the per-project blob.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProjectSnapshot {
  pub src_root: Option<PathBuf>,
  pub files: Vec<PathBuf>,
  pub indexer: IndexerSnapshot,
}

pub struct Project {
  pub kind: ProjectKind,
  /// Registry key: the makefile path or the project directory.
  pub path: PathBuf,
  src_root: Option<PathBuf>,
  resolved_src_root: Option<PathBuf>,
  pub file_manager: FileManager,
  pub indexer: Option<Arc<Indexer>>,
  /// A restore is attempted once, on the first ingestion after startup.
  pub restore_attempted: bool,
}

impl Project {
  pub fn new(kind: ProjectKind, path: PathBuf) -> Self {
    Self {
      kind,
      path,
      src_root: None,
      resolved_src_root: None,
      file_manager: FileManager::default(),
      indexer: None,
      restore_attempted: false,
    }
  }

  /// Valid once a source root is known.
  pub fn is_valid(&self) -> bool {
    self.src_root.is_some()
  }

  pub fn src_root(&self) -> Option<&Path> {
    self.src_root.as_deref()
  }

  pub fn resolved_src_root(&self) -> Option<&Path> {
    self.resolved_src_root.as_deref()
  }

  /// Adopt a source root and bring up the indexer. Called at most once per
  /// registration; the root never changes until [`Project::unload`].
  pub fn init(&mut self, src_root: &Path, store_path: &Path, events: UnboundedSender<ServerEvent>) {
    if self.is_valid() {
      warn!(project = %self.path.display(), "init on an already-valid project ignored");
      return;
    }
    self.src_root = Some(src_root.to_path_buf());
    self.resolved_src_root = src_root.canonicalize().ok().filter(|p| p != src_root);

    match ProjectStores::open(store_path) {
      Ok(stores) => {
        self.indexer = Some(Indexer::new(self.path.clone(), Arc::new(stores), events));
      }
      Err(e) => {
        warn!(project = %self.path.display(), error = %e, "cannot open project stores");
      }
    }
    self.file_manager.init(src_root);
    info!(project = %self.path.display(), src_root = %src_root.display(), "project initialized");
  }

  pub fn is_indexed(&self, file: cnav_store::FileId) -> bool {
    self.indexer.as_ref().is_some_and(|indexer| indexer.is_indexed(file))
  }

  /// Release the indexer and file manager; the registry entry remains
  /// until explicit removal.
  pub fn unload(&mut self) {
    if let Some(indexer) = self.indexer.take() {
      indexer.writer().stop();
    }
    self.file_manager.clear();
    self.src_root = None;
    self.resolved_src_root = None;
    self.restore_attempted = false;
    info!(project = %self.path.display(), "project unloaded");
  }

  pub fn snapshot(&self) -> ProjectSnapshot {
    ProjectSnapshot {
      src_root: self.src_root.clone(),
      files: self.file_manager.snapshot(),
      indexer: self.indexer.as_ref().map(|i| i.snapshot()).unwrap_or_default(),
    }
  }

  /// Apply a restored snapshot. The source root stays as discovered; only
  /// the file set and the indexer's source table are adopted.
  pub fn restore(&mut self, snapshot: ProjectSnapshot) {
    self.file_manager.restore(self.src_root.clone(), snapshot.files);
    if let Some(indexer) = &self.indexer {
      indexer.restore_snapshot(snapshot.indexer);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn events() -> UnboundedSender<ServerEvent> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    // Watcher threads outlive the test; leak the receiver so sends keep
    // succeeding.
    std::mem::forget(rx);
    tx
  }

  #[test]
  fn test_src_root_set_once_until_unload() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    let other = dir.path().join("other");
    std::fs::create_dir_all(&other).unwrap();

    let mut project = Project::new(ProjectKind::Makefile, dir.path().join("Makefile"));
    assert!(!project.is_valid());

    project.init(&src, &dir.path().join("db.redb"), events());
    assert!(project.is_valid());
    assert_eq!(project.src_root(), Some(src.as_path()));

    // A second init must not change the root.
    project.init(&other, &dir.path().join("db2.redb"), events());
    assert_eq!(project.src_root(), Some(src.as_path()));

    project.unload();
    assert!(!project.is_valid());
    assert_eq!(project.src_root(), None);
    assert!(project.indexer.is_none());
  }

  #[test]
  fn test_file_manager_contains_files_and_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let sub = dir.path().join("sub");
    std::fs::create_dir_all(&sub).unwrap();
    std::fs::write(sub.join("a.c"), "int x;\n").unwrap();

    let mut fm = FileManager::default();
    fm.init(dir.path());
    assert!(fm.contains(&sub.join("a.c")));
    assert!(fm.contains(&sub));
    assert!(!fm.contains(&dir.path().join("absent.c")));
  }

  #[test]
  fn test_project_snapshot_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("a.c"), "int x;\n").unwrap();

    let mut project = Project::new(ProjectKind::Makefile, dir.path().join("Makefile"));
    project.init(&src, &dir.path().join("db.redb"), events());
    let snapshot = project.snapshot();
    assert!(snapshot.files.iter().any(|f| f.ends_with("a.c")));

    let mut restored = Project::new(ProjectKind::Makefile, dir.path().join("Makefile"));
    restored.init(&src, &dir.path().join("db2.redb"), events());
    restored.restore(project.snapshot());
    assert!(restored.file_manager.contains(&src.join("a.c")));
  }
}
