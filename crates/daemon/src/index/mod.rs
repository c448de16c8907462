//! Per-project indexing: the staging/writer pair plus the bookkeeping the
//! dispatcher needs (source infos, diagnostics, begin/end accounting).

mod job;
mod merge;

pub use job::IndexJob;
pub use merge::{IndexWriter, StagedMaps};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use cnav_frontend::FixIt;
use cnav_store::{FileId, Location, PathTable, ProjectStores, SourceInfo, StoreId};

use crate::event::{IndexEvent, ServerEvent};

/// Serialized indexer state inside the per-project blob.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct IndexerSnapshot {
  pub sources: Vec<(FileId, SourceInfo)>,
}

#[derive(Default)]
struct Meta {
  /// Compile command per file, compared structurally to skip clean files.
  sources: HashMap<FileId, SourceInfo>,
  /// Formatted diagnostic lines per file; in-memory only.
  diagnostics: HashMap<FileId, Vec<String>>,
  fix_its: HashMap<FileId, Vec<FixIt>>,
  /// Files whose stored command must be re-run regardless of equality.
  dirty: std::collections::HashSet<FileId>,
  in_flight: usize,
  batch_sources: usize,
}

/// One project's indexer: producers feed the writer, the dispatcher reads
/// the bookkeeping.
pub struct Indexer {
  project: PathBuf,
  stores: Arc<ProjectStores>,
  writer: IndexWriter,
  meta: Mutex<Meta>,
  events: UnboundedSender<ServerEvent>,
}

impl Indexer {
  pub fn new(project: PathBuf, stores: Arc<ProjectStores>, events: UnboundedSender<ServerEvent>) -> Arc<Self> {
    let writer = IndexWriter::spawn(project.clone(), Arc::clone(&stores), events.clone());
    Arc::new(Self {
      project,
      stores,
      writer,
      meta: Mutex::new(Meta::default()),
      events,
    })
  }

  pub fn stores(&self) -> &Arc<ProjectStores> {
    &self.stores
  }

  pub fn writer(&self) -> &IndexWriter {
    &self.writer
  }

  // --------------------------------------------------------------------
  // Batch accounting
  // --------------------------------------------------------------------

  pub fn begin_makefile(&self) {
    self.meta.lock().batch_sources = 0;
  }

  pub fn end_makefile(&self) -> usize {
    self.meta.lock().batch_sources
  }

  /// Called when a parse job is scheduled. Emits `JobStarted` on the idle
  /// to busy transition, which disarms the persistence timer.
  pub fn job_started(&self, path: &Path) {
    let mut meta = self.meta.lock();
    meta.batch_sources += 1;
    meta.in_flight += 1;
    if meta.in_flight == 1 {
      let _ = self.events.send(ServerEvent::Index(IndexEvent::JobStarted {
        project: self.project.clone(),
        path: path.to_path_buf(),
      }));
    }
  }

  pub fn job_finished(&self) {
    let mut meta = self.meta.lock();
    meta.in_flight = meta.in_flight.saturating_sub(1);
  }

  // --------------------------------------------------------------------
  // Sources
  // --------------------------------------------------------------------

  pub fn source_info(&self, file: FileId) -> Option<SourceInfo> {
    self.meta.lock().sources.get(&file).cloned()
  }

  pub fn set_source_info(&self, file: FileId, source: SourceInfo) {
    let mut meta = self.meta.lock();
    meta.dirty.remove(&file);
    meta.sources.insert(file, source);
  }

  /// A source is clean when its stored command equals the incoming one and
  /// nobody dirtied it since.
  pub fn is_clean(&self, file: FileId, source: &SourceInfo) -> bool {
    let meta = self.meta.lock();
    !meta.dirty.contains(&file) && meta.sources.get(&file) == Some(source)
  }

  pub fn is_indexed(&self, file: FileId) -> bool {
    if self.meta.lock().sources.contains_key(&file) {
      return true;
    }
    self
      .stores
      .get::<cnav_store::FileInformation>(StoreId::FileInformation, &Location::file_prefix(file))
      .ok()
      .flatten()
      .is_some()
  }

  pub fn source_count(&self) -> usize {
    self.meta.lock().sources.len()
  }

  /// Mark every stored source matching `pattern` dirty and hand back its
  /// compile command for rescheduling.
  pub fn reindex(&self, pattern: &str, use_regex: bool, paths: &PathTable) -> Vec<(FileId, SourceInfo)> {
    let regex = if use_regex { Regex::new(pattern).ok() } else { None };
    let mut meta = self.meta.lock();
    let mut matched = Vec::new();
    for (&file, source) in &meta.sources {
      let Some(path) = paths.path_of(file) else { continue };
      let text = path.to_string_lossy();
      let hit = match &regex {
        Some(regex) => regex.is_match(&text),
        None => pattern.is_empty() || text.contains(pattern),
      };
      if hit {
        matched.push((file, source.clone()));
      }
    }
    for (file, _) in &matched {
      meta.dirty.insert(*file);
    }
    debug!(pattern, count = matched.len(), "marked files dirty");
    matched
  }

  // --------------------------------------------------------------------
  // Diagnostics & fix-its
  // --------------------------------------------------------------------

  pub fn set_diagnostics(&self, file: FileId, lines: Vec<String>) {
    self.meta.lock().diagnostics.insert(file, lines);
  }

  pub fn set_fix_its(&self, file: FileId, fix_its: Vec<FixIt>) {
    self.meta.lock().fix_its.insert(file, fix_its);
  }

  /// Fix-it hints for one file, one `offset length replacement` per line.
  pub fn fix_its(&self, file: FileId) -> String {
    let meta = self.meta.lock();
    meta
      .fix_its
      .get(&file)
      .map(|hints| {
        hints
          .iter()
          .map(|h| format!("{} {} {}", h.offset, h.length, h.text))
          .collect::<Vec<_>>()
          .join("\n")
      })
      .unwrap_or_default()
  }

  /// Diagnostics for one file, or for every file when `file` is `None`.
  pub fn errors(&self, file: Option<FileId>) -> String {
    let meta = self.meta.lock();
    match file {
      Some(file) => meta.diagnostics.get(&file).map(|l| l.join("\n")).unwrap_or_default(),
      None => {
        let mut all: Vec<&String> = meta.diagnostics.values().flatten().collect();
        all.sort();
        all.iter().map(|s| s.as_str()).collect::<Vec<_>>().join("\n")
      }
    }
  }

  // --------------------------------------------------------------------
  // Persistence
  // --------------------------------------------------------------------

  pub fn snapshot(&self) -> IndexerSnapshot {
    let meta = self.meta.lock();
    let mut sources: Vec<(FileId, SourceInfo)> = meta.sources.iter().map(|(k, v)| (*k, v.clone())).collect();
    sources.sort_by_key(|(k, _)| *k);
    IndexerSnapshot { sources }
  }

  pub fn restore_snapshot(&self, snapshot: IndexerSnapshot) {
    let mut meta = self.meta.lock();
    meta.sources = snapshot.sources.into_iter().collect();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn setup() -> (tempfile::TempDir, Arc<Indexer>, tokio::sync::mpsc::UnboundedReceiver<ServerEvent>) {
    let dir = tempfile::tempdir().unwrap();
    let stores = Arc::new(ProjectStores::open(&dir.path().join("index.redb")).unwrap());
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let indexer = Indexer::new(PathBuf::from("/proj/Makefile"), stores, tx);
    (dir, indexer, rx)
  }

  fn source(path: &str) -> SourceInfo {
    SourceInfo {
      source_file: path.into(),
      compiler: "/usr/bin/cc".into(),
      args: vec!["-I/proj".into()],
    }
  }

  #[test]
  fn test_clean_check_uses_structural_equality() {
    let (_dir, indexer, _rx) = setup();
    indexer.set_source_info(1, source("/proj/a.c"));
    assert!(indexer.is_clean(1, &source("/proj/a.c")));

    let mut changed = source("/proj/a.c");
    changed.args.push("-DX".into());
    assert!(!indexer.is_clean(1, &changed));
    assert!(!indexer.is_clean(2, &source("/proj/b.c")));
  }

  #[test]
  fn test_reindex_marks_dirty() {
    let (_dir, indexer, _rx) = setup();
    let paths = PathTable::new();
    let a = paths.intern(Path::new("/proj/a.c"));
    let b = paths.intern(Path::new("/proj/sub/b.c"));
    indexer.set_source_info(a, source("/proj/a.c"));
    indexer.set_source_info(b, source("/proj/sub/b.c"));

    let matched = indexer.reindex("sub", false, &paths);
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].0, b);
    // Dirty files stop being clean even with an equal command.
    assert!(!indexer.is_clean(b, &source("/proj/sub/b.c")));
    assert!(indexer.is_clean(a, &source("/proj/a.c")));
  }

  #[test]
  fn test_job_started_fires_on_idle_transition_only() {
    let (_dir, indexer, mut rx) = setup();
    indexer.begin_makefile();
    indexer.job_started(Path::new("/proj/a.c"));
    indexer.job_started(Path::new("/proj/b.c"));
    assert_eq!(indexer.end_makefile(), 2);

    let mut started = 0;
    while let Ok(event) = rx.try_recv() {
      if matches!(event, ServerEvent::Index(IndexEvent::JobStarted { .. })) {
        started += 1;
      }
    }
    assert_eq!(started, 1);

    // Draining back to idle re-arms the transition.
    indexer.job_finished();
    indexer.job_finished();
    indexer.job_started(Path::new("/proj/c.c"));
    let mut started = 0;
    while let Ok(event) = rx.try_recv() {
      if matches!(event, ServerEvent::Index(IndexEvent::JobStarted { .. })) {
        started += 1;
      }
    }
    assert_eq!(started, 1);
  }

  #[test]
  fn test_snapshot_roundtrip() {
    let (_dir, indexer, _rx) = setup();
    indexer.set_source_info(1, source("/proj/a.c"));
    indexer.set_source_info(2, source("/proj/b.c"));
    let snapshot = indexer.snapshot();

    let (_dir2, other, _rx2) = setup();
    other.restore_snapshot(snapshot);
    assert_eq!(other.source_info(1), Some(source("/proj/a.c")));
    assert_eq!(other.source_count(), 2);
  }
}
