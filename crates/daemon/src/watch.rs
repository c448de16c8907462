//! The makefile watcher.
//!
//! Watches registered makefile paths and posts a `MakefileModified` event
//! when one changes; the dispatcher re-runs that makefile's ingestion with
//! its recorded arguments. Removal events are deliberately ignored.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::event::ServerEvent;

pub struct MakefileWatcher {
  watcher: Option<RecommendedWatcher>,
  watched: HashSet<PathBuf>,
}

impl MakefileWatcher {
  /// The notify callback runs on its own thread; it bridges into the event
  /// loop with a plain channel send.
  pub fn new(events: UnboundedSender<ServerEvent>) -> Self {
    let watcher = notify::recommended_watcher(move |result: Result<Event, notify::Error>| match result {
      Ok(event) => {
        if matches!(event.kind, EventKind::Modify(_)) {
          for path in event.paths {
            let _ = events.send(ServerEvent::MakefileModified { path });
          }
        }
        // Remove events: ignored for now; the project stays registered.
      }
      Err(e) => warn!(error = %e, "watcher error"),
    });

    match watcher {
      Ok(watcher) => Self {
        watcher: Some(watcher),
        watched: HashSet::new(),
      },
      Err(e) => {
        warn!(error = %e, "cannot create file watcher, makefile changes will not retrigger");
        Self {
          watcher: None,
          watched: HashSet::new(),
        }
      }
    }
  }

  pub fn watch(&mut self, path: &Path) {
    if !self.watched.insert(path.to_path_buf()) {
      return;
    }
    if let Some(watcher) = &mut self.watcher {
      if let Err(e) = watcher.watch(path, RecursiveMode::NonRecursive) {
        warn!(path = %path.display(), error = %e, "cannot watch makefile");
      } else {
        debug!(path = %path.display(), "watching makefile");
      }
    }
  }

  pub fn clear(&mut self) {
    if let Some(watcher) = &mut self.watcher {
      for path in self.watched.drain() {
        let _ = watcher.unwatch(&path);
      }
    } else {
      self.watched.clear();
    }
  }

  pub fn is_watching(&self, path: &Path) -> bool {
    self.watched.contains(path)
  }
}
