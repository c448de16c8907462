//! Persistence: on-disk layout and the debounced save timers.
//!
//! The data directory holds a versioned `paths` blob, one versioned blob
//! per project (filename is the project key with `/` encoded), and the KV
//! store files under `db/`. Saves happen after five seconds of indexer
//! quiescence; a new work burst disarms the pending timer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use cnav_store::{PathTable, SCHEMA_VERSION, read_versioned, write_versioned};

use crate::project::{Project, ProjectSnapshot};

/// Quiescence interval between the last `jobs_complete` and the save.
pub const SAVE_DELAY: Duration = Duration::from_secs(5);

// ============================================================================
// Layout
// ============================================================================

/// Encode a project key into a flat file name (`/` becomes `_`).
pub fn encode_path(path: &Path) -> String {
  path.to_string_lossy().replace('/', "_")
}

pub fn paths_blob_path(data_dir: &Path) -> PathBuf {
  data_dir.join("paths")
}

pub fn project_blob_path(data_dir: &Path, key: &Path) -> PathBuf {
  data_dir.join(encode_path(key))
}

pub fn store_path(data_dir: &Path, key: &Path) -> PathBuf {
  data_dir.join("db").join(format!("{}.redb", encode_path(key)))
}

// ============================================================================
// Save / restore
// ============================================================================

/// Serialize one project to its blob and rewrite the global paths blob.
pub fn save_project(data_dir: &Path, project: &Project, paths: &PathTable) {
  if let Err(e) = paths.save(&paths_blob_path(data_dir), SCHEMA_VERSION) {
    warn!(error = %e, "cannot save paths blob");
    return;
  }
  let blob = project_blob_path(data_dir, &project.path);
  match write_versioned(&blob, SCHEMA_VERSION, &project.snapshot()) {
    Ok(()) => info!(project = %project.path.display(), "saved project"),
    Err(e) => warn!(project = %project.path.display(), error = %e, "cannot save project"),
  }
}

/// Restore a project from its blob; false when the blob is missing or its
/// schema version differs (the blob is then ignored).
pub fn restore_project(data_dir: &Path, project: &mut Project) -> bool {
  let blob = project_blob_path(data_dir, &project.path);
  match read_versioned::<ProjectSnapshot>(&blob, SCHEMA_VERSION) {
    Ok(Some(snapshot)) => {
      project.restore(snapshot);
      info!(project = %project.path.display(), "restored project");
      true
    }
    Ok(None) => false,
    Err(e) => {
      warn!(project = %project.path.display(), error = %e, "cannot restore project");
      false
    }
  }
}

// ============================================================================
// Save timers
// ============================================================================

/// One-shot save deadline per project, armed by `jobs_complete` and
/// disarmed by `job_started`.
#[derive(Debug, Default)]
pub struct SaveTimers {
  deadlines: HashMap<PathBuf, Instant>,
}

impl SaveTimers {
  pub fn arm(&mut self, key: &Path, now: Instant) {
    self.deadlines.insert(key.to_path_buf(), now + SAVE_DELAY);
  }

  pub fn disarm(&mut self, key: &Path) {
    self.deadlines.remove(key);
  }

  /// The earliest pending deadline, for the event loop's sleep arm.
  pub fn next_deadline(&self) -> Option<Instant> {
    self.deadlines.values().min().copied()
  }

  /// Remove and return every project whose deadline has passed.
  pub fn take_due(&mut self, now: Instant) -> Vec<PathBuf> {
    let due: Vec<PathBuf> = self
      .deadlines
      .iter()
      .filter(|(_, deadline)| **deadline <= now)
      .map(|(key, _)| key.clone())
      .collect();
    for key in &due {
      self.deadlines.remove(key);
    }
    due
  }

  pub fn is_empty(&self) -> bool {
    self.deadlines.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_arm_then_fire() {
    let mut timers = SaveTimers::default();
    let now = Instant::now();
    timers.arm(Path::new("/proj"), now);
    assert!(timers.take_due(now).is_empty());
    let due = timers.take_due(now + SAVE_DELAY);
    assert_eq!(due, vec![PathBuf::from("/proj")]);
    assert!(timers.is_empty());
  }

  #[test]
  fn test_job_started_disarms_pending_timer() {
    let mut timers = SaveTimers::default();
    let now = Instant::now();
    timers.arm(Path::new("/proj"), now);
    // Another burst of work starts before the deadline.
    timers.disarm(Path::new("/proj"));
    assert!(timers.take_due(now + SAVE_DELAY).is_empty());
    assert!(timers.next_deadline().is_none());
  }

  #[test]
  fn test_rearm_pushes_deadline_back() {
    let mut timers = SaveTimers::default();
    let now = Instant::now();
    timers.arm(Path::new("/proj"), now);
    timers.arm(Path::new("/proj"), now + Duration::from_secs(3));
    assert!(timers.take_due(now + SAVE_DELAY).is_empty());
    assert_eq!(
      timers.take_due(now + Duration::from_secs(3) + SAVE_DELAY),
      vec![PathBuf::from("/proj")]
    );
  }

  #[test]
  fn test_encode_path_flattens_separators() {
    assert_eq!(encode_path(Path::new("/home/u/proj/Makefile")), "_home_u_proj_Makefile");
  }
}
