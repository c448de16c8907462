//! The path interner.
//!
//! A process-wide injective map from absolute canonicalized paths to
//! monotonically increasing 32-bit ids. Id 0 is reserved for "no file" so a
//! [`crate::Location`] with file id 0 is null. The table is persisted as a
//! single versioned blob and reloaded at startup; when the blob cannot be
//! restored the table is rebuilt empty and every store keyed by the old ids
//! must be discarded by the caller.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::{FileId, StoreError, blob};

#[derive(Default)]
struct Inner {
  to_id: HashMap<PathBuf, FileId>,
  from_id: Vec<PathBuf>,
}

/// Read-mostly after startup; guarded by its own mutex (spec'd shared
/// state: jobs intern paths concurrently with the dispatcher).
#[derive(Default)]
pub struct PathTable {
  inner: Mutex<Inner>,
}

impl PathTable {
  pub fn new() -> Self {
    Self::default()
  }

  /// Return the id for `path`, assigning the next one on first sight.
  pub fn intern(&self, path: &Path) -> FileId {
    let mut inner = self.inner.lock();
    if let Some(&id) = inner.to_id.get(path) {
      return id;
    }
    let id = (inner.from_id.len() + 1) as FileId;
    inner.to_id.insert(path.to_path_buf(), id);
    inner.from_id.push(path.to_path_buf());
    id
  }

  /// Id for `path` if it has been seen, without assigning one.
  pub fn get(&self, path: &Path) -> Option<FileId> {
    self.inner.lock().to_id.get(path).copied()
  }

  pub fn path_of(&self, id: FileId) -> Option<PathBuf> {
    if id == 0 {
      return None;
    }
    self.inner.lock().from_id.get((id - 1) as usize).cloned()
  }

  pub fn len(&self) -> usize {
    self.inner.lock().from_id.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Every `(path, id)` pair, in id order.
  pub fn snapshot(&self) -> Vec<(PathBuf, FileId)> {
    let inner = self.inner.lock();
    inner
      .from_id
      .iter()
      .enumerate()
      .map(|(i, p)| (p.clone(), (i + 1) as FileId))
      .collect()
  }

  /// Persist the table to `path` as a versioned blob.
  pub fn save(&self, path: &Path, version: u32) -> Result<(), StoreError> {
    let pairs = self.snapshot();
    blob::write_versioned(path, version, &pairs)
  }

  /// Adopt the table stored at `path`. Returns false (leaving the table
  /// untouched) when the blob is missing or its version does not match.
  pub fn restore(&self, path: &Path, version: u32) -> Result<bool, StoreError> {
    let Some(pairs) = blob::read_versioned::<Vec<(PathBuf, FileId)>>(path, version)? else {
      return Ok(false);
    };
    let mut inner = self.inner.lock();
    inner.to_id.clear();
    inner.from_id.clear();
    for (path, id) in pairs {
      // Ids were assigned densely from 1, so id order reconstructs the vec.
      debug_assert_eq!(id as usize, inner.from_id.len() + 1);
      inner.to_id.insert(path.clone(), id);
      inner.from_id.push(path);
    }
    Ok(true)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_ids_are_stable_and_monotonic() {
    let table = PathTable::new();
    let a = table.intern(Path::new("/src/a.c"));
    let b = table.intern(Path::new("/src/b.h"));
    assert_eq!(a, 1);
    assert_eq!(b, 2);
    assert_eq!(table.intern(Path::new("/src/a.c")), a);
    assert_eq!(table.path_of(b).unwrap(), PathBuf::from("/src/b.h"));
    assert_eq!(table.path_of(0), None);
  }

  #[test]
  fn test_save_restore_identical_map() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("paths");

    let table = PathTable::new();
    table.intern(Path::new("/src/a.c"));
    table.intern(Path::new("/src/b.h"));
    table.intern(Path::new("/lib/c.cpp"));
    table.save(&path, 1).unwrap();

    let restored = PathTable::new();
    assert!(restored.restore(&path, 1).unwrap());
    assert_eq!(restored.snapshot(), table.snapshot());
    // New ids continue after the restored ones.
    assert_eq!(restored.intern(Path::new("/src/d.c")), 4);
  }

  #[test]
  fn test_restore_rejects_other_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("paths");

    let table = PathTable::new();
    table.intern(Path::new("/src/a.c"));
    table.save(&path, 1).unwrap();

    let restored = PathTable::new();
    assert!(!restored.restore(&path, 2).unwrap());
    assert!(restored.is_empty());
  }
}
