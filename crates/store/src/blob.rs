//! Versioned blob files.
//!
//! Snapshots (the `paths` table, per-project state) are written as a
//! little-endian u32 schema version followed by a bincode payload. Writes go
//! to a temp file in the same directory and are renamed into place so a
//! crash mid-write never leaves a torn blob.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::StoreError;

/// Atomically write `value` to `path` behind a schema version header.
pub fn write_versioned<T: Serialize>(path: &Path, version: u32, value: &T) -> Result<(), StoreError> {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent)?;
  }
  let tmp = path.with_extension("tmp");
  {
    let mut f = fs::File::create(&tmp)?;
    f.write_all(&version.to_le_bytes())?;
    f.write_all(&bincode::serialize(value)?)?;
    f.sync_all()?;
  }
  fs::rename(&tmp, path)?;
  Ok(())
}

/// Read a blob written by [`write_versioned`]. Returns `None` when the file
/// is missing, truncated, or carries a different schema version; a stale
/// blob is never an error, it is simply ignored.
pub fn read_versioned<T: DeserializeOwned>(path: &Path, version: u32) -> Result<Option<T>, StoreError> {
  let mut f = match fs::File::open(path) {
    Ok(f) => f,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
    Err(e) => return Err(e.into()),
  };

  let mut header = [0u8; 4];
  if f.read_exact(&mut header).is_err() {
    warn!(path = %path.display(), "blob too short, ignoring");
    return Ok(None);
  }
  if u32::from_le_bytes(header) != version {
    warn!(path = %path.display(), "blob schema version mismatch, ignoring");
    return Ok(None);
  }

  let mut payload = Vec::new();
  f.read_to_end(&mut payload)?;
  match bincode::deserialize(&payload) {
    Ok(value) => Ok(Some(value)),
    Err(e) => {
      warn!(path = %path.display(), error = %e, "blob payload undecodable, ignoring");
      Ok(None)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state");
    let value = vec![("a".to_string(), 1u32), ("b".to_string(), 2u32)];
    write_versioned(&path, 7, &value).unwrap();
    let back: Option<Vec<(String, u32)>> = read_versioned(&path, 7).unwrap();
    assert_eq!(back, Some(value));
  }

  #[test]
  fn test_version_mismatch_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state");
    write_versioned(&path, 7, &1u32).unwrap();
    let back: Option<u32> = read_versioned(&path, 8).unwrap();
    assert_eq!(back, None);
  }

  #[test]
  fn test_missing_file_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let back: Option<u32> = read_versioned(&dir.path().join("absent"), 1).unwrap();
    assert_eq!(back, None);
  }
}
