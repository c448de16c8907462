//! Typed adapter over the per-project KV store.
//!
//! One `redb` database file holds the five logical stores as tables. The
//! contract the indexer's writer relies on:
//!
//! - keys are ordered bytes, so per-file prefix ranges work;
//! - a [`StoreBatch`] is applied in a single write transaction, so a cycle's
//!   writes to one store land atomically or not at all;
//! - readers open their own read transaction and see a consistent snapshot
//!   while the writer commits.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::StoreError;

type Def = TableDefinition<'static, &'static [u8], &'static [u8]>;

const SYMBOL_NAMES: Def = TableDefinition::new("symbol_names");
const SYMBOLS: Def = TableDefinition::new("symbols");
const REFERENCES: Def = TableDefinition::new("references");
const DEPENDENCIES: Def = TableDefinition::new("dependencies");
const FILE_INFORMATION: Def = TableDefinition::new("file_information");

/// The five logical stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreId {
  SymbolNames,
  Symbols,
  References,
  Dependencies,
  FileInformation,
}

impl StoreId {
  pub const ALL: [StoreId; 5] = [
    StoreId::SymbolNames,
    StoreId::Symbols,
    StoreId::References,
    StoreId::Dependencies,
    StoreId::FileInformation,
  ];

  fn def(self) -> Def {
    match self {
      StoreId::SymbolNames => SYMBOL_NAMES,
      StoreId::Symbols => SYMBOLS,
      StoreId::References => REFERENCES,
      StoreId::Dependencies => DEPENDENCIES,
      StoreId::FileInformation => FILE_INFORMATION,
    }
  }
}

/// A set of writes against one store, applied atomically.
#[derive(Debug)]
pub struct StoreBatch {
  store: StoreId,
  puts: Vec<(Vec<u8>, Vec<u8>)>,
  deletes: Vec<Vec<u8>>,
}

impl StoreBatch {
  pub fn new(store: StoreId) -> Self {
    Self {
      store,
      puts: Vec::new(),
      deletes: Vec::new(),
    }
  }

  pub fn put<T: Serialize>(&mut self, key: impl Into<Vec<u8>>, value: &T) -> Result<(), StoreError> {
    self.puts.push((key.into(), bincode::serialize(value)?));
    Ok(())
  }

  pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
    self.deletes.push(key.into());
  }

  pub fn is_empty(&self) -> bool {
    self.puts.is_empty() && self.deletes.is_empty()
  }

  pub fn len(&self) -> usize {
    self.puts.len() + self.deletes.len()
  }
}

/// Handle to a project's on-disk stores.
pub struct ProjectStores {
  db: Database,
  /// Number of non-empty batches committed; tests use this to assert
  /// idempotence (a clean reindex commits nothing).
  batches_applied: AtomicU64,
}

impl ProjectStores {
  /// Open (or create) the store file, making sure every table exists so
  /// later readers never race table creation.
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let db = Database::create(path)?;
    let txn = db.begin_write()?;
    for store in StoreId::ALL {
      txn.open_table(store.def())?;
    }
    txn.commit()?;
    Ok(Self {
      db,
      batches_applied: AtomicU64::new(0),
    })
  }

  /// Read and decode one value.
  pub fn get<T: DeserializeOwned>(&self, store: StoreId, key: &[u8]) -> Result<Option<T>, StoreError> {
    let txn = self.db.begin_read()?;
    let table = txn.open_table(store.def())?;
    match table.get(key)? {
      Some(guard) => Ok(Some(bincode::deserialize(guard.value())?)),
      None => Ok(None),
    }
  }

  /// Apply a batch in one write transaction. Empty batches commit nothing.
  pub fn apply(&self, batch: StoreBatch) -> Result<(), StoreError> {
    if batch.is_empty() {
      return Ok(());
    }
    let txn = self.db.begin_write()?;
    {
      let mut table = txn.open_table(batch.store.def())?;
      for (key, value) in &batch.puts {
        table.insert(key.as_slice(), value.as_slice())?;
      }
      for key in &batch.deletes {
        table.remove(key.as_slice())?;
      }
    }
    txn.commit()?;
    self.batches_applied.fetch_add(1, Ordering::Relaxed);
    Ok(())
  }

  /// Visit every `(key, value)` in a store, in key order.
  pub fn for_each<F>(&self, store: StoreId, mut f: F) -> Result<(), StoreError>
  where
    F: FnMut(&[u8], &[u8]),
  {
    let txn = self.db.begin_read()?;
    let table = txn.open_table(store.def())?;
    for entry in table.iter()? {
      let (key, value) = entry?;
      f(key.value(), value.value());
    }
    Ok(())
  }

  /// Visit entries whose key starts with `prefix`, in key order.
  pub fn for_each_prefix<F>(&self, store: StoreId, prefix: &[u8], mut f: F) -> Result<(), StoreError>
  where
    F: FnMut(&[u8], &[u8]),
  {
    let txn = self.db.begin_read()?;
    let table = txn.open_table(store.def())?;
    for entry in table.range(prefix..)? {
      let (key, value) = entry?;
      if !key.value().starts_with(prefix) {
        break;
      }
      f(key.value(), value.value());
    }
    Ok(())
  }

  /// The entry with the greatest key `<= key` that shares `prefix`. Query
  /// jobs use this to find the cursor at-or-before a byte offset in a file.
  pub fn floor_entry(&self, store: StoreId, prefix: &[u8], key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
    let txn = self.db.begin_read()?;
    let table = txn.open_table(store.def())?;
    let mut found = None;
    for entry in table.range(prefix..)? {
      let (k, v) = entry?;
      if !k.value().starts_with(prefix) || k.value() > key {
        break;
      }
      found = Some((k.value().to_vec(), v.value().to_vec()));
    }
    Ok(found)
  }

  pub fn count(&self, store: StoreId) -> Result<u64, StoreError> {
    let txn = self.db.begin_read()?;
    let table = txn.open_table(store.def())?;
    Ok(table.len()?)
  }

  pub fn batches_applied(&self) -> u64 {
    self.batches_applied.load(Ordering::Relaxed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::Location;
  use std::collections::BTreeSet;

  fn open_temp() -> (tempfile::TempDir, ProjectStores) {
    let dir = tempfile::tempdir().unwrap();
    let stores = ProjectStores::open(&dir.path().join("index.redb")).unwrap();
    (dir, stores)
  }

  #[test]
  fn test_write_then_read_back() {
    let (_dir, stores) = open_temp();
    let set: BTreeSet<Location> = [Location::new(1, 4), Location::new(2, 8)].into_iter().collect();

    let mut batch = StoreBatch::new(StoreId::SymbolNames);
    batch.put(b"main".to_vec(), &set).unwrap();
    stores.apply(batch).unwrap();

    let back: BTreeSet<Location> = stores.get(StoreId::SymbolNames, b"main").unwrap().unwrap();
    assert_eq!(back, set);
    assert_eq!(stores.batches_applied(), 1);
  }

  #[test]
  fn test_empty_batch_commits_nothing() {
    let (_dir, stores) = open_temp();
    stores.apply(StoreBatch::new(StoreId::Symbols)).unwrap();
    assert_eq!(stores.batches_applied(), 0);
  }

  #[test]
  fn test_prefix_scan_is_file_scoped() {
    let (_dir, stores) = open_temp();
    let mut batch = StoreBatch::new(StoreId::Symbols);
    for loc in [Location::new(1, 10), Location::new(1, 20), Location::new(2, 5)] {
      batch.put(loc.to_key().to_vec(), &loc.offset).unwrap();
    }
    stores.apply(batch).unwrap();

    let mut seen = Vec::new();
    stores
      .for_each_prefix(StoreId::Symbols, &Location::file_prefix(1), |k, _| {
        seen.push(Location::from_key(k).unwrap());
      })
      .unwrap();
    assert_eq!(seen, vec![Location::new(1, 10), Location::new(1, 20)]);
  }

  #[test]
  fn test_floor_entry_finds_at_or_before() {
    let (_dir, stores) = open_temp();
    let mut batch = StoreBatch::new(StoreId::Symbols);
    for loc in [Location::new(1, 10), Location::new(1, 30)] {
      batch.put(loc.to_key().to_vec(), &loc.offset).unwrap();
    }
    stores.apply(batch).unwrap();

    let prefix = Location::file_prefix(1);
    let hit = stores
      .floor_entry(StoreId::Symbols, &prefix, &Location::new(1, 25).to_key())
      .unwrap()
      .unwrap();
    assert_eq!(Location::from_key(&hit.0), Some(Location::new(1, 10)));

    let exact = stores
      .floor_entry(StoreId::Symbols, &prefix, &Location::new(1, 30).to_key())
      .unwrap()
      .unwrap();
    assert_eq!(Location::from_key(&exact.0), Some(Location::new(1, 30)));

    let miss = stores
      .floor_entry(StoreId::Symbols, &prefix, &Location::new(1, 5).to_key())
      .unwrap();
    assert!(miss.is_none());
  }
}
