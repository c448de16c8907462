//! The staging buffer and its writer thread.
//!
//! Parser jobs post deltas through cheap merge calls; a dedicated writer
//! thread swaps the staged maps out under the lock, releases it, and flushes
//! each non-empty map to its KV store in one atomic batch. A crash between
//! cycles loses at most the deltas staged since the last flush; the on-disk
//! stores never see a partial cycle for one store.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, trace};

use cnav_store::{
  CursorInfo, DependencyMap, FileId, FileInformation, Location, ProjectStores, RefKind, ReferenceMap, StoreBatch,
  StoreError, StoreId, SymbolMap, SymbolNameMap,
};

use crate::event::{IndexEvent, ServerEvent};

/// The writer wakes at least this often even without an explicit nudge, so
/// slow drips of deltas still reach disk.
const WRITER_WAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Key of the pch-dependency blob inside the dependencies store. Regular
/// keys are 4-byte file ids, so the 3-byte literal cannot collide.
const PCH_KEY: &[u8] = b"pch";

// ============================================================================
// Staged maps
// ============================================================================

#[derive(Debug, Default)]
pub struct StagedMaps {
  pub symbol_names: SymbolNameMap,
  pub symbols: SymbolMap,
  pub references: ReferenceMap,
  pub dependencies: DependencyMap,
  pub pch_dependencies: DependencyMap,
  pub file_information: HashMap<FileId, FileInformation>,
}

impl StagedMaps {
  pub fn is_empty(&self) -> bool {
    self.symbol_names.is_empty()
      && self.symbols.is_empty()
      && self.references.is_empty()
      && self.dependencies.is_empty()
      && self.pch_dependencies.is_empty()
      && self.file_information.is_empty()
  }
}

struct WriterState {
  maps: StagedMaps,
  stopped: bool,
  flushing: bool,
  cycles: u64,
}

struct Shared {
  state: Mutex<WriterState>,
  /// Wakes the writer when deltas arrive or on stop.
  wake: Condvar,
  /// Signalled after every completed cycle.
  cycle_done: Condvar,
}

// ============================================================================
// IndexWriter
// ============================================================================

/// Producer handle plus the background writer thread.
pub struct IndexWriter {
  shared: Arc<Shared>,
  thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl IndexWriter {
  pub fn spawn(project: PathBuf, stores: Arc<ProjectStores>, events: UnboundedSender<ServerEvent>) -> Self {
    let shared = Arc::new(Shared {
      state: Mutex::new(WriterState {
        maps: StagedMaps::default(),
        stopped: false,
        flushing: false,
        cycles: 0,
      }),
      wake: Condvar::new(),
      cycle_done: Condvar::new(),
    });

    let thread = {
      let shared = Arc::clone(&shared);
      std::thread::Builder::new()
        .name("cnav-writer".to_string())
        .spawn(move || writer_loop(shared, project, stores, events))
        .expect("failed to spawn writer thread")
    };

    Self {
      shared,
      thread: Mutex::new(Some(thread)),
    }
  }

  // --------------------------------------------------------------------
  // Producer interface: merge under the lock, wake the writer.
  // --------------------------------------------------------------------

  pub fn add_symbol_names(&self, names: SymbolNameMap) {
    let mut state = self.shared.state.lock();
    for (name, locations) in names {
      state.maps.symbol_names.entry(name).or_default().extend(locations);
    }
    drop(state);
    self.shared.wake.notify_one();
  }

  pub fn add_symbols(&self, symbols: SymbolMap) {
    let mut state = self.shared.state.lock();
    for (location, info) in symbols {
      state.maps.symbols.entry(location).or_default().unite(&info);
    }
    drop(state);
    self.shared.wake.notify_one();
  }

  pub fn add_references(&self, references: ReferenceMap) {
    let mut state = self.shared.state.lock();
    // Last writer wins per referring location.
    state.maps.references.extend(references);
    drop(state);
    self.shared.wake.notify_one();
  }

  pub fn add_dependencies(&self, dependencies: DependencyMap) {
    let mut state = self.shared.state.lock();
    for (file, deps) in dependencies {
      state.maps.dependencies.entry(file).or_default().extend(deps);
    }
    drop(state);
    self.shared.wake.notify_one();
  }

  pub fn set_pch_dependencies(&self, dependencies: DependencyMap) {
    let mut state = self.shared.state.lock();
    for (file, deps) in dependencies {
      state.maps.pch_dependencies.entry(file).or_default().extend(deps);
    }
    drop(state);
    self.shared.wake.notify_one();
  }

  pub fn add_file_information(&self, file: FileId, info: FileInformation) {
    let mut state = self.shared.state.lock();
    state.maps.file_information.insert(file, info);
    drop(state);
    self.shared.wake.notify_one();
  }

  // --------------------------------------------------------------------
  // Lifecycle
  // --------------------------------------------------------------------

  /// Block until everything staged at the time of the call is on disk.
  /// Queries never wait like this; only tests and shutdown do.
  pub fn flush_and_wait(&self) {
    let mut state = self.shared.state.lock();
    if state.stopped {
      return;
    }
    let pending_cycles = match (state.maps.is_empty(), state.flushing) {
      (true, false) => return,
      (true, true) => 1,
      (false, false) => 1,
      // A flush is mid-air and new deltas are staged behind it.
      (false, true) => 2,
    };
    let target = state.cycles + pending_cycles;
    self.shared.wake.notify_one();
    while state.cycles < target && !state.stopped {
      self.shared.cycle_done.wait(&mut state);
    }
  }

  /// Stop the writer after flushing what is currently staged.
  pub fn stop(&self) {
    self.flush_and_wait();
    {
      let mut state = self.shared.state.lock();
      state.stopped = true;
    }
    self.shared.wake.notify_all();
    if let Some(thread) = self.thread.lock().take() {
      let _ = thread.join();
    }
  }
}

impl Drop for IndexWriter {
  fn drop(&mut self) {
    self.stop();
  }
}

// ============================================================================
// Writer loop
// ============================================================================

fn writer_loop(shared: Arc<Shared>, project: PathBuf, stores: Arc<ProjectStores>, events: UnboundedSender<ServerEvent>) {
  loop {
    let maps = {
      let mut state = shared.state.lock();
      loop {
        if state.stopped {
          return;
        }
        if !state.maps.is_empty() {
          break;
        }
        shared.wake.wait_for(&mut state, WRITER_WAKE_TIMEOUT);
      }
      state.flushing = true;
      std::mem::take(&mut state.maps)
    };

    let files = maps.file_information.len();
    let result = flush_cycle(&stores, maps);

    {
      let mut state = shared.state.lock();
      state.cycles += 1;
      state.flushing = false;
      if let Err(e) = result {
        // Unrecoverable KV failure: log and exit; deltas staged after the
        // swap are dropped with the thread.
        error!(project = %project.display(), error = %e, "index writer failed, exiting");
        state.stopped = true;
        shared.cycle_done.notify_all();
        return;
      }
    }
    shared.cycle_done.notify_all();

    trace!(project = %project.display(), files, "writer cycle complete");
    if files > 0 {
      let _ = events.send(ServerEvent::Index(IndexEvent::JobsComplete {
        project: project.clone(),
        count: files,
      }));
    }
  }
}

/// One writer cycle: each non-empty map against its store, one atomic
/// batch per store.
fn flush_cycle(stores: &ProjectStores, mut maps: StagedMaps) -> Result<(), StoreError> {
  // 1. Symbol names: read, union, write back only if the set grew.
  if !maps.symbol_names.is_empty() {
    let mut batch = StoreBatch::new(StoreId::SymbolNames);
    for (name, added) in &maps.symbol_names {
      let mut current: BTreeSet<Location> = stores.get(StoreId::SymbolNames, name.as_bytes())?.unwrap_or_default();
      let before = current.len();
      current.extend(added.iter().copied());
      if current.len() != before {
        batch.put(name.as_bytes().to_vec(), &current)?;
      }
    }
    stores.apply(batch)?;
  }

  // 2. References. The raw tuples go to the references store (write only
  // when the stored tuple differs); the cursor side effects go to the
  // staged symbols when that side is staged, and through a read-modify-
  // write scratch map otherwise.
  let mut scratch: SymbolMap = HashMap::new();
  let mut scratch_changed: HashSet<Location> = HashSet::new();

  if !maps.references.is_empty() {
    let mut batch = StoreBatch::new(StoreId::References);
    for (&from, &(to, kind)) in &maps.references {
      let stored: Option<(Location, RefKind)> = stores.get(StoreId::References, &from.to_key())?;
      if stored != Some((to, kind)) {
        batch.put(from.to_key().to_vec(), &(to, kind))?;
      }
      if from == to {
        continue;
      }

      if maps.symbols.contains_key(&to) {
        let mut target_info = maps.symbols.remove(&to).expect("checked above");
        target_info.references.insert(from);
        if !kind.is_normal() {
          // Fold any scratch copy in before aliasing the referring side,
          // so step 3 merges exactly one truth per location.
          let other = maps
            .symbols
            .entry(from)
            .or_insert_with(|| scratch.remove(&from).unwrap_or_default());
          scratch_changed.remove(&from);
          other.references.insert(to);
          target_info.references.extend(other.references.iter().copied());
          other.references = target_info.references.clone();
          if other.target.is_null() {
            other.target = to;
          }
          if target_info.target.is_null() {
            target_info.target = from;
          }
        }
        maps.symbols.insert(to, target_info);
      } else {
        let mut target_changed = scratch_changed.contains(&to);
        let mut target_info = match scratch.remove(&to) {
          Some(info) => info,
          None => stores.get(StoreId::Symbols, &to.to_key())?.unwrap_or_default(),
        };
        target_changed |= target_info.references.insert(from);

        if !kind.is_normal() {
          if let Some(other) = maps.symbols.get_mut(&from) {
            other.references.insert(to);
            let before = target_info.references.len();
            target_info.references.extend(other.references.iter().copied());
            target_changed |= target_info.references.len() != before;
            other.references.extend(target_info.references.iter().copied());
            if other.target.is_null() {
              other.target = to;
            }
          } else {
            let mut other_changed = scratch_changed.contains(&from);
            let mut other = match scratch.remove(&from) {
              Some(info) => info,
              None => stores.get(StoreId::Symbols, &from.to_key())?.unwrap_or_default(),
            };
            other_changed |= other.references.insert(to);

            let before = target_info.references.len();
            target_info.references.extend(other.references.iter().copied());
            target_changed |= target_info.references.len() != before;

            let before = other.references.len();
            other.references.extend(target_info.references.iter().copied());
            other_changed |= other.references.len() != before;

            if other.target.is_null() {
              other.target = to;
              other_changed = true;
            }
            if other_changed {
              scratch_changed.insert(from);
            }
            scratch.insert(from, other);
          }
          if target_info.target.is_null() {
            target_info.target = from;
            target_changed = true;
          }
        }

        if target_changed {
          scratch_changed.insert(to);
        }
        scratch.insert(to, target_info);
      }
    }
    stores.apply(batch)?;
  }

  // 3. Symbols: unite staged records into the stored ones; the scratch map
  // from step 2 rides in the same batch so the store sees one cycle.
  if !maps.symbols.is_empty() || !scratch_changed.is_empty() {
    let mut batch = StoreBatch::new(StoreId::Symbols);
    for (location, staged) in &maps.symbols {
      let mut current: CursorInfo = stores.get(StoreId::Symbols, &location.to_key())?.unwrap_or_default();
      if current.unite(staged) {
        batch.put(location.to_key().to_vec(), &current)?;
      }
    }
    for location in &scratch_changed {
      if let Some(info) = scratch.get(location) {
        batch.put(location.to_key().to_vec(), info)?;
      }
    }
    stores.apply(batch)?;
  }

  // 4. Dependencies: union, write if grown. 5. The pch blob replaces.
  if !maps.dependencies.is_empty() || !maps.pch_dependencies.is_empty() {
    let mut batch = StoreBatch::new(StoreId::Dependencies);
    for (file, added) in &maps.dependencies {
      let key = Location::file_prefix(*file);
      let mut current: BTreeSet<FileId> = stores.get(StoreId::Dependencies, &key)?.unwrap_or_default();
      let before = current.len();
      current.extend(added.iter().copied());
      if current.len() != before {
        batch.put(key.to_vec(), &current)?;
      }
    }
    if !maps.pch_dependencies.is_empty() {
      batch.put(PCH_KEY.to_vec(), &maps.pch_dependencies)?;
    }
    stores.apply(batch)?;
  }

  // 6. File information: straight overwrite per key.
  if !maps.file_information.is_empty() {
    let mut batch = StoreBatch::new(StoreId::FileInformation);
    for (file, info) in &maps.file_information {
      batch.put(Location::file_prefix(*file).to_vec(), info)?;
    }
    stores.apply(batch)?;
  }

  debug!("flushed writer cycle");
  Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
  use super::*;
  use cnav_store::{RefKind, SymbolKind};

  fn setup() -> (tempfile::TempDir, Arc<ProjectStores>, IndexWriter) {
    let dir = tempfile::tempdir().unwrap();
    let stores = Arc::new(ProjectStores::open(&dir.path().join("index.redb")).unwrap());
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let writer = IndexWriter::spawn(PathBuf::from("/proj"), Arc::clone(&stores), tx);
    (dir, stores, writer)
  }

  fn loc(file: u32, offset: u32) -> Location {
    Location::new(file, offset)
  }

  fn names(name: &str, locations: &[Location]) -> SymbolNameMap {
    let mut map = SymbolNameMap::default();
    map.insert(name.to_string(), locations.iter().copied().collect());
    map
  }

  #[test]
  fn test_symbol_names_union_with_existing_value() {
    let (_dir, stores, writer) = setup();

    writer.add_symbol_names(names("frob", &[loc(1, 10)]));
    writer.flush_and_wait();
    writer.add_symbol_names(names("frob", &[loc(1, 10), loc(2, 20)]));
    writer.flush_and_wait();

    let stored: BTreeSet<Location> = stores.get(StoreId::SymbolNames, b"frob").unwrap().unwrap();
    let expected: BTreeSet<Location> = [loc(1, 10), loc(2, 20)].into_iter().collect();
    assert_eq!(stored, expected);
  }

  #[test]
  fn test_idempotent_cycle_writes_nothing() {
    let (_dir, stores, writer) = setup();

    writer.add_symbol_names(names("frob", &[loc(1, 10)]));
    writer.flush_and_wait();
    let after_first = stores.batches_applied();

    // The same delta again: every read-modify-write sees no growth.
    writer.add_symbol_names(names("frob", &[loc(1, 10)]));
    writer.flush_and_wait();
    assert_eq!(stores.batches_applied(), after_first);
  }

  #[test]
  fn test_non_normal_reference_back_links_staged() {
    let (_dir, stores, writer) = setup();

    let def = loc(1, 100);
    let call = loc(2, 50);
    let mut symbols = SymbolMap::default();
    symbols.insert(
      def,
      CursorInfo {
        kind: SymbolKind::Function,
        symbol_name: "frob".into(),
        ..Default::default()
      },
    );
    let mut references = ReferenceMap::default();
    references.insert(call, (def, RefKind::GlobalFunction));

    writer.add_symbols(symbols);
    writer.add_references(references);
    writer.flush_and_wait();

    let target: CursorInfo = stores.get(StoreId::Symbols, &def.to_key()).unwrap().unwrap();
    let referrer: CursorInfo = stores.get(StoreId::Symbols, &call.to_key()).unwrap().unwrap();
    assert!(target.references.contains(&call));
    assert!(referrer.references.contains(&def));
    assert!(!target.target.is_null());
    assert_eq!(referrer.target, def);

    let raw: (Location, RefKind) = stores.get(StoreId::References, &call.to_key()).unwrap().unwrap();
    assert_eq!(raw, (def, RefKind::GlobalFunction));
  }

  #[test]
  fn test_non_normal_reference_back_links_through_store() {
    let (_dir, stores, writer) = setup();

    // Cycle one persists the definition.
    let def = loc(1, 100);
    let mut symbols = SymbolMap::default();
    symbols.insert(
      def,
      CursorInfo {
        kind: SymbolKind::Function,
        symbol_name: "frob".into(),
        ..Default::default()
      },
    );
    writer.add_symbols(symbols);
    writer.flush_and_wait();

    // Cycle two references it without restaging the symbol.
    let call = loc(2, 50);
    let mut references = ReferenceMap::default();
    references.insert(call, (def, RefKind::GlobalFunction));
    writer.add_references(references);
    writer.flush_and_wait();

    let target: CursorInfo = stores.get(StoreId::Symbols, &def.to_key()).unwrap().unwrap();
    let referrer: CursorInfo = stores.get(StoreId::Symbols, &call.to_key()).unwrap().unwrap();
    assert!(target.references.contains(&call));
    assert!(referrer.references.contains(&def));
    assert_eq!(referrer.target, def);
  }

  #[test]
  fn test_normal_reference_has_no_back_link() {
    let (_dir, stores, writer) = setup();

    let def = loc(1, 100);
    let site = loc(2, 50);
    let mut symbols = SymbolMap::default();
    symbols.insert(
      def,
      CursorInfo {
        kind: SymbolKind::Struct,
        symbol_name: "point".into(),
        ..Default::default()
      },
    );
    let mut references = ReferenceMap::default();
    references.insert(site, (def, RefKind::Normal));

    writer.add_symbols(symbols);
    writer.add_references(references);
    writer.flush_and_wait();

    let target: CursorInfo = stores.get(StoreId::Symbols, &def.to_key()).unwrap().unwrap();
    assert!(target.references.contains(&site));
    // No cursor materializes at the referring side for normal references.
    let referrer: Option<CursorInfo> = stores.get(StoreId::Symbols, &site.to_key()).unwrap();
    assert!(referrer.is_none());
  }

  #[test]
  fn test_dependencies_union_and_pch_replace() {
    let (_dir, stores, writer) = setup();

    let mut deps = DependencyMap::default();
    deps.insert(1, [2, 3].into_iter().collect());
    writer.add_dependencies(deps);

    let mut pch = DependencyMap::default();
    pch.insert(9, [4].into_iter().collect());
    writer.set_pch_dependencies(pch);
    writer.flush_and_wait();

    let stored: BTreeSet<FileId> = stores
      .get(StoreId::Dependencies, &Location::file_prefix(1))
      .unwrap()
      .unwrap();
    assert_eq!(stored, [2, 3].into_iter().collect::<BTreeSet<_>>());
    let pch: DependencyMap = stores.get(StoreId::Dependencies, PCH_KEY).unwrap().unwrap();
    assert!(pch.contains_key(&9));
  }

  #[test]
  fn test_file_information_overwrites() {
    let (_dir, stores, writer) = setup();

    writer.add_file_information(
      1,
      FileInformation {
        args: vec!["-DOLD".into()],
        last_touched: 100,
      },
    );
    writer.flush_and_wait();
    writer.add_file_information(
      1,
      FileInformation {
        args: vec!["-DNEW".into()],
        last_touched: 200,
      },
    );
    writer.flush_and_wait();

    let info: FileInformation = stores
      .get(StoreId::FileInformation, &Location::file_prefix(1))
      .unwrap()
      .unwrap();
    assert_eq!(info.args, vec!["-DNEW".to_string()]);
    assert_eq!(info.last_touched, 200);
  }
}
