//! Query handling.
//!
//! The subtypes that scan the stores run as pool jobs streaming text lines
//! back through the dispatcher; this module holds those jobs plus the
//! location parsing/printing helpers they share. Trivial subtypes are
//! answered inline by the dispatcher and never reach this module.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use cnav_frontend::TranslationUnitProvider;
use cnav_store::{CursorInfo, FileId, Location, PathTable, ProjectStores, SourceInfo, StoreId};

use crate::pool::{Job, JobContext};

// ============================================================================
// Locations as text
// ============================================================================

/// Parse `path:line:col` (trailing colon tolerated) into a [`Location`].
/// The file must already be interned; unknown files yield `None`.
pub fn parse_location(spec: &str, paths: &PathTable) -> Option<Location> {
  let spec = spec.trim().trim_end_matches(':');
  let (rest, col) = spec.rsplit_once(':')?;
  let (path, line) = rest.rsplit_once(':')?;
  let line: u32 = line.parse().ok()?;
  let col: u32 = col.parse().ok()?;
  let path = Path::new(path);
  let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
  let file_id = paths.get(&path)?;
  let offset = offset_of(&path, line, col)?;
  Some(Location::new(file_id, offset))
}

/// Byte offset of a 1-based line/column pair.
fn offset_of(path: &Path, line: u32, col: u32) -> Option<u32> {
  if line == 1 {
    return Some(col.saturating_sub(1));
  }
  let content = std::fs::read_to_string(path).ok()?;
  let mut current = 1u32;
  for (index, c) in content.char_indices() {
    if c == '\n' {
      current += 1;
      if current == line {
        return Some(index as u32 + 1 + col.saturating_sub(1));
      }
    }
  }
  None
}

/// Prints locations as `path:line:col`, caching line starts per file.
pub struct LocationPrinter {
  paths: Arc<PathTable>,
  line_starts: HashMap<FileId, Option<Vec<u32>>>,
}

impl LocationPrinter {
  pub fn new(paths: Arc<PathTable>) -> Self {
    Self {
      paths,
      line_starts: HashMap::new(),
    }
  }

  pub fn display(&mut self, location: Location) -> String {
    let Some(path) = self.paths.path_of(location.file_id) else {
      return format!("<unknown>:{}", location.offset);
    };
    let starts = self.line_starts.entry(location.file_id).or_insert_with(|| {
      std::fs::read_to_string(&path).ok().map(|content| {
        let mut starts = vec![0u32];
        for (index, c) in content.char_indices() {
          if c == '\n' {
            starts.push(index as u32 + 1);
          }
        }
        starts
      })
    });
    match starts {
      Some(starts) => {
        let line = starts.partition_point(|&s| s <= location.offset);
        let col = location.offset - starts[line - 1] + 1;
        format!("{}:{}:{}", path.display(), line, col)
      }
      None => format!("{}:{}", path.display(), location.offset),
    }
  }
}

/// The cursor at or before `location` within the same file.
fn cursor_at(stores: &ProjectStores, location: Location) -> Option<(Location, CursorInfo)> {
  let prefix = Location::file_prefix(location.file_id);
  let (key, value) = stores
    .floor_entry(StoreId::Symbols, &prefix, &location.to_key())
    .ok()
    .flatten()?;
  let found = Location::from_key(&key)?;
  let info: CursorInfo = bincode::deserialize(&value).ok()?;
  Some((found, info))
}

// ============================================================================
// Jobs
// ============================================================================

/// `follow-location`: the target of the cursor under the point.
pub struct FollowLocationJob {
  pub location: Location,
  pub stores: Arc<ProjectStores>,
  pub paths: Arc<PathTable>,
}

impl Job for FollowLocationJob {
  fn run(&mut self, ctx: &JobContext) {
    if ctx.aborted() {
      return;
    }
    let mut printer = LocationPrinter::new(Arc::clone(&self.paths));
    if let Some((_, info)) = cursor_at(&self.stores, self.location) {
      if !info.target.is_null() {
        ctx.write(printer.display(info.target));
      }
    }
  }
}

/// `cursor-info`: everything the index knows about the cursor.
pub struct CursorInfoJob {
  pub location: Location,
  pub stores: Arc<ProjectStores>,
  pub paths: Arc<PathTable>,
}

impl Job for CursorInfoJob {
  fn run(&mut self, ctx: &JobContext) {
    if ctx.aborted() {
      return;
    }
    let mut printer = LocationPrinter::new(Arc::clone(&self.paths));
    let Some((found, info)) = cursor_at(&self.stores, self.location) else {
      return;
    };
    ctx.write(format!(
      "{} kind: {} symbol: {} usr: {}",
      printer.display(found),
      info.kind,
      info.symbol_name,
      info.usr
    ));
    if !info.target.is_null() {
      ctx.write(format!("  target: {}", printer.display(info.target)));
    }
    for reference in &info.references {
      if ctx.aborted() {
        return;
      }
      ctx.write(format!("  reference: {}", printer.display(*reference)));
    }
  }
}

/// `references-at-location` / `references-by-name`.
pub enum ReferencesQuery {
  Location(Location),
  Name(String),
}

pub struct ReferencesJob {
  pub query: ReferencesQuery,
  pub stores: Arc<ProjectStores>,
  pub paths: Arc<PathTable>,
}

impl Job for ReferencesJob {
  fn run(&mut self, ctx: &JobContext) {
    if ctx.aborted() {
      return;
    }
    let mut targets: Vec<Location> = Vec::new();
    match &self.query {
      ReferencesQuery::Location(location) => {
        if let Some((found, info)) = cursor_at(&self.stores, *location) {
          // From a reference site, the interesting set hangs off the target.
          if !info.target.is_null() {
            targets.push(info.target);
          }
          targets.push(found);
        }
      }
      ReferencesQuery::Name(name) => {
        if let Ok(Some(locations)) = self.stores.get::<BTreeSet<Location>>(StoreId::SymbolNames, name.as_bytes()) {
          targets.extend(locations);
        }
      }
    }

    let mut references: BTreeSet<Location> = BTreeSet::new();
    for target in targets {
      if ctx.aborted() {
        return;
      }
      if let Ok(Some(info)) = self.stores.get::<CursorInfo>(StoreId::Symbols, &target.to_key()) {
        references.extend(info.references.iter().copied());
      }
    }

    let mut printer = LocationPrinter::new(Arc::clone(&self.paths));
    for reference in references {
      if ctx.aborted() {
        return;
      }
      ctx.write(printer.display(reference));
    }
  }
}

/// `list-symbols`: every known symbol name matching the query string.
pub struct ListSymbolsJob {
  pub partial: String,
  pub stores: Arc<ProjectStores>,
}

impl Job for ListSymbolsJob {
  fn run(&mut self, ctx: &JobContext) {
    let mut names = Vec::new();
    let partial = self.partial.clone();
    let _ = self.stores.for_each(StoreId::SymbolNames, |key, _| {
      if let Ok(name) = std::str::from_utf8(key) {
        if partial.is_empty() || name.contains(&partial) {
          names.push(name.to_string());
        }
      }
    });
    for name in names {
      if ctx.aborted() {
        return;
      }
      ctx.write(name);
    }
  }
}

/// `find-symbols`: locations carrying an exact symbol name.
pub struct FindSymbolsJob {
  pub name: String,
  pub stores: Arc<ProjectStores>,
  pub paths: Arc<PathTable>,
}

impl Job for FindSymbolsJob {
  fn run(&mut self, ctx: &JobContext) {
    if ctx.aborted() {
      return;
    }
    let Ok(Some(locations)) = self
      .stores
      .get::<BTreeSet<Location>>(StoreId::SymbolNames, self.name.as_bytes())
    else {
      return;
    };
    let mut printer = LocationPrinter::new(Arc::clone(&self.paths));
    for location in locations {
      if ctx.aborted() {
        return;
      }
      ctx.write(printer.display(location));
    }
  }
}

/// `find-file`: managed files matching a pattern.
pub struct FindFileJob {
  pub pattern: String,
  pub regex: Option<Regex>,
  pub files: Vec<PathBuf>,
}

impl Job for FindFileJob {
  fn run(&mut self, ctx: &JobContext) {
    for file in &self.files {
      if ctx.aborted() {
        return;
      }
      let text = file.to_string_lossy();
      let hit = match &self.regex {
        Some(regex) => regex.is_match(&text),
        None => self.pattern.is_empty() || text.contains(&self.pattern),
      };
      if hit {
        ctx.write(text.into_owned());
      }
    }
  }
}

/// `dump-file`: every indexed cursor in one file, in offset order.
pub struct DumpFileJob {
  pub file_id: FileId,
  pub stores: Arc<ProjectStores>,
  pub paths: Arc<PathTable>,
}

impl Job for DumpFileJob {
  fn run(&mut self, ctx: &JobContext) {
    let mut entries = Vec::new();
    let _ = self
      .stores
      .for_each_prefix(StoreId::Symbols, &Location::file_prefix(self.file_id), |key, value| {
        if let (Some(location), Ok(info)) = (Location::from_key(key), bincode::deserialize::<CursorInfo>(value)) {
          entries.push((location, info));
        }
      });
    let mut printer = LocationPrinter::new(Arc::clone(&self.paths));
    for (location, info) in entries {
      if ctx.aborted() {
        return;
      }
      ctx.write(format!("{} {} {}", printer.display(location), info.kind, info.symbol_name));
    }
  }
}

/// `status`: store sizes and source counts for the current project.
pub struct StatusJob {
  pub project: PathBuf,
  pub src_root: Option<PathBuf>,
  pub source_count: usize,
  pub file_count: usize,
  pub stores: Arc<ProjectStores>,
}

impl Job for StatusJob {
  fn run(&mut self, ctx: &JobContext) {
    if ctx.aborted() {
      return;
    }
    ctx.write(format!("project: {}", self.project.display()));
    if let Some(root) = &self.src_root {
      ctx.write(format!("srcroot: {}", root.display()));
    }
    ctx.write(format!("sources: {}", self.source_count));
    ctx.write(format!("files: {}", self.file_count));
    for (store, label) in [
      (StoreId::SymbolNames, "symbol_names"),
      (StoreId::Symbols, "symbols"),
      (StoreId::References, "references"),
      (StoreId::Dependencies, "dependencies"),
      (StoreId::FileInformation, "file_information"),
    ] {
      if ctx.aborted() {
        return;
      }
      let count = self.stores.count(store).unwrap_or(0);
      ctx.write(format!("{}: {}", label, count));
    }
  }
}

/// `preprocess-file`: the provider's preprocessed view of one unit.
pub struct PreprocessJob {
  pub source: SourceInfo,
  pub provider: Arc<dyn TranslationUnitProvider>,
}

impl Job for PreprocessJob {
  fn run(&mut self, ctx: &JobContext) {
    if ctx.aborted() {
      return;
    }
    match self.provider.preprocess(&self.source) {
      Ok(output) => {
        for line in output.lines() {
          if ctx.aborted() {
            return;
          }
          ctx.write(line.to_string());
        }
      }
      Err(e) => {
        debug!(error = %e, "preprocess failed");
        ctx.write(format!("Preprocess failed: {}", e));
      }
    }
  }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_location_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.c");
    std::fs::write(&file, "int x;\nint y;\nint z;\n").unwrap();
    let file = file.canonicalize().unwrap();

    let paths = Arc::new(PathTable::new());
    let id = paths.intern(&file);

    // Line 2, column 5 lands on 'y' (offset 7 + 4).
    let spec = format!("{}:2:5", file.display());
    let location = parse_location(&spec, &paths).unwrap();
    assert_eq!(location, Location::new(id, 11));

    let mut printer = LocationPrinter::new(Arc::clone(&paths));
    assert_eq!(printer.display(location), spec);
  }

  #[test]
  fn test_parse_location_unknown_file() {
    let paths = PathTable::new();
    assert_eq!(parse_location("/absent/x.c:1:1", &paths), None);
    assert_eq!(parse_location("garbage", &paths), None);
  }

  #[test]
  fn test_printer_first_line() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.c");
    std::fs::write(&file, "abc\ndef\n").unwrap();
    let paths = Arc::new(PathTable::new());
    let id = paths.intern(&file);
    let mut printer = LocationPrinter::new(Arc::clone(&paths));
    assert_eq!(printer.display(Location::new(id, 0)), format!("{}:1:1", file.display()));
    assert_eq!(printer.display(Location::new(id, 4)), format!("{}:2:1", file.display()));
  }
}
