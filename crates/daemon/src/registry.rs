//! The project registry and source-root discovery.
//!
//! Owned exclusively by the event loop; nothing here is locked. Insertion
//! order is preserved because the current-project selection rule breaks
//! prefix-length ties in favor of the first registered project.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use globset::Glob;
use tracing::debug;

use crate::project::Project;

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
pub struct ProjectRegistry {
  projects: Vec<Project>,
  current: Option<PathBuf>,
}

impl ProjectRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn contains(&self, key: &Path) -> bool {
    self.projects.iter().any(|p| p.path == key)
  }

  pub fn get(&self, key: &Path) -> Option<&Project> {
    self.projects.iter().find(|p| p.path == key)
  }

  pub fn get_mut(&mut self, key: &Path) -> Option<&mut Project> {
    self.projects.iter_mut().find(|p| p.path == key)
  }

  /// Register a project; an existing entry under the same key is kept.
  pub fn insert(&mut self, project: Project) -> &mut Project {
    if let Some(index) = self.projects.iter().position(|p| p.path == project.path) {
      return &mut self.projects[index];
    }
    self.projects.push(project);
    self.projects.last_mut().expect("just pushed")
  }

  /// Remove and return a project. When the current project goes away the
  /// first remaining one takes over; the last removal leaves no current.
  pub fn remove(&mut self, key: &Path) -> Option<Project> {
    let index = self.projects.iter().position(|p| p.path == key)?;
    let removed = self.projects.remove(index);
    if self.current.as_deref() == Some(key) {
      self.current = None;
    }
    if self.current.is_none() {
      self.current = self.projects.first().map(|p| p.path.clone());
    }
    Some(removed)
  }

  pub fn iter(&self) -> impl Iterator<Item = &Project> {
    self.projects.iter()
  }

  pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Project> {
    self.projects.iter_mut()
  }

  pub fn keys(&self) -> Vec<PathBuf> {
    self.projects.iter().map(|p| p.path.clone()).collect()
  }

  pub fn len(&self) -> usize {
    self.projects.len()
  }

  pub fn is_empty(&self) -> bool {
    self.projects.is_empty()
  }

  pub fn current(&self) -> Option<&Project> {
    let key = self.current.as_deref()?;
    self.get(key)
  }

  pub fn current_mut(&mut self) -> Option<&mut Project> {
    let key = self.current.clone()?;
    self.get_mut(&key)
  }

  pub fn current_key(&self) -> Option<&Path> {
    self.current.as_deref()
  }

  pub fn set_current(&mut self, key: &Path) -> bool {
    if self.contains(key) {
      self.current = Some(key.to_path_buf());
      true
    } else {
      false
    }
  }

  pub fn clear_current(&mut self) {
    self.current = None;
  }

  /// Current-project selection: the registered project whose srcRoot (or
  /// resolved srcRoot) is the longest string prefix of `path`. Ties go to
  /// the first registered project; no match leaves current unchanged.
  pub fn update_for_path(&mut self, path: &Path) -> bool {
    let text = path.to_string_lossy();
    let mut best: Option<(usize, PathBuf)> = None;
    for project in &self.projects {
      for root in [project.src_root(), project.resolved_src_root()].into_iter().flatten() {
        let root_text = root.to_string_lossy();
        if text.starts_with(root_text.as_ref()) {
          let length = root_text.len();
          if best.as_ref().is_none_or(|(longest, _)| length > *longest) {
            best = Some((length, project.path.clone()));
          }
        }
      }
    }
    match best {
      Some((_, key)) => {
        debug!(path = %path.display(), project = %key.display(), "selected current project");
        self.current = Some(key);
        true
      }
      None => false,
    }
  }
}

// ============================================================================
// Source-root discovery
// ============================================================================

/// Markers tested at each ancestor, in priority order. `true` marks a glob
/// that needs a directory scan.
const ROOT_MARKERS: &[(&str, bool)] = &[
  ("GTAGS", false),
  ("configure", false),
  (".git", false),
  ("CMakeLists.txt", false),
  ("*.pro", true),
  ("scons.1", false),
  ("*.scons", true),
  ("SConstruct", false),
  ("autogen.*", true),
  ("Makefile*", true),
  ("GNUMakefile*", true),
  ("INSTALL*", true),
  ("README*", true),
];

/// Find the source root for `input` (the first file of an ingestion). Walks
/// ancestors deepest to shallowest testing the marker table, then falls
/// back to a `config.status` scan. Hits in the home directory never count.
pub fn find_project_root(input: &Path, home: &Path) -> Option<PathBuf> {
  for ancestor in input.ancestors().skip(1) {
    if ancestor.as_os_str().is_empty() || ancestor == Path::new("/") {
      break;
    }
    if ancestor == home {
      continue;
    }
    for (marker, is_glob) in ROOT_MARKERS {
      let hit = if *is_glob {
        dir_has_glob(ancestor, marker)
      } else {
        ancestor.join(marker).exists()
      };
      if hit {
        return Some(ancestor.to_path_buf());
      }
    }
  }

  // config.status records the configure invocation; its first tokens name
  // the configure script's directory.
  for ancestor in input.ancestors().skip(1) {
    if ancestor.as_os_str().is_empty() || ancestor == Path::new("/") {
      break;
    }
    let status = ancestor.join("config.status");
    if !status.is_file() {
      continue;
    }
    if let Some(root) = root_from_config_status(&status, home) {
      return Some(root);
    }
    break;
  }

  None
}

fn dir_has_glob(dir: &Path, pattern: &str) -> bool {
  let Ok(glob) = Glob::new(pattern) else {
    return false;
  };
  let matcher = glob.compile_matcher();
  let Ok(entries) = fs::read_dir(dir) else {
    return false;
  };
  for entry in entries.flatten() {
    let name = entry.file_name();
    let name = name.to_string_lossy();
    if name == "." || name == ".." {
      continue;
    }
    if matcher.is_match(name.as_ref()) {
      return true;
    }
  }
  false
}

fn root_from_config_status(status: &Path, home: &Path) -> Option<PathBuf> {
  let file = fs::File::open(status).ok()?;
  let reader = BufReader::new(file);
  for line in reader.lines().take(10) {
    let Ok(line) = line else { break };
    if let Some(index) = line.find("configure") {
      let prefix = line[..index].trim();
      if prefix.is_empty() {
        continue;
      }
      let root = PathBuf::from(prefix);
      let root = root.canonicalize().unwrap_or(root);
      if root.is_dir() && root != home {
        return Some(root);
      }
    }
  }
  None
}

// ============================================================================
// Tests
// ============================================================================
