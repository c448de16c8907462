//! Daemon runtime configuration.

use std::path::PathBuf;

/// Everything the daemon needs to run; filled in by the CLI and passed
/// explicitly to the components that need it.
#[derive(Debug, Clone)]
pub struct Options {
  /// Path of the Unix socket clients connect to.
  pub socket_path: PathBuf,
  /// Directory holding the `paths` blob, per-project blobs and KV stores.
  pub data_dir: PathBuf,
  /// The registered-projects file, rewritten after registration changes.
  pub projects_file: PathBuf,
  /// Worker pool size; 0 means one per host CPU.
  pub thread_count: usize,
  /// Extra compiler arguments appended to every compile command.
  pub default_args: Vec<String>,
  /// Skip the built-in system include path.
  pub no_builtin_include: bool,
  /// Do not append `-Wall`.
  pub no_wall: bool,
  /// Wipe the data directory at startup.
  pub clear_projects: bool,
  /// Build tool spawned in dry-run mode for makefile projects.
  pub build_tool: String,
}

impl Default for Options {
  fn default() -> Self {
    let base = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp")).join(".cnav");
    Self {
      socket_path: base.join("cnavd.sock"),
      data_dir: base.join("data"),
      projects_file: base.join("projects"),
      thread_count: 0,
      default_args: Vec::new(),
      no_builtin_include: false,
      no_wall: false,
      clear_projects: false,
      build_tool: "make".to_string(),
    }
  }
}

impl Options {
  /// The argument list appended to every compile command, derived from the
  /// flags once at startup.
  pub fn effective_default_args(&self) -> Vec<String> {
    let mut args = self.default_args.clone();
    if !self.no_builtin_include {
      args.push("-I/usr/include".to_string());
    }
    if !self.no_wall {
      args.push("-Wall".to_string());
    }
    args
  }

  pub fn worker_threads(&self) -> usize {
    if self.thread_count == 0 {
      num_cpus::get()
    } else {
      self.thread_count
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_args_follow_flags() {
    let mut options = Options::default();
    assert!(options.effective_default_args().contains(&"-Wall".to_string()));

    options.no_wall = true;
    options.no_builtin_include = true;
    options.default_args = vec!["-DDEBUG".to_string()];
    assert_eq!(options.effective_default_args(), vec!["-DDEBUG".to_string()]);
  }
}
