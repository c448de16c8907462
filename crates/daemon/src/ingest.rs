//! Build ingestion: dry-run output parsing and smart-project discovery.
//!
//! A makefile project runs the build tool with `-n` and turns every printed
//! compiler invocation into a [`CompileCommand`]; a smart project walks a
//! directory tree and synthesizes the commands instead. Both feed the
//! dispatcher the same `FileReady`/`IngestDone` event protocol.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::event::{ConnId, ServerEvent};

/// Source language of a compile command; `None` means the line was a
/// compiler invocation but not a compile step (link, archive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
  C,
  CPlusPlus,
  None,
}

#[derive(Debug, Clone)]
pub struct CompileCommand {
  pub compiler: PathBuf,
  pub args: Vec<String>,
  pub inputs: Vec<PathBuf>,
  pub language: Language,
}

// ============================================================================
// Dry-run output parsing
// ============================================================================

const SOURCE_EXTENSIONS: &[&str] = &["c", "cpp", "cc", "cxx", "C"];

fn is_source_file(path: &Path) -> bool {
  path
    .extension()
    .and_then(|e| e.to_str())
    .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
}

fn is_compiler(token: &str) -> bool {
  let name = Path::new(token).file_name().and_then(|n| n.to_str()).unwrap_or(token);
  matches!(name, "cc" | "gcc" | "c++" | "g++" | "clang" | "clang++")
    || name.starts_with("gcc-")
    || name.starts_with("g++-")
    || name.starts_with("clang-")
}

/// Minimal shell-style tokenizer: whitespace separated, single and double
/// quotes grouped, no escapes. Dry-run output is not a full shell script.
fn tokenize(line: &str) -> Vec<String> {
  let mut tokens = Vec::new();
  let mut current = String::new();
  let mut quote: Option<char> = None;
  for c in line.chars() {
    match quote {
      Some(q) if c == q => quote = None,
      Some(_) => current.push(c),
      None if c == '"' || c == '\'' => quote = Some(c),
      None if c.is_whitespace() => {
        if !current.is_empty() {
          tokens.push(std::mem::take(&mut current));
        }
      }
      None => current.push(c),
    }
  }
  if !current.is_empty() {
    tokens.push(current);
  }
  tokens
}

/// Parse one line of dry-run output. Returns `None` for non-compiler lines;
/// a command with [`Language::None`] is a compiler invocation without a
/// source input and is skipped by the dispatcher.
pub fn parse_dry_run_line(line: &str, cwd: &Path) -> Option<CompileCommand> {
  let tokens = tokenize(line);
  let compiler_index = tokens.iter().position(|t| is_compiler(t))?;
  let compiler = PathBuf::from(&tokens[compiler_index]);

  let mut args = Vec::new();
  let mut inputs = Vec::new();
  let mut iter = tokens[compiler_index + 1..].iter();
  while let Some(token) = iter.next() {
    match token.as_str() {
      "-c" => {}
      "-o" => {
        iter.next();
      }
      "-I" | "-D" | "-include" | "-isystem" => {
        // Two-token form; keep both.
        args.push(token.clone());
        if let Some(value) = iter.next() {
          args.push(value.clone());
        }
      }
      t if t.starts_with('-') => args.push(token.clone()),
      t => {
        let path = Path::new(t);
        if is_source_file(path) {
          let absolute = if path.is_absolute() {
            path.to_path_buf()
          } else {
            cwd.join(path)
          };
          inputs.push(absolute.canonicalize().unwrap_or(absolute));
        }
        // Object files and other outputs are not ours.
      }
    }
  }

  let language = if inputs.is_empty() {
    Language::None
  } else if compiler.to_string_lossy().contains("++") || inputs.iter().any(|p| !p.extension().is_some_and(|e| e == "c"))
  {
    Language::CPlusPlus
  } else {
    Language::C
  };

  Some(CompileCommand {
    compiler,
    args,
    inputs,
    language,
  })
}

// ============================================================================
// Makefile ingestion
// ============================================================================

pub struct IngestConfig {
  pub build_tool: String,
  pub makefile: PathBuf,
  pub args: Vec<String>,
  pub no_make_tricks: bool,
  pub conn: Option<ConnId>,
}

/// Spawn the build tool in dry-run mode and stream `FileReady` events; ends
/// with `IngestDone`. Cancelling the token discards remaining output.
pub fn start_build_ingest(config: IngestConfig, events: UnboundedSender<ServerEvent>, cancel: CancellationToken) {
  tokio::spawn(async move {
    let project = config.makefile.clone();
    let ok = run_build_ingest(&config, &events, &cancel).await;
    let _ = events.send(ServerEvent::IngestDone {
      project,
      conn: config.conn,
      ok,
    });
  });
}

async fn run_build_ingest(config: &IngestConfig, events: &UnboundedSender<ServerEvent>, cancel: &CancellationToken) -> bool {
  let dir = config
    .makefile
    .parent()
    .map(Path::to_path_buf)
    .unwrap_or_else(|| PathBuf::from("."));

  let mut command = Command::new(&config.build_tool);
  command
    .arg("-n")
    .arg("-f")
    .arg(&config.makefile)
    .arg("-C")
    .arg(&dir)
    .args(&config.args)
    .stdin(std::process::Stdio::null())
    .stdout(std::process::Stdio::piped())
    .stderr(std::process::Stdio::null());
  if !config.no_make_tricks {
    command.arg("--keep-going");
  }

  let mut child = match command.spawn() {
    Ok(child) => child,
    Err(e) => {
      warn!(makefile = %config.makefile.display(), error = %e, "cannot spawn build tool");
      return false;
    }
  };

  let stdout = child.stdout.take().expect("stdout was piped");
  let mut lines = BufReader::new(stdout).lines();
  let mut pending = String::new();

  loop {
    let line = tokio::select! {
      _ = cancel.cancelled() => {
        let _ = child.kill().await;
        return false;
      }
      line = lines.next_line() => line,
    };
    let line = match line {
      Ok(Some(line)) => line,
      Ok(None) => break,
      Err(e) => {
        warn!(error = %e, "error reading dry-run output");
        break;
      }
    };

    // Continuation lines belong to the same command.
    if let Some(stripped) = line.strip_suffix('\\') {
      pending.push_str(stripped);
      pending.push(' ');
      continue;
    }
    pending.push_str(&line);
    let full = std::mem::take(&mut pending);

    if let Some(command) = parse_dry_run_line(&full, &dir) {
      debug!(inputs = command.inputs.len(), "dry-run compile command");
      let _ = events.send(ServerEvent::FileReady {
        project: config.makefile.clone(),
        command,
      });
    }
  }

  match child.wait().await {
    Ok(status) => status.success(),
    Err(e) => {
      warn!(error = %e, "build tool did not exit cleanly");
      false
    }
  }
}

// ============================================================================
// Smart projects
// ============================================================================

/// File selection rules for a smart-project walk.
pub struct SmartRules {
  includes: GlobSet,
  excludes: GlobSet,
}

impl Default for SmartRules {
  fn default() -> Self {
    let mut includes = GlobSetBuilder::new();
    for pattern in ["*.c", "*.cpp", "*.cc", "*.cxx", "*.C"] {
      includes.add(Glob::new(pattern).expect("static glob"));
    }
    Self {
      includes: includes.build().expect("static glob set"),
      excludes: GlobSet::empty(),
    }
  }
}

impl SmartRules {
  fn matches(&self, path: &Path) -> bool {
    let Some(name) = path.file_name() else {
      return false;
    };
    self.includes.is_match(name) && !self.excludes.is_match(name)
  }
}

/// Walk `dir`, group the matching sources by directory, and synthesize one
/// compile command per directory with `-I` for every directory that holds
/// sources. Runs the same event protocol as the build ingester.
pub fn start_smart_ingest(
  dir: PathBuf,
  extra_flags: Vec<String>,
  conn: Option<ConnId>,
  events: UnboundedSender<ServerEvent>,
  cancel: CancellationToken,
) {
  tokio::spawn(async move {
    let rules = SmartRules::default();
    let commands = tokio::task::spawn_blocking({
      let dir = dir.clone();
      move || discover_smart_commands(&dir, &rules, &extra_flags)
    })
    .await
    .unwrap_or_default();

    for command in commands {
      if cancel.is_cancelled() {
        break;
      }
      let _ = events.send(ServerEvent::FileReady {
        project: dir.clone(),
        command,
      });
    }
    let _ = events.send(ServerEvent::IngestDone {
      project: dir,
      conn,
      ok: true,
    });
  });
}

fn discover_smart_commands(dir: &Path, rules: &SmartRules, extra_flags: &[String]) -> Vec<CompileCommand> {
  let mut by_dir: std::collections::BTreeMap<PathBuf, Vec<PathBuf>> = std::collections::BTreeMap::new();
  for entry in WalkBuilder::new(dir).build().flatten() {
    if !entry.file_type().is_some_and(|t| t.is_file()) {
      continue;
    }
    let path = entry.into_path();
    if rules.matches(&path) {
      let parent = path.parent().unwrap_or(dir).to_path_buf();
      by_dir.entry(parent).or_default().push(path);
    }
  }

  let include_args: Vec<String> = std::iter::once(dir.to_path_buf())
    .chain(by_dir.keys().cloned())
    .collect::<std::collections::BTreeSet<_>>()
    .into_iter()
    .map(|d| format!("-I{}", d.display()))
    .collect();

  by_dir
    .into_values()
    .map(|inputs| {
      let language = if inputs.iter().all(|p| p.extension().is_some_and(|e| e == "c")) {
        Language::C
      } else {
        Language::CPlusPlus
      };
      let mut args = include_args.clone();
      args.extend(extra_flags.iter().cloned());
      CompileCommand {
        compiler: PathBuf::from(if language == Language::C { "/usr/bin/cc" } else { "/usr/bin/c++" }),
        args,
        inputs,
        language,
      }
    })
    .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_simple_compile_line() {
    let command = parse_dry_run_line("gcc -c -I include -DNDEBUG -o build/a.o src/a.c", Path::new("/proj")).unwrap();
    assert_eq!(command.compiler, PathBuf::from("gcc"));
    assert_eq!(command.language, Language::C);
    assert_eq!(command.inputs, vec![PathBuf::from("/proj/src/a.c")]);
    assert!(command.args.contains(&"-DNDEBUG".to_string()));
    assert!(command.args.contains(&"include".to_string()));
    // Output and -c are dropped.
    assert!(!command.args.contains(&"-o".to_string()));
    assert!(!command.args.contains(&"-c".to_string()));
  }

  #[test]
  fn test_parse_cpp_and_quoted_args() {
    let command =
      parse_dry_run_line("g++ -std=c++17 -D'NAME=\"x y\"' -c /proj/w.cpp -o w.o", Path::new("/proj")).unwrap();
    assert_eq!(command.language, Language::CPlusPlus);
    assert_eq!(command.inputs, vec![PathBuf::from("/proj/w.cpp")]);
    assert!(command.args.iter().any(|a| a.contains("NAME=")));
  }

  #[test]
  fn test_non_compiler_lines_are_ignored() {
    assert!(parse_dry_run_line("echo building...", Path::new("/")).is_none());
    assert!(parse_dry_run_line("mkdir -p build", Path::new("/")).is_none());
    assert!(parse_dry_run_line("", Path::new("/")).is_none());
  }

  #[test]
  fn test_link_line_has_no_language() {
    let command = parse_dry_run_line("gcc -o app a.o b.o", Path::new("/proj")).unwrap();
    assert_eq!(command.language, Language::None);
    assert!(command.inputs.is_empty());
  }

  #[test]
  fn test_smart_discovery_groups_by_directory() {
    let dir = tempfile::tempdir().unwrap();
    let sub = dir.path().join("lib");
    std::fs::create_dir_all(&sub).unwrap();
    std::fs::write(dir.path().join("main.c"), "int main(void){return 0;}\n").unwrap();
    std::fs::write(sub.join("util.c"), "int util(void){return 1;}\n").unwrap();
    std::fs::write(sub.join("README"), "not source\n").unwrap();

    let commands = discover_smart_commands(dir.path(), &SmartRules::default(), &["-DEXTRA".to_string()]);
    assert_eq!(commands.len(), 2);
    for command in &commands {
      assert_eq!(command.language, Language::C);
      assert!(command.args.iter().any(|a| a == &format!("-I{}", sub.display())));
      assert!(command.args.contains(&"-DEXTRA".to_string()));
    }
    let all_inputs: Vec<_> = commands.iter().flat_map(|c| c.inputs.iter()).collect();
    assert_eq!(all_inputs.len(), 2);
  }
}
