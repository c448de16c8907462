//! The registered-projects file.
//!
//! An INI-shaped text file with three groups. `[Makefiles]` maps a makefile
//! path to its serialized build arguments, `[GRTags]` lists directories one
//! per line, `[SmartProjects]` maps a directory to `|`-joined extra flags.
//! The file is rewritten atomically after every registration change.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Build arguments recorded for a makefile project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MakefileInfo {
  pub args: Vec<String>,
  pub extra_flags: Vec<String>,
  /// Disable the build-tool override tricks for this makefile.
  #[serde(default)]
  pub no_make_tricks: bool,
}

#[derive(Debug, Default, PartialEq)]
pub struct ProjectsFile {
  pub makefiles: Vec<(PathBuf, MakefileInfo)>,
  pub grtags: Vec<PathBuf>,
  pub smart: Vec<(PathBuf, Vec<String>)>,
}

#[derive(PartialEq)]
enum Group {
  None,
  Makefiles,
  GrTags,
  Smart,
}

impl ProjectsFile {
  /// Parse the file; a missing file is an empty registry, an unparseable
  /// line is logged and skipped.
  pub fn load(path: &Path) -> Self {
    let mut result = Self::default();
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return result,
      Err(e) => {
        warn!(path = %path.display(), error = %e, "cannot read projects file");
        return result;
      }
    };

    let mut group = Group::None;
    for line in content.lines() {
      let line = line.trim();
      if line.is_empty() || line.starts_with('#') {
        continue;
      }
      match line {
        "[Makefiles]" => group = Group::Makefiles,
        "[GRTags]" => group = Group::GrTags,
        "[SmartProjects]" => group = Group::Smart,
        _ => match group {
          Group::Makefiles => {
            let Some((key, value)) = line.split_once('=') else {
              warn!(line, "projects file: makefile entry without value");
              continue;
            };
            match serde_json::from_str::<MakefileInfo>(value) {
              Ok(info) => result.makefiles.push((PathBuf::from(key), info)),
              Err(e) => warn!(line, error = %e, "projects file: bad makefile information"),
            }
          }
          Group::GrTags => result.grtags.push(PathBuf::from(line)),
          Group::Smart => {
            let (key, value) = line.split_once('=').unwrap_or((line, ""));
            let flags = if value.is_empty() {
              Vec::new()
            } else {
              value.split('|').map(str::to_string).collect()
            };
            result.smart.push((PathBuf::from(key), flags));
          }
          Group::None => warn!(line, "projects file: entry outside any group"),
        },
      }
    }
    result
  }

  /// Rewrite the file atomically (temp file + rename).
  pub fn save(&self, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)?;
    }
    let mut out = String::new();
    out.push_str("[Makefiles]\n");
    for (key, info) in &self.makefiles {
      out.push_str(&format!(
        "{}={}\n",
        key.display(),
        serde_json::to_string(info).expect("makefile info serializes")
      ));
    }
    out.push_str("[GRTags]\n");
    for dir in &self.grtags {
      out.push_str(&format!("{}\n", dir.display()));
    }
    out.push_str("[SmartProjects]\n");
    for (key, flags) in &self.smart {
      out.push_str(&format!("{}={}\n", key.display(), flags.join("|")));
    }

    let tmp = path.with_extension("tmp");
    {
      let mut file = fs::File::create(&tmp)?;
      file.write_all(out.as_bytes())?;
      file.sync_all()?;
    }
    fs::rename(&tmp, path)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_roundtrip_all_groups() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("projects");

    let file = ProjectsFile {
      makefiles: vec![(
        PathBuf::from("/proj/Makefile"),
        MakefileInfo {
          args: vec!["-j4".into()],
          extra_flags: vec!["-DX=1".into()],
          no_make_tricks: true,
        },
      )],
      grtags: vec![PathBuf::from("/proj/tags")],
      smart: vec![(PathBuf::from("/proj/smart"), vec!["-I/inc".into(), "-DY".into()])],
    };
    file.save(&path).unwrap();

    assert_eq!(ProjectsFile::load(&path), file);
  }

  #[test]
  fn test_missing_file_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(ProjectsFile::load(&dir.path().join("absent")), ProjectsFile::default());
  }

  #[test]
  fn test_bad_lines_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("projects");
    std::fs::write(
      &path,
      "[Makefiles]\n/ok={\"args\":[],\"extra_flags\":[]}\n/broken=not-json\n[GRTags]\n/tags\n",
    )
    .unwrap();

    let file = ProjectsFile::load(&path);
    assert_eq!(file.makefiles.len(), 1);
    assert_eq!(file.makefiles[0].0, PathBuf::from("/ok"));
    assert_eq!(file.grtags, vec![PathBuf::from("/tags")]);
  }

  #[test]
  fn test_smart_project_without_flags() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("projects");
    std::fs::write(&path, "[SmartProjects]\n/proj\n").unwrap();
    let file = ProjectsFile::load(&path);
    assert_eq!(file.smart, vec![(PathBuf::from("/proj"), Vec::new())]);
  }
}
