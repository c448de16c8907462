//! The C/C++ frontend seam.
//!
//! The daemon core never names a parser: indexing jobs hand a compile
//! command to a [`TranslationUnitProvider`] and merge whatever comes back.
//! The built-in provider ([`SitterProvider`]) parses the unit with the
//! tree-sitter C/C++ grammars; tests substitute script-driven fakes.

mod languages;
mod sitter;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};

use cnav_store::{DependencyMap, FileId, PathTable, ReferenceMap, SourceInfo, SymbolMap, SymbolNameMap};

pub use sitter::SitterProvider;

// ============================================================================
// Parse output
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
  Note,
  Warning,
  Error,
}

impl std::fmt::Display for Severity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      Severity::Note => "note",
      Severity::Warning => "warning",
      Severity::Error => "error",
    })
  }
}

/// One compiler-style diagnostic for a file in the unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
  pub file_id: FileId,
  pub line: u32,
  pub column: u32,
  pub severity: Severity,
  pub message: String,
}

/// A suggested textual replacement: `length` bytes at `offset` become `text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixIt {
  pub offset: u32,
  pub length: u32,
  pub text: String,
}

/// Everything extracted from one translation unit, shaped like the
/// indexer's staging maps so merging is a plain union.
#[derive(Debug, Default)]
pub struct ParsedUnit {
  pub symbols: SymbolMap,
  pub symbol_names: SymbolNameMap,
  pub references: ReferenceMap,
  pub dependencies: DependencyMap,
  /// Precompiled-header dependencies; empty for providers without pch
  /// support (the built-in one).
  pub pch_dependencies: DependencyMap,
  pub diagnostics: Vec<Diagnostic>,
  pub fix_its: HashMap<FileId, Vec<FixIt>>,
}

// ============================================================================
// Provider contract
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
  #[error("cannot read {path}: {source}")]
  Read {
    path: std::path::PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("grammar rejected: {0}")]
  Grammar(String),
  #[error("parse aborted")]
  Aborted,
}

/// The opaque parser frontend. `aborted` is the owning job's cooperative
/// cancellation flag; implementations check it between files and bail out
/// with [`ParseError::Aborted`].
pub trait TranslationUnitProvider: Send + Sync {
  fn parse(&self, unit: &SourceInfo, paths: &PathTable, aborted: &AtomicBool) -> Result<ParsedUnit, ParseError>;

  /// Preprocessed view of the unit's main file. The default is the raw
  /// file contents; providers backed by a real compiler may do better.
  fn preprocess(&self, unit: &SourceInfo) -> Result<String, ParseError> {
    std::fs::read_to_string(&unit.source_file).map_err(|source| ParseError::Read {
      path: unit.source_file.clone(),
      source,
    })
  }
}
