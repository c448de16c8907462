//! Shared index records.
//!
//! Everything here is small, `serde`-serializable and structurally
//! comparable; the indexer merges these records, the KV adapter persists
//! them, and query jobs read them back.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Stable id assigned to an absolute path by the [`crate::PathTable`].
/// Id 0 is reserved and means "no file".
pub type FileId = u32;

// ============================================================================
// Location
// ============================================================================

/// A point in a translation unit: file id plus byte offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
  pub file_id: FileId,
  pub offset: u32,
}

impl Location {
  pub const NULL: Location = Location { file_id: 0, offset: 0 };

  pub fn new(file_id: FileId, offset: u32) -> Self {
    Self { file_id, offset }
  }

  /// A location with file id 0 points nowhere.
  pub fn is_null(&self) -> bool {
    self.file_id == 0
  }

  /// Ordered byte key: big-endian file id then big-endian offset, so a
  /// store range scan over one file's prefix yields offsets in order.
  pub fn to_key(self) -> [u8; 8] {
    let mut key = [0u8; 8];
    key[..4].copy_from_slice(&self.file_id.to_be_bytes());
    key[4..].copy_from_slice(&self.offset.to_be_bytes());
    key
  }

  pub fn from_key(key: &[u8]) -> Option<Self> {
    if key.len() != 8 {
      return None;
    }
    let file_id = u32::from_be_bytes(key[..4].try_into().ok()?);
    let offset = u32::from_be_bytes(key[4..].try_into().ok()?);
    Some(Self { file_id, offset })
  }

  /// Key prefix covering every location in `file_id`.
  pub fn file_prefix(file_id: FileId) -> [u8; 4] {
    file_id.to_be_bytes()
  }
}

// ============================================================================
// Reference kinds & symbol kinds
// ============================================================================

/// How a reference relates to its target. Only non-[`RefKind::Normal`]
/// kinds induce bidirectional back-links between the two cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefKind {
  Normal,
  MemberFunction,
  GlobalFunction,
  Macro,
}

impl RefKind {
  pub fn is_normal(&self) -> bool {
    matches!(self, RefKind::Normal)
  }
}

/// The kind of entity a cursor points at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolKind {
  #[default]
  Invalid,
  Function,
  Method,
  Struct,
  Class,
  Enum,
  EnumConstant,
  Typedef,
  Variable,
  Field,
  Macro,
  /// A declaration without a body; superseded by definition-like kinds
  /// when the two meet in a merge.
  Declaration,
  Reference,
}

impl SymbolKind {
  /// Definition-like kinds win over declaration-like kinds in
  /// [`CursorInfo::unite`].
  pub fn is_definition(&self) -> bool {
    matches!(
      self,
      SymbolKind::Function
        | SymbolKind::Method
        | SymbolKind::Struct
        | SymbolKind::Class
        | SymbolKind::Enum
        | SymbolKind::EnumConstant
        | SymbolKind::Typedef
        | SymbolKind::Variable
        | SymbolKind::Field
        | SymbolKind::Macro
    )
  }
}

impl std::fmt::Display for SymbolKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      SymbolKind::Invalid => "Invalid",
      SymbolKind::Function => "Function",
      SymbolKind::Method => "Method",
      SymbolKind::Struct => "Struct",
      SymbolKind::Class => "Class",
      SymbolKind::Enum => "Enum",
      SymbolKind::EnumConstant => "EnumConstant",
      SymbolKind::Typedef => "Typedef",
      SymbolKind::Variable => "Variable",
      SymbolKind::Field => "Field",
      SymbolKind::Macro => "Macro",
      SymbolKind::Declaration => "Declaration",
      SymbolKind::Reference => "Reference",
    };
    f.write_str(name)
  }
}

// ============================================================================
// CursorInfo
// ============================================================================

/// The indexer's per-location record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorInfo {
  pub kind: SymbolKind,
  /// Definition/declaration this cursor resolves to; null when unknown.
  pub target: Location,
  /// Locations that refer to this cursor.
  pub references: BTreeSet<Location>,
  /// Stable unit-independent symbol id.
  pub usr: String,
  pub symbol_name: String,
}

impl CursorInfo {
  pub fn is_empty(&self) -> bool {
    self.kind == SymbolKind::Invalid && self.target.is_null() && self.references.is_empty() && self.usr.is_empty()
  }

  /// Merge `other` into `self`. Reference sets are unioned, a null target
  /// is filled from the incoming record, and an incoming definition-like
  /// kind replaces a declaration-like one (ties keep the earliest-seen
  /// kind and usr). Returns true when anything changed.
  pub fn unite(&mut self, other: &CursorInfo) -> bool {
    let mut changed = false;

    let before = self.references.len();
    self.references.extend(other.references.iter().copied());
    if self.references.len() != before {
      changed = true;
    }

    if self.target.is_null() && !other.target.is_null() {
      self.target = other.target;
      changed = true;
    }

    if self.kind == SymbolKind::Invalid && other.kind != SymbolKind::Invalid {
      self.kind = other.kind;
      changed = true;
    } else if self.kind != other.kind && other.kind.is_definition() && !self.kind.is_definition() {
      self.kind = other.kind;
      changed = true;
    }

    if self.usr.is_empty() && !other.usr.is_empty() {
      self.usr = other.usr.clone();
      changed = true;
    } else if self.kind == other.kind && !other.usr.is_empty() && self.usr.is_empty() {
      self.usr = other.usr.clone();
      changed = true;
    }

    if self.symbol_name.is_empty() && !other.symbol_name.is_empty() {
      self.symbol_name = other.symbol_name.clone();
      changed = true;
    }

    changed
  }
}

// ============================================================================
// SourceInfo & FileInformation
// ============================================================================

/// One translation unit's compile command. Equality is structural; an
/// incoming `SourceInfo` equal to the stored one is clean and skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
  pub source_file: PathBuf,
  pub compiler: PathBuf,
  pub args: Vec<String>,
}

impl SourceInfo {
  pub fn is_null(&self) -> bool {
    self.source_file.as_os_str().is_empty()
  }
}

/// Per-file record persisted in the `file_information` store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInformation {
  pub args: Vec<String>,
  /// Seconds since the Unix epoch at the time the file was last indexed.
  pub last_touched: u64,
}

// ============================================================================
// Mergeable map shapes
// ============================================================================

/// Symbol name -> every location carrying that name (union-merged).
pub type SymbolNameMap = std::collections::HashMap<String, BTreeSet<Location>>;
/// Location -> cursor record (merged via [`CursorInfo::unite`]).
pub type SymbolMap = std::collections::HashMap<Location, CursorInfo>;
/// Referring location -> (target location, reference kind); last writer wins.
pub type ReferenceMap = std::collections::HashMap<Location, (Location, RefKind)>;
/// File -> files it transitively depends on (union-merged).
pub type DependencyMap = std::collections::HashMap<FileId, BTreeSet<FileId>>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
  use super::*;

  fn loc(file: u32, offset: u32) -> Location {
    Location::new(file, offset)
  }

  #[test]
  fn test_location_key_roundtrip_and_order() {
    let a = loc(1, 500);
    let b = loc(2, 10);
    assert_eq!(Location::from_key(&a.to_key()), Some(a));
    // Byte order must agree with (file_id, offset) order.
    assert!(a.to_key() < b.to_key());
    assert!(loc(1, 10).to_key() < a.to_key());
  }

  #[test]
  fn test_null_location() {
    assert!(Location::NULL.is_null());
    assert!(!loc(1, 0).is_null());
  }

  #[test]
  fn test_unite_unions_references() {
    let mut a = CursorInfo {
      references: [loc(1, 10)].into_iter().collect(),
      ..Default::default()
    };
    let b = CursorInfo {
      references: [loc(1, 10), loc(2, 20)].into_iter().collect(),
      ..Default::default()
    };
    assert!(a.unite(&b));
    assert_eq!(a.references.len(), 2);
    // Second merge with the same record is a no-op.
    assert!(!a.unite(&b));
  }

  #[test]
  fn test_unite_fills_null_target() {
    let mut a = CursorInfo::default();
    let b = CursorInfo {
      target: loc(3, 7),
      ..Default::default()
    };
    assert!(a.unite(&b));
    assert_eq!(a.target, loc(3, 7));

    // An already-set target is kept.
    let c = CursorInfo {
      target: loc(9, 9),
      ..Default::default()
    };
    a.unite(&c);
    assert_eq!(a.target, loc(3, 7));
  }

  #[test]
  fn test_unite_prefers_definition_kind() {
    let mut decl = CursorInfo {
      kind: SymbolKind::Declaration,
      ..Default::default()
    };
    let def = CursorInfo {
      kind: SymbolKind::Function,
      ..Default::default()
    };
    assert!(decl.unite(&def));
    assert_eq!(decl.kind, SymbolKind::Function);

    // The reverse direction does not downgrade.
    let mut def = CursorInfo {
      kind: SymbolKind::Function,
      ..Default::default()
    };
    let decl = CursorInfo {
      kind: SymbolKind::Declaration,
      ..Default::default()
    };
    assert!(!def.unite(&decl));
    assert_eq!(def.kind, SymbolKind::Function);
  }

  #[test]
  fn test_source_info_structural_equality() {
    let a = SourceInfo {
      source_file: "/src/a.c".into(),
      compiler: "/usr/bin/cc".into(),
      args: vec!["-I/src".into()],
    };
    let mut b = a.clone();
    assert_eq!(a, b);
    b.args.push("-DX".into());
    assert_ne!(a, b);
  }
}
