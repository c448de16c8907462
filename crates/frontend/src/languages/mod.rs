//! Per-language tree-sitter queries.

pub mod c;
pub mod cpp;

use tracing::warn;
use tree_sitter::{Language as TsLanguage, Query};

use cnav_store::SymbolKind;

/// Compiled query set for one grammar.
pub struct LanguageQueries {
  pub includes: Option<Query>,
  pub definitions: Option<Query>,
  pub calls: Option<Query>,
}

pub fn compile_query(grammar: &TsLanguage, source: &str) -> Option<Query> {
  match Query::new(grammar, source) {
    Ok(query) => Some(query),
    Err(e) => {
      warn!(error = %e, "failed to compile query");
      None
    }
  }
}

/// Map a `@definition.*` / `@declaration.*` capture name to a symbol kind.
pub fn kind_for_capture(capture: &str) -> Option<SymbolKind> {
  let kind = match capture {
    "definition.function" => SymbolKind::Function,
    "definition.method" => SymbolKind::Method,
    "definition.struct" => SymbolKind::Struct,
    "definition.class" => SymbolKind::Class,
    "definition.enum" => SymbolKind::Enum,
    "definition.enumconst" => SymbolKind::EnumConstant,
    "definition.type" => SymbolKind::Typedef,
    "definition.field" => SymbolKind::Field,
    "definition.macro" => SymbolKind::Macro,
    "declaration.function" => SymbolKind::Declaration,
    _ => return None,
  };
  Some(kind)
}
