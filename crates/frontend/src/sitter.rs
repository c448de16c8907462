//! Built-in tree-sitter provider.
//!
//! A translation unit is the compile command's main file plus every local
//! header reachable through quoted includes (resolved against the file's
//! directory and the command's `-I` paths). System headers are recorded as
//! unresolvable and skipped.
//!
//! Extraction runs three passes per file: definitions, then references,
//! then syntax diagnostics. References resolve against a unit-wide name
//! table built by the definitions pass, so a use in the main file can point
//! at a definition in an included header.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, trace};
use tree_sitter::{Language as TsLanguage, Node, Parser, QueryCursor, StreamingIterator};

use cnav_store::{CursorInfo, FileId, Location, PathTable, RefKind, SourceInfo, SymbolKind};

use crate::{
  Diagnostic, ParseError, ParsedUnit, Severity, TranslationUnitProvider,
  languages::{self, LanguageQueries, kind_for_capture},
};

/// Cap on syntax diagnostics per file so a binary blob fed to the parser
/// cannot balloon the diagnostics map.
const MAX_DIAGNOSTICS_PER_FILE: usize = 50;

struct GrammarSet {
  grammar: TsLanguage,
  queries: LanguageQueries,
}

pub struct SitterProvider {
  c: GrammarSet,
  cpp: GrammarSet,
}

impl Default for SitterProvider {
  fn default() -> Self {
    Self::new()
  }
}

impl SitterProvider {
  pub fn new() -> Self {
    let c_grammar: TsLanguage = tree_sitter_c::LANGUAGE.into();
    let cpp_grammar: TsLanguage = tree_sitter_cpp::LANGUAGE.into();
    let c_queries = languages::c::queries(&c_grammar);
    let cpp_queries = languages::cpp::queries(&cpp_grammar);
    Self {
      c: GrammarSet {
        grammar: c_grammar,
        queries: c_queries,
      },
      cpp: GrammarSet {
        grammar: cpp_grammar,
        queries: cpp_queries,
      },
    }
  }

  fn grammar_for(&self, path: &Path, main_is_c: bool) -> &GrammarSet {
    match path.extension().and_then(|e| e.to_str()) {
      Some("c") => &self.c,
      Some("h") if main_is_c => &self.c,
      _ => &self.cpp,
    }
  }
}

// ============================================================================
// Per-unit extraction state
// ============================================================================

struct UnitState {
  unit: ParsedUnit,
  /// name -> defining location; definitions shadow declarations.
  names: HashMap<String, (Location, SymbolKind)>,
  /// file id -> direct includes, for the transitive dependency closure.
  direct_includes: HashMap<FileId, BTreeSet<FileId>>,
}

struct ParsedFile {
  file_id: FileId,
  content: String,
  tree: tree_sitter::Tree,
}

impl TranslationUnitProvider for SitterProvider {
  fn parse(&self, unit: &SourceInfo, paths: &PathTable, aborted: &AtomicBool) -> Result<ParsedUnit, ParseError> {
    let main_is_c = unit.source_file.extension().and_then(|e| e.to_str()) == Some("c");
    let include_dirs = include_dirs(unit);

    let mut state = UnitState {
      unit: ParsedUnit::default(),
      names: HashMap::new(),
      direct_includes: HashMap::new(),
    };

    // Discover and parse every file of the unit, main file first.
    let mut parsed: Vec<ParsedFile> = Vec::new();
    let mut visited: HashSet<PathBuf> = HashSet::new();
    let mut worklist = vec![unit.source_file.clone()];

    while let Some(path) = worklist.pop() {
      if aborted.load(Ordering::Relaxed) {
        return Err(ParseError::Aborted);
      }
      if !visited.insert(path.clone()) {
        continue;
      }

      let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(source) => {
          if path == unit.source_file {
            return Err(ParseError::Read { path, source });
          }
          trace!(path = %path.display(), "skipping unreadable include");
          continue;
        }
      };

      let set = self.grammar_for(&path, main_is_c);
      let mut parser = Parser::new();
      parser
        .set_language(&set.grammar)
        .map_err(|e| ParseError::Grammar(e.to_string()))?;
      let Some(tree) = parser.parse(&content, None) else {
        debug!(path = %path.display(), "parser produced no tree");
        continue;
      };

      let file_id = paths.intern(&path);
      let includes = resolve_includes(set, &tree, &content, &path, &include_dirs);
      let mut direct = BTreeSet::new();
      for include in includes {
        direct.insert(paths.intern(&include));
        worklist.push(include);
      }
      state.direct_includes.insert(file_id, direct);

      parsed.push(ParsedFile { file_id, content, tree });
    }

    // Definitions across the whole unit before any reference resolves.
    for file in &parsed {
      if aborted.load(Ordering::Relaxed) {
        return Err(ParseError::Aborted);
      }
      let set = self.grammar_for(&paths.path_of(file.file_id).unwrap_or_default(), main_is_c);
      collect_definitions(set, file, &mut state);
    }

    link_declarations(&mut state);

    for file in &parsed {
      if aborted.load(Ordering::Relaxed) {
        return Err(ParseError::Aborted);
      }
      let set = self.grammar_for(&paths.path_of(file.file_id).unwrap_or_default(), main_is_c);
      collect_references(set, file, &mut state);
      collect_diagnostics(file, &mut state);
    }

    close_dependencies(&mut state);

    Ok(state.unit)
  }
}

// ============================================================================
// Includes
// ============================================================================

fn include_dirs(unit: &SourceInfo) -> Vec<PathBuf> {
  let mut dirs = Vec::new();
  if let Some(parent) = unit.source_file.parent() {
    dirs.push(parent.to_path_buf());
  }
  let mut args = unit.args.iter();
  while let Some(arg) = args.next() {
    if let Some(dir) = arg.strip_prefix("-I") {
      if dir.is_empty() {
        if let Some(next) = args.next() {
          dirs.push(PathBuf::from(next));
        }
      } else {
        dirs.push(PathBuf::from(dir));
      }
    }
  }
  dirs
}

fn resolve_includes(
  set: &GrammarSet,
  tree: &tree_sitter::Tree,
  content: &str,
  path: &Path,
  include_dirs: &[PathBuf],
) -> Vec<PathBuf> {
  let Some(query) = set.queries.includes.as_ref() else {
    return Vec::new();
  };

  let mut resolved = Vec::new();
  let mut cursor = QueryCursor::new();
  let mut matches = cursor.matches(query, tree.root_node(), content.as_bytes());
  while let Some(match_) = matches.next() {
    for cap in match_.captures {
      let capture_name = query.capture_names()[cap.index as usize];
      let Ok(text) = cap.node.utf8_text(content.as_bytes()) else {
        continue;
      };
      let cleaned = text.trim_matches(|c: char| c == '"' || c == '<' || c == '>');
      if cleaned.is_empty() {
        continue;
      }
      if capture_name == "include.system" {
        // System headers stay outside the unit.
        continue;
      }

      // Quoted include: the including file's directory wins, then -I order.
      let local = path.parent().map(|dir| dir.join(cleaned));
      let candidates = local
        .into_iter()
        .chain(include_dirs.iter().map(|dir| dir.join(cleaned)));
      for candidate in candidates {
        if candidate.is_file() {
          resolved.push(candidate.canonicalize().unwrap_or(candidate));
          break;
        }
      }
    }
  }
  resolved
}

// ============================================================================
// Definitions
// ============================================================================

fn collect_definitions(set: &GrammarSet, file: &ParsedFile, state: &mut UnitState) {
  let Some(query) = set.queries.definitions.as_ref() else {
    return;
  };

  let mut cursor = QueryCursor::new();
  let mut matches = cursor.matches(query, file.tree.root_node(), file.content.as_bytes());
  while let Some(match_) = matches.next() {
    let mut name_node: Option<Node> = None;
    let mut kind: Option<SymbolKind> = None;
    for cap in match_.captures {
      let capture_name = query.capture_names()[cap.index as usize];
      if capture_name == "name" {
        name_node = Some(cap.node);
      } else if let Some(k) = kind_for_capture(capture_name) {
        kind = Some(k);
      }
    }
    let (Some(node), Some(kind)) = (name_node, kind) else {
      continue;
    };
    let Ok(name) = node.utf8_text(file.content.as_bytes()) else {
      continue;
    };

    let location = Location::new(file.file_id, node.start_byte() as u32);
    let qualified = enclosing_type_name(node, &file.content).map(|parent| format!("{}::{}", parent, name));
    let usr = match &qualified {
      Some(q) => format!("c:@{}", q.replace("::", "@")),
      None => format!("c:@{}", name),
    };

    let info = CursorInfo {
      kind,
      target: Location::NULL,
      references: BTreeSet::new(),
      usr,
      symbol_name: qualified.clone().unwrap_or_else(|| name.to_string()),
    };
    state.unit.symbols.entry(location).or_default().unite(&info);

    state
      .unit
      .symbol_names
      .entry(name.to_string())
      .or_default()
      .insert(location);
    if let Some(qualified) = qualified {
      state.unit.symbol_names.entry(qualified).or_default().insert(location);
    }

    // Definitions shadow declarations in the resolution table.
    let replace = match state.names.get(name) {
      Some((_, existing)) => kind.is_definition() && !existing.is_definition(),
      None => true,
    };
    if replace {
      state.names.insert(name.to_string(), (location, kind));
    }
  }
}

/// Point declarations at their definition and vice versa.
fn link_declarations(state: &mut UnitState) {
  let mut links: Vec<(Location, Location)> = Vec::new();
  for (location, info) in &state.unit.symbols {
    if info.kind != SymbolKind::Declaration {
      continue;
    }
    let bare = info.symbol_name.rsplit("::").next().unwrap_or(&info.symbol_name);
    if let Some(&(def, kind)) = state.names.get(bare) {
      if kind.is_definition() && def != *location {
        links.push((*location, def));
      }
    }
  }
  for (decl, def) in links {
    if let Some(info) = state.unit.symbols.get_mut(&decl) {
      info.target = def;
    }
    if let Some(info) = state.unit.symbols.get_mut(&def) {
      if info.target.is_null() {
        info.target = decl;
      }
    }
  }
}

/// Name of the innermost class/struct a node sits in, for qualified method
/// names. Out-of-line definitions take the scope of their qualified id.
fn enclosing_type_name(node: Node, content: &str) -> Option<String> {
  if let Some(parent) = node.parent() {
    if parent.kind() == "qualified_identifier" {
      if let Some(scope) = parent.child_by_field_name("scope") {
        return scope.utf8_text(content.as_bytes()).ok().map(str::to_string);
      }
    }
  }

  let mut current = node.parent();
  while let Some(n) = current {
    if matches!(n.kind(), "class_specifier" | "struct_specifier") {
      if let Some(name) = n.child_by_field_name("name") {
        return name.utf8_text(content.as_bytes()).ok().map(str::to_string);
      }
    }
    current = n.parent();
  }
  None
}

// ============================================================================
// References
// ============================================================================

fn collect_references(set: &GrammarSet, file: &ParsedFile, state: &mut UnitState) {
  // Call sites first so they claim the non-normal kinds.
  if let Some(query) = set.queries.calls.as_ref() {
    let mut cursor = QueryCursor::new();
    let mut matches = cursor.matches(query, file.tree.root_node(), file.content.as_bytes());
    while let Some(match_) = matches.next() {
      for cap in match_.captures {
        let capture_name = query.capture_names()[cap.index as usize];
        add_reference(file, cap.node, capture_name == "call.member", state);
      }
    }
  }

  // Every remaining identifier that resolves in the unit is a normal
  // reference; a plain tree walk beats enumerating contexts in a query.
  walk_identifiers(file.tree.root_node(), &mut |node| {
    add_reference(file, node, false, state);
  });
}

fn walk_identifiers(node: Node, f: &mut impl FnMut(Node)) {
  if matches!(node.kind(), "identifier" | "type_identifier" | "field_identifier") {
    f(node);
  }
  let mut cursor = node.walk();
  for child in node.children(&mut cursor) {
    walk_identifiers(child, f);
  }
}

fn add_reference(file: &ParsedFile, node: Node, member_call: bool, state: &mut UnitState) {
  let Ok(name) = node.utf8_text(file.content.as_bytes()) else {
    return;
  };
  let Some(&(target, target_kind)) = state.names.get(name) else {
    return;
  };

  let ref_loc = Location::new(file.file_id, node.start_byte() as u32);
  if ref_loc == target || state.unit.references.contains_key(&ref_loc) {
    return;
  }
  // The definition pass already claimed this spot (e.g. a declaration).
  if state.unit.symbols.contains_key(&ref_loc) {
    return;
  }

  let kind = if member_call || target_kind == SymbolKind::Method {
    RefKind::MemberFunction
  } else if is_call_site(node) && target_kind == SymbolKind::Function {
    RefKind::GlobalFunction
  } else if target_kind == SymbolKind::Macro && is_call_site(node) {
    RefKind::Macro
  } else {
    RefKind::Normal
  };

  state.unit.references.insert(ref_loc, (target, kind));

  let info = CursorInfo {
    kind: SymbolKind::Reference,
    target,
    references: BTreeSet::new(),
    usr: String::new(),
    symbol_name: name.to_string(),
  };
  state.unit.symbols.entry(ref_loc).or_default().unite(&info);
}

fn is_call_site(node: Node) -> bool {
  let mut current = node.parent();
  // identifier -> (qualified id / field expression) -> call_expression
  for _ in 0..3 {
    let Some(n) = current else { return false };
    if n.kind() == "call_expression" {
      return true;
    }
    current = n.parent();
  }
  false
}

// ============================================================================
// Diagnostics & dependencies
// ============================================================================

fn collect_diagnostics(file: &ParsedFile, state: &mut UnitState) {
  let mut count = 0usize;
  collect_error_nodes(file.tree.root_node(), file, state, &mut count);
}

fn collect_error_nodes(node: Node, file: &ParsedFile, state: &mut UnitState, count: &mut usize) {
  if *count >= MAX_DIAGNOSTICS_PER_FILE {
    return;
  }
  if node.is_error() || node.is_missing() {
    let point = node.start_position();
    let message = if node.is_missing() {
      format!("missing {}", node.kind())
    } else {
      "syntax error".to_string()
    };
    state.unit.diagnostics.push(Diagnostic {
      file_id: file.file_id,
      line: point.row as u32 + 1,
      column: point.column as u32 + 1,
      severity: Severity::Error,
      message,
    });
    *count += 1;
    return;
  }
  if !node.has_error() {
    return;
  }
  let mut cursor = node.walk();
  for child in node.children(&mut cursor) {
    collect_error_nodes(child, file, state, count);
  }
}

/// Turn direct include edges into the transitive closure the dependency
/// store expects.
fn close_dependencies(state: &mut UnitState) {
  let direct = &state.direct_includes;
  for &file_id in direct.keys() {
    let mut seen: BTreeSet<FileId> = BTreeSet::new();
    let mut stack: Vec<FileId> = direct.get(&file_id).map(|s| s.iter().copied().collect()).unwrap_or_default();
    while let Some(dep) = stack.pop() {
      if dep != file_id && seen.insert(dep) {
        if let Some(next) = direct.get(&dep) {
          stack.extend(next.iter().copied());
        }
      }
    }
    state.unit.dependencies.insert(file_id, seen);
  }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;

  fn parse_tree(files: &[(&str, &str)], main: &str, args: Vec<String>) -> (tempfile::TempDir, PathTable, ParsedUnit) {
    let dir = tempfile::tempdir().unwrap();
    for (name, content) in files {
      let path = dir.path().join(name);
      if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
      }
      fs::write(path, content).unwrap();
    }
    let unit = SourceInfo {
      source_file: dir.path().join(main).canonicalize().unwrap(),
      compiler: "/usr/bin/cc".into(),
      args,
    };
    let paths = PathTable::new();
    let provider = SitterProvider::new();
    let parsed = provider.parse(&unit, &paths, &AtomicBool::new(false)).unwrap();
    (dir, paths, parsed)
  }

  #[test]
  fn test_c_definitions_and_names() {
    let (_dir, _paths, unit) = parse_tree(
      &[(
        "a.c",
        "struct point { int x; };\n\nint area(struct point p) {\n  return p.x;\n}\n",
      )],
      "a.c",
      vec![],
    );

    assert!(unit.symbol_names.contains_key("area"));
    assert!(unit.symbol_names.contains_key("point"));
    let area_loc = *unit.symbol_names["area"].iter().next().unwrap();
    assert_eq!(unit.symbols[&area_loc].kind, SymbolKind::Function);
  }

  #[test]
  fn test_reference_into_included_header() {
    let (_dir, paths, unit) = parse_tree(
      &[
        ("b.h", "int helper(void);\nint helper_impl(int x) { return x; }\n"),
        ("a.c", "#include \"b.h\"\n\nint main(void) {\n  return helper_impl(3);\n}\n"),
      ],
      "a.c",
      vec![],
    );

    let def_loc = unit.symbol_names["helper_impl"]
      .iter()
      .copied()
      .find(|l| unit.symbols[l].kind == SymbolKind::Function)
      .unwrap();

    // The call in a.c must reference the definition in b.h.
    let (ref_loc, (target, kind)) = unit
      .references
      .iter()
      .find(|(_, (target, _))| *target == def_loc)
      .map(|(l, t)| (*l, *t))
      .expect("call site resolved into header");
    assert_eq!(kind, RefKind::GlobalFunction);
    assert_ne!(ref_loc.file_id, def_loc.file_id);
    assert_eq!(target, def_loc);

    // Dependencies: a.c transitively depends on b.h.
    let main_id = paths.get(&_dir.path().join("a.c").canonicalize().unwrap()).unwrap();
    let header_id = def_loc.file_id;
    assert!(unit.dependencies[&main_id].contains(&header_id));
  }

  #[test]
  fn test_declaration_links_to_definition() {
    let (_dir, _paths, unit) = parse_tree(
      &[("a.c", "int f(void);\n\nint f(void) {\n  return 1;\n}\n")],
      "a.c",
      vec![],
    );

    let locations = &unit.symbol_names["f"];
    assert_eq!(locations.len(), 2);
    let decl = locations
      .iter()
      .copied()
      .find(|l| unit.symbols[l].kind == SymbolKind::Declaration)
      .unwrap();
    let def = locations
      .iter()
      .copied()
      .find(|l| unit.symbols[l].kind == SymbolKind::Function)
      .unwrap();
    assert_eq!(unit.symbols[&decl].target, def);
    assert_eq!(unit.symbols[&def].target, decl);
  }

  #[test]
  fn test_cpp_method_qualified_name() {
    let (_dir, _paths, unit) = parse_tree(
      &[(
        "w.cpp",
        "class Widget {\npublic:\n  void draw();\n};\n\nvoid Widget::draw() {\n}\n",
      )],
      "w.cpp",
      vec![],
    );

    assert!(unit.symbol_names.contains_key("Widget"));
    assert!(unit.symbol_names.contains_key("Widget::draw"));
    let def = unit.symbol_names["Widget::draw"]
      .iter()
      .copied()
      .find(|l| unit.symbols[l].kind == SymbolKind::Method)
      .expect("out-of-line method definition");
    assert_eq!(unit.symbols[&def].symbol_name, "Widget::draw");
  }

  #[test]
  fn test_syntax_error_produces_diagnostic() {
    let (_dir, _paths, unit) = parse_tree(&[("a.c", "int f( {\n")], "a.c", vec![]);
    assert!(!unit.diagnostics.is_empty());
    assert_eq!(unit.diagnostics[0].severity, Severity::Error);
  }

  #[test]
  fn test_abort_stops_parse() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.c"), "int main(void) { return 0; }\n").unwrap();
    let unit = SourceInfo {
      source_file: dir.path().join("a.c"),
      compiler: "/usr/bin/cc".into(),
      args: vec![],
    };
    let provider = SitterProvider::new();
    let paths = PathTable::new();
    let aborted = AtomicBool::new(true);
    assert!(matches!(provider.parse(&unit, &paths, &aborted), Err(ParseError::Aborted)));
  }
}
