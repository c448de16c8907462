//! C tree-sitter queries

use tree_sitter::Language as TsLanguage;

use super::{LanguageQueries, compile_query};

/// Include extraction query for C
const INCLUDES_QUERY: &str = r#"
; #include <stdio.h>
(preproc_include
  path: (system_lib_string) @include.system)

; #include "myheader.h"
(preproc_include
  path: (string_literal) @include.local)
"#;

/// Call extraction query for C
const CALLS_QUERY: &str = r#"
; Direct function calls: foo()
(call_expression
  function: (identifier) @call)

; Function pointer calls via field: obj->func()
(call_expression
  function: (field_expression
    field: (field_identifier) @call.member))
"#;

/// Definition extraction query for C
const DEFINITIONS_QUERY: &str = r#"
; Function definitions
(function_definition
  declarator: (function_declarator
    declarator: (identifier) @name)) @definition.function

; Function definitions with pointer return type
(function_definition
  declarator: (pointer_declarator
    declarator: (function_declarator
      declarator: (identifier) @name))) @definition.function

; Function declarations (prototypes)
(declaration
  declarator: (function_declarator
    declarator: (identifier) @name)) @declaration.function

; Struct definitions
(struct_specifier
  name: (type_identifier) @name
  body: (field_declaration_list)) @definition.struct

; Enum definitions
(enum_specifier
  name: (type_identifier) @name
  body: (enumerator_list)) @definition.enum

; Enumerators
(enumerator
  name: (identifier) @name) @definition.enumconst

; Typedef
(type_definition
  declarator: (type_identifier) @name) @definition.type

; Object-like and function-like macros
(preproc_def
  name: (identifier) @name) @definition.macro
(preproc_function_def
  name: (identifier) @name) @definition.macro
"#;

pub fn queries(grammar: &TsLanguage) -> LanguageQueries {
  LanguageQueries {
    includes: compile_query(grammar, INCLUDES_QUERY),
    calls: compile_query(grammar, CALLS_QUERY),
    definitions: compile_query(grammar, DEFINITIONS_QUERY),
  }
}
