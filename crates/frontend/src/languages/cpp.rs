//! C++ tree-sitter queries

use tree_sitter::Language as TsLanguage;

use super::{LanguageQueries, compile_query};

/// Include extraction query for C++
const INCLUDES_QUERY: &str = r#"
; #include <iostream>
(preproc_include
  path: (system_lib_string) @include.system)

; #include "myheader.hpp"
(preproc_include
  path: (string_literal) @include.local)
"#;

/// Call extraction query for C++
const CALLS_QUERY: &str = r#"
; Direct function calls: foo()
(call_expression
  function: (identifier) @call)

; Method calls: obj.method() and ptr->method()
(call_expression
  function: (field_expression
    field: (field_identifier) @call.member))

; Namespaced calls: ns::helper()
(call_expression
  function: (qualified_identifier
    name: (identifier) @call))

; Template function calls: make_thing<T>()
(call_expression
  function: (template_function
    name: (identifier) @call))
"#;

/// Definition extraction query for C++
const DEFINITIONS_QUERY: &str = r#"
; Function definitions
(function_definition
  declarator: (function_declarator
    declarator: (identifier) @name)) @definition.function

; Method definitions outside class (MyClass::method)
(function_definition
  declarator: (function_declarator
    declarator: (qualified_identifier
      scope: (namespace_identifier)
      name: (identifier) @name))) @definition.method

; Method definitions inside a class body
(field_declaration_list
  (function_definition
    declarator: (function_declarator
      declarator: (field_identifier) @name)) @definition.method)

; Method declarations inside a class body
(field_declaration_list
  (field_declaration
    declarator: (function_declarator
      declarator: (field_identifier) @name)) @declaration.function)

; Free function declarations (prototypes)
(translation_unit
  (declaration
    declarator: (function_declarator
      declarator: (identifier) @name)) @declaration.function)

; Class definitions
(class_specifier
  name: (type_identifier) @name
  body: (field_declaration_list)) @definition.class

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

; Typedef / using alias
(type_definition
  declarator: (type_identifier) @name) @definition.type
(alias_declaration
  name: (type_identifier) @name) @definition.type

; Macros
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
