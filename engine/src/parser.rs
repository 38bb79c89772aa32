//! Tree-sitter based code parser
//!
//! Extracts named symbols (functions, classes, methods) with 1-indexed
//! inclusive line ranges, docstrings and import targets. Class members stay
//! nested under their class; nothing is flattened. A definition whose name
//! the grammar cannot produce is skipped and counted, never emitted as
//! `"unknown"`.
//!
//! Line numbers are relative to the bytes handed in — the file processor
//! feeds `git show <commit>:<path>` output, so ranges always describe the
//! pinned commit rather than the working tree.

use std::collections::HashMap;

use thiserror::Error;
use tree_sitter::{Node, Parser as TsParser};

use crate::types::{ParsedSymbol, SymbolKind};

/// Parser errors
#[derive(Debug, Error)]
pub enum ParserError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("grammar error: {0}")]
    GrammarError(String),
}

/// Languages with a grammar wired in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
    Rust,
    Go,
    Java,
}

impl Language {
    /// Detect language from a file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "py" | "pyw" => Some(Self::Python),
            "js" | "jsx" | "mjs" | "cjs" => Some(Self::JavaScript),
            "ts" | "tsx" => Some(Self::TypeScript),
            "rs" => Some(Self::Rust),
            "go" => Some(Self::Go),
            "java" => Some(Self::Java),
            _ => None,
        }
    }

    /// Detect language from a repo-relative path
    pub fn from_path(path: &str) -> Option<Self> {
        let ext = path.rsplit('.').next()?;
        Self::from_extension(ext)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Rust => "rust",
            Self::Go => "go",
            Self::Java => "java",
        }
    }

    fn grammar(&self) -> tree_sitter::Language {
        match self {
            Self::Python => tree_sitter_python::language(),
            Self::JavaScript => tree_sitter_javascript::language(),
            Self::TypeScript => tree_sitter_typescript::language_typescript(),
            Self::Rust => tree_sitter_rust::language(),
            Self::Go => tree_sitter_go::language(),
            Self::Java => tree_sitter_java::language(),
        }
    }

    /// Node kinds that declare a free function
    fn function_kinds(&self) -> &'static [&'static str] {
        match self {
            Self::Python => &["function_definition"],
            Self::JavaScript => &["function_declaration", "generator_function_declaration"],
            Self::TypeScript => &["function_declaration", "generator_function_declaration"],
            Self::Rust => &["function_item"],
            Self::Go => &["function_declaration"],
            Self::Java => &[],
        }
    }

    /// Node kinds that declare a class-like container
    fn class_kinds(&self) -> &'static [&'static str] {
        match self {
            Self::Python => &["class_definition"],
            Self::JavaScript => &["class_declaration"],
            Self::TypeScript => &["class_declaration", "abstract_class_declaration"],
            Self::Rust => &["struct_item", "enum_item", "trait_item"],
            Self::Go => &[],
            Self::Java => &["class_declaration", "interface_declaration", "enum_declaration"],
        }
    }

    /// Node kinds that are methods wherever they appear
    fn method_kinds(&self) -> &'static [&'static str] {
        match self {
            Self::Python => &[],
            Self::JavaScript | Self::TypeScript => &["method_definition"],
            Self::Rust => &[],
            Self::Go => &["method_declaration"],
            Self::Java => &["method_declaration", "constructor_declaration"],
        }
    }

    /// Containers whose direct functions are methods (Rust impl blocks)
    fn method_container_kinds(&self) -> &'static [&'static str] {
        match self {
            Self::Rust => &["impl_item"],
            _ => &[],
        }
    }

    fn comment_kinds(&self) -> &'static [&'static str] {
        match self {
            Self::Python => &["comment"],
            Self::JavaScript | Self::TypeScript | Self::Go | Self::Java => &["comment"],
            Self::Rust => &["line_comment", "block_comment"],
        }
    }
}

/// Parse result: source-ordered symbols plus bookkeeping the file processor
/// folds into warnings and `file_index` metadata.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub symbols: Vec<ParsedSymbol>,
    pub imports: Vec<String>,
    /// Definitions skipped because the grammar produced no name
    pub unnamed_skipped: u32,
}

/// Symbol extractor with per-language parsers initialized on first use.
pub struct Parser {
    parsers: HashMap<Language, TsParser>,
}

impl Parser {
    pub fn new() -> Self {
        Self { parsers: HashMap::new() }
    }

    /// Parse source text and extract the symbol tree.
    pub fn parse(&mut self, source: &str, language: Language) -> Result<ParseOutcome, ParserError> {
        use std::collections::hash_map::Entry;
        if let Entry::Vacant(entry) = self.parsers.entry(language) {
            let mut parser = TsParser::new();
            parser
                .set_language(language.grammar())
                .map_err(|e| ParserError::GrammarError(e.to_string()))?;
            entry.insert(parser);
        }

        let parser = self
            .parsers
            .get_mut(&language)
            .ok_or_else(|| ParserError::UnsupportedLanguage(language.name().to_owned()))?;
        let tree = parser
            .parse(source, None)
            .ok_or_else(|| ParserError::ParseError("tree-sitter returned no tree".to_owned()))?;

        let mut outcome = ParseOutcome::default();
        collect_symbols(
            tree.root_node(),
            source,
            language,
            false,
            &mut outcome.symbols,
            &mut outcome.unnamed_skipped,
        );
        collect_imports(tree.root_node(), source, language, &mut outcome.imports);
        Ok(outcome)
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursive walk. `as_methods` is true inside a class body or a method
/// container, where function-like definitions become methods.
fn collect_symbols(
    node: Node<'_>,
    source: &str,
    language: Language,
    as_methods: bool,
    out: &mut Vec<ParsedSymbol>,
    unnamed: &mut u32,
) {
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        let kind_str = child.kind();

        let declared = if language.class_kinds().contains(&kind_str) {
            Some(SymbolKind::Class)
        } else if language.method_kinds().contains(&kind_str) {
            Some(SymbolKind::Method)
        } else if language.function_kinds().contains(&kind_str) {
            Some(if as_methods { SymbolKind::Method } else { SymbolKind::Function })
        } else {
            None
        };

        match declared {
            Some(kind) => {
                let Some(name) = node_name(child, source) else {
                    *unnamed += 1;
                    continue;
                };

                let mut symbol = ParsedSymbol::new(
                    name,
                    kind,
                    child.start_position().row as u32 + 1,
                    child.end_position().row as u32 + 1,
                );
                symbol.docstring = extract_docstring(child, source, language);

                if kind == SymbolKind::Class {
                    collect_symbols(child, source, language, true, &mut symbol.methods, unnamed);
                }
                out.push(symbol);
            }
            None => {
                // Containers (decorated defs, export statements, impl blocks,
                // class bodies) are transparent to the walk.
                let into_methods =
                    as_methods || language.method_container_kinds().contains(&kind_str);
                collect_symbols(child, source, language, into_methods, out, unnamed);
            }
        }
    }
}

fn node_name(node: Node<'_>, source: &str) -> Option<String> {
    let name_node = node.child_by_field_name("name")?;
    let text = name_node.utf8_text(source.as_bytes()).ok()?;
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(text.to_owned())
}

/// First string/comment statement inside the body, cleaned of markers.
fn extract_docstring(node: Node<'_>, source: &str, language: Language) -> Option<String> {
    let body = node.child_by_field_name("body")?;
    let first = body.named_child(0)?;

    let raw = match language {
        Language::Python => {
            if first.kind() != "expression_statement" {
                return None;
            }
            let expr = first.named_child(0)?;
            if expr.kind() != "string" {
                return None;
            }
            expr.utf8_text(source.as_bytes()).ok()?.to_owned()
        }
        _ => {
            if !language.comment_kinds().contains(&first.kind()) {
                return None;
            }
            first.utf8_text(source.as_bytes()).ok()?.to_owned()
        }
    };

    let cleaned = clean_docstring(&raw);
    if cleaned.is_empty() { None } else { Some(cleaned) }
}

fn clean_docstring(raw: &str) -> String {
    let mut text = raw.trim();
    for quote in ["\"\"\"", "'''", "/**", "/*"] {
        text = text.strip_prefix(quote).unwrap_or(text);
    }
    for quote in ["\"\"\"", "'''", "*/"] {
        text = text.strip_suffix(quote).unwrap_or(text);
    }
    let joined: String = text
        .lines()
        .map(|line| line.trim().trim_start_matches("//").trim_start_matches('*').trim())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let mut out = joined.trim().to_owned();
    if out.len() > 400 {
        out.truncate(400);
    }
    out
}

/// Import targets, feeding `file_index.metadata.imports` and the
/// criticality graph.
fn collect_imports(node: Node<'_>, source: &str, language: Language, out: &mut Vec<String>) {
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        match (language, child.kind()) {
            (Language::Python, "import_statement")
            | (Language::Python, "import_from_statement")
            | (Language::JavaScript, "import_statement")
            | (Language::TypeScript, "import_statement")
            | (Language::Rust, "use_declaration")
            | (Language::Java, "import_declaration") => {
                if let Some(target) = import_target(child, source, language) {
                    out.push(target);
                }
            }
            (Language::Go, "import_declaration") => {
                // Go groups import specs; collect every string inside.
                collect_go_import_specs(child, source, out);
            }
            _ => {
                // Imports are top level in every supported language except
                // when wrapped (e.g. TS namespaces); one level of recursion
                // through unknown containers keeps those covered.
                if child.named_child_count() > 0 {
                    collect_imports(child, source, language, out);
                }
            }
        }
    }
}

fn import_target(node: Node<'_>, source: &str, language: Language) -> Option<String> {
    let text = match language {
        Language::Python => {
            let module = node
                .child_by_field_name("module_name")
                .or_else(|| node.named_child(0))?;
            module.utf8_text(source.as_bytes()).ok()?.to_owned()
        }
        Language::JavaScript | Language::TypeScript => {
            let src = node.child_by_field_name("source")?;
            src.utf8_text(source.as_bytes()).ok()?.trim_matches(['"', '\'']).to_owned()
        }
        Language::Rust => {
            let arg = node.named_child(0)?;
            arg.utf8_text(source.as_bytes()).ok()?.to_owned()
        }
        Language::Java => node
            .named_child(0)?
            .utf8_text(source.as_bytes())
            .ok()?
            .to_owned(),
        Language::Go => return None,
    };
    let trimmed = text.trim();
    if trimmed.is_empty() { None } else { Some(trimmed.to_owned()) }
}

fn collect_go_import_specs(node: Node<'_>, source: &str, out: &mut Vec<String>) {
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        match child.kind() {
            "import_spec" => {
                if let Some(path) = child.child_by_field_name("path") {
                    if let Ok(text) = path.utf8_text(source.as_bytes()) {
                        out.push(text.trim_matches('"').to_owned());
                    }
                }
            }
            "import_spec_list" => collect_go_import_specs(child, source, out),
            _ => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::str_to_string)]
mod tests {
    use super::*;

    fn parse(source: &str, language: Language) -> ParseOutcome {
        Parser::new().parse(source, language).unwrap()
    }

    #[test]
    fn test_python_function_lines_and_docstring() {
        let source = "\"\"\"Greeter.\"\"\"\ndef hi(name):\n    return f\"Hi {name}\"\n";
        let outcome = parse(source, Language::Python);

        assert_eq!(outcome.symbols.len(), 1);
        let sym = &outcome.symbols[0];
        assert_eq!(sym.name, "hi");
        assert_eq!(sym.kind, SymbolKind::Function);
        assert_eq!((sym.start_line, sym.end_line), (2, 3));
        assert_eq!(outcome.unnamed_skipped, 0);
    }

    #[test]
    fn test_python_class_keeps_methods_nested() {
        let source = r#"
class Greeter:
    """Says hello."""

    def __init__(self, name):
        self.name = name

    def greet(self):
        """Return the greeting."""
        return f"Hi {self.name}"


def free_function():
    pass
"#;
        let outcome = parse(source, Language::Python);

        let names: Vec<&str> = outcome.symbols.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Greeter", "free_function"]);

        let class = &outcome.symbols[0];
        assert_eq!(class.kind, SymbolKind::Class);
        assert_eq!(class.docstring.as_deref(), Some("Says hello."));
        let methods: Vec<&str> = class.methods.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(methods, vec!["__init__", "greet"]);
        assert!(class.methods.iter().all(|m| m.kind == SymbolKind::Method));
        assert_eq!(class.methods[1].docstring.as_deref(), Some("Return the greeting."));
    }

    #[test]
    fn test_python_decorated_function_found() {
        let source = "@cached\ndef expensive():\n    return compute()\n";
        let outcome = parse(source, Language::Python);
        assert_eq!(outcome.symbols.len(), 1);
        assert_eq!(outcome.symbols[0].name, "expensive");
    }

    #[test]
    fn test_python_imports() {
        let source = "import os\nfrom pathlib import Path\n\ndef f():\n    pass\n";
        let outcome = parse(source, Language::Python);
        assert_eq!(outcome.imports, vec!["os".to_string(), "pathlib".to_string()]);
    }

    #[test]
    fn test_javascript_class_and_methods() {
        let source = r#"
import { helper } from "./helper";

class Router {
  constructor(routes) {
    this.routes = routes;
  }

  resolve(path) {
    return this.routes[path];
  }
}

function standalone() {
  return 1;
}
"#;
        let outcome = parse(source, Language::JavaScript);

        let class = outcome.symbols.iter().find(|s| s.name == "Router").unwrap();
        assert_eq!(class.kind, SymbolKind::Class);
        let methods: Vec<&str> = class.methods.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(methods, vec!["constructor", "resolve"]);

        assert!(outcome.symbols.iter().any(|s| s.name == "standalone"));
        assert_eq!(outcome.imports, vec!["./helper".to_string()]);
    }

    #[test]
    fn test_no_symbol_is_ever_unnamed() {
        // Anonymous default exports have no name the grammar can produce.
        let source = "export default function () {\n  return 1;\n}\n";
        let outcome = parse(source, Language::JavaScript);
        assert!(outcome.symbols.iter().all(|s| !s.name.is_empty() && s.name != "unknown"));
    }

    #[test]
    fn test_rust_functions_structs_and_impl_methods() {
        let source = r#"
use std::fmt;

pub struct Config {
    pub retries: u32,
}

impl Config {
    pub fn new() -> Self {
        Self { retries: 3 }
    }
}

fn helper() -> u32 {
    1
}
"#;
        let outcome = parse(source, Language::Rust);

        let kinds: Vec<(&str, SymbolKind)> =
            outcome.symbols.iter().map(|s| (s.name.as_str(), s.kind)).collect();
        assert!(kinds.contains(&("Config", SymbolKind::Class)));
        assert!(kinds.contains(&("new", SymbolKind::Method)));
        assert!(kinds.contains(&("helper", SymbolKind::Function)));
        assert_eq!(outcome.imports, vec!["std::fmt".to_string()]);
    }

    #[test]
    fn test_go_functions_methods_and_imports() {
        let source = r#"
package main

import (
	"fmt"
	"strings"
)

func Run() {
	fmt.Println(strings.ToUpper("go"))
}

func (s *Server) Handle() error {
	return nil
}
"#;
        let outcome = parse(source, Language::Go);

        let run = outcome.symbols.iter().find(|s| s.name == "Run").unwrap();
        assert_eq!(run.kind, SymbolKind::Function);
        let handle = outcome.symbols.iter().find(|s| s.name == "Handle").unwrap();
        assert_eq!(handle.kind, SymbolKind::Method);
        assert_eq!(outcome.imports, vec!["fmt".to_string(), "strings".to_string()]);
    }

    #[test]
    fn test_java_class_with_methods() {
        let source = r#"
import java.util.List;

public class OrderService {
    public OrderService() {
    }

    public int total(List<Integer> items) {
        return items.stream().mapToInt(Integer::intValue).sum();
    }
}
"#;
        let outcome = parse(source, Language::Java);

        assert_eq!(outcome.symbols.len(), 1);
        let class = &outcome.symbols[0];
        assert_eq!(class.name, "OrderService");
        assert_eq!(class.methods.len(), 2);
        assert_eq!(outcome.imports, vec!["java.util.List".to_string()]);
    }

    #[test]
    fn test_symbols_in_source_order() {
        let source = "def b():\n    pass\n\ndef a():\n    pass\n";
        let outcome = parse(source, Language::Python);
        let names: Vec<&str> = outcome.symbols.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_language_detection() {
        assert_eq!(Language::from_extension("py"), Some(Language::Python));
        assert_eq!(Language::from_extension("TSX"), Some(Language::TypeScript));
        assert_eq!(Language::from_path("src/deep/mod.rs"), Some(Language::Rust));
        assert_eq!(Language::from_extension("txt"), None);
    }

    #[test]
    fn test_clean_docstring() {
        assert_eq!(clean_docstring("\"\"\"Line one.\nLine two.\"\"\""), "Line one. Line two.");
        assert_eq!(clean_docstring("/** JSDoc summary. */"), "JSDoc summary.");
        assert_eq!(clean_docstring("// terse note"), "terse note");
    }
}
