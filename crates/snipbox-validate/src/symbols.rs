//! Snippet parsing into typed symbol references
//!
//! Uses the tree-sitter Python grammar to collect every imported or
//! referenced top-level name. The structural walk replaces string
//! containment checks: `import math` yields the reference `math`, and the
//! lookalike `import mathx` can never satisfy a `math.*` capability.

use tree_sitter::{Node, Parser};

/// How a symbol enters the snippet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    /// Introduced by an `import` or `from ... import` statement
    Import,
    /// Fully-dotted attribute chain rooted at an identifier (`os.system`)
    Attribute,
    /// Bare identifier reference
    Name,
}

/// One symbol referenced by the snippet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolReference {
    /// Dotted symbol path
    pub name: String,
    /// How the symbol is introduced
    pub kind: SymbolKind,
    /// 1-based source line of the reference
    pub line: usize,
}

/// Errors raised while extracting symbols
///
/// Every variant fails closed: the validator rejects the snippet rather
/// than executing input it could not fully account for.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExtractError {
    /// The grammar failed to load (version mismatch)
    #[error("failed to load python grammar: {0}")]
    Language(String),

    /// The parser produced no tree
    #[error("parser produced no syntax tree")]
    ParseFailed,

    /// The snippet contains a syntax error
    #[error("syntax error at line {line}")]
    Syntax {
        /// 1-based line of the first error node
        line: usize,
    },

    /// `from module import *` hides the introduced names
    #[error("wildcard import at line {line} cannot be validated")]
    WildcardImport {
        /// 1-based line of the wildcard import
        line: usize,
    },
}

/// Parse a snippet and collect its symbol references
///
/// # Errors
/// Fails closed on unparseable input, syntax errors and wildcard imports.
pub fn extract_symbols(source: &str) -> Result<Vec<SymbolReference>, ExtractError> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| ExtractError::Language(e.to_string()))?;

    let tree = parser.parse(source, None).ok_or(ExtractError::ParseFailed)?;
    let root = tree.root_node();
    if root.has_error() {
        return Err(ExtractError::Syntax {
            line: first_error_line(root),
        });
    }

    let mut collector = Collector {
        source,
        references: Vec::new(),
        seen: std::collections::HashSet::new(),
    };
    collector.walk(root)?;
    Ok(collector.references)
}

fn first_error_line(root: Node<'_>) -> usize {
    let mut cursor = root.walk();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_error() || node.is_missing() {
            return node.start_position().row + 1;
        }
        for child in node.children(&mut cursor) {
            stack.push(child);
        }
    }
    root.start_position().row + 1
}

struct Collector<'s> {
    source: &'s str,
    references: Vec<SymbolReference>,
    seen: std::collections::HashSet<(SymbolKind, String)>,
}

impl Collector<'_> {
    fn text(&self, node: Node<'_>) -> &str {
        node.utf8_text(self.source.as_bytes()).unwrap_or("")
    }

    fn push(&mut self, name: String, kind: SymbolKind, node: Node<'_>) {
        if name.is_empty() {
            return;
        }
        if self.seen.insert((kind, name.clone())) {
            self.references.push(SymbolReference {
                name,
                kind,
                line: node.start_position().row + 1,
            });
        }
    }

    fn walk(&mut self, node: Node<'_>) -> Result<(), ExtractError> {
        match node.kind() {
            "import_statement" => self.collect_import(node),
            "import_from_statement" => self.collect_from_import(node),
            "attribute" => {
                if let Some(path) = dotted_path(node, self.source) {
                    self.push(path, SymbolKind::Attribute, node);
                    return Ok(());
                }
                // Chain rooted in a call or subscript: validate the pieces
                self.walk_children(node)
            }
            "identifier" => {
                let name = self.text(node).to_string();
                self.push(name, SymbolKind::Name, node);
                Ok(())
            }
            _ => self.walk_children(node),
        }
    }

    fn walk_children(&mut self, node: Node<'_>) -> Result<(), ExtractError> {
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
        for child in children {
            self.walk(child)?;
        }
        Ok(())
    }

    /// `import a.b, c as d` introduces `a.b` and `c`
    fn collect_import(&mut self, node: Node<'_>) -> Result<(), ExtractError> {
        let mut cursor = node.walk();
        let names: Vec<Node<'_>> = node.children_by_field_name("name", &mut cursor).collect();
        for name_node in names {
            let module = match name_node.kind() {
                "aliased_import" => name_node
                    .child_by_field_name("name")
                    .map(|n| self.text(n).to_string()),
                _ => Some(self.text(name_node).to_string()),
            };
            if let Some(module) = module {
                self.push(module, SymbolKind::Import, name_node);
            }
        }
        Ok(())
    }

    /// `from a.b import c, d as e` introduces `a.b`, `a.b.c` and `a.b.d`
    fn collect_from_import(&mut self, node: Node<'_>) -> Result<(), ExtractError> {
        let module = node
            .child_by_field_name("module_name")
            .map(|n| self.text(n).to_string())
            .unwrap_or_default();
        self.push(module.clone(), SymbolKind::Import, node);

        let mut cursor = node.walk();
        for i in 0..node.named_child_count() {
            let Some(child) = node.named_child(i) else {
                continue;
            };
            if child.kind() == "wildcard_import" {
                return Err(ExtractError::WildcardImport {
                    line: child.start_position().row + 1,
                });
            }
        }

        let names: Vec<Node<'_>> = node.children_by_field_name("name", &mut cursor).collect();
        for name_node in names {
            let imported = match name_node.kind() {
                "aliased_import" => name_node
                    .child_by_field_name("name")
                    .map(|n| self.text(n).to_string()),
                _ => Some(self.text(name_node).to_string()),
            };
            if let Some(imported) = imported {
                self.push(
                    format!("{module}.{imported}"),
                    SymbolKind::Import,
                    name_node,
                );
            }
        }
        Ok(())
    }
}

/// Flatten an attribute chain rooted at a plain identifier
///
/// `os.path.join` becomes `Some("os.path.join")`; chains rooted at calls or
/// subscripts return `None` and are walked piecewise instead.
fn dotted_path(node: Node<'_>, source: &str) -> Option<String> {
    match node.kind() {
        "identifier" => Some(node.utf8_text(source.as_bytes()).ok()?.to_string()),
        "attribute" => {
            let object = node.child_by_field_name("object")?;
            let attribute = node.child_by_field_name("attribute")?;
            let mut path = dotted_path(object, source)?;
            path.push('.');
            path.push_str(attribute.utf8_text(source.as_bytes()).ok()?);
            Some(path)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(source: &str, kind: SymbolKind) -> Vec<String> {
        extract_symbols(source)
            .unwrap()
            .into_iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.name)
            .collect()
    }

    #[test]
    fn plain_import() {
        assert_eq!(names("import os", SymbolKind::Import), vec!["os"]);
    }

    #[test]
    fn dotted_and_aliased_imports() {
        assert_eq!(
            names("import os.path, numpy as np", SymbolKind::Import),
            vec!["os.path", "numpy"]
        );
    }

    #[test]
    fn from_import_composes_full_paths() {
        let imports = names("from os import system, getenv as env", SymbolKind::Import);
        assert_eq!(imports, vec!["os", "os.system", "os.getenv"]);
    }

    #[test]
    fn attribute_chain_is_one_reference() {
        let refs = names("os.path.join('a', 'b')", SymbolKind::Attribute);
        assert_eq!(refs, vec!["os.path.join"]);
    }

    #[test]
    fn bare_identifiers_are_collected() {
        let refs = names("x = compute(y)", SymbolKind::Name);
        assert!(refs.contains(&"compute".to_string()));
        assert!(refs.contains(&"y".to_string()));
        assert!(refs.contains(&"x".to_string()));
    }

    #[test]
    fn duplicates_are_deduplicated() {
        let refs = names("import os\nimport os", SymbolKind::Import);
        assert_eq!(refs, vec!["os"]);
    }

    #[test]
    fn syntax_errors_fail_closed() {
        assert!(matches!(
            extract_symbols("def broken(:\n"),
            Err(ExtractError::Syntax { .. })
        ));
    }

    #[test]
    fn wildcard_import_fails_closed() {
        assert!(matches!(
            extract_symbols("from os import *"),
            Err(ExtractError::WildcardImport { line: 1 })
        ));
    }

    #[test]
    fn lines_are_one_based() {
        let refs = extract_symbols("x = 1\nimport os").unwrap();
        let os_ref = refs.iter().find(|r| r.name == "os").unwrap();
        assert_eq!(os_ref.line, 2);
    }
}
