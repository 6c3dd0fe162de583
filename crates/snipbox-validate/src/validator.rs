//! Policy checks over extracted symbol references

use crate::symbols::{extract_symbols, ExtractError, SymbolKind, SymbolReference};
use snipbox_core::Snippet;
use snipbox_policy::Policy;

/// Builtins that load or run code named at runtime. A bare reference to
/// one of these can smuggle in any module as a string literal, so they
/// are held to the same allow-list bar as a literal `import` statement.
const DYNAMIC_EXECUTION_BUILTINS: &[&str] = &["__import__", "eval", "exec", "compile", "open"];

fn introduces_import(reference: &SymbolReference) -> bool {
    reference.kind == SymbolKind::Import
        || (reference.kind == SymbolKind::Name
            && DYNAMIC_EXECUTION_BUILTINS.contains(&reference.name.as_str()))
}

/// A snippet that passed static validation
///
/// Execution only ever accepts validated snippets; the symbol list is kept
/// for diagnostics and logging.
#[derive(Debug, Clone)]
pub struct ValidatedSnippet {
    snippet: Snippet,
    symbols: Vec<SymbolReference>,
}

impl ValidatedSnippet {
    /// The underlying snippet
    #[inline]
    #[must_use]
    pub fn snippet(&self) -> &Snippet {
        &self.snippet
    }

    /// Symbol references found during validation
    #[inline]
    #[must_use]
    pub fn symbols(&self) -> &[SymbolReference] {
        &self.symbols
    }
}

/// Static validator: parse, then check references against the policy
///
/// Pure and deterministic; safe to run outside the sandbox. Anything
/// ambiguous is rejected (fail-closed).
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticValidator;

impl StaticValidator {
    /// Create a validator instance
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Validate a snippet against a policy
    ///
    /// Every reference is checked against the forbidden list (exact or
    /// dotted-prefix match); every import-introducing reference must also
    /// match an allowed pattern.
    ///
    /// # Errors
    /// Returns [`SecurityViolation`] and execution is never attempted.
    pub fn validate(
        &self,
        snippet: &Snippet,
        policy: &Policy,
    ) -> Result<ValidatedSnippet, SecurityViolation> {
        let symbols = extract_symbols(&snippet.source_text)?;

        for reference in &symbols {
            if let Some(matched) = policy.forbidden_match(&reference.name) {
                tracing::debug!(
                    symbol = %reference.name,
                    matched = %matched,
                    line = reference.line,
                    "rejecting snippet: forbidden symbol"
                );
                return Err(SecurityViolation::ForbiddenSymbol {
                    symbol: reference.name.clone(),
                    matched: matched.to_string(),
                    line: reference.line,
                });
            }
        }

        for reference in symbols.iter().filter(|r| introduces_import(r)) {
            if !policy.allows_import(&reference.name) {
                tracing::debug!(
                    symbol = %reference.name,
                    line = reference.line,
                    "rejecting snippet: import not covered by allow-list"
                );
                return Err(SecurityViolation::ImportNotAllowed {
                    symbol: reference.name.clone(),
                    line: reference.line,
                });
            }
        }

        Ok(ValidatedSnippet {
            snippet: snippet.clone(),
            symbols,
        })
    }
}

/// Terminal validation failure; never retried
#[derive(Debug, Clone, thiserror::Error)]
pub enum SecurityViolation {
    /// A reference fell under the forbidden list
    #[error("forbidden symbol '{symbol}' (matches '{matched}') at line {line}")]
    ForbiddenSymbol {
        /// The referenced symbol
        symbol: String,
        /// The forbidden entry it matched
        matched: String,
        /// 1-based source line
        line: usize,
    },

    /// An import was not covered by any allowed pattern
    #[error("import '{symbol}' at line {line} is not covered by any allowed pattern")]
    ImportNotAllowed {
        /// The imported symbol
        symbol: String,
        /// 1-based source line
        line: usize,
    },

    /// The snippet could not be parsed; rejected by default
    #[error("snippet rejected: {0}")]
    Unparseable(#[from] ExtractError),
}

impl SecurityViolation {
    /// The offending symbol, when one is known
    #[must_use]
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::ForbiddenSymbol { symbol, .. } | Self::ImportNotAllowed { symbol, .. } => {
                Some(symbol)
            }
            Self::Unparseable(_) => None,
        }
    }
}
