//! Static capability validation
//!
//! Parses a snippet into a typed symbol-reference list and checks it
//! against the capability policy before any execution is attempted.
//! Validation is a pure function: no I/O, no mutation, fully deterministic
//! and safe to run outside the sandbox. Anything the parser cannot make
//! sense of is rejected, never allowed by default.

pub mod symbols;
pub mod validator;

pub use symbols::{extract_symbols, ExtractError, SymbolKind, SymbolReference};
pub use validator::{SecurityViolation, StaticValidator, ValidatedSnippet};
