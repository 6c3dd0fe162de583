//! Capability policies for sandboxed snippet execution
//!
//! A [`Policy`] is an immutable value built once per documentation build and
//! shared by reference across every execution. Snippet-level overrides go
//! through [`PolicyStore::resolve`], which only ever narrows the base
//! policy: an override that would loosen a limit or widen the allow-list is
//! rejected with [`PolicyError`].

pub mod config;
pub mod pattern;
pub mod store;

pub use config::{ConfigError, PolicyConfig};
pub use pattern::{PatternError, SymbolPattern};
pub use store::{Policy, PolicyDelta, PolicyError, PolicyStore};
