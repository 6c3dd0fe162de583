//! Declarative policy configuration
//!
//! The documentation pipeline loads one policy document per build (TOML)
//! and hands the resulting [`Policy`](crate::Policy) to the
//! [`PolicyStore`](crate::PolicyStore).

use crate::pattern::{PatternError, SymbolPattern};
use crate::store::Policy;
use serde::Deserialize;
use std::time::Duration;

fn default_timeout_seconds() -> u64 {
    10
}

fn default_memory_limit_mb() -> u64 {
    256
}

/// Build-wide policy document
///
/// ```toml
/// allowed_symbol_patterns = ["math.*", "json.*"]
/// forbidden_symbols = ["os", "subprocess", "socket"]
/// timeout_seconds = 5
/// memory_limit_mb = 128
/// network_allowed = false
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    /// Import patterns permitted to snippets
    #[serde(default)]
    pub allowed_symbol_patterns: Vec<String>,
    /// Symbols rejected outright (exact or dotted-prefix match)
    #[serde(default)]
    pub forbidden_symbols: Vec<String>,
    /// Wall-clock limit per snippet
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Memory ceiling per worker
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    /// Whether workers keep outbound network capability
    #[serde(default)]
    pub network_allowed: bool,
}

impl PolicyConfig {
    /// Parse a policy document from TOML text
    ///
    /// # Errors
    /// Returns [`ConfigError::Toml`] on malformed documents.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Convert the document into an immutable [`Policy`]
    ///
    /// # Errors
    /// Returns [`ConfigError::Pattern`] if an allow-pattern is malformed.
    pub fn into_policy(self) -> Result<Policy, ConfigError> {
        let patterns = self
            .allowed_symbol_patterns
            .iter()
            .map(|p| p.parse::<SymbolPattern>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Policy::new(
            patterns,
            self.forbidden_symbols,
            Duration::from_secs(self.timeout_seconds),
            self.memory_limit_mb * 1024 * 1024,
            self.network_allowed,
        ))
    }
}

/// Errors for policy configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Document was not valid TOML for this schema
    #[error("invalid policy document: {0}")]
    Toml(#[from] toml::de::Error),

    /// An allow-pattern failed to parse
    #[error("invalid allow-pattern: {0}")]
    Pattern(#[from] PatternError),
}
