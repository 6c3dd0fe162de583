//! Typed capability patterns over dotted symbol paths
//!
//! Patterns replace the string-containment checks common in dynamic-language
//! sandboxes with structural matching on dot-separated segments, closing the
//! `"math"` vs `"mathx"` class of bypass bugs.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// A dotted-path capability pattern
///
/// Three forms are accepted:
/// - exact: `os.path` matches only the symbol `os.path`
/// - subtree: `math.*` matches `math` and anything under it
///   (`math.sqrt`, `math.nan`), never `mathx`
/// - universal: `*` matches every symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolPattern {
    prefix: Vec<String>,
    wildcard: bool,
}

impl SymbolPattern {
    /// Segments before the wildcard (empty for the universal pattern)
    #[inline]
    #[must_use]
    pub fn prefix(&self) -> &[String] {
        &self.prefix
    }

    /// Whether the pattern ends in `*`
    #[inline]
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    /// Check whether a dotted symbol matches this pattern
    #[must_use]
    pub fn matches(&self, symbol: &str) -> bool {
        let segments: Vec<&str> = symbol.split('.').collect();
        if self.wildcard {
            segments.len() >= self.prefix.len()
                && self
                    .prefix
                    .iter()
                    .zip(&segments)
                    .all(|(pattern, segment)| pattern == segment)
        } else {
            segments.len() == self.prefix.len()
                && self
                    .prefix
                    .iter()
                    .zip(&segments)
                    .all(|(pattern, segment)| pattern == segment)
        }
    }

    /// Check whether every symbol matched by `other` is matched by `self`
    ///
    /// Used when resolving overrides: an override allow-pattern must be
    /// covered by some base pattern, otherwise it widens the policy.
    #[must_use]
    pub fn covers(&self, other: &SymbolPattern) -> bool {
        if self.wildcard {
            other.prefix.len() >= self.prefix.len()
                && other
                    .prefix
                    .iter()
                    .zip(&self.prefix)
                    .all(|(theirs, ours)| theirs == ours)
        } else {
            !other.wildcard && self.prefix == other.prefix
        }
    }
}

impl FromStr for SymbolPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PatternError::Empty);
        }
        let mut prefix = Vec::new();
        let mut wildcard = false;
        let segments: Vec<&str> = s.split('.').collect();
        let last = segments.len() - 1;
        for (i, segment) in segments.iter().enumerate() {
            if *segment == "*" {
                if i != last {
                    return Err(PatternError::WildcardNotLast {
                        pattern: s.to_string(),
                    });
                }
                wildcard = true;
            } else if segment.is_empty()
                || !segment
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_')
            {
                return Err(PatternError::InvalidSegment {
                    pattern: s.to_string(),
                    segment: (*segment).to_string(),
                });
            } else {
                prefix.push((*segment).to_string());
            }
        }
        Ok(Self { prefix, wildcard })
    }
}

impl Display for SymbolPattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.prefix.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(segment)?;
        }
        if self.wildcard {
            if !self.prefix.is_empty() {
                f.write_str(".")?;
            }
            f.write_str("*")?;
        }
        Ok(())
    }
}

/// Check whether a symbol falls under a forbidden entry
///
/// Matches exactly or on a dot boundary: forbidding `os` also forbids
/// `os.system` but never `osmium`.
#[must_use]
pub fn forbidden_matches(forbidden: &str, symbol: &str) -> bool {
    symbol == forbidden
        || (symbol.len() > forbidden.len()
            && symbol.starts_with(forbidden)
            && symbol.as_bytes()[forbidden.len()] == b'.')
}

/// Errors for pattern parsing
#[derive(Debug, Clone, thiserror::Error)]
pub enum PatternError {
    /// The pattern string was empty
    #[error("empty pattern")]
    Empty,

    /// A wildcard appeared before the final segment
    #[error("wildcard must be the final segment in '{pattern}'")]
    WildcardNotLast {
        /// Offending pattern
        pattern: String,
    },

    /// A segment contained invalid characters
    #[error("invalid segment '{segment}' in pattern '{pattern}'")]
    InvalidSegment {
        /// Offending pattern
        pattern: String,
        /// Offending segment
        segment: String,
    },
}
