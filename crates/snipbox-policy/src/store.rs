//! Immutable policies and narrow-only override resolution

use crate::pattern::{forbidden_matches, SymbolPattern};
use snipbox_core::Fingerprint;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Immutable capability policy for one build configuration
///
/// Created once per build and shared by reference across all executions.
/// There is deliberately no mutation API: per-snippet adjustments go
/// through [`PolicyStore::resolve`], which produces a new narrowed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    allowed_symbol_patterns: Vec<SymbolPattern>,
    forbidden_symbols: BTreeSet<String>,
    timeout: Duration,
    memory_limit_bytes: u64,
    network_allowed: bool,
}

impl Policy {
    /// Assemble a policy from its parts
    #[must_use]
    pub fn new(
        allowed_symbol_patterns: Vec<SymbolPattern>,
        forbidden_symbols: impl IntoIterator<Item = String>,
        timeout: Duration,
        memory_limit_bytes: u64,
        network_allowed: bool,
    ) -> Self {
        Self {
            allowed_symbol_patterns,
            forbidden_symbols: forbidden_symbols.into_iter().collect(),
            timeout,
            memory_limit_bytes,
            network_allowed,
        }
    }

    /// Allowed import patterns
    #[inline]
    #[must_use]
    pub fn allowed_symbol_patterns(&self) -> &[SymbolPattern] {
        &self.allowed_symbol_patterns
    }

    /// Forbidden symbol list
    #[inline]
    #[must_use]
    pub fn forbidden_symbols(&self) -> &BTreeSet<String> {
        &self.forbidden_symbols
    }

    /// Hard wall-clock limit per execution
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Memory ceiling per worker
    #[inline]
    #[must_use]
    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_bytes
    }

    /// Whether workers keep outbound network capability
    #[inline]
    #[must_use]
    pub fn network_allowed(&self) -> bool {
        self.network_allowed
    }

    /// Find the forbidden entry a symbol falls under, if any
    ///
    /// Matches exactly or on a dotted prefix (`os` forbids `os.system`).
    #[must_use]
    pub fn forbidden_match(&self, symbol: &str) -> Option<&str> {
        self.forbidden_symbols
            .iter()
            .find(|forbidden| forbidden_matches(forbidden, symbol))
            .map(String::as_str)
    }

    /// Check whether an import-introducing symbol is covered by the allow-list
    ///
    /// An empty allow-list rejects every import (fail-closed).
    #[must_use]
    pub fn allows_import(&self, symbol: &str) -> bool {
        self.allowed_symbol_patterns
            .iter()
            .any(|pattern| pattern.matches(symbol))
    }

    /// Stable content hash of the policy, one input of the cache key
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();
        for pattern in &self.allowed_symbol_patterns {
            let text = pattern.to_string();
            hasher.update(&(text.len() as u64).to_le_bytes());
            hasher.update(text.as_bytes());
        }
        hasher.update(b"\0forbidden\0");
        for symbol in &self.forbidden_symbols {
            hasher.update(&(symbol.len() as u64).to_le_bytes());
            hasher.update(symbol.as_bytes());
        }
        hasher.update(&self.timeout.as_nanos().to_le_bytes());
        hasher.update(&self.memory_limit_bytes.to_le_bytes());
        hasher.update(&[u8::from(self.network_allowed)]);
        Fingerprint::new(*hasher.finalize().as_bytes())
    }
}

/// Snippet-declared overrides applied on top of the base policy
///
/// Every field narrows: additions to the forbidden list, a replacement
/// allow-list covered by the base one, tighter limits, network off.
#[derive(Debug, Clone, Default)]
pub struct PolicyDelta {
    /// Extra forbidden symbols (union with the base list)
    pub forbidden_symbols: Vec<String>,
    /// Replacement allow-list; each pattern must be covered by a base pattern
    pub allowed_symbol_patterns: Option<Vec<SymbolPattern>>,
    /// Tighter wall-clock limit
    pub timeout: Option<Duration>,
    /// Tighter memory ceiling
    pub memory_limit_bytes: Option<u64>,
    /// Network override; may only disable
    pub network_allowed: Option<bool>,
}

/// Holds the build-wide base policy and resolves per-snippet overrides
///
/// The explicit store replaces module-level mutable security lists: there
/// is no process-wide state, and the base policy never changes after
/// construction.
#[derive(Debug, Clone)]
pub struct PolicyStore {
    base: Arc<Policy>,
}

impl PolicyStore {
    /// Create a store around the build-wide base policy
    #[inline]
    #[must_use]
    pub fn new(base: Policy) -> Self {
        Self {
            base: Arc::new(base),
        }
    }

    /// The base policy
    #[inline]
    #[must_use]
    pub fn base(&self) -> &Arc<Policy> {
        &self.base
    }

    /// Resolve snippet overrides against the base policy
    ///
    /// # Errors
    /// Any override that would loosen the base policy fails with the
    /// matching [`PolicyError`] variant; execution is never attempted for
    /// that submission.
    pub fn resolve(&self, overrides: Option<&PolicyDelta>) -> Result<Arc<Policy>, PolicyError> {
        let Some(delta) = overrides else {
            return Ok(Arc::clone(&self.base));
        };

        let timeout = match delta.timeout {
            Some(requested) if requested > self.base.timeout => {
                return Err(PolicyError::WidenedTimeout {
                    requested,
                    base: self.base.timeout,
                });
            }
            Some(requested) => requested,
            None => self.base.timeout,
        };

        let memory_limit_bytes = match delta.memory_limit_bytes {
            Some(requested) if requested > self.base.memory_limit_bytes => {
                return Err(PolicyError::WidenedMemoryLimit {
                    requested,
                    base: self.base.memory_limit_bytes,
                });
            }
            Some(requested) => requested,
            None => self.base.memory_limit_bytes,
        };

        let network_allowed = match delta.network_allowed {
            Some(true) if !self.base.network_allowed => {
                return Err(PolicyError::WidenedNetwork);
            }
            Some(requested) => requested,
            None => self.base.network_allowed,
        };

        let allowed_symbol_patterns = match &delta.allowed_symbol_patterns {
            Some(patterns) => {
                for pattern in patterns {
                    let covered = self
                        .base
                        .allowed_symbol_patterns
                        .iter()
                        .any(|base| base.covers(pattern));
                    if !covered {
                        return Err(PolicyError::WidenedAllowList {
                            pattern: pattern.to_string(),
                        });
                    }
                }
                patterns.clone()
            }
            None => self.base.allowed_symbol_patterns.clone(),
        };

        let mut forbidden_symbols = self.base.forbidden_symbols.clone();
        forbidden_symbols.extend(delta.forbidden_symbols.iter().cloned());

        tracing::debug!(
            timeout_ms = timeout.as_millis() as u64,
            memory_limit_bytes,
            "resolved narrowed policy"
        );

        Ok(Arc::new(Policy {
            allowed_symbol_patterns,
            forbidden_symbols,
            timeout,
            memory_limit_bytes,
            network_allowed,
        }))
    }
}

/// Policy resolution errors (fatal to the offending submission only)
#[derive(Debug, Clone, thiserror::Error)]
pub enum PolicyError {
    /// Override requested a longer timeout than the base policy grants
    #[error("override widens timeout: requested {requested:?}, base allows {base:?}")]
    WidenedTimeout {
        /// Requested timeout
        requested: Duration,
        /// Base policy timeout
        base: Duration,
    },

    /// Override requested a higher memory ceiling
    #[error("override widens memory limit: requested {requested}, base allows {base}")]
    WidenedMemoryLimit {
        /// Requested ceiling in bytes
        requested: u64,
        /// Base ceiling in bytes
        base: u64,
    },

    /// Override tried to enable network access the base policy denies
    #[error("override enables network access forbidden by the base policy")]
    WidenedNetwork,

    /// Override allow-pattern not covered by any base pattern
    #[error("override allow-pattern '{pattern}' is not covered by the base policy")]
    WidenedAllowList {
        /// Offending pattern
        pattern: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_policy() -> Policy {
        Policy::new(
            vec!["math.*".parse().unwrap(), "json.*".parse().unwrap()],
            ["os".to_string(), "subprocess".to_string()],
            Duration::from_secs(5),
            64 * 1024 * 1024,
            false,
        )
    }

    #[test]
    fn resolve_without_overrides_shares_base() {
        let store = PolicyStore::new(base_policy());
        let resolved = store.resolve(None).unwrap();
        assert!(Arc::ptr_eq(&resolved, store.base()));
    }

    #[test]
    fn narrowing_overrides_apply() {
        let store = PolicyStore::new(base_policy());
        let delta = PolicyDelta {
            forbidden_symbols: vec!["json".to_string()],
            allowed_symbol_patterns: Some(vec!["math.sqrt".parse().unwrap()]),
            timeout: Some(Duration::from_secs(1)),
            memory_limit_bytes: Some(16 * 1024 * 1024),
            network_allowed: None,
        };
        let resolved = store.resolve(Some(&delta)).unwrap();
        assert_eq!(resolved.timeout(), Duration::from_secs(1));
        assert_eq!(resolved.memory_limit_bytes(), 16 * 1024 * 1024);
        assert!(resolved.forbidden_match("json.dumps").is_some());
        assert!(resolved.allows_import("math.sqrt"));
        assert!(!resolved.allows_import("math.fsum"));
    }

    #[test]
    fn widened_timeout_rejected() {
        let store = PolicyStore::new(base_policy());
        let delta = PolicyDelta {
            timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        assert!(matches!(
            store.resolve(Some(&delta)),
            Err(PolicyError::WidenedTimeout { .. })
        ));
    }

    #[test]
    fn widened_memory_rejected() {
        let store = PolicyStore::new(base_policy());
        let delta = PolicyDelta {
            memory_limit_bytes: Some(u64::MAX),
            ..Default::default()
        };
        assert!(matches!(
            store.resolve(Some(&delta)),
            Err(PolicyError::WidenedMemoryLimit { .. })
        ));
    }

    #[test]
    fn enabling_network_rejected() {
        let store = PolicyStore::new(base_policy());
        let delta = PolicyDelta {
            network_allowed: Some(true),
            ..Default::default()
        };
        assert!(matches!(
            store.resolve(Some(&delta)),
            Err(PolicyError::WidenedNetwork)
        ));
    }

    #[test]
    fn uncovered_allow_pattern_rejected() {
        let store = PolicyStore::new(base_policy());
        let delta = PolicyDelta {
            allowed_symbol_patterns: Some(vec!["os.*".parse().unwrap()]),
            ..Default::default()
        };
        assert!(matches!(
            store.resolve(Some(&delta)),
            Err(PolicyError::WidenedAllowList { .. })
        ));
    }

    #[test]
    fn forbidden_match_uses_dot_boundaries() {
        let policy = base_policy();
        assert_eq!(policy.forbidden_match("os.system"), Some("os"));
        assert_eq!(policy.forbidden_match("osmium"), None);
    }

    #[test]
    fn empty_allow_list_fails_closed() {
        let policy = Policy::new(
            Vec::new(),
            [],
            Duration::from_secs(1),
            1024,
            false,
        );
        assert!(!policy.allows_import("math"));
    }

    #[test]
    fn fingerprint_tracks_every_field() {
        let base = base_policy().fingerprint();
        let longer_timeout = Policy::new(
            vec!["math.*".parse().unwrap(), "json.*".parse().unwrap()],
            ["os".to_string(), "subprocess".to_string()],
            Duration::from_secs(6),
            64 * 1024 * 1024,
            false,
        );
        assert_ne!(base, longer_timeout.fingerprint());
        assert_eq!(base, base_policy().fingerprint());
    }
}
