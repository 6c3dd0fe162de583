//! Content-derived cache keys
//!
//! Provides [`Fingerprint`], a strongly-typed 32-byte Blake3 hash that keys
//! the result cache. A fingerprint combines the normalized snippet source,
//! the context-group snapshot and the resolved policy, so two submissions
//! share a fingerprint only when they are fully interchangeable.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// A 32-byte content fingerprint (Blake3)
///
/// Immutable and cheap to clone (Copy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// All-zero fingerprint, used as the snapshot hash of an absent context
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a fingerprint from raw bytes
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get reference to the underlying bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create fingerprint from a byte slice
    ///
    /// # Errors
    /// Returns error if slice length is not exactly 32 bytes
    #[inline]
    pub fn from_slice(bytes: &[u8]) -> Result<Self, FingerprintError> {
        if bytes.len() != 32 {
            return Err(FingerprintError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Compute the Blake3 hash of arbitrary data
    #[inline]
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self::new(*blake3::hash(data).as_bytes())
    }

    /// Derive the cache key for one execution
    ///
    /// Domain-separated over the three inputs so that, for example, moving
    /// bytes between the source text and the policy can never collide.
    #[must_use]
    pub fn for_execution(
        normalized_source: &str,
        context_snapshot: &Fingerprint,
        policy_hash: &Fingerprint,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"snipbox.source\0");
        hasher.update(&(normalized_source.len() as u64).to_le_bytes());
        hasher.update(normalized_source.as_bytes());
        hasher.update(b"snipbox.context\0");
        hasher.update(context_snapshot.as_bytes());
        hasher.update(b"snipbox.policy\0");
        hasher.update(policy_hash.as_bytes());
        Self::new(*hasher.finalize().as_bytes())
    }

    /// Short string representation (first 16 hex chars)
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

/// Errors for fingerprint construction
#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    /// Byte slice had the wrong length
    #[error("invalid fingerprint length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected byte count
        expected: usize,
        /// Actual byte count
        actual: usize,
    },

    /// Hex decoding failed
    #[error("invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn compute_is_deterministic() {
        let a = Fingerprint::compute(b"print('hi')");
        let b = Fingerprint::compute(b"print('hi')");
        assert_eq!(a, b);
    }

    #[test]
    fn roundtrip_through_hex() {
        let fp = Fingerprint::compute(b"roundtrip");
        let parsed: Fingerprint = fp.to_string().parse().unwrap();
        assert_eq!(fp, parsed);
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        let result = Fingerprint::from_slice(&[0u8; 16]);
        assert!(matches!(
            result,
            Err(FingerprintError::InvalidLength { actual: 16, .. })
        ));
    }

    #[test]
    fn short_is_sixteen_chars() {
        assert_eq!(Fingerprint::compute(b"x").short().len(), 16);
    }

    #[test]
    fn execution_key_differs_on_each_input() {
        let ctx = Fingerprint::compute(b"ctx");
        let pol = Fingerprint::compute(b"pol");
        let base = Fingerprint::for_execution("x = 1", &ctx, &pol);

        assert_ne!(base, Fingerprint::for_execution("x = 2", &ctx, &pol));
        assert_ne!(
            base,
            Fingerprint::for_execution("x = 1", &Fingerprint::compute(b"other"), &pol)
        );
        assert_ne!(
            base,
            Fingerprint::for_execution("x = 1", &ctx, &Fingerprint::compute(b"other"))
        );
    }

    proptest! {
        #[test]
        fn execution_key_deterministic(source in ".*", ctx in any::<[u8; 32]>(), pol in any::<[u8; 32]>()) {
            let ctx = Fingerprint::new(ctx);
            let pol = Fingerprint::new(pol);
            let a = Fingerprint::for_execution(&source, &ctx, &pol);
            let b = Fingerprint::for_execution(&source, &ctx, &pol);
            prop_assert_eq!(a, b);
        }

        #[test]
        fn distinct_sources_distinct_keys(a in "[a-z]{1,32}", b in "[a-z]{1,32}") {
            prop_assume!(a != b);
            let ctx = Fingerprint::ZERO;
            let pol = Fingerprint::ZERO;
            prop_assert_ne!(
                Fingerprint::for_execution(&a, &ctx, &pol),
                Fingerprint::for_execution(&b, &ctx, &pol)
            );
        }
    }
}
