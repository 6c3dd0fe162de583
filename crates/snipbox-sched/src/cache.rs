//! Content-addressed result cache using moka
//!
//! Maps an execution fingerprint to a previously computed result.
//! `Success` entries live until capacity pressure or explicit purge;
//! non-success entries carry a short TTL so a transient failure cannot
//! permanently poison identical-looking requests after an underlying fix,
//! while still de-duplicating work within one build.

use moka::future::Cache;
use moka::Expiry;
use snipbox_core::{Bindings, ExecutionResult, Fingerprint};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A cached execution: the result plus the bindings it produced
///
/// Replaying the bindings on a cache hit keeps context groups consistent
/// when a grouped snippet is served from the cache instead of re-running.
#[derive(Debug, Clone)]
pub struct CachedExecution {
    /// The cached terminal result
    pub result: Arc<ExecutionResult>,
    /// Bindings produced by the original successful run, if any
    pub bindings: Option<Bindings>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    fingerprint: Fingerprint,
    result: Arc<ExecutionResult>,
    bindings: Option<Bindings>,
    ttl: Option<Duration>,
}

struct EntryExpiry;

impl Expiry<Fingerprint, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &Fingerprint,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// Thread-safe, content-addressed store of execution results
///
/// Owns every stored result; callers receive `Arc` references. Entries are
/// evicted by TTL or capacity pressure, never individually invalidated by
/// external callers except via explicit purge.
#[derive(Clone)]
pub struct ResultCache {
    inner: Cache<Fingerprint, CacheEntry>,
    failure_ttl: Duration,
}

impl ResultCache {
    /// Create a cache with an entry-count ceiling and a failure TTL
    #[must_use]
    pub fn new(max_entries: u64, failure_ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_entries)
                .expire_after(EntryExpiry)
                .build(),
            failure_ttl,
        }
    }

    /// Look up a fingerprint
    ///
    /// A stored entry whose recorded fingerprint disagrees with its key is
    /// cache corruption: it is logged, evicted and treated as a miss,
    /// never surfaced as a snippet failure.
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<CachedExecution> {
        let entry = self.inner.get(fingerprint).await?;
        if entry.fingerprint != *fingerprint {
            tracing::error!(
                key = %fingerprint.short(),
                stored = %entry.fingerprint.short(),
                "cache corruption: fingerprint mismatch, evicting entry"
            );
            self.inner.invalidate(fingerprint).await;
            return None;
        }
        Some(CachedExecution {
            result: entry.result,
            bindings: entry.bindings,
        })
    }

    /// Store an execution result
    ///
    /// Non-success results get the short failure TTL.
    pub async fn put(
        &self,
        fingerprint: Fingerprint,
        result: Arc<ExecutionResult>,
        bindings: Option<Bindings>,
    ) {
        let ttl = if result.status.is_success() {
            None
        } else {
            Some(self.failure_ttl)
        };
        self.inner
            .insert(
                fingerprint,
                CacheEntry {
                    fingerprint,
                    result,
                    bindings,
                    ttl,
                },
            )
            .await;
    }

    /// Explicitly remove one entry
    pub async fn purge(&self, fingerprint: &Fingerprint) {
        self.inner.invalidate(fingerprint).await;
    }

    /// Drop every entry
    pub fn purge_all(&self) {
        self.inner.invalidate_all();
    }

    /// Approximate number of live entries (eventually consistent)
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snipbox_core::{ExecutionResult, ExecutionStatus};

    fn success_result() -> Arc<ExecutionResult> {
        Arc::new(ExecutionResult::success(
            b"out".to_vec(),
            Vec::new(),
            None,
            Duration::from_millis(5),
            0,
        ))
    }

    fn failure_result() -> Arc<ExecutionResult> {
        Arc::new(ExecutionResult::failure(
            ExecutionStatus::Timeout,
            "timed out",
            Duration::from_millis(5),
        ))
    }

    #[tokio::test]
    async fn hit_returns_same_result() {
        let cache = ResultCache::new(16, Duration::from_secs(30));
        let fp = Fingerprint::compute(b"snippet");
        let result = success_result();
        cache.put(fp, Arc::clone(&result), None).await;

        let hit = cache.get(&fp).await.unwrap();
        assert!(Arc::ptr_eq(&hit.result, &result));
    }

    #[tokio::test]
    async fn miss_returns_none() {
        let cache = ResultCache::new(16, Duration::from_secs(30));
        assert!(cache.get(&Fingerprint::compute(b"unseen")).await.is_none());
    }

    #[tokio::test]
    async fn failures_expire_quickly() {
        let cache = ResultCache::new(16, Duration::from_millis(50));
        let fp = Fingerprint::compute(b"flaky");
        cache.put(fp, failure_result(), None).await;
        assert!(cache.get(&fp).await.is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.get(&fp).await.is_none());
    }

    #[tokio::test]
    async fn successes_outlive_the_failure_ttl() {
        let cache = ResultCache::new(16, Duration::from_millis(50));
        let fp = Fingerprint::compute(b"stable");
        cache.put(fp, success_result(), None).await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.get(&fp).await.is_some());
    }

    #[tokio::test]
    async fn purge_removes_entry() {
        let cache = ResultCache::new(16, Duration::from_secs(30));
        let fp = Fingerprint::compute(b"purge-me");
        cache.put(fp, success_result(), None).await;
        cache.purge(&fp).await;
        assert!(cache.get(&fp).await.is_none());
    }

    #[tokio::test]
    async fn corrupt_entry_is_evicted_and_treated_as_miss() {
        let cache = ResultCache::new(16, Duration::from_secs(30));
        let key = Fingerprint::compute(b"key");
        let other = Fingerprint::compute(b"other");
        cache
            .inner
            .insert(
                key,
                CacheEntry {
                    fingerprint: other,
                    result: success_result(),
                    bindings: None,
                    ttl: None,
                },
            )
            .await;

        assert!(cache.get(&key).await.is_none());
        // The corrupt entry is gone; a subsequent put works normally
        cache.put(key, success_result(), None).await;
        assert!(cache.get(&key).await.is_some());
    }

    #[tokio::test]
    async fn cached_bindings_round_trip() {
        let cache = ResultCache::new(16, Duration::from_secs(30));
        let fp = Fingerprint::compute(b"grouped");
        let mut bindings = Bindings::new();
        bindings.insert("x".to_string(), serde_json::json!(5));
        cache
            .put(fp, success_result(), Some(bindings.clone()))
            .await;

        let hit = cache.get(&fp).await.unwrap();
        assert_eq!(hit.bindings, Some(bindings));
    }
}
