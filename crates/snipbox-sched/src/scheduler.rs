//! The concurrency scheduler
//!
//! Per-snippet state machine: Queued -> Validating -> (CacheHit: Done) ->
//! Executing -> Done. Independent snippets run in parallel on a bounded
//! worker pool; snippets sharing a context group are admitted strictly in
//! `sequence_index` order through the group lease. Every submission
//! completes with a typed result or error; worker failures never take
//! down the pool.

use crate::cache::ResultCache;
use crate::metrics::{BuildMetrics, MetricsSnapshot};
use snipbox_core::{ExecutionResult, ExecutionStatus, Fingerprint, Snippet};
use snipbox_policy::{PolicyDelta, PolicyError, PolicyStore};
use snipbox_sandbox::{
    ContextError, ContextRegistry, GroupLease, SandboxError, SandboxExecutor,
};
use snipbox_validate::StaticValidator;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};

/// Scheduler tuning knobs
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker pool size; defaults to the host core count
    pub max_workers: usize,
    /// Result cache entry ceiling
    pub cache_entries: u64,
    /// TTL for cached non-success results
    pub failure_ttl: Duration,
    /// Context group lifetime
    pub context_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4),
            cache_entries: 4096,
            failure_ttl: Duration::from_secs(30),
            context_ttl: Duration::from_secs(3600),
        }
    }
}

/// Submission errors that are not snippet results
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Overrides attempted to loosen the base policy
    #[error("policy violation: {0}")]
    Policy(#[from] PolicyError),

    /// Context group bookkeeping failed
    #[error("context error: {0}")]
    Context(#[from] ContextError),

    /// The build was aborted before this submission completed
    #[error("build aborted")]
    Cancelled,
}

/// Orchestrates validation, caching and sandboxed execution
///
/// The scheduler itself does no execution: queue and lease bookkeeping is
/// lock-protected, and all snippet work happens on pool workers.
pub struct ConcurrencyScheduler {
    policy_store: PolicyStore,
    validator: StaticValidator,
    executor: SandboxExecutor,
    cache: ResultCache,
    contexts: ContextRegistry,
    pool: Arc<Semaphore>,
    abort: watch::Sender<bool>,
    metrics: BuildMetrics,
}

impl ConcurrencyScheduler {
    /// Create a scheduler for one build
    #[must_use]
    pub fn new(
        policy_store: PolicyStore,
        executor: SandboxExecutor,
        config: SchedulerConfig,
    ) -> Self {
        let (abort, _) = watch::channel(false);
        Self {
            policy_store,
            validator: StaticValidator::new(),
            executor,
            cache: ResultCache::new(config.cache_entries, config.failure_ttl),
            contexts: ContextRegistry::new(config.context_ttl),
            pool: Arc::new(Semaphore::new(config.max_workers.max(1))),
            abort,
            metrics: BuildMetrics::new(),
        }
    }

    /// Submit one snippet for execution
    ///
    /// Synchronous from the caller's perspective: the future resolves once
    /// the snippet reaches a terminal state. Results come back behind an
    /// `Arc`; the cache retains ownership of stored entries.
    ///
    /// # Errors
    /// - [`SubmitError::Policy`] when overrides would widen the base policy
    /// - [`SubmitError::Cancelled`] when the build is aborted first
    /// - [`SubmitError::Context`] on group sequence misuse
    pub async fn submit(
        &self,
        snippet: Snippet,
        overrides: Option<&PolicyDelta>,
    ) -> Result<Arc<ExecutionResult>, SubmitError> {
        if *self.abort.borrow() {
            return Err(SubmitError::Cancelled);
        }
        self.metrics.record_submission();

        let mut aborted = self.abort.subscribe();
        tokio::select! {
            result = self.submit_inner(snippet, overrides) => result,
            _ = aborted.wait_for(|cancelled| *cancelled) => Err(SubmitError::Cancelled),
        }
    }

    async fn submit_inner(
        &self,
        snippet: Snippet,
        overrides: Option<&PolicyDelta>,
    ) -> Result<Arc<ExecutionResult>, SubmitError> {
        let policy = self.policy_store.resolve(overrides)?;
        let policy_hash = policy.fingerprint();

        // Grouped snippets take the exclusive lease before fingerprinting:
        // the context snapshot depends on every earlier mutation.
        let mut lease: Option<GroupLease> = match &snippet.context_group_id {
            Some(group_id) => Some(
                self.contexts
                    .lease(group_id, snippet.sequence_index)
                    .await?,
            ),
            None => None,
        };

        let snapshot = lease
            .as_ref()
            .map_or(Fingerprint::ZERO, |l| l.context().snapshot_hash());
        let fingerprint =
            Fingerprint::for_execution(&snippet.normalized_source(), &snapshot, &policy_hash);

        if snippet.cacheable {
            if let Some(hit) = self.cache.get(&fingerprint).await {
                tracing::debug!(fingerprint = %fingerprint.short(), "cache hit");
                self.metrics.record_cache_hit();
                self.metrics
                    .record_result(hit.result.status, hit.result.duration);
                if let Some(lease) = lease.take() {
                    finish_with_bindings(lease, hit.bindings.clone(), snippet.sequence_index);
                }
                return Ok(hit.result);
            }
        }

        let validated = match self.validator.validate(&snippet, &policy) {
            Ok(validated) => validated,
            Err(violation) => {
                tracing::warn!(
                    symbol = violation.symbol().unwrap_or("<unparseable>"),
                    fingerprint = %fingerprint.short(),
                    "snippet rejected by static validation"
                );
                let result = Arc::new(ExecutionResult::failure(
                    ExecutionStatus::SecurityViolation,
                    violation.to_string(),
                    Duration::ZERO,
                ));
                if snippet.cacheable {
                    self.cache
                        .put(fingerprint, Arc::clone(&result), None)
                        .await;
                }
                self.metrics
                    .record_result(ExecutionStatus::SecurityViolation, Duration::ZERO);
                if let Some(lease) = lease.take() {
                    lease.finish();
                }
                return Ok(result);
            }
        };

        // The pool permit comes after the lease so a snippet waiting for
        // its group turn never occupies a worker slot.
        let permit = self
            .pool
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SubmitError::Cancelled)?;

        let started = Instant::now();
        let run = self
            .executor
            .execute(
                &validated,
                lease.as_mut().map(|l| l.context_mut()),
                &policy,
                self.abort.subscribe(),
            )
            .await;
        drop(permit);

        let run = match run {
            Ok(run) => run,
            Err(SandboxError::Aborted) => {
                if let Some(lease) = lease.take() {
                    lease.finish();
                }
                return Err(SubmitError::Cancelled);
            }
        };

        let result = Arc::new(run.result);
        if snippet.cacheable {
            self.cache
                .put(fingerprint, Arc::clone(&result), run.bindings)
                .await;
        }
        self.metrics.record_result(result.status, result.duration);
        tracing::debug!(
            fingerprint = %fingerprint.short(),
            status = result.status.as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "submission complete"
        );
        if let Some(lease) = lease.take() {
            lease.finish();
        }
        Ok(result)
    }

    /// Abort the encompassing build
    ///
    /// Queued submissions return [`SubmitError::Cancelled`] without
    /// executing; executing workers take the same hard-termination path
    /// used for timeouts.
    pub fn abort(&self) {
        tracing::info!("build aborted: draining queued snippets");
        let _ = self.abort.send(true);
    }

    /// Destroy one context group ahead of build end
    pub fn release_group(&self, group_id: &str) {
        self.contexts.release(group_id);
    }

    /// Drop expired context groups
    pub async fn purge_expired_contexts(&self) {
        self.contexts.purge_expired(chrono::Utc::now()).await;
    }

    /// Explicitly purge one cache entry
    pub async fn purge_cached(&self, fingerprint: &Fingerprint) {
        self.cache.purge(fingerprint).await;
    }

    /// Current build-level metrics
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Replay cached bindings into the group, then advance the turn
fn finish_with_bindings(
    mut lease: GroupLease,
    bindings: Option<snipbox_core::Bindings>,
    sequence_index: u32,
) {
    if let Some(bindings) = bindings {
        lease.context_mut().apply(bindings, sequence_index);
    }
    lease.finish();
}
