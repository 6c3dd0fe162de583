//! Context groups and the single-writer registry
//!
//! A context group is an ordered set of bindings shared by a sequence of
//! related snippets. The registry enforces the single-writer invariant:
//! one exclusive lease per group at a time, admitted strictly in
//! `sequence_index` order. Snippets in different groups never contend.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use snipbox_core::{bindings_fingerprint, Bindings, Fingerprint};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};

/// Named, ordered bindings shared across a sequence of snippets
#[derive(Debug)]
pub struct ContextGroup {
    id: String,
    bindings: Bindings,
    last_sequence_applied: Option<u32>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl ContextGroup {
    fn new(id: String, ttl: Duration) -> Self {
        let created_at = Utc::now();
        let expires_at = created_at
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
        Self {
            id,
            bindings: Bindings::new(),
            last_sequence_applied: None,
            created_at,
            expires_at,
        }
    }

    /// Group identifier
    #[inline]
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current bindings
    #[inline]
    #[must_use]
    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    /// Sequence index of the last snippet whose bindings were applied
    #[inline]
    #[must_use]
    pub fn last_sequence_applied(&self) -> Option<u32> {
        self.last_sequence_applied
    }

    /// When the group was created
    #[inline]
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Snapshot hash of the current bindings, one input of the cache key
    #[inline]
    #[must_use]
    pub fn snapshot_hash(&self) -> Fingerprint {
        bindings_fingerprint(&self.bindings)
    }

    /// Apply the bindings produced by a successful snippet
    ///
    /// Called under the group lease, so the merge is atomic from the point
    /// of view of every other snippet: partial mutation is never visible.
    pub fn apply(&mut self, bindings: Bindings, sequence_index: u32) {
        for (key, value) in bindings {
            self.bindings.insert(key, value);
        }
        self.last_sequence_applied = Some(sequence_index);
    }

    /// Whether the group's TTL has elapsed
    #[inline]
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug)]
struct GroupSlot {
    state: Arc<Mutex<ContextGroup>>,
    // Next sequence index admitted to execution
    turn: watch::Sender<u32>,
}

/// Exclusive lease on a context group for one snippet's execution
///
/// Dropping the lease always advances the group's turn, so a snippet that
/// fails (or a task that unwinds) never wedges later sequence numbers.
#[derive(Debug)]
pub struct GroupLease {
    slot: Arc<GroupSlot>,
    guard: Option<OwnedMutexGuard<ContextGroup>>,
    sequence_index: u32,
    advanced: bool,
}

impl GroupLease {
    /// Shared view of the group state
    #[inline]
    #[must_use]
    pub fn context(&self) -> &ContextGroup {
        self.guard
            .as_ref()
            .expect("lease guard present until drop")
    }

    /// Exclusive view of the group state
    #[inline]
    #[must_use]
    pub fn context_mut(&mut self) -> &mut ContextGroup {
        self.guard
            .as_mut()
            .expect("lease guard present until drop")
    }

    /// Release the lease and admit the next sequence index
    pub fn finish(mut self) {
        self.advance();
    }

    fn advance(&mut self) {
        if !self.advanced {
            self.advanced = true;
            self.guard.take();
            let _ = self.slot.turn.send(self.sequence_index.saturating_add(1));
        }
    }
}

impl Drop for GroupLease {
    fn drop(&mut self) {
        self.advance();
    }
}

/// Thread-safe registry of context groups
///
/// Groups are created on first reference, leased exclusively per snippet,
/// and destroyed at build end or TTL expiry, whichever comes first.
#[derive(Debug)]
pub struct ContextRegistry {
    groups: DashMap<String, Arc<GroupSlot>>,
    ttl: Duration,
}

impl ContextRegistry {
    /// Create a registry whose groups expire after `ttl`
    #[inline]
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            groups: DashMap::new(),
            ttl,
        }
    }

    fn slot(&self, group_id: &str) -> Arc<GroupSlot> {
        self.groups
            .entry(group_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(group = group_id, "creating context group");
                let (turn, _) = watch::channel(0u32);
                Arc::new(GroupSlot {
                    state: Arc::new(Mutex::new(ContextGroup::new(
                        group_id.to_string(),
                        self.ttl,
                    ))),
                    turn,
                })
            })
            .clone()
    }

    /// Acquire the exclusive lease for one snippet
    ///
    /// Blocks until every earlier sequence index for the group has reached
    /// a terminal state and the lease is free.
    ///
    /// # Errors
    /// - [`ContextError::SequenceReplayed`] if this sequence index already
    ///   completed for the group
    /// - [`ContextError::GroupClosed`] if the group was released while
    ///   waiting
    pub async fn lease(
        &self,
        group_id: &str,
        sequence_index: u32,
    ) -> Result<GroupLease, ContextError> {
        let slot = self.slot(group_id);
        let mut turn = slot.turn.subscribe();
        loop {
            let current = *turn.borrow_and_update();
            if current == sequence_index {
                break;
            }
            if current > sequence_index {
                return Err(ContextError::SequenceReplayed {
                    group: group_id.to_string(),
                    sequence_index,
                    current,
                });
            }
            turn.changed()
                .await
                .map_err(|_| ContextError::GroupClosed {
                    group: group_id.to_string(),
                })?;
        }
        let guard = Arc::clone(&slot.state).lock_owned().await;
        Ok(GroupLease {
            slot,
            guard: Some(guard),
            sequence_index,
            advanced: false,
        })
    }

    /// Destroy a group and drop its bindings
    pub fn release(&self, group_id: &str) {
        if self.groups.remove(group_id).is_some() {
            tracing::debug!(group = group_id, "released context group");
        }
    }

    /// Destroy every group whose TTL has elapsed
    pub async fn purge_expired(&self, now: DateTime<Utc>) {
        let mut expired = Vec::new();
        for entry in self.groups.iter() {
            let state = entry.value().state.lock().await;
            if state.is_expired(now) {
                expired.push(entry.key().clone());
            }
        }
        for group_id in expired {
            tracing::debug!(group = %group_id, "purging expired context group");
            self.groups.remove(&group_id);
        }
    }

    /// Number of live groups
    #[inline]
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

/// Context registry errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ContextError {
    /// A sequence index was submitted after it had already completed
    #[error("sequence {sequence_index} already completed for group '{group}' (next is {current})")]
    SequenceReplayed {
        /// Group identifier
        group: String,
        /// Replayed sequence index
        sequence_index: u32,
        /// Next admissible sequence index
        current: u32,
    },

    /// The group was released while a snippet was waiting for its turn
    #[error("context group '{group}' was closed")]
    GroupClosed {
        /// Group identifier
        group: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn lease_admits_in_sequence_order() {
        let registry = Arc::new(ContextRegistry::new(Duration::from_secs(60)));

        // Sequence 1 first: must wait until sequence 0 finishes
        let registry2 = Arc::clone(&registry);
        let later = tokio::spawn(async move {
            let lease = registry2.lease("tut1", 1).await.unwrap();
            let seen = lease.context().last_sequence_applied();
            lease.finish();
            seen
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!later.is_finished());

        let mut lease = registry.lease("tut1", 0).await.unwrap();
        let mut bindings = Bindings::new();
        bindings.insert("x".to_string(), json!(5));
        lease.context_mut().apply(bindings, 0);
        lease.finish();

        let seen = later.await.unwrap();
        assert_eq!(seen, Some(0));
    }

    #[tokio::test]
    async fn dropped_lease_still_advances() {
        let registry = ContextRegistry::new(Duration::from_secs(60));
        {
            let _lease = registry.lease("g", 0).await.unwrap();
            // Dropped without finish(), as after a failed execution
        }
        let lease = registry.lease("g", 1).await.unwrap();
        assert_eq!(lease.context().last_sequence_applied(), None);
    }

    #[tokio::test]
    async fn replayed_sequence_is_rejected() {
        let registry = ContextRegistry::new(Duration::from_secs(60));
        registry.lease("g", 0).await.unwrap().finish();
        let err = registry.lease("g", 0).await.unwrap_err();
        assert!(matches!(err, ContextError::SequenceReplayed { current: 1, .. }));
    }

    #[tokio::test]
    async fn groups_are_independent() {
        let registry = ContextRegistry::new(Duration::from_secs(60));
        let a = registry.lease("a", 0).await.unwrap();
        // Group b leases while a is held
        let b = registry.lease("b", 0).await.unwrap();
        assert_eq!(registry.group_count(), 2);
        a.finish();
        b.finish();
    }

    #[tokio::test]
    async fn apply_merges_and_tracks_sequence() {
        let registry = ContextRegistry::new(Duration::from_secs(60));
        let mut lease = registry.lease("g", 0).await.unwrap();
        let mut first = Bindings::new();
        first.insert("x".to_string(), json!(5));
        first.insert("y".to_string(), json!(1));
        lease.context_mut().apply(first, 0);
        let before = lease.context().snapshot_hash();
        lease.finish();

        let mut lease = registry.lease("g", 1).await.unwrap();
        let mut second = Bindings::new();
        second.insert("x".to_string(), json!(10));
        lease.context_mut().apply(second, 1);
        assert_eq!(lease.context().bindings().get("x"), Some(&json!(10)));
        assert_eq!(lease.context().bindings().get("y"), Some(&json!(1)));
        assert_ne!(lease.context().snapshot_hash(), before);
        assert_eq!(lease.context().last_sequence_applied(), Some(1));
    }

    #[tokio::test]
    async fn finishing_at_the_last_sequence_index_saturates() {
        let (turn, _rx) = watch::channel(u32::MAX);
        let slot = Arc::new(GroupSlot {
            state: Arc::new(Mutex::new(ContextGroup::new(
                "g".to_string(),
                Duration::from_secs(60),
            ))),
            turn,
        });
        let guard = Arc::clone(&slot.state).lock_owned().await;
        let lease = GroupLease {
            slot: Arc::clone(&slot),
            guard: Some(guard),
            sequence_index: u32::MAX,
            advanced: false,
        };
        lease.finish();
        assert_eq!(*slot.turn.borrow(), u32::MAX);
    }

    #[tokio::test]
    async fn expired_groups_are_purged() {
        let registry = ContextRegistry::new(Duration::ZERO);
        registry.lease("g", 0).await.unwrap().finish();
        assert_eq!(registry.group_count(), 1);
        registry.purge_expired(Utc::now()).await;
        assert_eq!(registry.group_count(), 0);
    }
}
