//! State store trait and implementations.
//!
//! Holds per key the desired spec, the last observed state and the visible
//! status, guarded by a version token that every write bumps.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{DesiredSpec, ObservedState, ResourceKey, ResourceStatus};

/// Opaque token for compare-and-set on observed state.
pub type VersionToken = u64;

/// Consistent view of one key.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// `None` once deletion is requested (tombstone).
    pub desired: Option<DesiredSpec>,
    /// `None` until the first successful fetch, or when nothing exists yet.
    pub observed: Option<ObservedState>,
    pub token: VersionToken,
}

/// Trait for state storage backends.
///
/// Reads and writes on different keys never block each other; writes to the
/// same key are serialized. Only `NotFound` and `Conflict` are returned.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read desired, observed and the current version token.
    async fn get(&self, key: &ResourceKey) -> Result<Snapshot>;

    /// Replace observed state if `expected` is still current.
    ///
    /// Also rejects a snapshot whose resource version is older than the one
    /// stored, so observed state never moves backwards.
    async fn compare_and_set_observed(
        &self,
        key: &ResourceKey,
        observed: Option<ObservedState>,
        expected: VersionToken,
    ) -> Result<VersionToken>;

    /// Replace the desired spec, creating the key if needed.
    async fn set_desired(&self, key: &ResourceKey, spec: DesiredSpec) -> Result<VersionToken>;

    /// Tombstone the key: desired becomes absent, observed is kept so the
    /// final cycle can tear children down.
    async fn mark_deleted(&self, key: &ResourceKey) -> Result<VersionToken>;

    /// Remove the key entirely if `expected` is still current.
    ///
    /// A write that lands after the caller's last read (a new spec, say)
    /// makes this fail with `Conflict` instead of being discarded.
    async fn delete(&self, key: &ResourceKey, expected: VersionToken) -> Result<()>;

    /// Read the visible status.
    async fn status(&self, key: &ResourceKey) -> Result<ResourceStatus>;

    /// Replace the visible status. Does not bump the version token.
    async fn set_status(&self, key: &ResourceKey, status: ResourceStatus) -> Result<()>;

    /// All known keys, in ascending order.
    async fn keys(&self) -> Vec<ResourceKey>;
}

#[derive(Debug, Default)]
struct Entry {
    desired: Option<DesiredSpec>,
    observed: Option<ObservedState>,
    status: ResourceStatus,
    token: VersionToken,
    /// Set under the entry lock when the key is deleted; holders of a
    /// stale handle must treat the key as gone.
    removed: bool,
}

/// In-memory state store.
///
/// The outer map lock is held only to find, insert or remove an entry;
/// each entry has its own lock. Tokens come from one store-wide counter, so
/// a key that is deleted and declared again never reuses an old token.
#[derive(Default)]
pub struct InMemoryStateStore {
    entries: RwLock<HashMap<ResourceKey, Arc<Mutex<Entry>>>>,
    clock: AtomicU64,
}

impl InMemoryStateStore {
    /// Create a new in-memory state store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new in-memory state store wrapped in an Arc.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    async fn entry(&self, key: &ResourceKey) -> Result<Arc<Mutex<Entry>>> {
        self.entries
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(key))
    }

    fn bump(&self, entry: &mut Entry) -> VersionToken {
        entry.token = self.clock.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        entry.token
    }
}

fn live(key: &ResourceKey, entry: &Entry) -> Result<()> {
    if entry.removed {
        return Err(Error::not_found(key));
    }
    Ok(())
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, key: &ResourceKey) -> Result<Snapshot> {
        let entry = self.entry(key).await?;
        let entry = entry.lock().await;
        live(key, &entry)?;
        Ok(Snapshot {
            desired: entry.desired.clone(),
            observed: entry.observed.clone(),
            token: entry.token,
        })
    }

    async fn compare_and_set_observed(
        &self,
        key: &ResourceKey,
        observed: Option<ObservedState>,
        expected: VersionToken,
    ) -> Result<VersionToken> {
        let entry = self.entry(key).await?;
        let mut entry = entry.lock().await;
        live(key, &entry)?;

        if entry.token != expected {
            return Err(Error::conflict(key, expected, entry.token));
        }

        if let (Some(current), Some(incoming)) = (&entry.observed, &observed) {
            if incoming.resource_version < current.resource_version {
                debug!(
                    key = %key,
                    stored = current.resource_version,
                    incoming = incoming.resource_version,
                    "Rejecting stale observation"
                );
                return Err(Error::conflict(
                    key,
                    current.resource_version,
                    incoming.resource_version,
                ));
            }
        }

        entry.observed = observed;
        Ok(self.bump(&mut entry))
    }

    async fn set_desired(&self, key: &ResourceKey, spec: DesiredSpec) -> Result<VersionToken> {
        loop {
            let handle = {
                let mut entries = self.entries.write().await;
                Arc::clone(entries.entry(key.clone()).or_default())
            };
            let mut entry = handle.lock().await;
            // Deleted between lookup and lock: insert a fresh entry.
            if entry.removed {
                continue;
            }
            entry.desired = Some(spec);
            return Ok(self.bump(&mut entry));
        }
    }

    async fn mark_deleted(&self, key: &ResourceKey) -> Result<VersionToken> {
        let entry = self.entry(key).await?;
        let mut entry = entry.lock().await;
        live(key, &entry)?;
        entry.desired = None;
        Ok(self.bump(&mut entry))
    }

    async fn delete(&self, key: &ResourceKey, expected: VersionToken) -> Result<()> {
        // Entry locks are never held while waiting on the map lock, so taking
        // the entry lock under the map write lock cannot deadlock.
        let mut entries = self.entries.write().await;
        let handle = entries.get(key).cloned().ok_or_else(|| Error::not_found(key))?;
        let mut entry = handle.lock().await;
        if entry.token != expected {
            return Err(Error::conflict(key, expected, entry.token));
        }
        entry.removed = true;
        entries.remove(key);
        debug!(key = %key, token = expected, "Removed key");
        Ok(())
    }

    async fn status(&self, key: &ResourceKey) -> Result<ResourceStatus> {
        let entry = self.entry(key).await?;
        let entry = entry.lock().await;
        live(key, &entry)?;
        Ok(entry.status.clone())
    }

    async fn set_status(&self, key: &ResourceKey, status: ResourceStatus) -> Result<()> {
        let entry = self.entry(key).await?;
        let mut entry = entry.lock().await;
        live(key, &entry)?;
        entry.status = status;
        Ok(())
    }

    async fn keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<_> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Phase;

    fn key() -> ResourceKey {
        ResourceKey::new("replicaset", "default", "web")
    }

    #[tokio::test]
    async fn test_get_missing_key_is_not_found() {
        let store = InMemoryStateStore::new();
        let result = store.get(&key()).await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_set_desired_then_get() -> Result<()> {
        let store = InMemoryStateStore::new();
        let token = store.set_desired(&key(), DesiredSpec::new(1)).await?;

        let snapshot = store.get(&key()).await?;
        assert_eq!(snapshot.token, token);
        assert_eq!(snapshot.desired.map(|d| d.generation()), Some(1));
        assert!(snapshot.observed.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_cas_succeeds_with_current_token() -> Result<()> {
        let store = InMemoryStateStore::new();
        let token = store.set_desired(&key(), DesiredSpec::new(1)).await?;

        let next = store
            .compare_and_set_observed(&key(), Some(ObservedState::new(1, vec![])), token)
            .await?;

        assert!(next > token);
        assert!(store.get(&key()).await?.observed.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_cas_conflicts_after_spec_change() -> Result<()> {
        let store = InMemoryStateStore::new();
        let token = store.set_desired(&key(), DesiredSpec::new(1)).await?;
        store.set_desired(&key(), DesiredSpec::new(2)).await?;

        let result = store
            .compare_and_set_observed(&key(), Some(ObservedState::new(1, vec![])), token)
            .await;

        assert!(matches!(result, Err(Error::Conflict { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_cas_rejects_older_resource_version() -> Result<()> {
        let store = InMemoryStateStore::new();
        let token = store.set_desired(&key(), DesiredSpec::new(1)).await?;
        let token = store
            .compare_and_set_observed(&key(), Some(ObservedState::new(5, vec![])), token)
            .await?;

        let result = store
            .compare_and_set_observed(&key(), Some(ObservedState::new(4, vec![])), token)
            .await;

        assert!(matches!(result, Err(Error::Conflict { .. })));
        assert_eq!(
            store.get(&key()).await?.observed.map(|o| o.resource_version),
            Some(5)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_mark_deleted_keeps_observed() -> Result<()> {
        let store = InMemoryStateStore::new();
        let token = store.set_desired(&key(), DesiredSpec::new(1)).await?;
        store
            .compare_and_set_observed(&key(), Some(ObservedState::new(1, vec![])), token)
            .await?;

        store.mark_deleted(&key()).await?;

        let snapshot = store.get(&key()).await?;
        assert!(snapshot.desired.is_none());
        assert!(snapshot.observed.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_removes_key() -> Result<()> {
        let store = InMemoryStateStore::new();
        let token = store.set_desired(&key(), DesiredSpec::new(1)).await?;

        store.delete(&key(), token).await?;

        assert!(store.keys().await.is_empty());
        assert!(matches!(
            store.delete(&key(), token).await,
            Err(Error::NotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_with_stale_token_keeps_new_spec() -> Result<()> {
        let store = InMemoryStateStore::new();
        let token = store.set_desired(&key(), DesiredSpec::new(1)).await?;
        let token = store.mark_deleted(&key()).await?;
        store.set_desired(&key(), DesiredSpec::new(2)).await?;

        let result = store.delete(&key(), token).await;

        assert!(matches!(result, Err(Error::Conflict { .. })));
        assert_eq!(store.get(&key()).await?.desired.map(|d| d.generation()), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn test_redeclared_key_never_reuses_token() -> Result<()> {
        let store = InMemoryStateStore::new();
        let old = store.set_desired(&key(), DesiredSpec::new(1)).await?;
        store.delete(&key(), old).await?;

        let new = store.set_desired(&key(), DesiredSpec::new(1)).await?;

        assert_ne!(new, old);
        let result = store
            .compare_and_set_observed(&key(), Some(ObservedState::new(1, vec![])), old)
            .await;
        assert!(matches!(result, Err(Error::Conflict { .. })));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_set_desired_racing_delete_is_never_lost() -> Result<()> {
        let store = Arc::new(InMemoryStateStore::new());
        for generation in 1..=50u64 {
            let token = store.set_desired(&key(), DesiredSpec::new(generation)).await?;

            let deleter = {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.delete(&key(), token).await })
            };
            let writer = {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.set_desired(&key(), DesiredSpec::new(generation)).await })
            };
            let (deleted, written) = (deleter.await, writer.await);
            assert!(written.is_ok_and(|r| r.is_ok()));
            assert!(deleted.is_ok());

            // Whichever ran first, the later spec survives.
            let snapshot = store.get(&key()).await?;
            assert_eq!(snapshot.desired.map(|d| d.generation()), Some(generation));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_status_does_not_bump_token() -> Result<()> {
        let store = InMemoryStateStore::new();
        let token = store.set_desired(&key(), DesiredSpec::new(1)).await?;

        let status = ResourceStatus {
            phase: Phase::Failed,
            last_error: Some("denied".to_string()),
            ..ResourceStatus::default()
        };
        store.set_status(&key(), status.clone()).await?;

        assert_eq!(store.get(&key()).await?.token, token);
        assert_eq!(store.status(&key()).await?, status);
        Ok(())
    }

    #[tokio::test]
    async fn test_keys_sorted() -> Result<()> {
        let store = InMemoryStateStore::new();
        let b = ResourceKey::new("replicaset", "default", "b");
        let a = ResourceKey::new("replicaset", "default", "a");
        store.set_desired(&b, DesiredSpec::new(1)).await?;
        store.set_desired(&a, DesiredSpec::new(1)).await?;

        assert_eq!(store.keys().await, vec![a, b]);
        Ok(())
    }
}
