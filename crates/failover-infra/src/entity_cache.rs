//! Keyed collection of versioned cache entries
//!
//! TigerStyle: The map lock guards membership only. Value updates go through
//! each entry's own optimistic lock, so writers on different keys never
//! contend.

use crate::cache_entry::{CacheValue, LockedCacheEntry, VersionedCacheEntry};
use crate::error::{CacheError, CacheResult, EntityKind};
use failover_core::CacheConfig;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Cache of entities of one kind, keyed by `K`
pub struct EntityCache<K, T: CacheValue> {
    entries: RwLock<HashMap<K, Arc<VersionedCacheEntry<T>>>>,
    /// Wait used by `acquire` and `acquire_or_create`
    lock_timeout: Duration,
}

impl<K, T> EntityCache<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug,
    T: CacheValue,
{
    /// Create an empty cache with the default lock timeout
    pub fn new() -> Self {
        Self::with_lock_timeout(CacheConfig::default().lock_timeout())
    }

    /// Create an empty cache from a cache config section
    ///
    /// Fails with `InvalidConfiguration` if the section is out of limits.
    pub fn with_config(config: &CacheConfig) -> failover_core::Result<Self> {
        config.validate()?;
        Ok(Self::with_lock_timeout(config.lock_timeout()))
    }

    fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            lock_timeout,
        }
    }

    /// How long `acquire` waits for a locked entry
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Entity kind stored in this cache
    pub fn kind(&self) -> EntityKind {
        T::KIND
    }

    /// Insert a new entry
    ///
    /// Returns false and leaves the cache unchanged if `key` already exists.
    pub fn insert(&self, key: K, value: T) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, Arc::new(VersionedCacheEntry::new(value)));
        true
    }

    /// Current value for `key`
    ///
    /// `None` if the key is missing, has no committed value, or was deleted.
    pub fn get(&self, key: &K) -> Option<Arc<T>> {
        let entry = self.entry(key)?;
        if entry.is_deleted() {
            return None;
        }
        entry.get()
    }

    /// The entry for `key`, deleted or not
    pub fn entry(&self, key: &K) -> Option<Arc<VersionedCacheEntry<T>>> {
        self.entries.read().get(key).cloned()
    }

    /// Lock the entry for `key`
    ///
    /// Missing keys fail with `NotFound`, like deleted entries.
    pub async fn lock(&self, key: &K, timeout: Duration) -> CacheResult<LockedCacheEntry<T>> {
        let entry = self
            .entry(key)
            .ok_or_else(|| CacheError::not_found(T::KIND))?;
        entry.lock(timeout).await
    }

    /// `lock` with the configured timeout
    pub async fn acquire(&self, key: &K) -> CacheResult<LockedCacheEntry<T>> {
        self.lock(key, self.lock_timeout).await
    }

    /// `lock_or_create` with the configured timeout
    pub async fn acquire_or_create(&self, key: &K) -> CacheResult<(LockedCacheEntry<T>, bool)> {
        self.lock_or_create(key, self.lock_timeout).await
    }

    /// Lock the entry for `key`, creating an empty one if absent
    ///
    /// Returns the handle and whether the entry was created by this call.
    /// A deleted entry is replaced by a fresh one. A freshly created entry is
    /// locked before it becomes visible, so no other writer can take it first.
    pub async fn lock_or_create(
        &self,
        key: &K,
        timeout: Duration,
    ) -> CacheResult<(LockedCacheEntry<T>, bool)> {
        let existing = {
            let mut entries = self.entries.write();
            let live = entries
                .get(key)
                .filter(|entry| !entry.is_deleted())
                .cloned();
            match live {
                Some(entry) => entry,
                None => {
                    let entry = Arc::new(VersionedCacheEntry::empty());
                    let locked = entry.try_lock()?;
                    entries.insert(key.clone(), entry);
                    debug!(kind = %T::KIND, ?key, "cache entry created");
                    return Ok((locked, true));
                }
            }
        };

        let locked = existing.lock(timeout).await?;
        Ok((locked, false))
    }

    /// Physically remove the entry for `key`
    ///
    /// Holders of the removed entry keep working against it; new lookups
    /// miss.
    pub fn remove(&self, key: &K) -> Option<Arc<VersionedCacheEntry<T>>> {
        let removed = self.entries.write().remove(key);
        if removed.is_some() {
            debug!(kind = %T::KIND, ?key, "cache entry removed");
        }
        removed
    }

    /// Number of entries, including deleted ones not yet removed
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.read().keys().cloned().collect()
    }

    /// Current values of all live entries with a committed value
    pub fn snapshot(&self) -> Vec<(K, Arc<T>)> {
        self.entries
            .read()
            .iter()
            .filter(|(_, entry)| !entry.is_deleted())
            .filter_map(|(key, entry)| entry.get().map(|value| (key.clone(), value)))
            .collect()
    }
}

impl<K, T> Default for EntityCache<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug,
    T: CacheValue,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T: CacheValue> fmt::Debug for EntityCache<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityCache")
            .field("kind", &T::KIND)
            .field("len", &self.entries.read().len())
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct ServiceRecord {
        target_replicas: u32,
    }

    impl CacheValue for ServiceRecord {
        const KIND: EntityKind = EntityKind::Service;
    }

    fn record(target_replicas: u32) -> ServiceRecord {
        ServiceRecord { target_replicas }
    }

    #[test]
    fn test_with_config_rejects_out_of_range_timeout() {
        let config = CacheConfig {
            lock_timeout_ms: failover_core::CACHE_LOCK_TIMEOUT_MS_MAX + 1,
        };
        let err = EntityCache::<u64, ServiceRecord>::with_config(&config).unwrap_err();
        assert_eq!(err.field(), Some("cache.lock_timeout_ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_configured_timeout() {
        let config = CacheConfig {
            lock_timeout_ms: 300,
        };
        let cache = EntityCache::with_config(&config).unwrap();
        assert_eq!(cache.lock_timeout(), Duration::from_millis(300));
        cache.insert("svc", record(1));

        let _held = cache.acquire(&"svc").await.unwrap();
        let start = tokio::time::Instant::now();
        let err = cache.acquire(&"svc").await.unwrap_err();

        assert!(err.is_retriable());
        let waited = tokio::time::Instant::now() - start;
        assert!(waited >= Duration::from_millis(300));
        assert!(waited < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_acquire_or_create_uses_cache_defaults() {
        let cache: EntityCache<&str, ServiceRecord> = EntityCache::new();
        assert_eq!(
            cache.lock_timeout(),
            Duration::from_millis(failover_core::CACHE_LOCK_TIMEOUT_MS_DEFAULT)
        );

        let (locked, is_new) = cache.acquire_or_create(&"svc").await.unwrap();
        assert!(is_new);
        locked.commit(record(2));
        assert_eq!(cache.get(&"svc").unwrap().target_replicas, 2);
    }

    #[test]
    fn test_insert_rejects_duplicate() {
        let cache = EntityCache::new();
        assert!(cache.insert("fabric:/app/svc", record(3)));
        assert!(!cache.insert("fabric:/app/svc", record(5)));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"fabric:/app/svc").unwrap().target_replicas, 3);
    }

    #[tokio::test]
    async fn test_lock_missing_key_not_found() {
        let cache: EntityCache<&str, ServiceRecord> = EntityCache::new();
        let err = cache.lock(&"missing", Duration::ZERO).await.unwrap_err();
        assert_eq!(err, CacheError::not_found(EntityKind::Service));
        assert_eq!(err.to_string(), "ServiceNotFound");
    }

    #[tokio::test]
    async fn test_lock_or_create_new_entry() {
        let cache: EntityCache<&str, ServiceRecord> = EntityCache::new();

        let (locked, is_new) = cache.lock_or_create(&"svc", Duration::ZERO).await.unwrap();
        assert!(is_new);
        assert!(locked.is_empty());
        // Visible but without a value until the first commit
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&"svc").is_none());
        assert!(cache.entry(&"svc").unwrap().is_locked());

        locked.commit(record(1));
        assert_eq!(cache.get(&"svc").unwrap().target_replicas, 1);

        let (locked, is_new) = cache.lock_or_create(&"svc", Duration::ZERO).await.unwrap();
        assert!(!is_new);
        assert_eq!(locked.get().unwrap().target_replicas, 1);
    }

    #[tokio::test]
    async fn test_lock_or_create_replaces_deleted_entry() {
        let cache = EntityCache::new();
        cache.insert("svc", record(3));

        cache.lock(&"svc", Duration::ZERO).await.unwrap().delete();
        assert!(cache.get(&"svc").is_none());
        assert!(cache.entry(&"svc").unwrap().is_deleted());

        let (locked, is_new) = cache.lock_or_create(&"svc", Duration::ZERO).await.unwrap();
        assert!(is_new);
        locked.commit(record(4));

        assert_eq!(cache.get(&"svc").unwrap().target_replicas, 4);
    }

    #[tokio::test]
    async fn test_abandoned_creation_removed() {
        let cache: EntityCache<&str, ServiceRecord> = EntityCache::new();

        let (locked, is_new) = cache.lock_or_create(&"svc", Duration::ZERO).await.unwrap();
        assert!(is_new);
        locked.delete();
        cache.remove(&"svc");

        assert!(cache.is_empty());
        assert!(cache.entry(&"svc").is_none());
    }

    #[tokio::test]
    async fn test_snapshot_skips_deleted_and_empty() {
        let cache = EntityCache::new();
        cache.insert(1u64, record(1));
        cache.insert(2u64, record(2));
        cache.insert(3u64, record(3));

        cache.lock(&2, Duration::ZERO).await.unwrap().delete();
        let (_pending, _) = cache.lock_or_create(&4, Duration::ZERO).await.unwrap();

        let mut snapshot = cache.snapshot();
        snapshot.sort_by_key(|(key, _)| *key);
        let keys: Vec<u64> = snapshot.iter().map(|(key, _)| *key).collect();
        assert_eq!(keys, vec![1, 3]);

        let mut all_keys = cache.keys();
        all_keys.sort();
        assert_eq!(all_keys, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_removed_entry_holder_unaffected() {
        let cache = EntityCache::new();
        cache.insert("svc", record(1));

        let locked = cache.lock(&"svc", Duration::ZERO).await.unwrap();
        let entry = cache.remove(&"svc").unwrap();
        locked.commit(record(2));

        assert_eq!(entry.get().unwrap().target_replicas, 2);
        assert!(cache.get(&"svc").is_none());
    }
}
