//! Versioned cache entries with optimistic single-writer locking
//!
//! TigerStyle: Readers never wait, writers serialize, deletion is terminal.
//!
//! # Model
//!
//! A `VersionedCacheEntry<T>` publishes an immutable `Arc<T>` snapshot.
//! Readers call `get()` and receive whichever snapshot was last committed.
//! A writer calls `lock()`, prepares a new value from the snapshot it locked,
//! and either commits it or drops the handle.
//!
//! ```text
//!            lock()                commit(v) / unlock() / drop
//!  Unlocked ---------> Locked ----------------------------------> Unlocked
//!                        |
//!                        | delete()
//!                        v
//!                     Deleted (terminal, every lock() -> NotFound)
//! ```
//!
//! # Invariants
//! - At most one `LockedCacheEntry` exists per entry at any instant
//! - `is_deleted` only goes false -> true
//! - `get()` returns a whole snapshot, never a partially written value
//! - Lock acquisition is not fair; any waiter may win after a release

use crate::error::{CacheError, CacheResult, EntityKind};
use crate::wait::WaitGate;
use failover_core::metrics;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Value type stored in a versioned cache entry
///
/// `KIND` maps cache failures onto entity-specific errors.
pub trait CacheValue: Send + Sync + 'static {
    /// Entity kind used for not-found and update-pending errors
    const KIND: EntityKind;

    /// Called on the outgoing snapshot right before a commit replaces it
    ///
    /// Readers still holding the old snapshot can observe this to detect
    /// staleness without locking.
    fn mark_superseded(&self) {}
}

struct EntryState<T> {
    value: Option<Arc<T>>,
    is_locked: bool,
    is_deleted: bool,
}

enum Release<T> {
    Unlock,
    Commit(Arc<T>),
    Delete,
}

/// A cached record guarded by an optimistic lock
pub struct VersionedCacheEntry<T: CacheValue> {
    state: Mutex<EntryState<T>>,
    gate: WaitGate,
}

impl<T: CacheValue> VersionedCacheEntry<T> {
    /// Create an entry holding `value`
    pub fn new(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Create an entry holding an already shared value
    pub fn from_arc(value: Arc<T>) -> Self {
        Self::with_value(Some(value))
    }

    /// Create an entry with no value yet
    ///
    /// The first writer commits the initial value.
    pub fn empty() -> Self {
        Self::with_value(None)
    }

    fn with_value(value: Option<Arc<T>>) -> Self {
        Self {
            state: Mutex::new(EntryState {
                value,
                is_locked: false,
                is_deleted: false,
            }),
            gate: WaitGate::new(),
        }
    }

    /// Entity kind of the cached value
    pub fn kind(&self) -> EntityKind {
        T::KIND
    }

    /// Current snapshot, `None` if nothing was committed yet
    ///
    /// Never waits for a writer.
    pub fn get(&self) -> Option<Arc<T>> {
        self.state.lock().value.clone()
    }

    /// Whether the entry was deleted
    pub fn is_deleted(&self) -> bool {
        self.state.lock().is_deleted
    }

    /// Whether a writer currently holds the lock
    pub fn is_locked(&self) -> bool {
        self.state.lock().is_locked
    }

    /// Number of writers currently waiting for the lock
    pub fn waiter_count(&self) -> usize {
        self.gate.waiter_count()
    }

    /// Try to take the lock without waiting
    pub fn try_lock(self: &Arc<Self>) -> CacheResult<LockedCacheEntry<T>> {
        let mut state = self.state.lock();
        if state.is_deleted {
            return Err(CacheError::not_found(T::KIND));
        }
        if state.is_locked {
            metrics::record_cache_lock_contended(T::KIND.as_str());
            return Err(CacheError::update_pending(T::KIND));
        }
        state.is_locked = true;
        Ok(LockedCacheEntry::new(self.clone(), state.value.clone()))
    }

    /// Take the lock, waiting up to `timeout` for the current writer
    ///
    /// Returns:
    /// - `NotFound` if the entry is deleted, including when it is deleted
    ///   while this caller waits
    /// - `UpdatePending` if another writer still holds the lock at the deadline
    ///
    /// A timeout too large to be represented as a deadline (e.g.
    /// `Duration::MAX`) waits without one.
    pub async fn lock(self: &Arc<Self>, timeout: Duration) -> CacheResult<LockedCacheEntry<T>> {
        let deadline = tokio::time::Instant::now().checked_add(timeout);

        loop {
            let waiter = {
                let mut state = self.state.lock();
                if state.is_deleted {
                    return Err(CacheError::not_found(T::KIND));
                }
                if !state.is_locked {
                    state.is_locked = true;
                    return Ok(LockedCacheEntry::new(self.clone(), state.value.clone()));
                }
                if deadline.is_some_and(|deadline| tokio::time::Instant::now() >= deadline) {
                    trace!(kind = %T::KIND, "cache entry still locked at deadline");
                    metrics::record_cache_lock_timeout(T::KIND.as_str());
                    return Err(CacheError::update_pending(T::KIND));
                }
                self.gate.register()
            };

            match deadline {
                Some(deadline) => {
                    if !waiter.wait_until(deadline).await {
                        trace!(kind = %T::KIND, ?timeout, "cache lock wait timed out");
                    }
                }
                None => waiter.wait().await,
            }
        }
    }

    fn release(&self, release: Release<T>) {
        {
            let mut state = self.state.lock();
            assert!(state.is_locked, "cache entry released without holding the lock");
            assert!(!state.is_deleted, "cache entry released after deletion");

            match release {
                Release::Unlock => {}
                Release::Commit(value) => {
                    state.value = Some(value);
                }
                Release::Delete => {
                    state.is_deleted = true;
                }
            }
            state.is_locked = false;
        }

        self.gate.signal_all();
    }
}

impl<T: CacheValue> fmt::Debug for VersionedCacheEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("VersionedCacheEntry")
            .field("kind", &T::KIND)
            .field("has_value", &state.value.is_some())
            .field("is_locked", &state.is_locked)
            .field("is_deleted", &state.is_deleted)
            .field("waiters", &self.gate.waiter_count())
            .finish()
    }
}

/// Exclusive write access to a `VersionedCacheEntry`
///
/// Dropping the handle without committing releases the lock and leaves the
/// value unchanged, on every exit path.
pub struct LockedCacheEntry<T: CacheValue> {
    entry: Arc<VersionedCacheEntry<T>>,
    snapshot: Option<Arc<T>>,
    holds_lock: bool,
}

impl<T: CacheValue> LockedCacheEntry<T> {
    fn new(entry: Arc<VersionedCacheEntry<T>>, snapshot: Option<Arc<T>>) -> Self {
        Self {
            entry,
            snapshot,
            holds_lock: true,
        }
    }

    /// Snapshot that was current when the lock was taken
    pub fn get(&self) -> Option<&Arc<T>> {
        self.snapshot.as_ref()
    }

    /// Whether the locked entry has no value yet
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none()
    }

    /// The entry this handle locks
    pub fn entry(&self) -> &Arc<VersionedCacheEntry<T>> {
        &self.entry
    }

    /// Publish `value` and release the lock
    pub fn commit(self, value: T) {
        self.commit_arc(Arc::new(value));
    }

    /// Publish an already shared value and release the lock
    pub fn commit_arc(mut self, value: Arc<T>) {
        assert!(self.holds_lock, "commit without holding the cache lock");
        self.holds_lock = false;

        if let Some(previous) = self.snapshot.take() {
            previous.mark_superseded();
        }

        self.entry.release(Release::Commit(value));
        metrics::record_cache_commit(T::KIND.as_str());
        debug!(kind = %T::KIND, "cache entry committed");
    }

    /// Release the lock without changing the value
    pub fn unlock(mut self) {
        self.release_unchanged();
    }

    /// Mark the entry deleted and release the lock
    ///
    /// Current and future lock attempts fail with `NotFound`.
    pub fn delete(mut self) {
        assert!(self.holds_lock, "delete without holding the cache lock");
        self.holds_lock = false;
        self.entry.release(Release::Delete);
        debug!(kind = %T::KIND, "cache entry deleted");
    }

    fn release_unchanged(&mut self) {
        if self.holds_lock {
            self.holds_lock = false;
            self.entry.release(Release::Unlock);
        }
    }
}

impl<T: CacheValue> Drop for LockedCacheEntry<T> {
    fn drop(&mut self) {
        self.release_unchanged();
    }
}

impl<T: CacheValue> fmt::Debug for LockedCacheEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedCacheEntry")
            .field("kind", &T::KIND)
            .field("has_snapshot", &self.snapshot.is_some())
            .field("holds_lock", &self.holds_lock)
            .finish()
    }
}
