//! Background processing of a set of marked entities
//!
//! Callers mark entity keys that need work; one `BackgroundWorkManager`
//! drains the set. A key leaves the set only when its processor reports
//! `Done` and it was not marked again while being processed.

use crate::background_work::{
    BackgroundWork, BackgroundWorkConfig, BackgroundWorkManager, WorkOutcome, WorkPhase,
};
use async_trait::async_trait;
use failover_core::{metrics, ActivityId, Runtime, ENTITY_SET_COUNT_MAX};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, trace};

/// Per-entity work run by an `EntitySetWorkManager`
#[async_trait]
pub trait EntityProcessor<K>: Send + Sync + 'static {
    async fn process(&self, key: &K, activity_id: ActivityId) -> WorkOutcome;
}

struct SetState<K> {
    /// Key -> mark at which it was last added
    marks: HashMap<K, u64>,
    next_mark: u64,
}

struct EntitySet<K> {
    name: String,
    state: Mutex<SetState<K>>,
}

impl<K: Eq + Hash + Clone> EntitySet<K> {
    fn pending(&self) -> usize {
        self.state.lock().marks.len()
    }

    fn report_pending(&self, pending: usize) {
        metrics::record_entity_set_pending(&self.name, pending);
    }
}

struct EntitySetWork<K, P> {
    set: Arc<EntitySet<K>>,
    processor: Arc<P>,
}

#[async_trait]
impl<K, P> BackgroundWork for EntitySetWork<K, P>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    P: EntityProcessor<K>,
{
    async fn execute(&self, activity_id: ActivityId) -> WorkOutcome {
        let batch: Vec<(K, u64)> = self
            .set
            .state
            .lock()
            .marks
            .iter()
            .map(|(key, mark)| (key.clone(), *mark))
            .collect();
        trace!(set = %self.set.name, %activity_id, count = batch.len(), "processing entity set");

        for (key, mark) in batch {
            if self.processor.process(&key, activity_id).await != WorkOutcome::Done {
                continue;
            }

            let mut state = self.set.state.lock();
            if state.marks.get(&key) == Some(&mark) {
                state.marks.remove(&key);
            }
        }

        let pending = self.set.pending();
        self.set.report_pending(pending);
        if pending == 0 {
            WorkOutcome::Done
        } else {
            debug!(set = %self.set.name, pending, "entities left for retry");
            WorkOutcome::Retry
        }
    }
}

/// A set of entity keys drained by background work
///
/// Keys still pending after a pass are retried after the configured retry
/// interval; without one they wait for the next `add`.
pub struct EntitySetWorkManager<K, R: Runtime + 'static> {
    set: Arc<EntitySet<K>>,
    manager: BackgroundWorkManager<R>,
}

impl<K, R> EntitySetWorkManager<K, R>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    R: Runtime + 'static,
{
    pub fn new<P>(config: BackgroundWorkConfig, runtime: R, processor: Arc<P>) -> Self
    where
        P: EntityProcessor<K>,
    {
        let set = Arc::new(EntitySet {
            name: config.name.clone(),
            state: Mutex::new(SetState {
                marks: HashMap::new(),
                next_mark: 0,
            }),
        });
        let work = Arc::new(EntitySetWork {
            set: set.clone(),
            processor,
        });

        Self {
            set,
            manager: BackgroundWorkManager::new(config, runtime, work),
        }
    }

    /// Mark `key` for processing and request a pass
    ///
    /// Re-adding a key that is being processed keeps it for the next pass.
    ///
    /// # Panics
    /// If the set would exceed `ENTITY_SET_COUNT_MAX` keys.
    pub fn add(&self, key: K, activity_id: ActivityId) {
        let pending = {
            let mut state = self.set.state.lock();
            state.next_mark += 1;
            let mark = state.next_mark;
            state.marks.insert(key, mark);
            assert!(
                state.marks.len() <= ENTITY_SET_COUNT_MAX,
                "entity set {} exceeds {} keys",
                self.set.name,
                ENTITY_SET_COUNT_MAX
            );
            state.marks.len()
        };

        self.set.report_pending(pending);
        self.manager.request(activity_id);
    }

    /// Drop `key` without processing it
    pub fn remove(&self, key: &K) -> bool {
        let (removed, pending) = {
            let mut state = self.set.state.lock();
            let removed = state.marks.remove(key).is_some();
            (removed, state.marks.len())
        };
        if removed {
            self.set.report_pending(pending);
        }
        removed
    }

    pub fn contains(&self, key: &K) -> bool {
        self.set.state.lock().marks.contains_key(key)
    }

    /// Keys waiting for processing
    pub fn len(&self) -> usize {
        self.set.pending()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop processing; the set keeps its keys
    pub fn close(&self) {
        self.manager.close();
    }

    pub fn phase(&self) -> WorkPhase {
        self.manager.phase()
    }

    pub fn execution_count(&self) -> u64 {
        self.manager.execution_count()
    }
}

impl<K, R: Runtime + 'static> fmt::Debug for EntitySetWorkManager<K, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntitySetWorkManager")
            .field("name", &self.set.name)
            .field("pending", &self.set.state.lock().marks.len())
            .field("manager", &self.manager)
            .finish()
    }
}
