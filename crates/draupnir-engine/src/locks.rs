//! Per-identifier locking for lifecycle transitions

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// A lazily populated table of read/write locks, one per key.
///
/// A state transition on an id holds the exclusive side. Work that only needs
/// the id to stay put (for example provisioning against an image) holds the
/// shared side. Keys never contend with each other.
pub struct KeyedLocks<K> {
    slots: DashMap<K, Arc<RwLock<()>>>,
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    fn slot(&self, key: K) -> Arc<RwLock<()>> {
        Arc::clone(
            self.slots
                .entry(key)
                .or_insert_with(|| Arc::new(RwLock::new(())))
                .value(),
        )
    }

    pub async fn exclusive(&self, key: K) -> OwnedRwLockWriteGuard<()> {
        self.slot(key).write_owned().await
    }

    pub async fn shared(&self, key: K) -> OwnedRwLockReadGuard<()> {
        self.slot(key).read_owned().await
    }

    /// Drop the slot for a key that no longer exists, unless someone is
    /// still holding or waiting on it.
    pub fn prune(&self, key: &K) {
        self.slots
            .remove_if(key, |_, slot| Arc::strong_count(slot) == 1);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
