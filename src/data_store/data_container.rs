use crossbeam_skiplist::SkipMap;

use crate::Key;
use crate::data_store::versioned_value::{VersionedValue, now_millis};

/// The authoritative data container, implemented using a lock-free SkipMap.
///
/// Holds the committed value of every key this node owns. Reads never block;
/// writers are expected to hold the key's lock from the lock manager before
/// calling [`DataContainer::insert`] or [`DataContainer::remove`].
pub struct DataContainer {
    data: SkipMap<Key, VersionedValue>,
}

impl Default for DataContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl DataContainer {
    /// Creates a new, empty `DataContainer`.
    pub fn new() -> Self {
        Self {
            data: SkipMap::new(),
        }
    }

    /// Retrieves the live `VersionedValue` for `key`.
    /// Expired entries read as absent.
    pub fn get(&self, key: &Key) -> Option<VersionedValue> {
        let now = now_millis();
        self.data
            .get(key)
            .map(|entry| entry.value().clone())
            .filter(|value| !value.is_expired(now))
    }

    /// Inserts or replaces the value for `key`.
    pub fn insert(&self, key: Key, value: VersionedValue) {
        self.data.insert(key, value);
    }

    /// Removes a value from the container, returning it if one existed.
    pub fn remove(&self, key: &Key) -> Option<VersionedValue> {
        self.data.remove(key).map(|entry| entry.value().clone())
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        self.get(key).is_some()
    }

    /// Point-in-time snapshot of the keys currently stored, in key order.
    pub fn keys(&self) -> Vec<Key> {
        self.data.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Removes every expired entry and returns the keys that were purged.
    pub fn purge_expired(&self) -> Vec<Key> {
        let now = now_millis();
        let mut purged = Vec::new();
        for entry in self.data.iter() {
            if entry.value().is_expired(now) {
                purged.push(entry.key().clone());
                entry.remove();
            }
        }
        purged
    }
}
