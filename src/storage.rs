use crate::Key;
use crate::data_store::versioned_value::VersionedValue;
use crate::errors::Result;

/// Represents a single mutation to be applied to the persistence layer.
///
/// `StoreMutation` describes a change that a committed transaction made to a
/// key this node owns.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreMutation {
    /// Write (insert or overwrite) the entry for the key.
    Write(Key, VersionedValue),
    /// Delete the entry for the key. Deleting an absent key is a no-op.
    Delete(Key),
}

impl StoreMutation {
    pub fn key(&self) -> &Key {
        match self {
            StoreMutation::Write(key, _) | StoreMutation::Delete(key) => key,
        }
    }
}

/// Trait for the persistence collaborator backing a cache.
///
/// The cache consults the store on container misses (read-through) and hands
/// it the mutations of every committed transaction for the keys this node owns
/// (write-through). Implementations decide how and where entries are kept.
///
/// Implementations must be `Send` and `Sync` to be used concurrently by multiple
/// transactions.
pub trait Store: Send + Sync {
    /// Loads the entry for `key`, or `None` if the store has nothing for it.
    fn load(&self, key: &Key) -> Result<Option<VersionedValue>>;

    /// Loads every entry held by the store.
    fn load_all(&self) -> Result<Vec<(Key, VersionedValue)>>;

    /// Atomically applies the given mutations.
    ///
    /// Either all `mutations` are persisted, or none are and an
    /// `MnemosyneError::Store` is returned.
    ///
    /// # Examples
    ///
    /// A minimal in-memory implementation:
    ///
    /// ```no_run
    /// use mnemosyne::prelude::*;
    /// use ahash::AHashMap as HashMap;
    /// use parking_lot::Mutex;
    ///
    /// #[derive(Default)]
    /// struct MemoryStore {
    ///     data: Mutex<HashMap<Key, VersionedValue>>,
    /// }
    ///
    /// impl Store for MemoryStore {
    ///     fn load(&self, key: &Key) -> Result<Option<VersionedValue>> {
    ///         Ok(self.data.lock().get(key).cloned())
    ///     }
    ///
    ///     fn load_all(&self) -> Result<Vec<(Key, VersionedValue)>> {
    ///         Ok(self.data.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    ///     }
    ///
    ///     fn apply_mutations(&self, mutations: Vec<StoreMutation>) -> Result<()> {
    ///         let mut data = self.data.lock();
    ///         for mutation in mutations {
    ///             match mutation {
    ///                 StoreMutation::Write(key, value) => {
    ///                     data.insert(key, value);
    ///                 }
    ///                 StoreMutation::Delete(key) => {
    ///                     data.remove(&key);
    ///                 }
    ///             }
    ///         }
    ///         Ok(())
    ///     }
    ///
    ///     fn purge_expired(&self, now: u64) -> Result<usize> {
    ///         let mut data = self.data.lock();
    ///         let before = data.len();
    ///         data.retain(|_, v| !v.is_expired(now));
    ///         Ok(before - data.len())
    ///     }
    /// }
    /// ```
    fn apply_mutations(&self, mutations: Vec<StoreMutation>) -> Result<()>;

    /// Removes entries whose lifespan ended before `now` (milliseconds since
    /// the unix epoch) and returns how many were removed.
    fn purge_expired(&self, now: u64) -> Result<usize>;
}
