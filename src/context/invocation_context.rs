use ahash::{AHashMap as HashMap, AHashSet as HashSet};

use crate::commands::WriteCommand;
use crate::context::versioned_entry::VersionedEntry;
use crate::distributed::GlobalTransactionId;
use crate::errors::{MnemosyneError, Result};
use crate::{Key, NodeId};

/// Where the operation owning a context was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    /// Replayed on behalf of a transaction coordinated by another member.
    Remote(NodeId),
}

/// Scope of one top-level operation or transaction.
///
/// Holds exactly one [`VersionedEntry`] per touched key, the keys whose locks
/// were acquired on behalf of the scope, and the successful write commands in
/// the order they were performed. A context is owned by a single thread at a
/// time; it is moved, never shared.
#[derive(Debug)]
pub struct InvocationContext {
    origin: Origin,
    transaction_id: Option<GlobalTransactionId>,
    entries: HashMap<Key, VersionedEntry>,
    locked_keys: HashSet<Key>,
    modifications: Vec<WriteCommand>,
}

impl InvocationContext {
    /// Creates a context for an operation started on this node.
    pub fn new_local(transaction_id: Option<GlobalTransactionId>) -> Self {
        Self::new(Origin::Local, transaction_id)
    }

    /// Creates a context replaying commands received from `origin`.
    pub fn new_remote(origin: NodeId, transaction_id: Option<GlobalTransactionId>) -> Self {
        Self::new(Origin::Remote(origin), transaction_id)
    }

    fn new(origin: Origin, transaction_id: Option<GlobalTransactionId>) -> Self {
        Self {
            origin,
            transaction_id,
            entries: HashMap::new(),
            locked_keys: HashSet::new(),
            modifications: Vec::new(),
        }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn is_origin_local(&self) -> bool {
        self.origin == Origin::Local
    }

    pub fn transaction_id(&self) -> Option<GlobalTransactionId> {
        self.transaction_id
    }

    /// Rebinds the context to a new transaction id, used when a commit is
    /// retried under a fresh identity.
    pub fn set_transaction_id(&mut self, transaction_id: Option<GlobalTransactionId>) {
        self.transaction_id = transaction_id;
    }

    pub fn lookup_entry(&self, key: &Key) -> Option<&VersionedEntry> {
        self.entries.get(key)
    }

    pub fn lookup_entry_mut(&mut self, key: &Key) -> Option<&mut VersionedEntry> {
        self.entries.get_mut(key)
    }

    /// Returns the entry a command is about to mutate.
    ///
    /// Locally originated commands require the entry to have been wrapped
    /// first so conditional semantics see what was read. Remote replays trust
    /// the originator and get a blind entry when nothing was wrapped.
    pub fn entry_for_write(&mut self, key: &Key) -> Result<&mut VersionedEntry> {
        if !self.entries.contains_key(key) {
            if self.is_origin_local() {
                return Err(MnemosyneError::Other(format!(
                    "key {:?} was not wrapped before being written",
                    key
                )));
            }
            self.entries
                .insert(key.clone(), VersionedEntry::blind(key.clone()));
        }
        self.entries
            .get_mut(key)
            .ok_or_else(|| MnemosyneError::Other(format!("entry for key {:?} vanished", key)))
    }

    /// Inserts `entry` unless the key is already wrapped. Returns the wrapped entry.
    pub fn put_entry_if_absent(&mut self, entry: VersionedEntry) -> &mut VersionedEntry {
        self.entries.entry(entry.key().clone()).or_insert(entry)
    }

    pub fn contains_entry(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &VersionedEntry> {
        self.entries.values()
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut VersionedEntry> {
        self.entries.values_mut()
    }

    /// Entries modified in this scope, sorted by key.
    pub fn changed_entries(&self) -> Vec<&VersionedEntry> {
        let mut changed: Vec<&VersionedEntry> =
            self.entries.values().filter(|e| e.is_changed()).collect();
        changed.sort_by(|a, b| a.key().cmp(b.key()));
        changed
    }

    pub fn add_locked_key(&mut self, key: Key) {
        self.locked_keys.insert(key);
    }

    pub fn has_locked_key(&self, key: &Key) -> bool {
        self.locked_keys.contains(key)
    }

    pub fn locked_keys(&self) -> impl Iterator<Item = &Key> {
        self.locked_keys.iter()
    }

    /// Drains the locked-key set so the caller can release them.
    pub fn take_locked_keys(&mut self) -> Vec<Key> {
        self.locked_keys.drain().collect()
    }

    pub fn record_modification(&mut self, command: WriteCommand) {
        self.modifications.push(command);
    }

    pub fn modifications(&self) -> &[WriteCommand] {
        &self.modifications
    }

    pub fn has_modifications(&self) -> bool {
        !self.modifications.is_empty()
    }

    /// Discards every wrapped entry and recorded modification.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.modifications.clear();
    }
}
