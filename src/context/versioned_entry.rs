use serde::{Deserialize, Serialize};

use crate::data_store::versioned_value::{EntryVersion, Metadata, VersionedValue};
use crate::{Key, Value};

/// What a transaction observed in the data container when it first read a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionSeen {
    /// The key was never read (blind write). Exempt from write-skew checks.
    NotRead,
    /// The key was read and did not exist.
    Absent,
    /// The key was read at this version.
    Version(EntryVersion),
}

impl VersionSeen {
    pub fn is_read(&self) -> bool {
        !matches!(self, VersionSeen::NotRead)
    }

    /// The version a write-skew check compares against, `None` meaning "absent".
    pub fn expected(&self) -> Option<Option<EntryVersion>> {
        match self {
            VersionSeen::NotRead => None,
            VersionSeen::Absent => Some(None),
            VersionSeen::Version(version) => Some(Some(*version)),
        }
    }
}

/// Transaction-local view of one key.
///
/// A `VersionedEntry` lives in exactly one [`InvocationContext`] and is
/// discarded when the context ends. Commands mutate it; only a commit copies
/// its state into the data container.
///
/// [`InvocationContext`]: crate::context::invocation_context::InvocationContext
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedEntry {
    key: Key,
    /// Value as loaded when the entry was wrapped.
    old_value: Option<Value>,
    /// Current transaction-local value. `None` is a tombstone.
    value: Option<Value>,
    metadata: Metadata,
    version_seen: VersionSeen,
    changed: bool,
    removed: bool,
    valid: bool,
    created: bool,
}

impl VersionedEntry {
    /// Wraps the committed state of `key` as read from the owner.
    ///
    /// # Arguments
    ///
    /// * `key` - The key being wrapped.
    /// * `committed` - The authoritative value, or `None` if the key is absent.
    ///
    /// # Returns
    ///
    /// An unchanged entry whose `version_seen` records what was read.
    pub fn from_read(key: Key, committed: Option<VersionedValue>) -> Self {
        match committed {
            Some(committed) => Self {
                key,
                old_value: Some(committed.data().clone()),
                value: Some(committed.data().clone()),
                metadata: *committed.metadata(),
                version_seen: VersionSeen::Version(committed.version()),
                changed: false,
                removed: false,
                valid: true,
                created: false,
            },
            None => Self {
                key,
                old_value: None,
                value: None,
                metadata: Metadata::default(),
                version_seen: VersionSeen::Absent,
                changed: false,
                removed: false,
                valid: true,
                created: false,
            },
        }
    }

    /// Wraps `key` without reading it, for writes that ignore the previous value.
    pub fn blind(key: Key) -> Self {
        Self {
            key,
            old_value: None,
            value: None,
            metadata: Metadata::default(),
            version_seen: VersionSeen::NotRead,
            changed: false,
            removed: false,
            valid: true,
            created: false,
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Current value, or `None` when absent or removed in this transaction.
    pub fn value(&self) -> Option<&Value> {
        if self.removed {
            None
        } else {
            self.value.as_ref()
        }
    }

    pub fn old_value(&self) -> Option<&Value> {
        self.old_value.as_ref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn version_seen(&self) -> VersionSeen {
        self.version_seen
    }

    pub fn is_null(&self) -> bool {
        self.value().is_none()
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Upgrades a blind entry with the committed state read later on.
    ///
    /// Has no effect on entries that were already read. A blind entry that was
    /// already written keeps its written value and only records the version.
    pub fn record_read(&mut self, committed: Option<&VersionedValue>) {
        if self.version_seen.is_read() {
            return;
        }
        self.version_seen = match committed {
            Some(committed) => VersionSeen::Version(committed.version()),
            None => VersionSeen::Absent,
        };
        self.old_value = committed.map(|c| c.data().clone());
        if !self.changed {
            self.value = self.old_value.clone();
            if let Some(committed) = committed {
                self.metadata = *committed.metadata();
            }
        }
    }

    /// Sets a new value, reviving the entry if it was removed earlier.
    pub fn set_value(&mut self, value: Value, metadata: Metadata) {
        self.created = self.is_null();
        self.value = Some(value);
        self.metadata = metadata;
        self.changed = true;
        self.removed = false;
        self.valid = true;
    }

    /// Marks the entry as deleted.
    pub fn remove(&mut self) {
        self.value = None;
        self.changed = true;
        self.removed = true;
        self.valid = false;
        self.created = false;
    }

    /// The committed form of this entry at `version`, or `None` for a removal.
    pub fn to_committed(&self, version: EntryVersion) -> Option<VersionedValue> {
        self.value()
            .map(|value| VersionedValue::new(value.clone(), version, self.metadata))
    }
}
