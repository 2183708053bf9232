use log::debug;

use crate::Key;
use crate::context::versioned_entry::VersionSeen;
use crate::data_store::versioned_value::EntryVersion;
use crate::errors::{MnemosyneError, Result};

/// Rejects repeatable-read transactions whose reads went stale before commit.
///
/// The check runs on the primary owner of each key while the transaction
/// holds the key's lock, so the version it compares against cannot move
/// underneath it.
#[derive(Debug, Default, Clone, Copy)]
pub struct WriteSkewDetector;

impl WriteSkewDetector {
    pub fn new() -> Self {
        Self
    }

    /// Compares what a transaction saw for `key` with the committed version.
    ///
    /// # Arguments
    ///
    /// * `key` - The written key.
    /// * `seen` - What the transaction observed when it first read the key.
    /// * `current` - The version committed right now, `None` if absent.
    ///
    /// # Returns
    ///
    /// `Ok(())` when the key is unchanged since the read, or was never read.
    ///
    /// # Errors
    ///
    /// `MnemosyneError::WriteSkew` if another transaction committed the key
    /// (including creating or removing it) after it was read.
    pub fn check(&self, key: &Key, seen: VersionSeen, current: Option<EntryVersion>) -> Result<()> {
        match seen.expected() {
            None => Ok(()),
            Some(expected) if expected == current => Ok(()),
            Some(expected) => {
                debug!(
                    "Write skew on {:?}: read {:?}, committed {:?}",
                    key, expected, current
                );
                Err(MnemosyneError::WriteSkew { key: key.clone() })
            }
        }
    }

    /// Checks every `(key, seen)` pair, failing on the first stale key.
    ///
    /// `current_version` is consulted only for keys that were actually read.
    pub fn check_all<F>(&self, seen: &[(Key, VersionSeen)], mut current_version: F) -> Result<()>
    where
        F: FnMut(&Key) -> Result<Option<EntryVersion>>,
    {
        for (key, seen) in seen {
            if !seen.is_read() {
                continue;
            }
            let current = current_version(key)?;
            self.check(key, *seen, current)?;
        }
        Ok(())
    }
}
