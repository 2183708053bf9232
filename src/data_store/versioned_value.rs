use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::Value;

/// Version of an authoritative entry.
///
/// Versions are totally ordered and strictly increase every time a key is
/// committed, including after the key was removed and written again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryVersion(pub u64);

impl fmt::Display for EntryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Lifespan metadata attached to a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metadata {
    /// How long the entry lives after `created_at`. `None` means forever.
    pub lifespan: Option<Duration>,
    /// Wall clock creation time, milliseconds since the unix epoch.
    pub created_at: u64,
}

impl Metadata {
    pub fn with_lifespan(lifespan: Option<Duration>) -> Self {
        Self {
            lifespan,
            created_at: now_millis(),
        }
    }

    /// Milliseconds since the unix epoch at which the entry expires, if ever.
    pub fn expires_at(&self) -> Option<u64> {
        self.lifespan
            .map(|lifespan| self.created_at.saturating_add(lifespan.as_millis() as u64))
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at().is_some_and(|deadline| deadline <= now)
    }
}

/// Represents an authoritative, committed value together with its version.
///
/// Values stored in the data container are wrapped in `VersionedValue` so the
/// write-skew detector can compare the version a transaction observed with the
/// version currently committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    data: Value,
    version: EntryVersion,
    metadata: Metadata,
}

impl VersionedValue {
    /// Creates a new `VersionedValue`.
    ///
    /// # Examples
    ///
    /// ```
    /// use mnemosyne::prelude::*;
    /// use bytes::Bytes;
    ///
    /// let value = VersionedValue::new(Bytes::from("v1"), EntryVersion(1), Metadata::default());
    /// assert_eq!(value.version(), EntryVersion(1));
    /// ```
    pub fn new(data: Value, version: EntryVersion, metadata: Metadata) -> Self {
        Self {
            data,
            version,
            metadata,
        }
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn version(&self) -> EntryVersion {
        self.version
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.metadata.is_expired(now)
    }
}

/// Node-local source of new entry versions.
///
/// Works like a Lamport clock: every version stored on this node is observed,
/// and every version handed out is greater than anything observed so far. A
/// node that becomes primary for a key after a rehash therefore never reissues
/// a version the previous primary already used for that key.
#[derive(Debug, Default)]
pub struct VersionGenerator {
    counter: AtomicU64,
}

impl VersionGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a version strictly greater than `current` and every version seen so far.
    pub fn next_after(&self, current: Option<EntryVersion>) -> EntryVersion {
        let floor = current.map(|v| v.0).unwrap_or(0);
        let mut observed = self.counter.load(Ordering::Acquire);
        loop {
            let next = observed.max(floor) + 1;
            match self.counter.compare_exchange_weak(
                observed,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return EntryVersion(next),
                Err(actual) => observed = actual,
            }
        }
    }

    /// Records a version produced elsewhere (e.g. by the primary owner).
    pub fn observe(&self, version: EntryVersion) {
        self.counter.fetch_max(version.0, Ordering::AcqRel);
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
