use serde::{Deserialize, Serialize};

/// Defines the isolation levels supported by Mnemosyne transactions.
///
/// Isolation decides what a transaction sees when the same key is touched more
/// than once, and whether the write-skew detector runs at prepare time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionIsolation {
    /// **Read Committed:**
    ///
    /// Every read observes the latest committed value. A key read twice within
    /// the same transaction may return different values if another transaction
    /// committed in between, unless this transaction already modified it.
    /// Write-skew checking never applies at this level.
    ReadCommitted,
    /// **Repeatable Read:**
    ///
    /// The first read of a key wraps it into the transaction's invocation
    /// context and records the version observed. Later reads of that key return
    /// the wrapped value. When write-skew checking is enabled, the version
    /// recorded here is compared against the authoritative version during
    /// prepare, and the transaction aborts if another transaction committed a
    /// change to the key in the meantime.
    RepeatableRead,
}

impl TransactionIsolation {
    pub fn is_repeatable(&self) -> bool {
        matches!(self, TransactionIsolation::RepeatableRead)
    }
}
