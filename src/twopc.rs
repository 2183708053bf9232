use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::commands::{CommandReturn, WriteCommand};
use crate::context::invocation_context::InvocationContext;
use crate::context::versioned_entry::VersionSeen;
use crate::data_store::versioned_value::EntryVersion;
use crate::distributed::{GlobalTransactionId, View};
use crate::errors::Result;
use crate::{Key, NodeId};

/// Trait for a participant in the two-phase commit protocol.
///
/// Every cache member implements it for the transactions other members
/// coordinate. Commit and rollback of a transaction the participant does not
/// know about succeed without doing anything, so both phases are idempotent.
///
/// Implementations must be `Send` and `Sync` to be used concurrently.
pub trait TwoPhaseCommitParticipant: Send + Sync {
    /// Acquires (or releases, when `unlock` is set) the locks a pessimistic
    /// transaction needs on keys this participant is primary owner of.
    fn lock_keys(
        &self,
        origin: NodeId,
        gtx: GlobalTransactionId,
        keys: Vec<Key>,
        unlock: bool,
    ) -> Result<CommandReturn>;

    /// Phase 1: Prepare the transaction.
    ///
    /// Replays `modifications` and locks the keys of `lock_keys` this
    /// participant owns. For the locked keys it is primary owner of, it runs
    /// the write-skew check and assigns their new versions. A second prepare
    /// of the same transaction (as backup after primary) stages it again and
    /// keeps the locks already held.
    ///
    /// # Returns
    ///
    /// `CommandReturn::Versions` with the versions assigned by this participant.
    ///
    /// # Errors
    ///
    /// Rollback-class failures (`LockTimeout`, `WriteSkew`) vote "no". A
    /// prepare for a transaction that already completed here is refused.
    fn prepare(
        &self,
        origin: NodeId,
        gtx: GlobalTransactionId,
        modifications: Vec<WriteCommand>,
        versions_seen: Vec<(Key, VersionSeen)>,
        write_skew_check: bool,
        lock_keys: Vec<Key>,
    ) -> Result<CommandReturn>;

    /// Phase 2: Apply the prepared modifications using `versions`.
    fn commit(&self, gtx: GlobalTransactionId, versions: Vec<(Key, EntryVersion)>) -> Result<CommandReturn>;

    /// Phase 2: Discard the prepared state and release the locks.
    fn rollback(&self, gtx: GlobalTransactionId) -> Result<CommandReturn>;
}

/// What a participant holds for a transaction coordinated elsewhere.
#[derive(Debug)]
pub enum RemoteTxState {
    /// Pessimistic locks were taken, nothing was prepared yet.
    Locking,
    Prepared {
        ctx: InvocationContext,
        /// Changed keys this node owned at prepare time.
        owned_keys: Vec<Key>,
    },
}

#[derive(Debug)]
pub struct RemoteTransaction {
    pub origin: NodeId,
    pub state: RemoteTxState,
}

struct TableInner {
    active: HashMap<GlobalTransactionId, RemoteTransaction>,
    completed: HashSet<GlobalTransactionId>,
    completed_order: VecDeque<GlobalTransactionId>,
}

/// Participant-side registry of remote transactions.
///
/// Completed ids are remembered in a bounded history so that a Prepare or
/// lock request overtaken by its own Rollback is refused instead of leaving
/// locks behind.
pub struct TransactionTable {
    inner: Mutex<TableInner>,
    history: usize,
}

impl TransactionTable {
    pub fn new(history: usize) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                active: HashMap::new(),
                completed: HashSet::new(),
                completed_order: VecDeque::new(),
            }),
            history: history.max(1),
        }
    }

    pub fn is_completed(&self, gtx: &GlobalTransactionId) -> bool {
        self.inner.lock().completed.contains(gtx)
    }

    pub fn contains(&self, gtx: &GlobalTransactionId) -> bool {
        self.inner.lock().active.contains_key(gtx)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records the lock-only state of `gtx` unless it completed meanwhile.
    ///
    /// An existing entry (possibly already prepared) is left untouched.
    pub fn register_locking(&self, gtx: GlobalTransactionId, origin: NodeId) -> bool {
        let mut inner = self.inner.lock();
        if inner.completed.contains(&gtx) {
            return false;
        }
        inner.active.entry(gtx).or_insert(RemoteTransaction {
            origin,
            state: RemoteTxState::Locking,
        });
        true
    }

    /// Stores the prepared state of `gtx` unless it completed meanwhile.
    pub fn register_prepared(
        &self,
        gtx: GlobalTransactionId,
        origin: NodeId,
        ctx: InvocationContext,
        owned_keys: Vec<Key>,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.completed.contains(&gtx) {
            return false;
        }
        inner.active.insert(
            gtx,
            RemoteTransaction {
                origin,
                state: RemoteTxState::Prepared { ctx, owned_keys },
            },
        );
        true
    }

    /// Marks `gtx` completed and hands back whatever was held for it.
    pub fn complete(&self, gtx: GlobalTransactionId) -> Option<RemoteTransaction> {
        let mut inner = self.inner.lock();
        let removed = inner.active.remove(&gtx);
        Self::remember(&mut inner, gtx, self.history);
        removed
    }

    /// Completes every transaction whose originator is not part of `view`.
    pub fn remove_orphans(&self, view: &View) -> Vec<GlobalTransactionId> {
        let mut inner = self.inner.lock();
        let orphans: Vec<GlobalTransactionId> = inner
            .active
            .iter()
            .filter(|(_, tx)| !view.contains(tx.origin))
            .map(|(gtx, _)| *gtx)
            .collect();
        for gtx in &orphans {
            inner.active.remove(gtx);
            Self::remember(&mut inner, *gtx, self.history);
        }
        orphans
    }

    fn remember(inner: &mut TableInner, gtx: GlobalTransactionId, history: usize) {
        if inner.completed.insert(gtx) {
            inner.completed_order.push_back(gtx);
        }
        while inner.completed_order.len() > history {
            if let Some(oldest) = inner.completed_order.pop_front() {
                inner.completed.remove(&oldest);
            }
        }
    }
}
