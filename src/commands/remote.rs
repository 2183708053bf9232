use serde::{Deserialize, Serialize};

use crate::commands::{CommandReturn, WriteCommand};
use crate::context::versioned_entry::VersionSeen;
use crate::data_store::versioned_value::EntryVersion;
use crate::distributed::GlobalTransactionId;
use crate::Key;
use crate::errors::FailureKind;

/// Commands that travel between members through the transport.
///
/// Each variant carries the topology id the sender routed it with so the
/// receiver can refuse work computed against an outdated owner set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicableCommand {
    /// Read the committed entry of `key` from an owner.
    ClusteredGet { key: Key, topology_id: u64 },
    /// Acquire (or release) pessimistic locks on the primary owner.
    LockControl {
        gtx: GlobalTransactionId,
        topology_id: u64,
        keys: Vec<Key>,
        unlock: bool,
    },
    /// First phase: stage the transaction's modifications and lock
    /// `lock_keys`, checking and versioning those the receiver is primary of.
    ///
    /// A member owning keys in both roles receives one prepare as primary and
    /// a later one as backup.
    Prepare {
        gtx: GlobalTransactionId,
        topology_id: u64,
        modifications: Vec<WriteCommand>,
        versions_seen: Vec<(Key, VersionSeen)>,
        write_skew_check: bool,
        lock_keys: Vec<Key>,
    },
    /// Second phase: apply the staged modifications with the primaries' versions.
    Commit {
        gtx: GlobalTransactionId,
        topology_id: u64,
        versions: Vec<(Key, EntryVersion)>,
    },
    Rollback {
        gtx: GlobalTransactionId,
        topology_id: u64,
    },
    /// Best-effort removal of everything the receiver owns.
    Clear { topology_id: u64 },
    /// Ask a member for its current topology. `topology_id` is the view the
    /// joiner started in.
    GetTopology { topology_id: u64 },
}

impl ReplicableCommand {
    pub fn topology_id(&self) -> u64 {
        match self {
            ReplicableCommand::ClusteredGet { topology_id, .. }
            | ReplicableCommand::LockControl { topology_id, .. }
            | ReplicableCommand::Prepare { topology_id, .. }
            | ReplicableCommand::Commit { topology_id, .. }
            | ReplicableCommand::Rollback { topology_id, .. }
            | ReplicableCommand::Clear { topology_id }
            | ReplicableCommand::GetTopology { topology_id } => *topology_id,
        }
    }

    pub fn transaction_id(&self) -> Option<GlobalTransactionId> {
        match self {
            ReplicableCommand::LockControl { gtx, .. }
            | ReplicableCommand::Prepare { gtx, .. }
            | ReplicableCommand::Commit { gtx, .. }
            | ReplicableCommand::Rollback { gtx, .. } => Some(*gtx),
            ReplicableCommand::ClusteredGet { .. }
            | ReplicableCommand::Clear { .. }
            | ReplicableCommand::GetTopology { .. } => None,
        }
    }

    /// Whether the command only finishes work and releases locks.
    ///
    /// Such commands never wait for a lock, and lock waiters depend on them.
    pub fn releases_locks(&self) -> bool {
        matches!(
            self,
            ReplicableCommand::Commit { .. }
                | ReplicableCommand::Rollback { .. }
                | ReplicableCommand::LockControl { unlock: true, .. }
        )
    }

    /// Whether the receiver must refuse the command under a different topology.
    ///
    /// Commit and rollback finish work that was already accepted, so they are
    /// applied regardless of later view changes. Topology requests come from
    /// members that do not know the current topology yet.
    pub fn requires_topology_match(&self) -> bool {
        !(self.releases_locks() || matches!(self, ReplicableCommand::GetTopology { .. }))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReplicableCommand::ClusteredGet { .. } => "ClusteredGet",
            ReplicableCommand::LockControl { .. } => "LockControl",
            ReplicableCommand::Prepare { .. } => "Prepare",
            ReplicableCommand::Commit { .. } => "Commit",
            ReplicableCommand::Rollback { .. } => "Rollback",
            ReplicableCommand::Clear { .. } => "Clear",
            ReplicableCommand::GetTopology { .. } => "GetTopology",
        }
    }
}

/// A member's answer to a [`ReplicableCommand`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Successful(CommandReturn),
    Exception(FailureKind),
    /// Synthesized locally when the target left the view before answering.
    Leaver,
}

impl Response {
    pub fn from_result(result: crate::errors::Result<CommandReturn>) -> Self {
        match result {
            Ok(value) => Response::Successful(value),
            Err(err) => Response::Exception(FailureKind::from(&err)),
        }
    }

    pub fn is_successful(&self) -> bool {
        matches!(self, Response::Successful(_))
    }
}
