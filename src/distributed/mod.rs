//! Cluster plumbing: membership views, key ownership and remote invocation.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::NodeId;

pub mod consistent_hash;
pub mod invocation;
pub mod membership;
pub mod network;
pub mod response;
pub mod transport;

/// Cluster-wide identity of a transaction: the coordinating node plus a
/// counter local to that node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalTransactionId {
    pub node: NodeId,
    pub local_id: u64,
}

impl GlobalTransactionId {
    pub fn new(node: NodeId, local_id: u64) -> Self {
        Self { node, local_id }
    }
}

impl fmt::Display for GlobalTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gtx-{}:{}", self.node, self.local_id)
    }
}

/// An installed cluster view: its id and the ordered member list.
///
/// View ids strictly increase; every member sees the same member order for
/// the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub id: u64,
    pub members: Vec<NodeId>,
}

impl View {
    pub fn new(id: u64, members: Vec<NodeId>) -> Self {
        Self { id, members }
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.members.contains(&node)
    }

    /// Members of `previous` that are not part of this view.
    pub fn leavers_since(&self, previous: &View) -> Vec<NodeId> {
        previous
            .members
            .iter()
            .copied()
            .filter(|member| !self.contains(*member))
            .collect()
    }
}
