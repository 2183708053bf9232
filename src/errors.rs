use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Key, NodeId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MnemosyneError {
    #[error("Lock acquisition timed out for key {key:?} (owner {owner})")]
    LockTimeout { key: Key, owner: String },

    #[error("Write skew detected on key {key:?}")]
    WriteSkew { key: Key },

    #[error("Remote invocation timed out waiting for {targets:?}")]
    RemoteTimeout { targets: Vec<NodeId> },

    #[error("Node {node} left the cluster during the invocation")]
    SuspectedLeaver { node: NodeId },

    #[error("Stale topology: command routed with topology {actual}, current is {expected}")]
    StaleTopology { expected: u64, actual: u64 },

    #[error("Marshalling error: {0}")]
    Marshalling(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Remote exception on node {node}: {message}")]
    RemoteException { node: NodeId, message: String },

    #[error("Transaction {id} is {state} and cannot accept further operations")]
    InvalidTransactionState { id: String, state: String },

    #[error("Command vetoed: {reason}")]
    Vetoed { reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl MnemosyneError {
    /// Whether this failure forced (or must force) the owning transaction to roll back.
    pub fn is_rollback_class(&self) -> bool {
        matches!(
            self,
            MnemosyneError::LockTimeout { .. }
                | MnemosyneError::WriteSkew { .. }
                | MnemosyneError::StaleTopology { .. }
                | MnemosyneError::SuspectedLeaver { .. }
                | MnemosyneError::RemoteTimeout { .. }
        )
    }

    /// Whether retrying the whole operation can succeed without caller intervention.
    ///
    /// Write skew is deliberately excluded: the caller has to re-read before retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MnemosyneError::LockTimeout { .. }
                | MnemosyneError::StaleTopology { .. }
                | MnemosyneError::SuspectedLeaver { .. }
        )
    }
}

/// Serializable projection of [`MnemosyneError`] carried inside remote responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    LockTimeout { key: Key, owner: String },
    WriteSkew { key: Key },
    StaleTopology { expected: u64, actual: u64 },
    Vetoed { reason: String },
    Store(String),
    Marshalling(String),
    Other(String),
}

impl From<&MnemosyneError> for FailureKind {
    fn from(err: &MnemosyneError) -> Self {
        match err {
            MnemosyneError::LockTimeout { key, owner } => FailureKind::LockTimeout {
                key: key.clone(),
                owner: owner.clone(),
            },
            MnemosyneError::WriteSkew { key } => FailureKind::WriteSkew { key: key.clone() },
            MnemosyneError::StaleTopology { expected, actual } => FailureKind::StaleTopology {
                expected: *expected,
                actual: *actual,
            },
            MnemosyneError::Vetoed { reason } => FailureKind::Vetoed {
                reason: reason.clone(),
            },
            MnemosyneError::Store(msg) => FailureKind::Store(msg.clone()),
            MnemosyneError::Marshalling(msg) => FailureKind::Marshalling(msg.clone()),
            other => FailureKind::Other(other.to_string()),
        }
    }
}

impl FailureKind {
    /// Re-hydrates the failure reported by `node` into a local error.
    pub fn into_error(self, node: NodeId) -> MnemosyneError {
        match self {
            FailureKind::LockTimeout { key, owner } => MnemosyneError::LockTimeout { key, owner },
            FailureKind::WriteSkew { key } => MnemosyneError::WriteSkew { key },
            FailureKind::StaleTopology { expected, actual } => {
                MnemosyneError::StaleTopology { expected, actual }
            }
            FailureKind::Vetoed { reason } => MnemosyneError::Vetoed { reason },
            FailureKind::Store(msg) => MnemosyneError::Store(msg),
            FailureKind::Marshalling(msg) => MnemosyneError::Marshalling(msg),
            FailureKind::Other(message) => MnemosyneError::RemoteException { node, message },
        }
    }
}

pub type Result<T> = std::result::Result<T, MnemosyneError>;
