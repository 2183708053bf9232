pub mod commands;
pub mod config;
pub mod conflict;
pub mod context;
pub mod data_store;
pub mod distributed;
pub mod errors;
pub mod isolation;
pub mod lock;
pub mod marshall;
mod mnemosyne;
pub mod services;
pub mod stats;
pub mod storage;
pub mod transaction;
pub mod twopc;

/// Opaque, comparable cache key.
pub type Key = bytes::Bytes;
/// Opaque cache value.
pub type Value = bytes::Bytes;
/// Identity of a cluster member.
pub type NodeId = u64;

pub use mnemosyne::prelude;

// Re-export key types and structs for easier access
pub use commands::{CommandOutcome, CommandReturn, WriteCommand};
pub use config::{CacheMode, GridConfig, LockingMode};
pub use context::invocation_context::{InvocationContext, Origin};
pub use context::versioned_entry::{VersionSeen, VersionedEntry};
pub use data_store::data_container::DataContainer;
pub use data_store::versioned_value::{EntryVersion, Metadata, VersionedValue};
pub use distributed::{GlobalTransactionId, View};
pub use errors::{MnemosyneError, Result};
pub use isolation::TransactionIsolation;
pub use lock::lock_manager::{LockManager, LockOwner};
pub use mnemosyne::Mnemosyne;
pub use stats::{CacheStats, StatsSnapshot};
pub use storage::{Store, StoreMutation};
pub use transaction::{Transaction, TransactionState};
