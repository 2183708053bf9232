use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{MnemosyneError, Result};
use crate::{NodeId, TransactionIsolation};

/// How keys are spread over the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheMode {
    /// Single node, no remote invocations at all.
    Local,
    /// Every member owns every segment.
    Replicated,
    /// Each segment is owned by `num_owners` members.
    Distributed,
}

/// When locks are taken for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockingMode {
    /// Locks are only taken at prepare time, in canonical key order.
    Optimistic,
    /// Locks are taken on the primary owner the first time a write touches a key.
    Pessimistic,
}

/// Configuration of one cache instance on one node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GridConfig {
    pub node_id: NodeId,
    pub cache_mode: CacheMode,
    pub num_owners: usize,
    pub num_segments: usize,
    pub isolation: TransactionIsolation,
    pub locking_mode: LockingMode,
    pub write_skew_check: bool,
    pub lock_acquisition_timeout: Duration,
    /// Number of lock stripes keys are hashed onto.
    pub lock_concurrency_level: usize,
    /// Locks held for longer than this are reclaimed by the next contender.
    pub lock_lease: Option<Duration>,
    pub remote_timeout: Duration,
    pub sync_commit_phase: bool,
    pub stale_topology_retries: usize,
    /// How many completed remote transaction ids are remembered to reject replays.
    pub completed_tx_history: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            cache_mode: CacheMode::Local,
            num_owners: 2,
            num_segments: 256,
            isolation: TransactionIsolation::RepeatableRead,
            locking_mode: LockingMode::Optimistic,
            write_skew_check: true,
            lock_acquisition_timeout: Duration::from_secs(10),
            lock_concurrency_level: 32,
            lock_lease: None,
            remote_timeout: Duration::from_secs(15),
            sync_commit_phase: true,
            stale_topology_retries: 3,
            completed_tx_history: 1024,
        }
    }
}

impl GridConfig {
    pub fn local(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    pub fn distributed(node_id: NodeId, num_owners: usize) -> Self {
        Self {
            node_id,
            cache_mode: CacheMode::Distributed,
            num_owners,
            ..Default::default()
        }
    }

    pub fn replicated(node_id: NodeId) -> Self {
        Self {
            node_id,
            cache_mode: CacheMode::Replicated,
            ..Default::default()
        }
    }

    pub fn with_isolation(mut self, isolation: TransactionIsolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_locking_mode(mut self, locking_mode: LockingMode) -> Self {
        self.locking_mode = locking_mode;
        self
    }

    pub fn with_write_skew_check(mut self, enabled: bool) -> Self {
        self.write_skew_check = enabled;
        self
    }

    pub fn with_num_segments(mut self, num_segments: usize) -> Self {
        self.num_segments = num_segments;
        self
    }

    pub fn with_lock_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquisition_timeout = timeout;
        self
    }

    pub fn with_lock_concurrency_level(mut self, stripes: usize) -> Self {
        self.lock_concurrency_level = stripes;
        self
    }

    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = Some(lease);
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn with_sync_commit_phase(mut self, sync: bool) -> Self {
        self.sync_commit_phase = sync;
        self
    }

    /// Write-skew detection only runs under repeatable read.
    pub fn write_skew_enabled(&self) -> bool {
        self.write_skew_check && self.isolation.is_repeatable()
    }

    pub fn is_clustered(&self) -> bool {
        self.cache_mode != CacheMode::Local
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_segments == 0 {
            return Err(MnemosyneError::Config(
                "num_segments must be greater than 0".to_string(),
            ));
        }
        if self.cache_mode == CacheMode::Distributed && self.num_owners == 0 {
            return Err(MnemosyneError::Config(
                "num_owners must be greater than 0".to_string(),
            ));
        }
        if self.lock_concurrency_level == 0 {
            return Err(MnemosyneError::Config(
                "lock_concurrency_level must be greater than 0".to_string(),
            ));
        }
        if let Some(lease) = self.lock_lease {
            if lease < self.lock_acquisition_timeout {
                return Err(MnemosyneError::Config(format!(
                    "lock_lease ({:?}) must not be shorter than lock_acquisition_timeout ({:?})",
                    lease, self.lock_acquisition_timeout
                )));
            }
        }
        Ok(())
    }
}
