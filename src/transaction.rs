use ahash::AHashSet as HashSet;
use log::{debug, error, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::commands::remote::{ReplicableCommand, Response};
use crate::commands::{CommandOutcome, CommandReturn, WriteCommand};
use crate::config::LockingMode;
use crate::context::invocation_context::InvocationContext;
use crate::context::versioned_entry::{VersionSeen, VersionedEntry};
use crate::data_store::versioned_value::{EntryVersion, Metadata};
use crate::distributed::GlobalTransactionId;
use crate::distributed::consistent_hash::CacheTopology;
use crate::distributed::invocation::PendingInvocation;
use crate::distributed::response::{MapResponseCollector, Responses};
use crate::distributed::transport::Recipients;
use crate::errors::{MnemosyneError, Result};
use crate::lock::lock_manager::LockOwner;
use crate::services::CacheServices;
use crate::{Key, NodeId, TransactionIsolation, Value};

/// Lifecycle of a transaction on its coordinating node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Preparing,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::RolledBack)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Active => "active",
            TransactionState::Preparing => "preparing",
            TransactionState::Committing => "committing",
            TransactionState::Committed => "committed",
            TransactionState::RollingBack => "rolling back",
            TransactionState::RolledBack => "rolled back",
        };
        f.write_str(name)
    }
}

/// A transaction coordinated by this node.
///
/// Commands run against the transaction's private [`InvocationContext`] while
/// it is active. [`Transaction::commit`] drives the two-phase protocol over
/// every owner of the changed keys; [`Transaction::rollback`] (or dropping an
/// active transaction) discards the changes and releases every lock taken on
/// its behalf, locally and remotely.
pub struct Transaction {
    gtx: GlobalTransactionId,
    state: TransactionState,
    isolation: TransactionIsolation,
    locking_mode: LockingMode,
    ctx: InvocationContext,
    services: Arc<CacheServices>,
    /// Remote members that may hold locks or prepared state for this transaction.
    participants: HashSet<NodeId>,
}

impl Transaction {
    /// Creates a new transaction.
    ///
    /// This is typically called internally by [`crate::Mnemosyne::begin`].
    /// Isolation and locking mode are taken from the cache configuration.
    pub fn new(services: Arc<CacheServices>) -> Self {
        let gtx = services.next_transaction_id();
        let isolation = services.config().isolation;
        let locking_mode = services.config().locking_mode;
        debug!("Beginning {} on node {}", gtx, services.node());
        Self {
            gtx,
            state: TransactionState::Active,
            isolation,
            locking_mode,
            ctx: InvocationContext::new_local(Some(gtx)),
            services,
            participants: HashSet::new(),
        }
    }

    /// Returns the cluster-wide identifier of the transaction.
    ///
    /// The identifier changes if a commit has to be retried after a topology
    /// change.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use mnemosyne::prelude::*;
    ///
    /// let cache = Mnemosyne::local(GridConfig::local(1), None).unwrap();
    /// let tx = cache.begin();
    /// println!("Transaction ID: {}", tx.id());
    /// ```
    pub fn id(&self) -> GlobalTransactionId {
        self.gtx
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn isolation(&self) -> TransactionIsolation {
        self.isolation
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// The transaction's private scope.
    pub fn context(&self) -> &InvocationContext {
        &self.ctx
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(MnemosyneError::InvalidTransactionState {
                id: self.gtx.to_string(),
                state: self.state.to_string(),
            })
        }
    }

    /// Records `err` and rolls the transaction back if the failure requires it.
    fn fail(&mut self, err: MnemosyneError) -> MnemosyneError {
        match &err {
            MnemosyneError::WriteSkew { .. } => self.services.stats().record_write_skew(),
            MnemosyneError::LockTimeout { .. } => self.services.stats().record_lock_timeout(),
            _ => {}
        }
        if err.is_rollback_class() {
            debug!("{} aborted: {}", self.gtx, err);
            self.rollback_internal();
        }
        err
    }

    /// Reads the value associated with a key.
    ///
    /// Under `RepeatableRead` the first read wraps the key into the context
    /// and records the version observed; later reads return the wrapped value.
    /// Under `ReadCommitted` only the transaction's own writes are served from
    /// the context.
    ///
    /// # Arguments
    ///
    /// * `key` - The key to read.
    ///
    /// # Returns
    ///
    /// The current value, or `None` if the key is absent or was removed.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use mnemosyne::prelude::*;
    ///
    /// let cache = Mnemosyne::local(GridConfig::local(1), None).unwrap();
    /// let mut tx = cache.begin();
    /// tx.put("k", "v").unwrap();
    /// assert_eq!(tx.get("k").unwrap(), Some(bytes::Bytes::from("v")));
    /// tx.commit().unwrap();
    /// ```
    pub fn get(&mut self, key: impl Into<Key>) -> Result<Option<Value>> {
        self.ensure_active()?;
        let key = key.into();
        if let Some(entry) = self.ctx.lookup_entry(&key) {
            let snapshot = self.isolation.is_repeatable() && entry.version_seen().is_read();
            if snapshot || entry.is_changed() {
                let value = entry.value().cloned();
                self.services.interceptors().notify_read(&key, value.is_some());
                return Ok(value);
            }
        }

        let committed = match self.services.read_committed(&key) {
            Ok(committed) => committed,
            Err(err) => return Err(self.fail(err)),
        };
        let value = committed.as_ref().map(|c| c.data().clone());
        if self.isolation.is_repeatable() {
            match self.ctx.lookup_entry_mut(&key) {
                Some(entry) => entry.record_read(committed.as_ref()),
                None => {
                    self.ctx
                        .put_entry_if_absent(VersionedEntry::from_read(key.clone(), committed));
                }
            }
        }
        self.services.interceptors().notify_read(&key, value.is_some());
        Ok(value)
    }

    /// Performs a write command inside the transaction.
    ///
    /// Under pessimistic locking the primary owner's lock of every key the
    /// command writes is taken first. Keys are then wrapped into the context
    /// (reading them unless the command ignores the previous value) and the
    /// command is performed through the interceptor chain.
    ///
    /// # Errors
    ///
    /// Rollback-class failures (such as `LockTimeout`) roll the transaction
    /// back before being returned; the transaction accepts no further
    /// operations afterwards.
    pub fn execute(&mut self, command: WriteCommand) -> Result<CommandOutcome> {
        self.ensure_active()?;
        let keys = command.keys();
        if self.locking_mode == LockingMode::Pessimistic && !keys.is_empty() {
            if let Err(err) = self.lock_on_touch(&keys) {
                return Err(self.fail(err));
            }
        }
        let reads = command.reads_previous_value();
        for key in &keys {
            if let Err(err) = self.wrap_for_write(key, reads) {
                return Err(self.fail(err));
            }
        }
        match self.services.interceptors().invoke(&mut self.ctx, command) {
            Ok(outcome) => Ok(outcome),
            Err(err) => Err(self.fail(err)),
        }
    }

    fn wrap_for_write(&mut self, key: &Key, reads: bool) -> Result<()> {
        if let Some(entry) = self.ctx.lookup_entry(key) {
            // A blind entry that was never written still needs the committed value.
            if reads && !entry.version_seen().is_read() && !entry.is_changed() {
                let committed = self.services.read_committed(key)?;
                if let Some(entry) = self.ctx.lookup_entry_mut(key) {
                    entry.record_read(committed.as_ref());
                }
            }
            return Ok(());
        }
        let entry = if reads {
            VersionedEntry::from_read(key.clone(), self.services.read_committed(key)?)
        } else {
            VersionedEntry::blind(key.clone())
        };
        self.ctx.put_entry_if_absent(entry);
        Ok(())
    }

    /// Takes the primary owners' locks of `keys` not locked yet.
    fn lock_on_touch(&mut self, keys: &[Key]) -> Result<()> {
        let topology = self.services.topology();
        let local = self.services.node();
        let owner = LockOwner::Transaction(self.gtx);
        let timeout = self.services.config().lock_acquisition_timeout;

        let mut by_primary: Vec<(NodeId, Vec<Key>)> =
            topology.keys_by_primary(keys).into_iter().collect();
        by_primary.sort_by_key(|(primary, _)| *primary);
        for (primary, keys) in by_primary {
            let pending: Vec<Key> = keys
                .into_iter()
                .filter(|key| !self.ctx.has_locked_key(key))
                .collect();
            if pending.is_empty() {
                continue;
            }
            if primary == local {
                self.services
                    .lock_manager()
                    .acquire_all(&pending, owner, timeout)?;
            } else {
                self.participants.insert(primary);
                self.services.remote_lock(
                    primary,
                    self.gtx,
                    topology.topology_id,
                    pending.clone(),
                    false,
                )?;
            }
            for key in pending {
                self.ctx.add_locked_key(key);
            }
        }
        Ok(())
    }

    fn put_with_metadata(&mut self, key: Key, value: Value, metadata: Metadata) -> Result<Option<Value>> {
        let outcome = self.execute(WriteCommand::put(key, value, metadata))?;
        Ok(outcome.value.into_value())
    }

    /// Associates `value` with `key`, returning the previous value.
    pub fn put(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> Result<Option<Value>> {
        self.put_with_metadata(key.into(), value.into(), Metadata::default())
    }

    /// Like [`Transaction::put`], but the entry expires after `lifespan`.
    pub fn put_with_lifespan(
        &mut self,
        key: impl Into<Key>,
        value: impl Into<Value>,
        lifespan: Duration,
    ) -> Result<Option<Value>> {
        self.put_with_metadata(key.into(), value.into(), Metadata::with_lifespan(Some(lifespan)))
    }

    /// Writes `value` without reading the previous one.
    ///
    /// The write is exempt from write-skew checks.
    pub fn put_blind(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        self.execute(WriteCommand::blind_put(key.into(), value.into(), Metadata::default()))?;
        Ok(())
    }

    /// Stores `value` only if `key` has no value.
    ///
    /// # Returns
    ///
    /// `None` if the value was stored, otherwise the existing value.
    pub fn put_if_absent(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> Result<Option<Value>> {
        let outcome = self.execute(WriteCommand::put_if_absent(
            key.into(),
            value.into(),
            Metadata::default(),
        ))?;
        Ok(outcome.value.into_value())
    }

    pub fn put_all<K, V>(&mut self, entries: impl IntoIterator<Item = (K, V)>) -> Result<()>
    where
        K: Into<Key>,
        V: Into<Value>,
    {
        let entries = entries
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self.execute(WriteCommand::put_all(entries, Metadata::default()))?;
        Ok(())
    }

    /// Removes `key`, returning the value it had.
    pub fn remove(&mut self, key: impl Into<Key>) -> Result<Option<Value>> {
        let outcome = self.execute(WriteCommand::remove(key.into()))?;
        Ok(outcome.value.into_value())
    }

    /// Removes `key` only if its current value equals `expected`.
    pub fn remove_if(&mut self, key: impl Into<Key>, expected: impl Into<Value>) -> Result<bool> {
        let outcome = self.execute(WriteCommand::remove_if(key.into(), expected.into()))?;
        Ok(outcome.value.into_bool())
    }

    /// Replaces the value of `key` only if it has one, returning the previous value.
    pub fn replace(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> Result<Option<Value>> {
        let outcome = self.execute(WriteCommand::replace(key.into(), value.into(), Metadata::default()))?;
        Ok(outcome.value.into_value())
    }

    /// Replaces the value of `key` only if it currently equals `expected`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use mnemosyne::prelude::*;
    ///
    /// let cache = Mnemosyne::local(GridConfig::local(1), None).unwrap();
    /// cache.put("k", "v1").unwrap();
    ///
    /// let mut tx = cache.begin();
    /// assert!(!tx.replace_if("k", "v2", "v3").unwrap());
    /// assert!(tx.replace_if("k", "v1", "v3").unwrap());
    /// tx.commit().unwrap();
    /// ```
    pub fn replace_if(
        &mut self,
        key: impl Into<Key>,
        expected: impl Into<Value>,
        value: impl Into<Value>,
    ) -> Result<bool> {
        let outcome = self.execute(WriteCommand::replace_if(
            key.into(),
            expected.into(),
            value.into(),
            Metadata::default(),
        ))?;
        Ok(outcome.value.into_bool())
    }

    /// Commits the transaction.
    ///
    /// Runs the prepare phase (locking, write-skew validation and version
    /// assignment on every owner of the changed keys) and, once every owner
    /// voted yes, the commit phase. A prepare refused because the topology
    /// changed is retried under a fresh transaction id.
    ///
    /// # Errors
    ///
    /// Any failure of the prepare phase, typically `WriteSkew`, `LockTimeout`,
    /// `RemoteTimeout` or `StaleTopology`, or a `Store` failure while applying
    /// the changes on this node; the transaction is rolled back everywhere
    /// before the error is returned. Failures of remote owners in the commit
    /// phase are logged, not returned.
    pub fn commit(mut self) -> Result<()> {
        self.ensure_active()?;
        self.state = TransactionState::Preparing;

        if !self.ctx.has_modifications() {
            self.release_everything();
            self.finish_commit();
            return Ok(());
        }

        let retries = self.services.config().stale_topology_retries;
        let mut attempt = 0;
        let (topology, remote_targets, versions) = loop {
            let topology = self.services.topology();
            match self.prepare(&topology) {
                Ok((remote_targets, versions)) => break (topology, remote_targets, versions),
                Err(err) if Self::retry_prepare(&err) && attempt < retries => {
                    attempt += 1;
                    warn!("Prepare of {} failed ({}), retrying (attempt {})", self.gtx, err, attempt);
                    self.abort_attempt();
                    self.services.stale_topology_backoff(attempt);
                }
                Err(err) => {
                    let err = self.fail(err);
                    self.rollback_internal();
                    return Err(err);
                }
            }
        };

        self.state = TransactionState::Committing;
        if let Err(err) = self.commit_phase(&topology, remote_targets, versions) {
            let err = self.fail(err);
            self.rollback_internal();
            return Err(err);
        }
        self.finish_commit();
        Ok(())
    }

    /// Failures that a new prepare attempt under a refreshed topology can fix.
    fn retry_prepare(err: &MnemosyneError) -> bool {
        matches!(
            err,
            MnemosyneError::StaleTopology { .. } | MnemosyneError::SuspectedLeaver { .. }
        )
    }

    /// Locks, validates and versions the changed keys on every owner.
    ///
    /// Primary owners are visited one at a time in node id order, each
    /// locking its keys in key order, so every coordinator in the cluster
    /// takes primary locks in the same global order. Two transactions that
    /// write a common key meet on its primary, where the later one waits and
    /// then fails the write-skew check. Backups lock only once every primary
    /// lock is held, so they can be prepared together.
    ///
    /// # Returns
    ///
    /// The remote owners that prepared and the versions assigned by all primaries.
    fn prepare(&mut self, topology: &CacheTopology) -> Result<(Vec<NodeId>, Vec<(Key, EntryVersion)>)> {
        let local = self.services.node();
        let changed: Vec<(Key, VersionSeen)> = self
            .ctx
            .changed_entries()
            .into_iter()
            .map(|entry| (entry.key().clone(), entry.version_seen()))
            .collect();
        let keys: Vec<&Key> = changed.iter().map(|(key, _)| key).collect();

        let mut by_primary: Vec<(NodeId, Vec<Key>)> =
            topology.keys_by_primary(keys.iter().copied()).into_iter().collect();
        by_primary.sort_by_key(|(primary, _)| *primary);
        let by_owner = topology.keys_by_owner(keys.iter().copied());
        let mut remote_targets: Vec<NodeId> =
            by_owner.keys().copied().filter(|owner| *owner != local).collect();
        remote_targets.sort_unstable();
        let mut by_backup: Vec<(NodeId, Vec<Key>)> = by_owner
            .into_iter()
            .map(|(owner, keys)| {
                let backups: Vec<Key> = keys
                    .into_iter()
                    .filter(|key| !topology.hash.is_primary(key, owner))
                    .collect();
                (owner, backups)
            })
            .filter(|(_, keys)| !keys.is_empty())
            .collect();
        by_backup.sort_by_key(|(backup, _)| *backup);

        let mut versions = Vec::new();
        for (primary, keys) in by_primary {
            if primary == local {
                versions.extend(self.prepare_locally(topology, &keys, &changed)?);
            } else {
                let pending = self.send_prepare(topology, primary, keys, &changed)?;
                versions.extend(Self::assigned_versions(pending.wait()?));
            }
        }

        let mut pending = Vec::new();
        for (backup, keys) in by_backup {
            if backup == local {
                self.prepare_locally(topology, &keys, &changed)?;
            } else {
                pending.push(self.send_prepare(topology, backup, keys, &changed)?);
            }
        }
        for invocation in pending {
            invocation.wait()?;
        }
        Ok((remote_targets, versions))
    }

    /// Locks `keys` on this node, validating and versioning the primary ones.
    fn prepare_locally(
        &mut self,
        topology: &CacheTopology,
        keys: &[Key],
        changed: &[(Key, VersionSeen)],
    ) -> Result<Vec<(Key, EntryVersion)>> {
        let local = self.services.node();
        let primary: Vec<Key> = keys
            .iter()
            .filter(|key| topology.hash.is_primary(key, local))
            .cloned()
            .collect();
        let versions = self.services.lock_and_validate(
            self.gtx,
            keys,
            &primary,
            changed,
            self.services.config().write_skew_enabled(),
        )?;
        for key in keys {
            self.ctx.add_locked_key(key.clone());
        }
        Ok(versions)
    }

    /// Sends the prepare that asks `target` to lock `keys`.
    fn send_prepare(
        &mut self,
        topology: &CacheTopology,
        target: NodeId,
        keys: Vec<Key>,
        changed: &[(Key, VersionSeen)],
    ) -> Result<PendingInvocation> {
        let transport = self.services.transport().cloned().ok_or_else(|| {
            MnemosyneError::Config(format!("node {} has no transport bound", self.services.node()))
        })?;
        self.participants.insert(target);
        let command = ReplicableCommand::Prepare {
            gtx: self.gtx,
            topology_id: topology.topology_id,
            modifications: self.ctx.modifications().to_vec(),
            versions_seen: changed.to_vec(),
            write_skew_check: self.services.config().write_skew_enabled(),
            lock_keys: keys,
        };
        debug!("{} preparing on {}", self.gtx, target);
        transport.invoke(
            Recipients::One(target),
            command,
            self.services.rpc_options(),
            Box::new(MapResponseCollector::new(false)),
        )
    }

    fn assigned_versions(responses: Responses) -> Vec<(Key, EntryVersion)> {
        responses
            .into_values()
            .flat_map(|response| match response {
                Response::Successful(CommandReturn::Versions(assigned)) => assigned,
                _ => Vec::new(),
            })
            .collect()
    }

    /// Applies the changes locally and tells the remote owners to commit.
    ///
    /// The local apply decides the outcome: if this node's store refuses the
    /// changes nothing was applied anywhere, the error is returned and the
    /// caller rolls back. Once it succeeded, failures of remote owners are
    /// only logged.
    fn commit_phase(
        &mut self,
        topology: &CacheTopology,
        remote_targets: Vec<NodeId>,
        versions: Vec<(Key, EntryVersion)>,
    ) -> Result<()> {
        let local = self.services.node();
        let owned: Vec<Key> = self
            .ctx
            .changed_entries()
            .into_iter()
            .map(|entry| entry.key().clone())
            .filter(|key| topology.hash.is_owner(key, local))
            .collect();
        if let Err(err) = self.services.apply_entries(&self.ctx, &owned, &versions) {
            error!("{} failed to apply its changes on node {}: {}", self.gtx, local, err);
            return Err(err);
        }

        let mut targets: Vec<NodeId> = remote_targets;
        targets.extend(self.participants.iter().copied());
        targets.sort_unstable();
        targets.dedup();
        if !targets.is_empty() {
            if let Some(transport) = self.services.transport().cloned() {
                let command = ReplicableCommand::Commit {
                    gtx: self.gtx,
                    topology_id: topology.topology_id,
                    versions,
                };
                let collector = Box::new(MapResponseCollector::new(true));
                let options = self.services.rpc_options();
                if self.services.config().sync_commit_phase {
                    if let Err(err) =
                        transport.invoke_sync(Recipients::Set(targets), command, options, collector)
                    {
                        warn!("Commit of {} failed on some owners: {}", self.gtx, err);
                    }
                } else if let Err(err) =
                    transport.invoke(Recipients::Set(targets), command, options, collector)
                {
                    warn!("Commit of {} could not be sent: {}", self.gtx, err);
                }
            }
        }

        self.services
            .lock_manager()
            .release_owned_by(LockOwner::Transaction(self.gtx));
        self.ctx.take_locked_keys();
        Ok(())
    }

    fn finish_commit(&mut self) {
        self.state = TransactionState::Committed;
        self.services.stats().record_commit();
        debug!("{} committed", self.gtx);
    }

    /// Undoes a failed prepare attempt and rebinds the transaction to a new id.
    fn abort_attempt(&mut self) {
        self.release_everything();
        self.participants.clear();
        self.gtx = self.services.next_transaction_id();
        self.ctx.set_transaction_id(Some(self.gtx));
    }

    /// Rolls back every remote participant and releases every local lock.
    fn release_everything(&mut self) {
        if !self.participants.is_empty() {
            if let Some(transport) = self.services.transport().cloned() {
                let mut targets: Vec<NodeId> = self.participants.iter().copied().collect();
                targets.sort_unstable();
                let command = ReplicableCommand::Rollback {
                    gtx: self.gtx,
                    topology_id: self.services.distribution().topology_id(),
                };
                if let Err(err) = transport.invoke_sync(
                    Recipients::Set(targets),
                    command,
                    self.services.rpc_options(),
                    Box::new(MapResponseCollector::new(true)),
                ) {
                    warn!("Rollback of {} failed on some members: {}", self.gtx, err);
                }
            }
        }
        self.services
            .lock_manager()
            .release_owned_by(LockOwner::Transaction(self.gtx));
        self.ctx.take_locked_keys();
    }

    fn rollback_internal(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = TransactionState::RollingBack;
        self.release_everything();
        self.ctx.clear();
        self.state = TransactionState::RolledBack;
        self.services.stats().record_rollback();
        debug!("{} rolled back", self.gtx);
    }

    /// Rolls back the transaction, discarding its changes.
    ///
    /// # Errors
    ///
    /// `InvalidTransactionState` if the transaction already completed.
    pub fn rollback(mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(MnemosyneError::InvalidTransactionState {
                id: self.gtx.to_string(),
                state: self.state.to_string(),
            });
        }
        self.rollback_internal();
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            debug!("{} dropped while {}, rolling back", self.gtx, self.state);
            self.rollback_internal();
        }
    }
}
