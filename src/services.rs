use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use crate::commands::interceptor::{InterceptorChain, StatisticsInterceptor};
use crate::commands::remote::{ReplicableCommand, Response};
use crate::commands::{CommandReturn, WriteCommand};
use crate::config::{CacheMode, GridConfig};
use crate::conflict::detection::WriteSkewDetector;
use crate::context::invocation_context::InvocationContext;
use crate::context::versioned_entry::{VersionSeen, VersionedEntry};
use crate::data_store::data_container::DataContainer;
use crate::data_store::versioned_value::{EntryVersion, VersionGenerator, VersionedValue, now_millis};
use crate::distributed::consistent_hash::{CacheTopology, DistributionManager};
use crate::distributed::membership::ViewListener;
use crate::distributed::response::{FirstResponseCollector, MapResponseCollector};
use crate::distributed::transport::{InboundHandler, Recipients, RpcOptions, Transport};
use crate::distributed::{GlobalTransactionId, View};
use crate::errors::{FailureKind, MnemosyneError, Result};
use crate::lock::lock_manager::{LockManager, LockOwner};
use crate::stats::CacheStats;
use crate::storage::{Store, StoreMutation};
use crate::twopc::{RemoteTxState, TransactionTable, TwoPhaseCommitParticipant};
use crate::{Key, NodeId};

/// The components of one cache instance on one node.
///
/// Built once per cache and shared by reference (`Arc`) between the facade,
/// the transactions it starts and the transport's inbound handler. Nothing in
/// here is process-global: two caches in the same process are independent.
pub struct CacheServices {
    config: GridConfig,
    container: DataContainer,
    store: Option<Arc<dyn Store>>,
    locks: LockManager,
    versions: VersionGenerator,
    detector: WriteSkewDetector,
    interceptors: InterceptorChain,
    stats: Arc<CacheStats>,
    distribution: DistributionManager,
    transport: OnceLock<Arc<dyn Transport>>,
    remote_transactions: TransactionTable,
    tx_counter: AtomicU64,
    invocation_counter: AtomicU64,
    running: AtomicBool,
}

impl CacheServices {
    /// Creates the services of a cache starting out in `view`.
    ///
    /// # Errors
    ///
    /// Fails if `config` does not validate.
    pub fn new(config: GridConfig, store: Option<Arc<dyn Store>>, view: &View) -> Result<Arc<Self>> {
        config.validate()?;
        let num_owners = match config.cache_mode {
            CacheMode::Local => 1,
            CacheMode::Replicated => usize::MAX,
            CacheMode::Distributed => config.num_owners,
        };
        let stats = Arc::new(CacheStats::new());
        let interceptors = InterceptorChain::new();
        interceptors.add(Arc::new(StatisticsInterceptor::new(Arc::clone(&stats))));

        Ok(Arc::new(Self {
            container: DataContainer::new(),
            store,
            locks: LockManager::new(config.lock_concurrency_level, config.lock_lease),
            versions: VersionGenerator::new(),
            detector: WriteSkewDetector::new(),
            interceptors,
            stats,
            distribution: DistributionManager::new(config.node_id, view, num_owners, config.num_segments),
            transport: OnceLock::new(),
            remote_transactions: TransactionTable::new(config.completed_tx_history),
            tx_counter: AtomicU64::new(0),
            invocation_counter: AtomicU64::new(0),
            running: AtomicBool::new(true),
            config,
        }))
    }

    /// Attaches the transport used to reach the other members.
    pub fn bind_transport(&self, transport: Arc<dyn Transport>) -> Result<()> {
        self.transport
            .set(transport)
            .map_err(|_| MnemosyneError::Config("transport already bound".to_string()))
    }

    pub fn node(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn container(&self) -> &DataContainer {
        &self.container
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    pub fn interceptors(&self) -> &InterceptorChain {
        &self.interceptors
    }

    pub fn distribution(&self) -> &DistributionManager {
        &self.distribution
    }

    pub fn remote_transactions(&self) -> &TransactionTable {
        &self.remote_transactions
    }

    pub fn transport(&self) -> Option<&Arc<dyn Transport>> {
        self.transport.get()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn topology(&self) -> Arc<CacheTopology> {
        self.distribution.topology()
    }

    pub fn next_transaction_id(&self) -> GlobalTransactionId {
        GlobalTransactionId::new(self.node(), self.tx_counter.fetch_add(1, Ordering::Relaxed))
    }

    pub fn rpc_options(&self) -> RpcOptions {
        RpcOptions::unordered(self.config.remote_timeout)
    }

    fn require_transport(&self) -> Result<&Arc<dyn Transport>> {
        self.transport.get().ok_or_else(|| {
            MnemosyneError::Config(format!("node {} has no transport bound", self.node()))
        })
    }

    /// Sleeps before retrying an operation refused for a stale topology.
    pub(crate) fn stale_topology_backoff(&self, attempt: usize) {
        thread::sleep(Duration::from_millis(10 * attempt as u64));
    }

    /// Runs `op` against the current topology, retrying retryable failures
    /// with a refreshed topology up to `stale_topology_retries` times.
    fn with_topology_retry<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(&CacheTopology) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            let topology = self.topology();
            match op(&topology) {
                Err(err) if err.is_retryable() && attempt < self.config.stale_topology_retries => {
                    attempt += 1;
                    debug!(
                        "Node {} retrying under a fresh topology (attempt {}): {}",
                        self.node(),
                        attempt,
                        err
                    );
                    self.stale_topology_backoff(attempt);
                }
                result => return result,
            }
        }
    }

    /// Committed entry of `key` as held by this node: container first, then
    /// the store. Expired entries read as absent.
    pub fn load_local(&self, key: &Key) -> Result<Option<VersionedValue>> {
        if let Some(value) = self.container.get(key) {
            return Ok(Some(value));
        }
        match &self.store {
            Some(store) => {
                let now = now_millis();
                Ok(store.load(key)?.filter(|value| !value.is_expired(now)))
            }
            None => Ok(None),
        }
    }

    /// Committed entry of `key`, fetched from its owners when this node is
    /// not one of them.
    pub fn read_committed(&self, key: &Key) -> Result<Option<VersionedValue>> {
        self.with_topology_retry(|topology| {
            let owners = topology.hash.owners(key);
            if owners.is_empty() || owners.contains(&self.node()) {
                return self.load_local(key);
            }
            let transport = self.require_transport()?;
            let command = ReplicableCommand::ClusteredGet {
                key: key.clone(),
                topology_id: topology.topology_id,
            };
            let responses = transport.invoke_sync(
                Recipients::Set(owners.to_vec()),
                command,
                self.rpc_options(),
                Box::new(FirstResponseCollector::new()),
            )?;
            Ok(responses
                .into_values()
                .find_map(|response| match response {
                    Response::Successful(CommandReturn::Entry(entry)) => entry,
                    _ => None,
                }))
        })
    }

    /// Installs the topology of the first other member of `view` that answers.
    ///
    /// Members that were already running have rehashed stickily since the
    /// first view, so a joiner must route with their hash rather than with one
    /// computed from `view` alone. When no member answers (the whole cluster is
    /// starting) the locally computed hash is kept.
    pub fn fetch_topology(&self, view: &View) -> Result<bool> {
        let transport = self.require_transport()?;
        for member in view.members.iter().copied().filter(|m| *m != self.node()) {
            let responses = transport.invoke_sync(
                Recipients::One(member),
                ReplicableCommand::GetTopology { topology_id: view.id },
                self.rpc_options(),
                Box::new(MapResponseCollector::new(false)),
            );
            match responses {
                Ok(mut responses) => {
                    if let Some(Response::Successful(CommandReturn::Topology(topology))) =
                        responses.remove(&member)
                    {
                        return Ok(self.distribution.adopt(topology));
                    }
                }
                Err(err) => trace!("Node {} got no topology from {}: {}", self.node(), member, err),
            }
        }
        Ok(false)
    }

    /// Loads every live entry this node owns from the store into the container.
    pub fn preload(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let topology = self.topology();
        let now = now_millis();
        let mut loaded = 0;
        for (key, value) in store.load_all()? {
            self.versions.observe(value.version());
            if value.is_expired(now) || !topology.hash.is_owner(&key, self.node()) {
                continue;
            }
            self.container.insert(key, value);
            loaded += 1;
        }
        debug!("Node {} preloaded {} entries", self.node(), loaded);
        Ok(loaded)
    }

    /// Locks the changed keys this node owns, then validates and versions the
    /// ones it is primary owner of.
    ///
    /// # Arguments
    ///
    /// * `gtx` - The transaction the locks are taken for.
    /// * `owned` - Changed keys this node owns.
    /// * `primary` - The subset of `owned` this node is primary owner of.
    /// * `seen` - What the transaction observed for each changed key.
    /// * `write_skew_check` - Whether stale reads abort the transaction.
    ///
    /// # Returns
    ///
    /// The new version of every key in `primary`.
    ///
    /// # Errors
    ///
    /// `LockTimeout` or `WriteSkew`. Locks acquired before the failure stay
    /// held; the caller releases them when it rolls back.
    pub(crate) fn lock_and_validate(
        &self,
        gtx: GlobalTransactionId,
        owned: &[Key],
        primary: &[Key],
        seen: &[(Key, VersionSeen)],
        write_skew_check: bool,
    ) -> Result<Vec<(Key, EntryVersion)>> {
        let owner = LockOwner::Transaction(gtx);
        self.locks
            .acquire_all(owned, owner, self.config.lock_acquisition_timeout)?;

        if write_skew_check {
            let primary_keys: HashSet<&Key> = primary.iter().collect();
            let checked: Vec<(Key, VersionSeen)> = seen
                .iter()
                .filter(|(key, _)| primary_keys.contains(key))
                .cloned()
                .collect();
            self.detector.check_all(&checked, |key| {
                Ok(self.load_local(key)?.map(|value| value.version()))
            })?;
        }

        primary
            .iter()
            .map(|key| {
                let current = self.load_local(key)?.map(|value| value.version());
                Ok((key.clone(), self.versions.next_after(current)))
            })
            .collect()
    }

    /// The committed form of the changed entries of `ctx` among `keys`, using
    /// the versions chosen by their primaries. `None` marks a removal.
    pub(crate) fn committed_changes(
        &self,
        ctx: &InvocationContext,
        keys: &[Key],
        versions: &[(Key, EntryVersion)],
    ) -> Result<Vec<(Key, Option<VersionedValue>)>> {
        let assigned: HashMap<Key, EntryVersion> = versions.iter().cloned().collect();
        let mut changes = Vec::new();
        for key in keys {
            let Some(entry) = ctx.lookup_entry(key) else {
                continue;
            };
            if !entry.is_changed() {
                continue;
            }
            let version = match assigned.get(key) {
                Some(version) => *version,
                None => {
                    let current = self.load_local(key)?.map(|value| value.version());
                    self.versions.next_after(current)
                }
            };
            self.versions.observe(version);
            changes.push((key.clone(), entry.to_committed(version)));
        }
        Ok(changes)
    }

    fn write_through(&self, changes: &[(Key, Option<VersionedValue>)]) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mutations = changes
            .iter()
            .map(|(key, value)| match value {
                Some(value) => StoreMutation::Write(key.clone(), value.clone()),
                None => StoreMutation::Delete(key.clone()),
            })
            .collect();
        store.apply_mutations(mutations)
    }

    fn install(&self, changes: Vec<(Key, Option<VersionedValue>)>) -> usize {
        let applied = changes.len();
        for (key, value) in changes {
            trace!("Node {} commits {:?} = {:?}", self.node(), key, value);
            match value {
                Some(value) => self.container.insert(key, value),
                None => {
                    self.container.remove(&key);
                }
            }
        }
        applied
    }

    /// Writes the changed entries of `ctx` for `keys` to the store, then to
    /// the container. If the store refuses them the container is untouched.
    ///
    /// The caller must hold the locks of `keys`.
    pub(crate) fn apply_entries(
        &self,
        ctx: &InvocationContext,
        keys: &[Key],
        versions: &[(Key, EntryVersion)],
    ) -> Result<usize> {
        let changes = self.committed_changes(ctx, keys, versions)?;
        self.write_through(&changes)?;
        Ok(self.install(changes))
    }

    /// Applies the changes of a transaction whose outcome is already decided.
    ///
    /// The container always takes the changes so the owners stay in step; a
    /// store failure is logged and returned afterwards.
    fn apply_decided(
        &self,
        gtx: GlobalTransactionId,
        ctx: &InvocationContext,
        keys: &[Key],
        versions: &[(Key, EntryVersion)],
    ) -> Result<usize> {
        let changes = self.committed_changes(ctx, keys, versions)?;
        let stored = self.write_through(&changes);
        let applied = self.install(changes);
        if let Err(err) = &stored {
            error!(
                "Node {} applied {} in memory but its store refused the changes: {}",
                self.node(),
                gtx,
                err
            );
        }
        stored.map(|_| applied)
    }

    /// Asks `primary` to lock (or unlock) `keys` for `gtx`.
    pub(crate) fn remote_lock(
        &self,
        primary: NodeId,
        gtx: GlobalTransactionId,
        topology_id: u64,
        keys: Vec<Key>,
        unlock: bool,
    ) -> Result<()> {
        let transport = self.require_transport()?;
        let command = ReplicableCommand::LockControl {
            gtx,
            topology_id,
            keys,
            unlock,
        };
        transport.invoke_sync(
            Recipients::One(primary),
            command,
            self.rpc_options(),
            Box::new(MapResponseCollector::new(unlock)),
        )?;
        Ok(())
    }

    /// Best-effort removal of every entry this node holds.
    ///
    /// Keys locked by a transaction at the moment of the snapshot are skipped,
    /// and writes that land after the snapshot survive.
    pub fn clear_local(&self) -> Result<usize> {
        let owner = LockOwner::Invocation(self.invocation_counter.fetch_add(1, Ordering::Relaxed));
        let mut keys = self.container.keys();
        if let Some(store) = &self.store {
            keys.extend(store.load_all()?.into_iter().map(|(key, _)| key));
        }

        let mut ctx = InvocationContext::new_local(None);
        for key in keys {
            if ctx.contains_entry(&key) {
                continue;
            }
            let committed = self.load_local(&key)?;
            ctx.put_entry_if_absent(VersionedEntry::from_read(key, committed));
        }
        WriteCommand::Clear.perform(&mut ctx)?;

        let mut cleared = Vec::new();
        for entry in ctx.changed_entries() {
            if self.locks.try_acquire(entry.key(), owner) {
                cleared.push(entry.key().clone());
            } else {
                debug!("Clear on node {} skipped locked key {:?}", self.node(), entry.key());
            }
        }
        let result = self.apply_entries(&ctx, &cleared, &[]);
        self.locks.release_all(&cleared, owner);
        result
    }

    /// Clears this node, then every other member of the current view.
    pub fn clear_cluster(&self) -> Result<()> {
        let cleared = self.clear_local()?;
        debug!("Node {} cleared {} local entries", self.node(), cleared);
        let Some(transport) = self.transport.get() else {
            return Ok(());
        };
        self.with_topology_retry(|topology| {
            transport.invoke_sync(
                Recipients::All,
                ReplicableCommand::Clear {
                    topology_id: topology.topology_id,
                },
                self.rpc_options(),
                Box::new(MapResponseCollector::new(true)),
            )?;
            Ok(())
        })
    }

    /// Drops expired entries from the container and the store.
    pub fn purge_expired(&self) -> Result<usize> {
        let mut purged = self.container.purge_expired().len();
        if let Some(store) = &self.store {
            purged += store.purge_expired(now_millis())?;
        }
        Ok(purged)
    }

    /// Stops serving remote commands and leaves the network.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("Stopping cache on node {}", self.node());
            if let Some(transport) = self.transport.get() {
                transport.stop();
            }
        }
    }
}

impl TwoPhaseCommitParticipant for CacheServices {
    fn lock_keys(
        &self,
        origin: NodeId,
        gtx: GlobalTransactionId,
        keys: Vec<Key>,
        unlock: bool,
    ) -> Result<CommandReturn> {
        let owner = LockOwner::Transaction(gtx);
        if unlock {
            self.locks.release_all(&keys, owner);
            return Ok(CommandReturn::None);
        }
        if self.remote_transactions.is_completed(&gtx) {
            return Err(MnemosyneError::InvalidTransactionState {
                id: gtx.to_string(),
                state: "completed".to_string(),
            });
        }
        self.locks
            .acquire_all(&keys, owner, self.config.lock_acquisition_timeout)?;
        if !self.remote_transactions.register_locking(gtx, origin) {
            self.locks.release_owned_by(owner);
            return Err(MnemosyneError::InvalidTransactionState {
                id: gtx.to_string(),
                state: "completed".to_string(),
            });
        }
        Ok(CommandReturn::None)
    }

    fn prepare(
        &self,
        origin: NodeId,
        gtx: GlobalTransactionId,
        modifications: Vec<WriteCommand>,
        versions_seen: Vec<(Key, VersionSeen)>,
        write_skew_check: bool,
        lock_keys: Vec<Key>,
    ) -> Result<CommandReturn> {
        if self.remote_transactions.is_completed(&gtx) {
            debug!("Node {} refuses duplicate prepare of {}", self.node(), gtx);
            return Err(MnemosyneError::InvalidTransactionState {
                id: gtx.to_string(),
                state: "completed".to_string(),
            });
        }
        let owner = LockOwner::Transaction(gtx);
        let topology = self.topology();
        let mut ctx = InvocationContext::new_remote(origin, Some(gtx));
        for command in &modifications {
            command.perform(&mut ctx)?;
        }

        let changed: Vec<Key> = ctx
            .changed_entries()
            .into_iter()
            .map(|entry| entry.key().clone())
            .collect();
        let owned: Vec<Key> = changed
            .into_iter()
            .filter(|key| topology.hash.is_owner(key, self.node()))
            .collect();
        let locked: Vec<Key> = lock_keys
            .into_iter()
            .filter(|key| topology.hash.is_owner(key, self.node()))
            .collect();
        let primary: Vec<Key> = locked
            .iter()
            .filter(|key| topology.hash.is_primary(key, self.node()))
            .cloned()
            .collect();

        let versions =
            match self.lock_and_validate(gtx, &locked, &primary, &versions_seen, write_skew_check) {
                Ok(versions) => versions,
                Err(err) => {
                    self.locks.release_owned_by(owner);
                    return Err(err);
                }
            };
        for key in owned.iter().filter(|key| self.locks.is_held_by(key, owner)) {
            ctx.add_locked_key(key.clone());
        }

        if !self
            .remote_transactions
            .register_prepared(gtx, origin, ctx, owned)
        {
            self.locks.release_owned_by(owner);
            return Err(MnemosyneError::InvalidTransactionState {
                id: gtx.to_string(),
                state: "completed".to_string(),
            });
        }
        trace!("Node {} prepared {} from {}", self.node(), gtx, origin);
        Ok(CommandReturn::Versions(versions))
    }

    fn commit(&self, gtx: GlobalTransactionId, versions: Vec<(Key, EntryVersion)>) -> Result<CommandReturn> {
        let owner = LockOwner::Transaction(gtx);
        let Some(tx) = self.remote_transactions.complete(gtx) else {
            trace!("Node {} ignores commit of unknown {}", self.node(), gtx);
            return Ok(CommandReturn::None);
        };
        let result = match &tx.state {
            RemoteTxState::Prepared { ctx, owned_keys } => {
                self.apply_decided(gtx, ctx, owned_keys, &versions).map(|_| ())
            }
            RemoteTxState::Locking => Ok(()),
        };
        self.locks.release_owned_by(owner);
        trace!("Node {} committed {}", self.node(), gtx);
        result.map(|_| CommandReturn::None)
    }

    fn rollback(&self, gtx: GlobalTransactionId) -> Result<CommandReturn> {
        self.remote_transactions.complete(gtx);
        let released = self.locks.release_owned_by(LockOwner::Transaction(gtx));
        trace!("Node {} rolled back {} ({} locks)", self.node(), gtx, released);
        Ok(CommandReturn::None)
    }
}

impl InboundHandler for CacheServices {
    fn handle(&self, origin: NodeId, command: ReplicableCommand) -> Response {
        if !self.is_running() {
            return Response::Exception(FailureKind::Other(format!(
                "node {} is stopping",
                self.node()
            )));
        }
        let current = self.distribution.topology_id();
        if command.requires_topology_match() && command.topology_id() != current {
            debug!(
                "Node {} refuses {} from {}: topology {} != {}",
                self.node(),
                command.name(),
                origin,
                command.topology_id(),
                current
            );
            return Response::Exception(FailureKind::StaleTopology {
                expected: current,
                actual: command.topology_id(),
            });
        }

        let gtx = command.transaction_id();
        let name = command.name();
        let result = match command {
            ReplicableCommand::ClusteredGet { key, .. } => {
                self.load_local(&key).map(CommandReturn::Entry)
            }
            ReplicableCommand::LockControl {
                gtx, keys, unlock, ..
            } => self.lock_keys(origin, gtx, keys, unlock),
            ReplicableCommand::Prepare {
                gtx,
                modifications,
                versions_seen,
                write_skew_check,
                lock_keys,
                ..
            } => self.prepare(
                origin,
                gtx,
                modifications,
                versions_seen,
                write_skew_check,
                lock_keys,
            ),
            ReplicableCommand::Commit { gtx, versions, .. } => self.commit(gtx, versions),
            ReplicableCommand::Rollback { gtx, .. } => self.rollback(gtx),
            ReplicableCommand::Clear { .. } => self.clear_local().map(|_| CommandReturn::None),
            ReplicableCommand::GetTopology { .. } => {
                Ok(CommandReturn::Topology(self.topology().as_ref().clone()))
            }
        };
        if let Err(err) = &result {
            match gtx {
                Some(gtx) => debug!(
                    "Node {} failed {} of {} from {}: {}",
                    self.node(),
                    name,
                    gtx,
                    origin,
                    err
                ),
                None => debug!("Node {} failed {} from {}: {}", self.node(), name, origin, err),
            }
        }
        Response::from_result(result)
    }
}

impl ViewListener for CacheServices {
    fn view_changed(&self, previous: &View, new_view: &View) {
        self.distribution.on_view_change(new_view);
        if let Some(transport) = self.transport.get() {
            transport.on_view_change(new_view);
        }
        let leavers = new_view.leavers_since(previous);
        if !leavers.is_empty() {
            info!("Node {} saw members {:?} leave", self.node(), leavers);
        }
        for gtx in self.remote_transactions.remove_orphans(new_view) {
            let released = self.locks.release_owned_by(LockOwner::Transaction(gtx));
            warn!(
                "Node {} rolled back orphaned {} and released {} locks",
                self.node(),
                gtx,
                released
            );
        }
    }
}
