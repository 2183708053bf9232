use log::{debug, info};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::commands::interceptor::CommandInterceptor;
use crate::config::GridConfig;
use crate::distributed::View;
use crate::distributed::membership::{Membership, ViewListener};
use crate::distributed::network::InMemoryNetwork;
use crate::distributed::transport::{InboundHandler, Transport};
use crate::errors::{MnemosyneError, Result};
use crate::lock::lock_manager::LockManager;
use crate::services::CacheServices;
use crate::stats::StatsSnapshot;
use crate::storage::Store;
use crate::transaction::Transaction;
use crate::{Key, NodeId, Value};

/// Mnemosyne Prelude
pub mod prelude {
    pub use crate::commands::interceptor::*;
    pub use crate::distributed::membership::*;
    pub use crate::distributed::network::*;
    pub use crate::errors::*;
    pub use crate::storage::*;
    pub use crate::transaction::*;
    pub use crate::*;
}

/// One node's instance of a transactional cache.
///
/// Explicit transactions are started with [`Mnemosyne::begin`]. The
/// convenience operations (`put`, `remove`, `replace_if`, ...) each run as an
/// implicit transaction that commits before the call returns.
pub struct Mnemosyne {
    services: Arc<CacheServices>,
}

impl Mnemosyne {
    /// Creates a single-node cache.
    ///
    /// Entries of `store`, if given, are preloaded into memory.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use mnemosyne::prelude::*;
    ///
    /// let cache = Mnemosyne::local(GridConfig::local(1), None).unwrap();
    /// cache.put("greeting", "hello").unwrap();
    /// assert!(cache.get("greeting").unwrap().is_some());
    /// ```
    pub fn local(config: GridConfig, store: Option<Arc<dyn Store>>) -> Result<Self> {
        if config.is_clustered() {
            return Err(MnemosyneError::Config(format!(
                "{:?} caches need a membership and a transport",
                config.cache_mode
            )));
        }
        let view = View::new(0, vec![config.node_id]);
        let services = CacheServices::new(config, store, &view)?;
        services.preload()?;
        info!("Started local cache on node {}", services.node());
        Ok(Self { services })
    }

    /// Creates a clustered cache member attached to an in-process network.
    ///
    /// # Arguments
    ///
    /// * `config` - Configuration of this member; `node_id` must be part of
    ///   the membership's current view.
    /// * `store` - Optional persistence collaborator.
    /// * `membership` - Source of cluster views.
    /// * `network` - The network the other members joined.
    pub fn clustered(
        config: GridConfig,
        store: Option<Arc<dyn Store>>,
        membership: Arc<dyn Membership>,
        network: &Arc<InMemoryNetwork>,
    ) -> Result<Self> {
        let node = config.node_id;
        Self::clustered_with(config, store, membership, |handler| {
            let transport: Arc<dyn Transport> = network.join(node, handler)?;
            Ok(transport)
        })
    }

    /// Creates a clustered cache member over any [`Transport`].
    ///
    /// `connect` receives the handler for commands addressed to this member
    /// and returns the transport used to reach the others.
    pub fn clustered_with<F>(
        config: GridConfig,
        store: Option<Arc<dyn Store>>,
        membership: Arc<dyn Membership>,
        connect: F,
    ) -> Result<Self>
    where
        F: FnOnce(Weak<dyn InboundHandler>) -> Result<Arc<dyn Transport>>,
    {
        let view = membership.current_view();
        if !view.contains(config.node_id) {
            return Err(MnemosyneError::Config(format!(
                "node {} is not a member of view {}",
                config.node_id, view.id
            )));
        }
        let services = CacheServices::new(config, store, &view)?;

        let weak: Weak<CacheServices> = Arc::downgrade(&services);
        let handler: Weak<dyn InboundHandler> = weak.clone();
        let transport = connect(handler)?;
        transport.on_view_change(&view);
        services.bind_transport(transport)?;
        if services.fetch_topology(&view)? {
            debug!("Node {} joined with the topology of a running member", services.node());
        }

        let listener: Weak<dyn ViewListener> = weak;
        membership.add_listener(listener);
        let latest = membership.current_view();
        if latest.id > view.id {
            debug!("View {} installed while node {} was starting", latest.id, services.node());
            services.view_changed(&view, &latest);
        }

        services.preload()?;
        info!(
            "Node {} joined the cache in view {} ({} members)",
            services.node(),
            latest.id,
            latest.members.len()
        );
        Ok(Self { services })
    }

    /// Starts an explicit transaction.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use mnemosyne::prelude::*;
    ///
    /// let cache = Mnemosyne::local(GridConfig::local(1), None).unwrap();
    /// let mut tx = cache.begin();
    /// tx.put("a", "1").unwrap();
    /// tx.put("b", "2").unwrap();
    /// tx.commit().unwrap();
    /// ```
    pub fn begin(&self) -> Transaction {
        Transaction::new(Arc::clone(&self.services))
    }

    /// Runs `op` in an implicit transaction and commits it.
    fn auto_commit<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction) -> Result<T>,
    {
        let mut tx = self.begin();
        let result = op(&mut tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Reads the committed value of `key`.
    pub fn get(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        let key = key.into();
        let value = self
            .services
            .read_committed(&key)?
            .map(|committed| committed.data().clone());
        self.services.interceptors().notify_read(&key, value.is_some());
        Ok(value)
    }

    pub fn put(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<Option<Value>> {
        let (key, value) = (key.into(), value.into());
        self.auto_commit(|tx| tx.put(key, value))
    }

    pub fn put_with_lifespan(
        &self,
        key: impl Into<Key>,
        value: impl Into<Value>,
        lifespan: Duration,
    ) -> Result<Option<Value>> {
        let (key, value) = (key.into(), value.into());
        self.auto_commit(|tx| tx.put_with_lifespan(key, value, lifespan))
    }

    pub fn put_if_absent(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<Option<Value>> {
        let (key, value) = (key.into(), value.into());
        self.auto_commit(|tx| tx.put_if_absent(key, value))
    }

    pub fn put_all<K, V>(&self, entries: impl IntoIterator<Item = (K, V)>) -> Result<()>
    where
        K: Into<Key>,
        V: Into<Value>,
    {
        let entries: Vec<(Key, Value)> = entries
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self.auto_commit(|tx| tx.put_all(entries))
    }

    pub fn remove(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        let key = key.into();
        self.auto_commit(|tx| tx.remove(key))
    }

    pub fn remove_if(&self, key: impl Into<Key>, expected: impl Into<Value>) -> Result<bool> {
        let (key, expected) = (key.into(), expected.into());
        self.auto_commit(|tx| tx.remove_if(key, expected))
    }

    pub fn replace(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<Option<Value>> {
        let (key, value) = (key.into(), value.into());
        self.auto_commit(|tx| tx.replace(key, value))
    }

    /// Replaces the value of `key` with `value` if it currently equals `expected`.
    ///
    /// # Returns
    ///
    /// `true` if the value was replaced. A mismatch is not an error.
    pub fn replace_if(
        &self,
        key: impl Into<Key>,
        expected: impl Into<Value>,
        value: impl Into<Value>,
    ) -> Result<bool> {
        let (key, expected, value) = (key.into(), expected.into(), value.into());
        self.auto_commit(|tx| tx.replace_if(key, expected, value))
    }

    /// Removes every entry of the cache, on every member.
    ///
    /// Best effort: keys locked by a running transaction are skipped, and
    /// writes racing with the clear may survive it.
    pub fn clear(&self) -> Result<()> {
        self.services.clear_cluster()
    }

    /// Drops expired entries held by this node.
    pub fn purge_expired(&self) -> Result<usize> {
        self.services.purge_expired()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.services.stats().snapshot()
    }

    pub fn lock_manager(&self) -> &LockManager {
        self.services.lock_manager()
    }

    /// Registers an interceptor run around every command performed on this node.
    pub fn add_interceptor(&self, interceptor: Arc<dyn CommandInterceptor>) {
        self.services.interceptors().add(interceptor);
    }

    pub fn node_id(&self) -> NodeId {
        self.services.node()
    }

    /// Current owners of `key`, primary first.
    pub fn owners(&self, key: impl Into<Key>) -> Vec<NodeId> {
        self.services.distribution().owners(&key.into())
    }

    pub fn primary_owner(&self, key: impl Into<Key>) -> Option<NodeId> {
        self.services.distribution().primary_owner(&key.into())
    }

    /// Whether this node owns `key` in the current topology.
    pub fn is_local(&self, key: impl Into<Key>) -> bool {
        self.services.distribution().is_local(&key.into())
    }

    pub fn topology_id(&self) -> u64 {
        self.services.distribution().topology_id()
    }

    /// Number of entries held in this node's memory.
    pub fn local_size(&self) -> usize {
        self.services.container().len()
    }

    pub fn services(&self) -> &Arc<CacheServices> {
        &self.services
    }

    /// Stops serving remote commands and detaches from the transport.
    pub fn stop(&self) {
        self.services.stop();
    }
}

impl Drop for Mnemosyne {
    fn drop(&mut self) {
        self.stop();
    }
}
