//! Common utilities for Mnemosyne integration tests.
#![allow(dead_code)]

use ahash::AHashMap as HashMap;
use mnemosyne::distributed::membership::InMemoryMembership;
use mnemosyne::distributed::network::InMemoryNetwork;
use mnemosyne::prelude::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

static LOGGING: Once = Once::new();

/// Initialises `env_logger` once per test binary. Honours `RUST_LOG`.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

// --- MockStore ---

/// A mock implementation of the `Store` trait for testing purposes.
/// Keeps entries in an in-memory HashMap.
#[derive(Debug, Default)]
pub struct MockStore {
    data: Mutex<HashMap<Key, VersionedValue>>,
    batches: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retrieves an entry directly from the mock store.
    pub fn get(&self, key: &str) -> Option<VersionedValue> {
        self.data.lock().get(&Key::copy_from_slice(key.as_bytes())).cloned()
    }

    /// Puts an entry behind the cache's back.
    pub fn seed(&self, key: &'static str, value: &'static str, version: u64) {
        self.data.lock().insert(
            Key::from(key),
            VersionedValue::new(Value::from(value), EntryVersion(version), Metadata::default()),
        );
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// Number of `apply_mutations` calls that succeeded.
    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    /// Makes every following `apply_mutations` call fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl Store for MockStore {
    fn load(&self, key: &Key) -> Result<Option<VersionedValue>> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn load_all(&self) -> Result<Vec<(Key, VersionedValue)>> {
        Ok(self
            .data
            .lock()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn apply_mutations(&self, mutations: Vec<StoreMutation>) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MnemosyneError::Store("disk on fire".to_string()));
        }
        let mut data = self.data.lock();
        for mutation in mutations {
            match mutation {
                StoreMutation::Write(key, value) => {
                    data.insert(key, value);
                }
                StoreMutation::Delete(key) => {
                    data.remove(&key);
                }
            }
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn purge_expired(&self, now: u64) -> Result<usize> {
        let mut data = self.data.lock();
        let before = data.len();
        data.retain(|_, value| !value.is_expired(now));
        Ok(before - data.len())
    }
}

// --- Helper Functions ---

/// Creates a local cache with the given isolation and default everything else.
pub fn setup_cache(isolation: TransactionIsolation) -> Mnemosyne {
    init_logging();
    Mnemosyne::local(GridConfig::local(1).with_isolation(isolation), None).unwrap()
}

/// Creates a local cache backed by a fresh `MockStore`.
pub fn setup_cache_with_store(config: GridConfig) -> (Mnemosyne, Arc<MockStore>) {
    init_logging();
    let store = Arc::new(MockStore::new());
    let cache = Mnemosyne::local(config, Some(store.clone() as Arc<dyn Store>)).unwrap();
    (cache, store)
}

pub fn bytes(value: &'static str) -> Value {
    Value::from(value)
}

/// Polls `condition` every 10ms until it holds or `timeout` passes.
pub fn wait_for_condition<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

// --- Cluster ---

/// Small segment count and short timeouts so failure tests finish quickly.
pub fn distributed_config(node: NodeId, num_owners: usize) -> GridConfig {
    GridConfig::distributed(node, num_owners)
        .with_num_segments(16)
        .with_lock_acquisition_timeout(Duration::from_millis(500))
        .with_remote_timeout(Duration::from_secs(2))
}

/// An in-process cluster: one cache per member over a shared network.
pub struct TestCluster {
    pub network: Arc<InMemoryNetwork>,
    pub membership: Arc<InMemoryMembership>,
    pub nodes: Vec<Mnemosyne>,
}

impl TestCluster {
    /// Starts members `1..=size`, configured by `config(node_id)`.
    pub fn start<F>(size: u64, config: F) -> Self
    where
        F: Fn(NodeId) -> GridConfig,
    {
        init_logging();
        let network = InMemoryNetwork::new().unwrap();
        let members: Vec<NodeId> = (1..=size).collect();
        let membership = InMemoryMembership::new(View::new(1, members.clone()));
        let nodes = members
            .iter()
            .map(|node| {
                Mnemosyne::clustered(config(*node), None, membership.clone(), &network).unwrap()
            })
            .collect();
        Self {
            network,
            membership,
            nodes,
        }
    }

    /// Distributed cluster with `num_owners` owners per segment.
    pub fn distributed(size: u64, num_owners: usize) -> Self {
        Self::start(size, |node| distributed_config(node, num_owners))
    }

    /// Distributed cluster whose members each persist to their own `MockStore`.
    pub fn with_stores(size: u64, num_owners: usize) -> (Self, Vec<Arc<MockStore>>) {
        init_logging();
        let network = InMemoryNetwork::new().unwrap();
        let members: Vec<NodeId> = (1..=size).collect();
        let membership = InMemoryMembership::new(View::new(1, members.clone()));
        let stores: Vec<Arc<MockStore>> = members.iter().map(|_| Arc::new(MockStore::new())).collect();
        let nodes = members
            .iter()
            .zip(&stores)
            .map(|(node, store)| {
                let store: Arc<dyn Store> = store.clone();
                Mnemosyne::clustered(
                    distributed_config(*node, num_owners),
                    Some(store),
                    membership.clone(),
                    &network,
                )
                .unwrap()
            })
            .collect();
        let cluster = Self {
            network,
            membership,
            nodes,
        };
        (cluster, stores)
    }

    /// Adds member `config.node_id` to the view and starts its cache.
    pub fn join(&mut self, config: GridConfig) -> &Mnemosyne {
        self.membership.add_member(config.node_id).unwrap();
        let node =
            Mnemosyne::clustered(config, None, self.membership.clone(), &self.network).unwrap();
        self.nodes.push(node);
        self.nodes.last().unwrap()
    }

    pub fn node(&self, id: NodeId) -> &Mnemosyne {
        &self.nodes[(id - 1) as usize]
    }

    /// Simulates a crash of `id` and installs the view without it.
    pub fn crash(&self, id: NodeId) {
        self.network.disconnect(id);
        self.membership.remove_member(id).unwrap();
    }

    /// Finds a key whose owners are exactly `owners`, primary first.
    pub fn key_owned_by(&self, owners: &[NodeId]) -> Key {
        (0..10_000)
            .map(|i| Key::from(format!("key-{}", i)))
            .find(|key| self.nodes[0].owners(key.clone()) == owners)
            .unwrap()
    }
}
