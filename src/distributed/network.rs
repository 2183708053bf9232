use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use crossbeam_channel::{self as channel, Receiver, Sender};
use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use crate::NodeId;
use crate::commands::remote::{ReplicableCommand, Response};
use crate::distributed::View;
use crate::distributed::invocation::{InvocationTable, PendingInvocation, TimeoutScheduler};
use crate::distributed::response::ResponseCollector;
use crate::distributed::transport::{
    DeliverOrder, InboundHandler, Recipients, RpcOptions, Transport,
};
use crate::errors::{FailureKind, MnemosyneError, Result};
use crate::marshall::{BincodeMarshaller, Marshaller};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Endpoint {
    handler: Weak<dyn InboundHandler>,
    invocations: Weak<InvocationTable>,
}

struct NetworkShared {
    endpoints: RwLock<HashMap<NodeId, Endpoint>>,
    disconnected: RwLock<HashSet<NodeId>>,
    marshaller: Arc<dyn Marshaller>,
}

impl NetworkShared {
    fn is_reachable(&self, from: NodeId, to: NodeId) -> bool {
        let disconnected = self.disconnected.read();
        !disconnected.contains(&from) && !disconnected.contains(&to)
    }

    fn deliver(&self, from: NodeId, to: NodeId, request_id: u64, bytes: Vec<u8>) {
        if !self.is_reachable(from, to) {
            trace!("Request {} from {} to {} lost", request_id, from, to);
            return;
        }
        let handler = self.endpoints.read().get(&to).and_then(|e| e.handler.upgrade());
        let response = match handler {
            Some(handler) => match self.marshaller.unmarshal_command(&bytes) {
                Ok(command) => handler.handle(from, command),
                Err(err) => Response::Exception(FailureKind::from(&err)),
            },
            // Nothing listens at `to`: refuse the connection instead of
            // letting the sender wait for its timeout.
            None => {
                trace!("Request {} from {} refused by unknown node {}", request_id, from, to);
                Response::Leaver
            }
        };
        let reply = match self.marshaller.marshal_response(&response) {
            Ok(reply) => reply,
            Err(err) => {
                warn!("Node {} failed to marshal response to {}: {}", to, from, err);
                match self
                    .marshaller
                    .marshal_response(&Response::Exception(FailureKind::from(&err)))
                {
                    Ok(reply) => reply,
                    Err(_) => return,
                }
            }
        };

        if !self.is_reachable(from, to) {
            trace!("Response {} from {} to {} lost", request_id, to, from);
            return;
        }
        let invocations = self
            .endpoints
            .read()
            .get(&from)
            .and_then(|e| e.invocations.upgrade());
        let Some(invocations) = invocations else {
            return;
        };
        let response = self
            .marshaller
            .unmarshal_response(&reply)
            .unwrap_or_else(|err| Response::Exception(FailureKind::from(&err)));
        invocations.on_response(request_id, to, response);
    }
}

/// In-process network connecting the members of a test or embedded cluster.
///
/// Every command and response is marshalled, so what crosses the network is
/// exactly the wire form of the command. Per-sender ordered delivery uses one
/// queue and worker thread per (sender, receiver) pair; unordered delivery is
/// handled by a shared worker pool.
///
/// Unordered commands that release locks travel on a separate control lane.
/// Pool workers may sit in a lock wait for the whole lock timeout, and the
/// commit that ends the wait must not queue behind them.
pub struct InMemoryNetwork {
    shared: Arc<NetworkShared>,
    pool: WorkerPool,
    control: WorkerPool,
    fifo: Mutex<HashMap<(NodeId, NodeId), Sender<Job>>>,
}

/// Worker threads fed from one queue.
///
/// Every queued job either reserves an idle worker or starts a new one, up
/// to `max_workers`, so jobs do not wait behind workers blocked in a handler.
struct WorkerPool {
    name: &'static str,
    jobs: Sender<Job>,
    receiver: Receiver<Job>,
    idle: Arc<AtomicUsize>,
    workers: AtomicUsize,
    max_workers: usize,
}

impl WorkerPool {
    fn start(name: &'static str, core_workers: usize, max_workers: usize) -> Result<Self> {
        let (jobs, receiver) = channel::unbounded::<Job>();
        let core_workers = core_workers.max(1);
        let pool = Self {
            name,
            jobs,
            receiver,
            idle: Arc::new(AtomicUsize::new(core_workers)),
            workers: AtomicUsize::new(core_workers),
            max_workers: max_workers.max(core_workers),
        };
        for index in 0..core_workers {
            pool.spawn_worker(index)?;
        }
        Ok(pool)
    }

    fn spawn_worker(&self, index: usize) -> Result<()> {
        InMemoryNetwork::spawn_worker(
            format!("mnemosyne-{}-{}", self.name, index),
            self.receiver.clone(),
            Some(Arc::clone(&self.idle)),
        )
    }

    fn execute(&self, job: Job) -> Result<()> {
        let reserved = self
            .idle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |idle| idle.checked_sub(1))
            .is_ok();
        if !reserved {
            let index = self.workers.fetch_add(1, Ordering::AcqRel);
            if index < self.max_workers {
                trace!("Every {} worker is busy, starting worker {}", self.name, index);
                self.spawn_worker(index)?;
            } else {
                self.workers.fetch_sub(1, Ordering::AcqRel);
                debug!("All {} {} workers are busy, queueing", self.max_workers, self.name);
            }
        }
        self.jobs
            .send(job)
            .map_err(|_| MnemosyneError::Other(format!("{} queue is closed", self.name)))
    }
}

/// Queue a message is delivered through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Pool,
    Control,
    Fifo,
}

impl InMemoryNetwork {
    pub const DEFAULT_WORKERS: usize = 16;
    pub const MAX_WORKERS: usize = 512;
    pub const CONTROL_WORKERS: usize = 4;

    pub fn new() -> Result<Arc<Self>> {
        Self::with_marshaller(Self::DEFAULT_WORKERS, Arc::new(BincodeMarshaller))
    }

    /// Creates a network that keeps `workers` threads ready for unordered
    /// delivery and grows up to [`InMemoryNetwork::MAX_WORKERS`] under load.
    pub fn with_marshaller(workers: usize, marshaller: Arc<dyn Marshaller>) -> Result<Arc<Self>> {
        let pool = WorkerPool::start("net", workers, Self::MAX_WORKERS)?;
        let control = WorkerPool::start("control", Self::CONTROL_WORKERS, Self::CONTROL_WORKERS)?;
        Ok(Arc::new(Self {
            shared: Arc::new(NetworkShared {
                endpoints: RwLock::new(HashMap::new()),
                disconnected: RwLock::new(HashSet::new()),
                marshaller,
            }),
            pool,
            control,
            fifo: Mutex::new(HashMap::new()),
        }))
    }

    fn spawn_worker(name: String, jobs: Receiver<Job>, idle: Option<Arc<AtomicUsize>>) -> Result<()> {
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                while let Ok(job) = jobs.recv() {
                    job();
                    if let Some(idle) = &idle {
                        idle.fetch_add(1, Ordering::AcqRel);
                    }
                }
            })
            .map(|_| ())
            .map_err(|e| MnemosyneError::Other(format!("failed to start network worker: {}", e)))
    }

    /// Attaches `node` to the network.
    ///
    /// Commands addressed to `node` are handed to `handler`; the returned
    /// transport is the node's way of invoking the other members.
    pub fn join(
        self: &Arc<Self>,
        node: NodeId,
        handler: Weak<dyn InboundHandler>,
    ) -> Result<Arc<LocalTransport>> {
        let invocations = InvocationTable::new();
        let scheduler =
            TimeoutScheduler::start(format!("mnemosyne-timeouts-{}", node), Arc::downgrade(&invocations))?;
        self.shared.endpoints.write().insert(
            node,
            Endpoint {
                handler,
                invocations: Arc::downgrade(&invocations),
            },
        );
        self.shared.disconnected.write().remove(&node);
        debug!("Node {} joined the network", node);
        Ok(Arc::new(LocalTransport {
            node,
            network: Arc::clone(self),
            invocations,
            scheduler,
            view: RwLock::new(None),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Simulates a crash of `node`: everything sent to or from it is lost.
    pub fn disconnect(&self, node: NodeId) {
        debug!("Disconnecting node {}", node);
        self.shared.disconnected.write().insert(node);
    }

    pub fn reconnect(&self, node: NodeId) {
        self.shared.disconnected.write().remove(&node);
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.shared.endpoints.read().contains_key(&node)
            && !self.shared.disconnected.read().contains(&node)
    }

    /// Registered nodes, in id order.
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.shared.endpoints.read().keys().copied().collect();
        nodes.sort_unstable();
        nodes
    }

    fn leave(&self, node: NodeId) {
        self.shared.endpoints.write().remove(&node);
        self.fifo.lock().retain(|(from, to), _| *from != node && *to != node);
        debug!("Node {} left the network", node);
    }

    fn lane(command: &ReplicableCommand, order: DeliverOrder) -> Lane {
        match order {
            DeliverOrder::PerSender => Lane::Fifo,
            DeliverOrder::None if command.releases_locks() => Lane::Control,
            DeliverOrder::None => Lane::Pool,
        }
    }

    fn send(&self, from: NodeId, to: NodeId, request_id: u64, bytes: Vec<u8>, lane: Lane) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let job: Job = Box::new(move || shared.deliver(from, to, request_id, bytes));
        match lane {
            Lane::Pool => self.pool.execute(job),
            Lane::Control => self.control.execute(job),
            Lane::Fifo => self.ordered_queue(from, to)?.send(job).map_err(|_| {
                MnemosyneError::Other(format!("network queue {} -> {} is closed", from, to))
            }),
        }
    }

    fn ordered_queue(&self, from: NodeId, to: NodeId) -> Result<Sender<Job>> {
        let mut fifo = self.fifo.lock();
        if let Some(queue) = fifo.get(&(from, to)) {
            return Ok(queue.clone());
        }
        let (queue, jobs) = channel::unbounded::<Job>();
        Self::spawn_worker(format!("mnemosyne-fifo-{}-{}", from, to), jobs, None)?;
        fifo.insert((from, to), queue.clone());
        Ok(queue)
    }
}

/// One node's [`Transport`] over an [`InMemoryNetwork`].
pub struct LocalTransport {
    node: NodeId,
    network: Arc<InMemoryNetwork>,
    invocations: Arc<InvocationTable>,
    scheduler: TimeoutScheduler,
    view: RwLock<Option<View>>,
    stopped: AtomicBool,
}

impl LocalTransport {
    /// Number of invocations still waiting for responses.
    pub fn outstanding_invocations(&self) -> usize {
        self.invocations.outstanding()
    }

    pub fn network(&self) -> &Arc<InMemoryNetwork> {
        &self.network
    }

    fn resolve(&self, recipients: Recipients) -> Vec<NodeId> {
        let mut targets = match recipients {
            Recipients::One(node) => vec![node],
            Recipients::Set(nodes) => nodes,
            Recipients::All => self
                .members()
                .into_iter()
                .filter(|member| *member != self.node)
                .collect(),
        };
        targets.sort_unstable();
        targets.dedup();
        targets
    }
}

impl Transport for LocalTransport {
    fn local_node(&self) -> NodeId {
        self.node
    }

    fn members(&self) -> Vec<NodeId> {
        match self.view.read().as_ref() {
            Some(view) => view.members.clone(),
            None => self.network.nodes(),
        }
    }

    fn invoke(
        &self,
        recipients: Recipients,
        command: ReplicableCommand,
        options: RpcOptions,
        collector: Box<dyn ResponseCollector>,
    ) -> Result<PendingInvocation> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(MnemosyneError::Other(format!(
                "transport of node {} is stopped",
                self.node
            )));
        }
        let targets = self.resolve(recipients);
        let bytes = self.network.shared.marshaller.marshal_command(&command)?;
        let pending = self.invocations.register(&targets, collector);
        if pending.is_done() {
            return Ok(pending);
        }
        trace!(
            "Node {} sends {} as request {} to {:?}",
            self.node,
            command.name(),
            pending.id(),
            targets
        );
        self.scheduler
            .schedule(Instant::now() + options.timeout, pending.id());

        let lane = InMemoryNetwork::lane(&command, options.order);
        let view = self.view.read().clone();
        for target in targets {
            if view.as_ref().is_some_and(|v| !v.contains(target)) {
                self.invocations
                    .on_response(pending.id(), target, Response::Leaver);
                continue;
            }
            self.network
                .send(self.node, target, pending.id(), bytes.clone(), lane)?;
        }
        Ok(pending)
    }

    fn on_view_change(&self, view: &View) {
        {
            let mut current = self.view.write();
            if current.as_ref().is_some_and(|c| c.id >= view.id) {
                return;
            }
            *current = Some(view.clone());
        }
        self.invocations.on_view_change(view);
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.network.leave(self.node);
        }
    }
}
