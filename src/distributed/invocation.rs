use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use futures::task::AtomicWaker;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::thread;
use std::time::Instant;

use crate::NodeId;
use crate::commands::remote::Response;
use crate::distributed::View;
use crate::distributed::response::{ResponseCollector, Responses};
use crate::errors::{MnemosyneError, Result};

struct InvocationInner {
    /// Targets that have neither answered nor left.
    waiting_for: HashSet<NodeId>,
    collector: Box<dyn ResponseCollector>,
    result: Option<Result<Responses>>,
    completed: bool,
}

/// Shared completion state of one outstanding invocation.
struct InvocationState {
    inner: Mutex<InvocationInner>,
    done: Condvar,
    waker: AtomicWaker,
}

impl InvocationState {
    fn complete(&self, inner: &mut InvocationInner, result: Result<Responses>) {
        inner.result = Some(result);
        inner.completed = true;
        inner.waiting_for.clear();
        self.done.notify_all();
        self.waker.wake();
    }

    /// Feeds one response. Returns `true` once the invocation is complete.
    fn receive(&self, sender: NodeId, response: Response) -> bool {
        let mut inner = self.inner.lock();
        if inner.completed {
            return true;
        }
        if !inner.waiting_for.remove(&sender) {
            trace!("Dropping unexpected response from {}", sender);
            return false;
        }
        if let Some(result) = inner.collector.add_response(sender, response) {
            self.complete(&mut inner, result);
            return true;
        }
        if inner.waiting_for.is_empty() {
            let result = inner.collector.finish();
            self.complete(&mut inner, result);
            return true;
        }
        false
    }

    fn fail(&self, err: MnemosyneError) {
        let mut inner = self.inner.lock();
        if !inner.completed {
            self.complete(&mut inner, Err(err));
        }
    }

    fn waiting_for(&self) -> Vec<NodeId> {
        let mut targets: Vec<NodeId> = self.inner.lock().waiting_for.iter().copied().collect();
        targets.sort_unstable();
        targets
    }
}

/// Table of outstanding invocations, keyed by request id.
///
/// Entries are removed when the invocation completes, times out, or its
/// handle is dropped, whichever happens first.
#[derive(Default)]
pub struct InvocationTable {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Arc<InvocationState>>>,
}

impl InvocationTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers an invocation waiting on `targets` and returns its handle.
    pub fn register(
        self: &Arc<Self>,
        targets: &[NodeId],
        mut collector: Box<dyn ResponseCollector>,
    ) -> PendingInvocation {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let waiting_for: HashSet<NodeId> = targets.iter().copied().collect();
        let (result, completed) = if waiting_for.is_empty() {
            (Some(collector.finish()), true)
        } else {
            (None, false)
        };
        let state = Arc::new(InvocationState {
            inner: Mutex::new(InvocationInner {
                waiting_for,
                collector,
                result,
                completed,
            }),
            done: Condvar::new(),
            waker: AtomicWaker::new(),
        });
        if !completed {
            self.entries.lock().insert(id, Arc::clone(&state));
        }
        PendingInvocation {
            id,
            state,
            table: Arc::downgrade(self),
        }
    }

    fn lookup(&self, id: u64) -> Option<Arc<InvocationState>> {
        self.entries.lock().get(&id).cloned()
    }

    fn remove(&self, id: u64) {
        self.entries.lock().remove(&id);
    }

    /// Delivers a response from `sender` to request `id`.
    pub fn on_response(&self, id: u64, sender: NodeId, response: Response) {
        match self.lookup(id) {
            Some(state) => {
                if state.receive(sender, response) {
                    self.remove(id);
                }
            }
            None => trace!("Response from {} for finished request {} dropped", sender, id),
        }
    }

    /// Treats every target missing from `view` as a leaver.
    pub fn on_view_change(&self, view: &View) {
        let states: Vec<(u64, Arc<InvocationState>)> = self
            .entries
            .lock()
            .iter()
            .map(|(id, state)| (*id, Arc::clone(state)))
            .collect();
        for (id, state) in states {
            for target in state.waiting_for() {
                if !view.contains(target) {
                    debug!("Request {} lost target {} to view {}", id, target, view.id);
                    if state.receive(target, Response::Leaver) {
                        self.remove(id);
                    }
                }
            }
        }
    }

    /// Fails request `id` with `RemoteTimeout` if it is still outstanding.
    pub fn expire(&self, id: u64) {
        let Some(state) = self.lookup(id) else {
            return;
        };
        let targets = state.waiting_for();
        debug!("Request {} timed out waiting for {:?}", id, targets);
        state.fail(MnemosyneError::RemoteTimeout { targets });
        self.remove(id);
    }

    /// Number of invocations still outstanding.
    pub fn outstanding(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Handle to an outstanding remote invocation.
///
/// Can be waited on from a thread with [`PendingInvocation::wait`] or awaited
/// as a [`Future`]. Dropping the handle abandons the invocation and frees its
/// slot in the outstanding-request table.
pub struct PendingInvocation {
    id: u64,
    state: Arc<InvocationState>,
    table: Weak<InvocationTable>,
}

impl PendingInvocation {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_done(&self) -> bool {
        self.state.inner.lock().completed
    }

    /// Blocks the calling thread until the invocation completes or times out.
    pub fn wait(self) -> Result<Responses> {
        let mut inner = self.state.inner.lock();
        loop {
            if inner.completed {
                return inner.result.take().unwrap_or_else(|| {
                    Err(MnemosyneError::Other(format!(
                        "result of request {} already consumed",
                        self.id
                    )))
                });
            }
            self.state.done.wait(&mut inner);
        }
    }
}

impl Future for PendingInvocation {
    type Output = Result<Responses>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.state.waker.register(cx.waker());
        let mut inner = self.state.inner.lock();
        if !inner.completed {
            return Poll::Pending;
        }
        Poll::Ready(inner.result.take().unwrap_or_else(|| {
            Err(MnemosyneError::Other(format!(
                "request {} polled after completion",
                self.id
            )))
        }))
    }
}

impl Drop for PendingInvocation {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.remove(self.id);
        }
    }
}

struct SchedulerState {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    shutdown: bool,
}

struct SchedulerShared {
    state: Mutex<SchedulerState>,
    changed: Condvar,
}

/// Fails invocations whose deadline passed.
///
/// A single thread sleeps until the earliest registered deadline, or until a
/// new earlier deadline is scheduled, and expires everything that is due.
pub struct TimeoutScheduler {
    shared: Arc<SchedulerShared>,
}

impl TimeoutScheduler {
    /// Starts the scheduler thread for `table`.
    ///
    /// The thread exits when the scheduler is dropped or the table is gone.
    pub fn start(name: String, table: Weak<InvocationTable>) -> Result<Self> {
        let shared = Arc::new(SchedulerShared {
            state: Mutex::new(SchedulerState {
                deadlines: BinaryHeap::new(),
                shutdown: false,
            }),
            changed: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        thread::Builder::new()
            .name(name)
            .spawn(move || Self::run(worker, table))
            .map_err(|e| MnemosyneError::Other(format!("failed to start timeout scheduler: {}", e)))?;
        Ok(Self { shared })
    }

    pub fn schedule(&self, deadline: Instant, id: u64) {
        let mut state = self.shared.state.lock();
        let earliest = state.deadlines.peek().map(|Reverse((at, _))| *at);
        state.deadlines.push(Reverse((deadline, id)));
        if earliest.is_none_or(|at| deadline < at) {
            self.shared.changed.notify_one();
        }
    }

    fn run(shared: Arc<SchedulerShared>, table: Weak<InvocationTable>) {
        let mut state = shared.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            let now = Instant::now();
            let mut due = Vec::new();
            while let Some(Reverse((at, id))) = state.deadlines.peek().copied() {
                if at > now {
                    break;
                }
                state.deadlines.pop();
                due.push(id);
            }

            if !due.is_empty() {
                let Some(table) = table.upgrade() else {
                    return;
                };
                drop(state);
                for id in due {
                    table.expire(id);
                }
                state = shared.state.lock();
                continue;
            }

            match state.deadlines.peek().map(|Reverse((at, _))| *at) {
                Some(at) => {
                    shared.changed.wait_until(&mut state, at);
                }
                None => shared.changed.wait(&mut state),
            }
        }
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.changed.notify_all();
    }
}
