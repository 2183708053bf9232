use std::time::Duration;

use crate::NodeId;
use crate::commands::remote::{ReplicableCommand, Response};
use crate::distributed::View;
use crate::distributed::invocation::PendingInvocation;
use crate::distributed::response::{ResponseCollector, Responses};
use crate::errors::Result;

/// Delivery order of a remote invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverOrder {
    /// The receiver handles this sender's commands in send order.
    PerSender,
    /// No ordering; commands may be handled concurrently.
    None,
}

/// Per-call options of a remote invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcOptions {
    pub timeout: Duration,
    pub order: DeliverOrder,
}

impl RpcOptions {
    pub fn new(timeout: Duration, order: DeliverOrder) -> Self {
        Self { timeout, order }
    }

    pub fn unordered(timeout: Duration) -> Self {
        Self::new(timeout, DeliverOrder::None)
    }

    pub fn ordered(timeout: Duration) -> Self {
        Self::new(timeout, DeliverOrder::PerSender)
    }
}

/// Who an invocation is sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    One(NodeId),
    Set(Vec<NodeId>),
    /// Every member of the current view except the local node.
    All,
}

/// Executes commands delivered to this node and produces their response.
pub trait InboundHandler: Send + Sync {
    fn handle(&self, origin: NodeId, command: ReplicableCommand) -> Response;
}

/// Cluster RPC.
///
/// [`Transport::invoke`] is the asynchronous form: it returns as soon as the
/// command was handed to the network. [`Transport::invoke_sync`] suspends the
/// calling thread until the collector completes, a target times out or the
/// collector short-circuits.
pub trait Transport: Send + Sync {
    fn local_node(&self) -> NodeId;

    /// Members of the latest view this transport has seen.
    fn members(&self) -> Vec<NodeId>;

    fn invoke(
        &self,
        recipients: Recipients,
        command: ReplicableCommand,
        options: RpcOptions,
        collector: Box<dyn ResponseCollector>,
    ) -> Result<PendingInvocation>;

    fn invoke_sync(
        &self,
        recipients: Recipients,
        command: ReplicableCommand,
        options: RpcOptions,
        collector: Box<dyn ResponseCollector>,
    ) -> Result<Responses> {
        self.invoke(recipients, command, options, collector)?.wait()
    }

    /// Fails pending invocations' departed targets over to their collectors.
    fn on_view_change(&self, view: &View);

    /// Leaves the network. Later invocations and deliveries are dropped.
    fn stop(&self);
}
