use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use mnemosyne::commands::remote::{ReplicableCommand, Response};
use mnemosyne::distributed::response::MapResponseCollector;
use mnemosyne::distributed::transport::{InboundHandler, Recipients, RpcOptions, Transport};
use mnemosyne::marshall::{BincodeMarshaller, Marshaller};
use mnemosyne::prelude::*;

use crate::common::{TestCluster, bytes, distributed_config, init_logging, wait_for_condition};

fn rollback(local_id: u64, topology_id: u64) -> ReplicableCommand {
    ReplicableCommand::Rollback {
        gtx: GlobalTransactionId::new(1, local_id),
        topology_id,
    }
}

fn transport_of(cluster: &TestCluster, id: NodeId) -> Arc<dyn Transport> {
    cluster.node(id).services().transport().unwrap().clone()
}

/// Records the transaction ids of the rollbacks it receives.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<u64>>,
}

impl InboundHandler for Recorder {
    fn handle(&self, _origin: NodeId, command: ReplicableCommand) -> Response {
        if let Some(gtx) = command.transaction_id() {
            self.seen.lock().push(gtx.local_id);
        }
        Response::Successful(CommandReturn::None)
    }
}

#[test]
fn test_leaver_tolerated_by_lenient_collector() {
    let cluster = TestCluster::distributed(3, 2);
    let transport = transport_of(&cluster, 1);
    cluster.network.disconnect(3);

    let start = Instant::now();
    let pending = transport
        .invoke(
            Recipients::Set(vec![2, 3]),
            rollback(999, 1),
            RpcOptions::unordered(Duration::from_secs(30)),
            Box::new(MapResponseCollector::new(true)),
        )
        .unwrap();
    cluster.membership.remove_member(3).unwrap();

    let responses = pending.wait().unwrap();
    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(responses[&2].is_successful());
    assert_eq!(responses[&3], Response::Leaver);
}

#[test]
fn test_leaver_fails_strict_collector() {
    let cluster = TestCluster::distributed(3, 2);
    let transport = transport_of(&cluster, 1);
    cluster.network.disconnect(3);

    let pending = transport
        .invoke(
            Recipients::Set(vec![2, 3]),
            rollback(999, 1),
            RpcOptions::unordered(Duration::from_secs(30)),
            Box::new(MapResponseCollector::new(false)),
        )
        .unwrap();
    cluster.membership.remove_member(3).unwrap();

    let err = pending.wait().unwrap_err();
    assert!(matches!(err, MnemosyneError::SuspectedLeaver { node: 3 }), "{:?}", err);
    assert!(err.is_retryable());
}

#[test]
fn test_unresponsive_target_times_out() {
    let cluster = TestCluster::distributed(3, 2);
    let transport = transport_of(&cluster, 1);
    cluster.network.disconnect(3);

    let start = Instant::now();
    let err = transport
        .invoke_sync(
            Recipients::Set(vec![2, 3]),
            rollback(1, 1),
            RpcOptions::unordered(Duration::from_millis(200)),
            Box::new(MapResponseCollector::new(true)),
        )
        .unwrap_err();
    let elapsed = start.elapsed();

    assert!(
        matches!(&err, MnemosyneError::RemoteTimeout { targets } if targets == &vec![3]),
        "{:?}",
        err
    );
    assert!(elapsed >= Duration::from_millis(150), "timed out after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5));
}

#[test]
fn test_transaction_fails_when_owner_unreachable() {
    let cluster = TestCluster::distributed(3, 2);
    let key = cluster.key_owned_by(&[2, 3]);
    cluster.network.disconnect(3);

    let mut txn = cluster.node(1).begin();
    txn.put_blind(key.clone(), "v").unwrap();
    let err = txn.commit().unwrap_err();
    assert!(matches!(err, MnemosyneError::RemoteTimeout { .. }), "{:?}", err);
    assert!(err.is_rollback_class());

    // Node 2 voted yes, then received the rollback
    assert!(wait_for_condition(
        || cluster.node(2).lock_manager().held_count() == 0,
        Duration::from_secs(5)
    ));
    assert_eq!(cluster.node(2).local_size(), 0);
    assert_eq!(cluster.node(1).stats().rollbacks, 1);
}

#[test]
fn test_stale_topology_refused_by_receiver() {
    let cluster = TestCluster::distributed(3, 2);
    let transport = transport_of(&cluster, 1);

    let err = transport
        .invoke_sync(
            Recipients::One(2),
            ReplicableCommand::ClusteredGet {
                key: Key::from("k"),
                topology_id: 99,
            },
            RpcOptions::unordered(Duration::from_secs(2)),
            Box::new(MapResponseCollector::new(false)),
        )
        .unwrap_err();
    assert!(
        matches!(err, MnemosyneError::StaleTopology { expected: 1, actual: 99 }),
        "{:?}",
        err
    );

    // Rollbacks finish accepted work and skip the check
    let responses = transport
        .invoke_sync(
            Recipients::One(2),
            rollback(5, 99),
            RpcOptions::unordered(Duration::from_secs(2)),
            Box::new(MapResponseCollector::new(false)),
        )
        .unwrap();
    assert!(responses[&2].is_successful());
}

#[test]
fn test_per_sender_order_is_preserved() {
    init_logging();
    let network = InMemoryNetwork::new().unwrap();
    let sender = Arc::new(Recorder::default());
    let receiver = Arc::new(Recorder::default());
    let sender_handler: Weak<dyn InboundHandler> = Arc::<Recorder>::downgrade(&sender);
    let receiver_handler: Weak<dyn InboundHandler> = Arc::<Recorder>::downgrade(&receiver);
    let transport = network.join(1, sender_handler).unwrap();
    let _receiver_transport = network.join(2, receiver_handler).unwrap();

    let pending: Vec<_> = (0..100)
        .map(|i| {
            transport
                .invoke(
                    Recipients::One(2),
                    rollback(i, 0),
                    RpcOptions::ordered(Duration::from_secs(5)),
                    Box::new(MapResponseCollector::new(false)),
                )
                .unwrap()
        })
        .collect();
    for invocation in pending {
        invocation.wait().unwrap();
    }

    assert_eq!(*receiver.seen.lock(), (0..100).collect::<Vec<u64>>());
    assert!(sender.seen.lock().is_empty());
    assert_eq!(transport.outstanding_invocations(), 0);
}

#[test]
fn test_invocation_table_is_cleaned_up() {
    init_logging();
    let network = InMemoryNetwork::new().unwrap();
    let receiver = Arc::new(Recorder::default());
    let sender_handler: Weak<dyn InboundHandler> = Arc::<Recorder>::downgrade(&receiver);
    let receiver_handler: Weak<dyn InboundHandler> = Arc::<Recorder>::downgrade(&receiver);
    let transport = network.join(1, sender_handler).unwrap();
    let _other = network.join(2, receiver_handler).unwrap();

    // Completed
    transport
        .invoke_sync(
            Recipients::One(2),
            rollback(1, 0),
            RpcOptions::unordered(Duration::from_secs(5)),
            Box::new(MapResponseCollector::new(false)),
        )
        .unwrap();
    assert_eq!(transport.outstanding_invocations(), 0);

    // Timed out
    network.disconnect(2);
    let err = transport
        .invoke_sync(
            Recipients::One(2),
            rollback(2, 0),
            RpcOptions::unordered(Duration::from_millis(50)),
            Box::new(MapResponseCollector::new(false)),
        )
        .unwrap_err();
    assert!(matches!(err, MnemosyneError::RemoteTimeout { .. }));
    assert_eq!(transport.outstanding_invocations(), 0);

    // Abandoned
    let pending = transport
        .invoke(
            Recipients::One(2),
            rollback(3, 0),
            RpcOptions::unordered(Duration::from_secs(30)),
            Box::new(MapResponseCollector::new(false)),
        )
        .unwrap();
    assert_eq!(transport.outstanding_invocations(), 1);
    drop(pending);
    assert_eq!(transport.outstanding_invocations(), 0);
}

#[test]
fn test_request_to_unknown_node_is_refused() {
    init_logging();
    let network = InMemoryNetwork::new().unwrap();
    let receiver = Arc::new(Recorder::default());
    let handler: Weak<dyn InboundHandler> = Arc::<Recorder>::downgrade(&receiver);
    let transport = network.join(1, handler).unwrap();

    let start = Instant::now();
    let err = transport
        .invoke_sync(
            Recipients::One(42),
            rollback(1, 0),
            RpcOptions::unordered(Duration::from_secs(30)),
            Box::new(MapResponseCollector::new(false)),
        )
        .unwrap_err();
    assert!(matches!(err, MnemosyneError::SuspectedLeaver { node: 42 }), "{:?}", err);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invocation_can_be_awaited() {
    let cluster = TestCluster::distributed(3, 2);
    let key = cluster.key_owned_by(&[2, 3]);
    cluster.node(2).put(key.clone(), "v").unwrap();
    let transport = transport_of(&cluster, 1);

    let pending = transport
        .invoke(
            Recipients::Set(vec![2, 3]),
            ReplicableCommand::ClusteredGet {
                key: key.clone(),
                topology_id: cluster.node(1).topology_id(),
            },
            RpcOptions::unordered(Duration::from_secs(5)),
            Box::new(MapResponseCollector::new(false)),
        )
        .unwrap();
    let responses = pending.await.unwrap();

    assert_eq!(responses.len(), 2);
    for response in responses.into_values() {
        match response {
            Response::Successful(value) => assert_eq!(value.into_value(), Some(bytes("v"))),
            other => panic!("unexpected response {:?}", other),
        }
    }
}

#[test]
fn test_commands_survive_the_wire_format() {
    let marshaller = BincodeMarshaller;
    let command = ReplicableCommand::Prepare {
        gtx: GlobalTransactionId::new(3, 17),
        topology_id: 4,
        modifications: vec![
            WriteCommand::put(Key::from("a"), Value::from("1"), Metadata::default()),
            WriteCommand::put_all(
                vec![(Key::from("b"), Value::from("2"))],
                Metadata::default(),
            ),
        ],
        versions_seen: vec![
            (Key::from("a"), VersionSeen::Version(EntryVersion(9))),
            (Key::from("b"), VersionSeen::NotRead),
        ],
        write_skew_check: true,
        lock_keys: vec![Key::from("a")],
    };
    let wire = marshaller.marshal_command(&command).unwrap();
    assert_eq!(marshaller.unmarshal_command(&wire).unwrap(), command);

    let err = marshaller.unmarshal_command(&wire[..wire.len() / 2]).unwrap_err();
    assert!(matches!(err, MnemosyneError::Marshalling(_)));
}

#[test]
fn test_commit_reaches_owner_while_lock_waiters_fill_the_pool() {
    // More waiters than the network has core workers: each one parks a
    // delivery thread on node 2 until the holder's commit gets through.
    const WAITERS: usize = InMemoryNetwork::DEFAULT_WORKERS + 8;
    let cluster = TestCluster::start(3, |node| {
        distributed_config(node, 2)
            .with_locking_mode(LockingMode::Pessimistic)
            .with_lock_acquisition_timeout(Duration::from_secs(10))
            .with_remote_timeout(Duration::from_secs(15))
    });
    let key = cluster.key_owned_by(&[2, 3]);

    let mut holder = cluster.node(1).begin();
    holder.put(key.clone(), "holder").unwrap();

    let start = Instant::now();
    let results: Vec<Result<Option<Value>>> = thread::scope(|scope| {
        let waiters: Vec<_> = (0..WAITERS)
            .map(|i| {
                let node = cluster.node(if i % 2 == 0 { 1 } else { 3 });
                let key = key.clone();
                scope.spawn(move || node.put(key, format!("waiter-{}", i)))
            })
            .collect();
        thread::sleep(Duration::from_millis(300));
        holder.commit().unwrap();
        waiters.into_iter().map(|waiter| waiter.join().unwrap()).collect()
    });

    assert!(start.elapsed() < Duration::from_secs(5), "took {:?}", start.elapsed());
    for result in results {
        result.unwrap();
    }
    let value = cluster.node(2).get(key.clone()).unwrap().unwrap();
    assert!(value.starts_with(b"waiter-"));
    for id in 1..=3 {
        assert_eq!(cluster.node(id).lock_manager().held_count(), 0);
    }
}

#[test]
fn test_lock_releasing_commands_skip_the_topology_check() {
    let gtx = GlobalTransactionId::new(1, 1);
    let unlock = ReplicableCommand::LockControl {
        gtx,
        topology_id: 1,
        keys: vec![Key::from("k")],
        unlock: true,
    };
    let lock = ReplicableCommand::LockControl {
        gtx,
        topology_id: 1,
        keys: vec![Key::from("k")],
        unlock: false,
    };
    let commit = ReplicableCommand::Commit {
        gtx,
        topology_id: 1,
        versions: Vec::new(),
    };

    for command in [&unlock, &commit, &rollback(1, 1)] {
        assert!(command.releases_locks(), "{}", command.name());
        assert!(!command.requires_topology_match(), "{}", command.name());
        assert_eq!(command.transaction_id(), Some(gtx));
    }
    assert!(!lock.releases_locks());
    assert!(lock.requires_topology_match());

    let topology = ReplicableCommand::GetTopology { topology_id: 1 };
    assert!(!topology.releases_locks());
    assert!(!topology.requires_topology_match());
    assert_eq!(topology.transaction_id(), None);
}
