use std::sync::Barrier;
use std::thread;
use std::time::{Duration, Instant};

use mnemosyne::distributed::consistent_hash::ConsistentHashFactory;
use mnemosyne::prelude::*;

use crate::common::{TestCluster, bytes, distributed_config, init_logging, wait_for_condition};

const LONG_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

fn pessimistic_cluster(size: u64) -> TestCluster {
    TestCluster::start(size, |node| {
        distributed_config(node, 2).with_locking_mode(LockingMode::Pessimistic)
    })
}

/// Runs `first` on one thread and `second` on another, both released by the
/// same barrier right before committing.
fn commit_together<A, B>(first: A, second: B) -> (Result<()>, Result<()>, Duration)
where
    A: FnOnce(&Barrier) -> Result<()> + Send,
    B: FnOnce(&Barrier) -> Result<()> + Send,
{
    let barrier = Barrier::new(2);
    let start = Instant::now();
    let (r1, r2) = thread::scope(|scope| {
        let h1 = scope.spawn(|| first(&barrier));
        let h2 = scope.spawn(|| second(&barrier));
        (h1.join().unwrap(), h2.join().unwrap())
    });
    (r1, r2, start.elapsed())
}

#[test]
fn test_clustered_write_skew_detected_on_primary() {
    // T1 reads remotely from node 1, T2 reads on backup node 3. T1 commits
    // first, so T2's prepare must be refused by the primary (node 2).
    let cluster = TestCluster::distributed(3, 2);
    let key = cluster.key_owned_by(&[2, 3]);
    cluster.node(1).put(key.clone(), "v0").unwrap();

    let mut t1 = cluster.node(1).begin();
    let mut t2 = cluster.node(3).begin();
    assert_eq!(t1.get(key.clone()).unwrap(), Some(bytes("v0")));
    assert_eq!(t2.get(key.clone()).unwrap(), Some(bytes("v0")));

    t1.put(key.clone(), "t1").unwrap();
    t1.commit().unwrap();

    t2.put(key.clone(), "t2").unwrap();
    let err = t2.commit().unwrap_err();
    assert!(matches!(err, MnemosyneError::WriteSkew { .. }), "{:?}", err);

    for id in 1..=3 {
        assert_eq!(cluster.node(id).get(key.clone()).unwrap(), Some(bytes("t1")));
        assert_eq!(cluster.node(id).lock_manager().held_count(), 0);
        assert!(cluster.node(id).services().remote_transactions().is_empty());
    }
}

#[test]
fn test_consistent_hash_is_sticky_when_members_leave() {
    let factory = ConsistentHashFactory;
    let hash = factory.create(&[1, 2, 3], 1, 3);
    assert_eq!(hash.primaries(), vec![Some(1), Some(2), Some(3)]);

    let hash = factory.update_members(&hash, &[2, 3]);
    assert_eq!(hash.primaries(), vec![Some(2), Some(2), Some(3)]);

    let hash = factory.update_members(&hash, &[3]);
    assert_eq!(hash.primaries(), vec![Some(3), Some(3), Some(3)]);
}

#[test]
fn test_rehash_tops_up_backups() {
    let factory = ConsistentHashFactory;
    let hash = factory.create(&[1, 2, 3], 2, 6);
    let hash = factory.update_members(&hash, &[1, 2]);
    for segment in 0..hash.num_segments() {
        let owners = hash.segment_owners(segment);
        assert_eq!(owners.len(), 2, "segment {} owners {:?}", segment, owners);
        assert_ne!(owners[0], owners[1]);
    }
    assert_eq!(hash.members(), &[1, 2]);
}

#[test]
fn test_data_survives_single_crash() {
    let cluster = TestCluster::distributed(3, 2);
    let keys: Vec<Key> = (0..30).map(|i| Key::from(format!("item-{}", i))).collect();
    let mut primaries = Vec::new();
    for key in &keys {
        cluster.node(1).put(key.clone(), key.clone()).unwrap();
        primaries.push(cluster.node(1).primary_owner(key.clone()).unwrap());
    }

    cluster.crash(3);
    assert_eq!(cluster.node(1).topology_id(), 2);
    assert_eq!(cluster.node(2).topology_id(), 2);

    for (key, before) in keys.iter().zip(primaries) {
        let owners = cluster.node(1).owners(key.clone());
        assert!(!owners.contains(&3));
        assert_eq!(owners.len(), 2);
        assert_eq!(cluster.node(2).owners(key.clone()), owners);
        if before != 3 {
            assert_eq!(owners[0], before, "primary of {:?} moved", key);
        }
        // The new primary was an owner before the crash and holds the entry
        let primary = cluster.node(owners[0]);
        assert_eq!(primary.get(key.clone()).unwrap(), Some(key.clone()));
    }
}

#[test]
fn test_orphaned_remote_locks_released_when_originator_crashes() {
    let cluster = pessimistic_cluster(3);
    let key = cluster.key_owned_by(&[2, 3]);

    let mut txn = cluster.node(1).begin();
    txn.put(key.clone(), "doomed").unwrap();
    let gtx = txn.id();
    assert!(cluster.node(2).lock_manager().is_held_by(&key, LockOwner::Transaction(gtx)));
    assert!(cluster.node(2).services().remote_transactions().contains(&gtx));

    cluster.crash(1);
    assert!(wait_for_condition(
        || cluster.node(2).lock_manager().held_count() == 0,
        Duration::from_secs(2)
    ));
    assert!(cluster.node(2).services().remote_transactions().is_empty());
    assert!(cluster.node(2).services().remote_transactions().is_completed(&gtx));

    // The survivors can use the key straight away
    cluster.node(3).put(key.clone(), "after").unwrap();
    assert_eq!(cluster.node(2).get(key).unwrap(), Some(bytes("after")));
    drop(txn);
}

#[test]
fn test_pessimistic_lock_taken_on_remote_primary() {
    let cluster = pessimistic_cluster(3);
    let key = cluster.key_owned_by(&[2, 3]);

    let mut holder = cluster.node(1).begin();
    holder.put(key.clone(), "holder").unwrap();
    assert!(
        cluster
            .node(2)
            .lock_manager()
            .is_held_by(&key, LockOwner::Transaction(holder.id()))
    );
    assert!(!cluster.node(3).lock_manager().is_held_by_anyone(&key));

    let start = Instant::now();
    let mut contender = cluster.node(3).begin();
    let err = contender.put(key.clone(), "contender").unwrap_err();
    assert!(matches!(err, MnemosyneError::LockTimeout { .. }), "{:?}", err);
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(contender.state(), TransactionState::RolledBack);

    holder.commit().unwrap();
    for id in 1..=3 {
        assert_eq!(cluster.node(id).get(key.clone()).unwrap(), Some(bytes("holder")));
        assert_eq!(cluster.node(id).lock_manager().held_count(), 0);
    }
}

#[test]
fn test_stale_topology_refused_then_recovered() {
    init_logging();
    let network = InMemoryNetwork::new().unwrap();
    // Each member gets its own membership so their views can diverge
    let first_view = InMemoryMembership::new(View::new(1, vec![1, 2]));
    let second_view = InMemoryMembership::new(View::new(1, vec![1, 2]));
    let node1 =
        Mnemosyne::clustered(distributed_config(1, 1), None, first_view.clone(), &network).unwrap();
    let node2 =
        Mnemosyne::clustered(distributed_config(2, 1), None, second_view.clone(), &network).unwrap();

    let key = (0..1000)
        .map(|i| Key::from(format!("key-{}", i)))
        .find(|key| node1.owners(key.clone()) == vec![2])
        .unwrap();

    second_view.install_view(View::new(2, vec![1, 2])).unwrap();
    assert_eq!(node2.topology_id(), 2);
    assert_eq!(node1.topology_id(), 1);

    let err = node1.put(key.clone(), "v").unwrap_err();
    assert!(
        matches!(err, MnemosyneError::StaleTopology { expected: 2, actual: 1 }),
        "{:?}",
        err
    );
    assert!(err.is_retryable());
    assert_eq!(node2.local_size(), 0);

    first_view.install_view(View::new(2, vec![1, 2])).unwrap();
    node1.put(key.clone(), "v").unwrap();
    assert_eq!(node2.get(key).unwrap(), Some(bytes("v")));
    assert_eq!(node2.lock_manager().held_count(), 0);
}

#[test]
fn test_concurrent_conflict_across_members_resolves_by_write_skew() {
    // Both members own every key, so each coordinator also locks the key
    // locally. The conflict must be decided on the primary, not by a timeout.
    let cluster = TestCluster::start(2, |node| {
        GridConfig::replicated(node).with_lock_acquisition_timeout(LONG_LOCK_TIMEOUT)
    });

    for round in 0..30 {
        let key = Key::from(format!("contended-{}", round));
        cluster.node(1).put(key.clone(), "v0").unwrap();

        let run = |id: NodeId, value: &'static str| {
            let node = cluster.node(id);
            let key = key.clone();
            move |barrier: &Barrier| {
                let mut txn = node.begin();
                assert_eq!(txn.get(key.clone()).unwrap(), Some(bytes("v0")));
                txn.put(key, value).unwrap();
                barrier.wait();
                txn.commit()
            }
        };
        let (r1, r2, elapsed) = commit_together(run(1, "from-1"), run(2, "from-2"));

        assert!(
            elapsed < Duration::from_secs(2),
            "round {} took {:?}: {:?} / {:?}",
            round,
            elapsed,
            r1,
            r2
        );
        let winner = match (&r1, &r2) {
            (Ok(()), Err(MnemosyneError::WriteSkew { .. })) => "from-1",
            (Err(MnemosyneError::WriteSkew { .. }), Ok(())) => "from-2",
            other => panic!("round {}: expected one commit and one write skew, got {:?}", round, other),
        };
        for id in 1..=2 {
            assert_eq!(cluster.node(id).get(key.clone()).unwrap(), Some(bytes(winner)));
            assert_eq!(cluster.node(id).lock_manager().held_count(), 0);
        }
    }
}

#[test]
fn test_crossing_transactions_do_not_deadlock() {
    // Each coordinator is primary of one key and backup of the other
    let cluster = TestCluster::start(3, |node| {
        distributed_config(node, 2).with_lock_acquisition_timeout(LONG_LOCK_TIMEOUT)
    });
    let a = cluster.key_owned_by(&[1, 2]);
    let b = cluster.key_owned_by(&[2, 1]);

    for round in 0..20 {
        let run = |id: NodeId, value: String| {
            let node = cluster.node(id);
            let (a, b) = (a.clone(), b.clone());
            move |barrier: &Barrier| {
                let mut txn = node.begin();
                txn.put_blind(a, value.clone())?;
                txn.put_blind(b, value)?;
                barrier.wait();
                txn.commit()
            }
        };
        let (r1, r2, elapsed) = commit_together(
            run(1, format!("node-1-{}", round)),
            run(2, format!("node-2-{}", round)),
        );

        r1.unwrap();
        r2.unwrap();
        assert!(elapsed < Duration::from_secs(2), "round {} took {:?}", round, elapsed);
        // The transactions were serialized: both keys hold the later one's value
        let value_a = cluster.node(3).get(a.clone()).unwrap();
        assert_eq!(cluster.node(3).get(b.clone()).unwrap(), value_a);
        for id in 1..=3 {
            assert_eq!(cluster.node(id).lock_manager().held_count(), 0);
        }
    }
}

#[test]
fn test_coordinator_store_failure_rolls_back_everywhere() {
    let (cluster, stores) = TestCluster::with_stores(2, 2);
    let key = cluster.key_owned_by(&[1, 2]);
    stores[0].fail_writes(true);

    let err = cluster.node(1).put(key.clone(), "v").unwrap_err();
    assert!(matches!(err, MnemosyneError::Store(_)), "{:?}", err);

    for id in 1..=2 {
        let node = cluster.node(id);
        assert_eq!(node.services().container().get(&key), None);
        assert_eq!(node.lock_manager().held_count(), 0);
        assert!(node.services().remote_transactions().is_empty());
    }
    assert_eq!(stores[1].len(), 0);
    assert_eq!(cluster.node(1).stats().commits, 0);
    assert_eq!(cluster.node(1).stats().rollbacks, 1);

    stores[0].fail_writes(false);
    cluster.node(1).put(key.clone(), "v").unwrap();
    assert_eq!(cluster.node(2).get(key).unwrap(), Some(bytes("v")));
}

#[test]
fn test_remote_store_failure_keeps_owners_in_step() {
    // Node 2 coordinates and applies first; the primary's store then fails
    // after the outcome was decided.
    let (cluster, stores) = TestCluster::with_stores(2, 2);
    let key = cluster.key_owned_by(&[1, 2]);
    stores[0].fail_writes(true);

    cluster.node(2).put(key.clone(), "v").unwrap();

    let primary = cluster.node(1).services().container().get(&key).unwrap();
    let backup = cluster.node(2).services().container().get(&key).unwrap();
    assert_eq!(primary.data(), &bytes("v"));
    assert_eq!(backup.data(), &bytes("v"));
    assert_eq!(primary.version(), backup.version());
    assert_eq!(stores[0].len(), 0);
    assert_eq!(stores[1].len(), 1);
    for id in 1..=2 {
        assert_eq!(cluster.node(id).lock_manager().held_count(), 0);
    }
}
