use mnemosyne::prelude::*;

use crate::common::{TestCluster, bytes, distributed_config};

#[test]
fn test_write_is_stored_on_owners_only() {
    let cluster = TestCluster::distributed(3, 2);
    let key = cluster.key_owned_by(&[2, 3]);

    assert_eq!(cluster.node(1).put(key.clone(), "v").unwrap(), None);

    assert_eq!(cluster.node(1).local_size(), 0);
    assert_eq!(cluster.node(2).local_size(), 1);
    assert_eq!(cluster.node(3).local_size(), 1);
    for id in 1..=3 {
        assert_eq!(cluster.node(id).get(key.clone()).unwrap(), Some(bytes("v")));
    }
}

#[test]
fn test_backups_receive_the_primary_version() {
    let cluster = TestCluster::distributed(3, 2);
    let key = cluster.key_owned_by(&[1, 2]);

    cluster.node(1).put(key.clone(), "v1").unwrap();
    cluster.node(3).put(key.clone(), "v2").unwrap();

    let primary = cluster.node(1).services().container().get(&key).unwrap();
    let backup = cluster.node(2).services().container().get(&key).unwrap();
    assert_eq!(primary.data(), &bytes("v2"));
    assert_eq!(primary.version(), backup.version());
}

#[test]
fn test_every_member_agrees_on_ownership() {
    let cluster = TestCluster::distributed(3, 2);
    for i in 0..100 {
        let key = Key::from(format!("key-{}", i));
        let owners = cluster.node(1).owners(key.clone());
        assert_eq!(owners.len(), 2);
        assert_eq!(cluster.node(2).owners(key.clone()), owners);
        assert_eq!(cluster.node(3).owners(key.clone()), owners);
        for id in 1..=3 {
            assert_eq!(cluster.node(id).is_local(key.clone()), owners.contains(&id));
        }
    }
}

#[test]
fn test_transaction_spanning_several_primaries() {
    let cluster = TestCluster::distributed(3, 2);
    let a = cluster.key_owned_by(&[1, 2]);
    let b = cluster.key_owned_by(&[2, 3]);
    let c = cluster.key_owned_by(&[3, 1]);

    let mut txn = cluster.node(2).begin();
    txn.put(a.clone(), "a").unwrap();
    txn.put(b.clone(), "b").unwrap();
    txn.put(c.clone(), "c").unwrap();
    assert_eq!(txn.get(c.clone()).unwrap(), Some(bytes("c")));
    txn.commit().unwrap();

    for id in 1..=3 {
        let node = cluster.node(id);
        assert_eq!(node.get(a.clone()).unwrap(), Some(bytes("a")));
        assert_eq!(node.get(b.clone()).unwrap(), Some(bytes("b")));
        assert_eq!(node.get(c.clone()).unwrap(), Some(bytes("c")));
        // Every member is an owner of exactly two of the three keys
        assert_eq!(node.local_size(), 2);
        assert_eq!(node.lock_manager().held_count(), 0);
        assert!(node.services().remote_transactions().is_empty());
    }
}

#[test]
fn test_conditional_operations_from_non_owner() {
    let cluster = TestCluster::distributed(3, 2);
    let key = cluster.key_owned_by(&[2, 3]);
    let client = cluster.node(1);

    assert_eq!(client.put_if_absent(key.clone(), "first").unwrap(), None);
    assert_eq!(
        client.put_if_absent(key.clone(), "second").unwrap(),
        Some(bytes("first"))
    );
    assert!(!client.replace_if(key.clone(), "stale", "x").unwrap());
    assert!(client.replace_if(key.clone(), "first", "third").unwrap());
    assert_eq!(cluster.node(2).get(key.clone()).unwrap(), Some(bytes("third")));

    assert!(client.remove_if(key.clone(), "third").unwrap());
    assert_eq!(cluster.node(3).get(key.clone()).unwrap(), None);
    assert_eq!(cluster.node(2).local_size(), 0);
}

#[test]
fn test_rollback_leaves_owners_untouched() {
    let cluster = TestCluster::distributed(3, 2);
    let key = cluster.key_owned_by(&[2, 3]);
    cluster.node(1).put(key.clone(), "v1").unwrap();

    let mut txn = cluster.node(1).begin();
    txn.put(key.clone(), "v2").unwrap();
    txn.rollback().unwrap();

    assert_eq!(cluster.node(2).get(key.clone()).unwrap(), Some(bytes("v1")));
    assert_eq!(cluster.node(3).get(key).unwrap(), Some(bytes("v1")));
}

#[test]
fn test_replicated_mode_copies_to_every_member() {
    let cluster = TestCluster::start(3, GridConfig::replicated);
    cluster
        .node(2)
        .put_all(vec![("a", "1"), ("b", "2")])
        .unwrap();

    for id in 1..=3 {
        let node = cluster.node(id);
        assert_eq!(node.local_size(), 2);
        assert!(node.is_local("a"));
        assert_eq!(node.owners("a").len(), 3);
        assert_eq!(node.get("b").unwrap(), Some(bytes("2")));
    }
}

#[test]
fn test_clear_reaches_every_member() {
    let cluster = TestCluster::distributed(3, 2);
    for i in 0..20 {
        cluster
            .node(1)
            .put(format!("key-{}", i), "v")
            .unwrap();
    }
    let total: usize = (1..=3).map(|id| cluster.node(id).local_size()).sum();
    assert_eq!(total, 40);

    cluster.node(2).clear().unwrap();
    for id in 1..=3 {
        assert_eq!(cluster.node(id).local_size(), 0);
    }
    assert_eq!(cluster.node(3).get("key-0").unwrap(), None);
}

#[test]
fn test_joiner_routes_with_the_running_topology() {
    let mut cluster = TestCluster::distributed(2, 2);
    let key = Key::from("before-join");
    cluster.node(1).put(key.clone(), "v").unwrap();

    cluster.join(distributed_config(3, 2));
    assert_eq!(cluster.node(3).topology_id(), 2);
    assert_eq!(cluster.node(1).topology_id(), 2);

    for i in 0..100 {
        let key = Key::from(format!("key-{}", i));
        assert_eq!(cluster.node(3).owners(key.clone()), cluster.node(1).owners(key.clone()));
        // Existing segments were already fully owned, so the joiner owns none
        assert!(!cluster.node(3).is_local(key));
    }

    assert_eq!(cluster.node(3).get(key.clone()).unwrap(), Some(bytes("v")));
    cluster.node(3).put("from-joiner", "j").unwrap();
    assert_eq!(cluster.node(1).local_size(), 2);
    assert_eq!(cluster.node(2).local_size(), 2);
    assert_eq!(cluster.node(3).local_size(), 0);
}
