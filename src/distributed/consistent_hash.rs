use ahash::AHashMap as HashMap;
use arc_swap::ArcSwap;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::distributed::View;
use crate::{Key, NodeId};

/// Immutable assignment of segments to ordered owner lists.
///
/// Element 0 of each owner list is the primary owner. The key-to-segment
/// hash is CRC32, so every member maps a key to the same segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistentHash {
    num_owners: usize,
    members: Vec<NodeId>,
    segment_owners: Vec<Vec<NodeId>>,
}

impl ConsistentHash {
    pub fn num_segments(&self) -> usize {
        self.segment_owners.len()
    }

    /// Configured replication factor. Owner lists are shorter when the view
    /// has fewer members.
    pub fn num_owners(&self) -> usize {
        self.num_owners
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn segment_of(&self, key: &Key) -> usize {
        crc32fast::hash(key) as usize % self.segment_owners.len()
    }

    pub fn segment_owners(&self, segment: usize) -> &[NodeId] {
        &self.segment_owners[segment]
    }

    pub fn owners(&self, key: &Key) -> &[NodeId] {
        self.segment_owners(self.segment_of(key))
    }

    pub fn primary_owner(&self, key: &Key) -> Option<NodeId> {
        self.owners(key).first().copied()
    }

    pub fn is_owner(&self, key: &Key, node: NodeId) -> bool {
        self.owners(key).contains(&node)
    }

    pub fn is_primary(&self, key: &Key, node: NodeId) -> bool {
        self.primary_owner(key) == Some(node)
    }

    /// Primary owner of every segment, in segment order.
    pub fn primaries(&self) -> Vec<Option<NodeId>> {
        self.segment_owners
            .iter()
            .map(|owners| owners.first().copied())
            .collect()
    }

    pub fn segments_owned_by(&self, node: NodeId) -> Vec<usize> {
        (0..self.segment_owners.len())
            .filter(|segment| self.segment_owners[*segment].contains(&node))
            .collect()
    }
}

/// Builds consistent hashes and rebuilds them on membership changes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsistentHashFactory;

impl ConsistentHashFactory {
    /// Balanced initial assignment: segment `s` is primarily owned by member
    /// `s mod n`, with backups taken from the following members.
    ///
    /// # Examples
    ///
    /// ```
    /// use mnemosyne::distributed::consistent_hash::ConsistentHashFactory;
    ///
    /// let ch = ConsistentHashFactory.create(&[1, 2, 3], 1, 3);
    /// assert_eq!(ch.primaries(), vec![Some(1), Some(2), Some(3)]);
    /// ```
    pub fn create(&self, members: &[NodeId], num_owners: usize, num_segments: usize) -> ConsistentHash {
        let num_segments = num_segments.max(1);
        let owners_per_segment = num_owners.min(members.len());
        let segment_owners = (0..num_segments)
            .map(|segment| {
                (0..owners_per_segment)
                    .map(|i| members[(segment + i) % members.len()])
                    .collect()
            })
            .collect();
        ConsistentHash {
            num_owners,
            members: members.to_vec(),
            segment_owners,
        }
    }

    /// Sticky rehash onto a new member list.
    ///
    /// Surviving owners keep their segments in their previous order, so a
    /// segment's primary only changes when its primary left. Segments left
    /// without enough owners are topped up with the least-loaded members,
    /// ties going to the member listed first.
    ///
    /// # Examples
    ///
    /// ```
    /// use mnemosyne::distributed::consistent_hash::ConsistentHashFactory;
    ///
    /// let factory = ConsistentHashFactory;
    /// let ch = factory.create(&[1, 2, 3], 1, 3);
    /// let ch = factory.update_members(&ch, &[2, 3]);
    /// assert_eq!(ch.primaries(), vec![Some(2), Some(2), Some(3)]);
    /// let ch = factory.update_members(&ch, &[3]);
    /// assert_eq!(ch.primaries(), vec![Some(3), Some(3), Some(3)]);
    /// ```
    pub fn update_members(&self, previous: &ConsistentHash, members: &[NodeId]) -> ConsistentHash {
        let owners_per_segment = previous.num_owners.min(members.len());
        let mut segment_owners: Vec<Vec<NodeId>> = previous
            .segment_owners
            .iter()
            .map(|owners| {
                owners
                    .iter()
                    .copied()
                    .filter(|owner| members.contains(owner))
                    .collect()
            })
            .collect();

        let mut load: HashMap<NodeId, usize> = members.iter().map(|m| (*m, 0)).collect();
        for owners in &segment_owners {
            for owner in owners {
                *load.entry(*owner).or_insert(0) += 1;
            }
        }

        for owners in segment_owners.iter_mut() {
            while owners.len() < owners_per_segment {
                let candidate = members
                    .iter()
                    .copied()
                    .filter(|member| !owners.contains(member))
                    .min_by_key(|member| load.get(member).copied().unwrap_or(0));
                match candidate {
                    Some(member) => {
                        owners.push(member);
                        *load.entry(member).or_insert(0) += 1;
                    }
                    None => break,
                }
            }
        }

        ConsistentHash {
            num_owners: previous.num_owners,
            members: members.to_vec(),
            segment_owners,
        }
    }
}

/// The routing table pinned by one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheTopology {
    /// Equal to the id of the view the hash was computed for, hence the same
    /// on every member.
    pub topology_id: u64,
    pub hash: ConsistentHash,
}

impl CacheTopology {
    /// Groups `keys` by every owner they have.
    pub fn keys_by_owner<'a>(&self, keys: impl IntoIterator<Item = &'a Key>) -> HashMap<NodeId, Vec<Key>> {
        let mut grouped: HashMap<NodeId, Vec<Key>> = HashMap::new();
        for key in keys {
            for owner in self.hash.owners(key) {
                grouped.entry(*owner).or_default().push(key.clone());
            }
        }
        grouped
    }

    /// Groups `keys` by their primary owner.
    pub fn keys_by_primary<'a>(&self, keys: impl IntoIterator<Item = &'a Key>) -> HashMap<NodeId, Vec<Key>> {
        let mut grouped: HashMap<NodeId, Vec<Key>> = HashMap::new();
        for key in keys {
            if let Some(primary) = self.hash.primary_owner(key) {
                grouped.entry(primary).or_default().push(key.clone());
            }
        }
        grouped
    }
}

/// Holds the current [`CacheTopology`] of one node.
///
/// Readers load an `Arc` snapshot and keep using it for the whole operation;
/// a view change swaps in a new snapshot atomically.
pub struct DistributionManager {
    local: NodeId,
    factory: ConsistentHashFactory,
    topology: ArcSwap<CacheTopology>,
}

impl DistributionManager {
    pub fn new(local: NodeId, view: &View, num_owners: usize, num_segments: usize) -> Self {
        let factory = ConsistentHashFactory;
        let hash = factory.create(&view.members, num_owners, num_segments);
        Self {
            local,
            factory,
            topology: ArcSwap::from_pointee(CacheTopology {
                topology_id: view.id,
                hash,
            }),
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local
    }

    pub fn topology(&self) -> Arc<CacheTopology> {
        self.topology.load_full()
    }

    pub fn topology_id(&self) -> u64 {
        self.topology.load().topology_id
    }

    pub fn owners(&self, key: &Key) -> Vec<NodeId> {
        self.topology.load().hash.owners(key).to_vec()
    }

    pub fn primary_owner(&self, key: &Key) -> Option<NodeId> {
        self.topology.load().hash.primary_owner(key)
    }

    pub fn is_local(&self, key: &Key) -> bool {
        self.topology.load().hash.is_owner(key, self.local)
    }

    /// Replaces the local topology with one computed by another member.
    ///
    /// Used by a joiner so that it routes with the hash the existing members
    /// rehashed to instead of a freshly balanced one. Older topologies are
    /// ignored.
    ///
    /// # Returns
    ///
    /// `true` if `topology` was installed.
    pub fn adopt(&self, topology: CacheTopology) -> bool {
        if topology.topology_id < self.topology_id() {
            return false;
        }
        info!(
            "Node {} adopted topology {} over {:?}",
            self.local,
            topology.topology_id,
            topology.hash.members()
        );
        self.topology.store(Arc::new(topology));
        true
    }

    /// Rehashes onto `view` unless it is not newer than the current topology.
    pub fn on_view_change(&self, view: &View) {
        let current = self.topology.load_full();
        if view.id <= current.topology_id {
            return;
        }
        let hash = self.factory.update_members(&current.hash, &view.members);
        info!(
            "Node {} installed topology {} over {:?}",
            self.local, view.id, view.members
        );
        self.topology.store(Arc::new(CacheTopology {
            topology_id: view.id,
            hash,
        }));
    }
}
