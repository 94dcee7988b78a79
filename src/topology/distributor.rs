//! Partition placement.

use std::collections::{BTreeMap, BTreeSet};

use crate::topology::{MemberId, PartitionId, PartitionMetadata};

/// A strategy for assigning partition replicas to members.
pub trait PartitionDistributor: Send + Sync {
    /// Assign replicas of the given partitions to the given members.
    ///
    /// Returns one entry per partition, in the order of `partitions`. When fewer members than
    /// `replication_factor` are available, partitions get fewer replicas.
    fn distribute_partitions(&self, members: &BTreeSet<MemberId>, partitions: &[PartitionId], replication_factor: u32) -> Vec<PartitionMetadata>;
}

/// Round-robin placement with balanced failover priorities.
///
/// Partition `i` is placed on the `min(R, L)` members following `sorted[i % L]`, which is the
/// primary with priority `R`. The secondary priorities descend from `R - 1` during even cycles
/// over the member list and ascend from `1` during odd cycles, so that every member is the
/// first failover candidate for an even share of partitions.
#[derive(Clone, Copy, Debug, Default)]
pub struct RoundRobinPartitionDistributor;

impl PartitionDistributor for RoundRobinPartitionDistributor {
    fn distribute_partitions(&self, members: &BTreeSet<MemberId>, partitions: &[PartitionId], replication_factor: u32) -> Vec<PartitionMetadata> {
        let sorted: Vec<MemberId> = members.iter().copied().collect();
        let cluster_size = sorted.len();
        if cluster_size == 0 {
            tracing::warn!(partitions = partitions.len(), "no members available to distribute partitions to");
            return vec![];
        }
        // A partition always has a primary.
        let replication_factor = replication_factor.max(1);
        let replica_count = (replication_factor as usize).min(cluster_size);

        partitions
            .iter()
            .enumerate()
            .map(|(idx, id)| {
                let primary = sorted[idx % cluster_size];
                let ascending = (idx / cluster_size) % 2 == 1;
                let mut priorities = BTreeMap::new();
                priorities.insert(primary, replication_factor);
                for offset in 1..replica_count {
                    let priority = if ascending { offset as u32 } else { replication_factor - offset as u32 };
                    priorities.insert(sorted[(idx + offset) % cluster_size], priority);
                }
                PartitionMetadata {
                    id: id.clone(),
                    members: priorities.keys().copied().collect(),
                    priorities,
                    primary,
                }
            })
            .collect()
    }
}
