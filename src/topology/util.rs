//! Conversions between the distribution view & the configuration view of a cluster.

use std::collections::BTreeMap;

use crate::topology::{
    ClusterConfiguration, DynamicPartitionConfig, MemberId, MemberState, MemberStatus, PartitionId, PartitionMetadata, PartitionState, PartitionStatus,
    INITIAL_VERSION,
};

/// Structural errors in cluster configurations.
///
/// These indicate a bug elsewhere in the system and are never recovered from.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("expected a cluster configuration, but the configuration is uninitialized")]
    Uninitialized,
    #[error("partition {0} has no members")]
    PartitionWithoutMembers(PartitionId),
}

/// Build the initial cluster configuration from a partition distribution.
pub fn from_distribution(distribution: &[PartitionMetadata], config: &DynamicPartitionConfig, cluster_id: Option<String>) -> ClusterConfiguration {
    let mut members: BTreeMap<MemberId, BTreeMap<u32, PartitionState>> = BTreeMap::new();
    for partition in distribution {
        for member in partition.members.iter() {
            let priority = partition.priority(*member).unwrap_or_default();
            members
                .entry(*member)
                .or_default()
                .insert(partition.id.number, PartitionState::active(priority, config.clone()));
        }
    }
    ClusterConfiguration {
        version: INITIAL_VERSION,
        members: members
            .into_iter()
            .map(|(id, partitions)| (id, MemberState::new(MemberStatus::Active, partitions)))
            .collect(),
        cluster_id,
        ..ClusterConfiguration::uninitialized()
    }
}

/// Compute the partition distribution described by the given configuration.
///
/// Only replicas which are active or leaving are included, as joining replicas are not yet ready
/// to be started by dependents.
pub fn to_distribution(configuration: &ClusterConfiguration, group: &str) -> Result<Vec<PartitionMetadata>, ConfigurationError> {
    if configuration.is_uninitialized() {
        return Err(ConfigurationError::Uninitialized);
    }
    let mut partitions: BTreeMap<u32, BTreeMap<MemberId, u32>> = BTreeMap::new();
    for (member, state) in configuration.members.iter() {
        for (partition, replica) in state.partitions.iter() {
            if matches!(replica.state, PartitionStatus::Active | PartitionStatus::Leaving) {
                partitions.entry(*partition).or_default().insert(*member, replica.priority);
            }
        }
    }
    partitions
        .into_iter()
        .map(|(number, priorities)| {
            let id = PartitionId::new(group, number);
            PartitionMetadata::from_priorities(id.clone(), priorities).ok_or(ConfigurationError::PartitionWithoutMembers(id))
        })
        .collect()
}
