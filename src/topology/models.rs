//! Cluster topology data model.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::utils;

/// The version of the bootstrap sentinel configuration.
pub const UNINITIALIZED_VERSION: i64 = -1;
/// The version of the first configuration of a cluster.
pub const INITIAL_VERSION: i64 = 1;

/// The ID of a cluster member.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberId(pub u32);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The ID of a partition within a named partition group.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionId {
    pub group: String,
    pub number: u32,
}

impl PartitionId {
    pub fn new(group: impl Into<String>, number: u32) -> Self {
        Self { group: group.into(), number }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.group, self.number)
    }
}

/// The placement of one partition: its replicas and their priorities.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionMetadata {
    pub id: PartitionId,
    pub members: BTreeSet<MemberId>,
    pub priorities: BTreeMap<MemberId, u32>,
    /// The member with the highest priority.
    pub primary: MemberId,
}

impl PartitionMetadata {
    /// Build the metadata of a partition from the priorities of its replicas.
    ///
    /// Returns `None` when there are no replicas, as a partition always has a primary.
    pub fn from_priorities(id: PartitionId, priorities: BTreeMap<MemberId, u32>) -> Option<Self> {
        // Ties resolve to the lowest member id.
        let primary = priorities
            .iter()
            .max_by(|(a_id, a_prio), (b_id, b_prio)| a_prio.cmp(b_prio).then_with(|| b_id.cmp(a_id)))
            .map(|(id, _)| *id)?;
        Some(Self {
            id,
            members: priorities.keys().copied().collect(),
            priorities,
            primary,
        })
    }

    /// The priority of the given member, if it is a replica.
    pub fn priority(&self, member: MemberId) -> Option<u32> {
        self.priorities.get(&member).copied()
    }
}

/// The state of a replica or member along its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionStatus {
    Joining,
    Active,
    Leaving,
}

/// The state of an exporter on a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExporterState {
    Enabled,
    Disabled,
}

/// Configuration of a partition which may change at runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DynamicPartitionConfig {
    pub exporters: BTreeMap<String, ExporterState>,
}

/// The state of one partition replica hosted by a member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionState {
    pub state: PartitionStatus,
    pub priority: u32,
    pub config: DynamicPartitionConfig,
}

impl PartitionState {
    pub fn active(priority: u32, config: DynamicPartitionConfig) -> Self {
        Self { state: PartitionStatus::Active, priority, config }
    }

    pub fn joining(priority: u32, config: DynamicPartitionConfig) -> Self {
        Self { state: PartitionStatus::Joining, priority, config }
    }

    pub fn to_leaving(&self) -> Self {
        Self { state: PartitionStatus::Leaving, ..self.clone() }
    }

    pub fn to_active(&self) -> Self {
        Self { state: PartitionStatus::Active, ..self.clone() }
    }

    pub fn with_priority(&self, priority: u32) -> Self {
        Self { priority, ..self.clone() }
    }
}

/// The lifecycle state of a member.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberStatus {
    Joining,
    Active,
    Leaving,
}

/// The state of one cluster member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberState {
    pub state: MemberStatus,
    /// The member's partition replicas, by partition number.
    pub partitions: BTreeMap<u32, PartitionState>,
}

impl MemberState {
    pub fn new(state: MemberStatus, partitions: BTreeMap<u32, PartitionState>) -> Self {
        Self { state, partitions }
    }

    pub fn with_state(&self, state: MemberStatus) -> Self {
        Self { state, ..self.clone() }
    }

    /// Return a copy of this member with the given partition replaced.
    pub fn with_partition(&self, partition: u32, state: PartitionState) -> Self {
        let mut next = self.clone();
        next.partitions.insert(partition, state);
        next
    }

    /// Return a copy of this member without the given partition.
    pub fn without_partition(&self, partition: u32) -> Self {
        let mut next = self.clone();
        next.partitions.remove(&partition);
        next
    }

    pub fn has_partition(&self, partition: u32) -> bool {
        self.partitions.contains_key(&partition)
    }
}

/// Routing information, present when partition count scaling is enabled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingState {
    pub partition_count: u32,
}

/// The status of a topology change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// The ID of a topology change.
pub type ChangeId = i64;

/// A single step of a topology change, executed by `member`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigurationChangeOperation {
    /// Add a new member to the cluster.
    MemberJoin { member: MemberId },
    /// Remove a member without partitions from the cluster.
    MemberLeave { member: MemberId },
    /// Remove `member_to_remove` from the cluster on its behalf, used when it is unreachable.
    MemberRemove { member: MemberId, member_to_remove: MemberId },
    /// Start a new replica of a partition.
    PartitionJoin { member: MemberId, partition: u32, priority: u32 },
    /// Stop a replica of a partition.
    PartitionLeave { member: MemberId, partition: u32 },
    /// Change the priority of a replica.
    PartitionReconfigurePriority { member: MemberId, partition: u32, priority: u32 },
    /// Shrink the replica set of a partition to `members` without consensus from removed replicas.
    PartitionForceReconfigure { member: MemberId, partition: u32, members: BTreeSet<MemberId> },
}

impl ConfigurationChangeOperation {
    /// The member which executes this operation.
    pub fn member(&self) -> MemberId {
        match self {
            Self::MemberJoin { member }
            | Self::MemberLeave { member }
            | Self::MemberRemove { member, .. }
            | Self::PartitionJoin { member, .. }
            | Self::PartitionLeave { member, .. }
            | Self::PartitionReconfigurePriority { member, .. }
            | Self::PartitionForceReconfigure { member, .. } => *member,
        }
    }
}

impl fmt::Display for ConfigurationChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemberJoin { member } => write!(f, "member {} joins", member),
            Self::MemberLeave { member } => write!(f, "member {} leaves", member),
            Self::MemberRemove { member, member_to_remove } => write!(f, "member {} removes member {}", member, member_to_remove),
            Self::PartitionJoin { member, partition, priority } => {
                write!(f, "member {} joins partition {} with priority {}", member, partition, priority)
            }
            Self::PartitionLeave { member, partition } => write!(f, "member {} leaves partition {}", member, partition),
            Self::PartitionReconfigurePriority { member, partition, priority } => {
                write!(f, "member {} sets priority of partition {} to {}", member, partition, priority)
            }
            Self::PartitionForceReconfigure { member, partition, members } => {
                write!(f, "member {} force reconfigures partition {} to members {:?}", member, partition, members)
            }
        }
    }
}

/// An operation of a change plan which has been applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedOperation {
    pub operation: ConfigurationChangeOperation,
    pub completed_at: i64,
}

/// An in-flight topology change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterChangePlan {
    pub id: ChangeId,
    /// The member driving this change.
    pub coordinator: MemberId,
    pub status: ChangeStatus,
    pub started_at: i64,
    pub pending_operations: Vec<ConfigurationChangeOperation>,
    pub completed_operations: Vec<CompletedOperation>,
}

impl ClusterChangePlan {
    pub fn new(id: ChangeId, coordinator: MemberId, operations: Vec<ConfigurationChangeOperation>) -> Self {
        Self {
            id,
            coordinator,
            status: ChangeStatus::InProgress,
            started_at: utils::now_millis(),
            pending_operations: operations,
            completed_operations: vec![],
        }
    }

    /// The next operation to apply, if any.
    pub fn next_operation(&self) -> Option<&ConfigurationChangeOperation> {
        self.pending_operations.first()
    }

    /// Return a copy of this plan with its next operation marked as completed.
    pub fn advance(&self) -> Self {
        let mut next = self.clone();
        if !next.pending_operations.is_empty() {
            let operation = next.pending_operations.remove(0);
            next.completed_operations.push(CompletedOperation {
                operation,
                completed_at: utils::now_millis(),
            });
        }
        next
    }
}

/// The record of the last finished topology change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedChange {
    pub id: ChangeId,
    pub status: ChangeStatus,
    pub started_at: i64,
    pub completed_at: i64,
}

/// An immutable, versioned snapshot of the cluster topology.
///
/// All updates return a new value; instances are never mutated once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterConfiguration {
    pub version: i64,
    pub members: BTreeMap<MemberId, MemberState>,
    pub pending_change: Option<ClusterChangePlan>,
    pub last_change: Option<CompletedChange>,
    pub routing: Option<RoutingState>,
    pub cluster_id: Option<String>,
}

impl ClusterConfiguration {
    /// The bootstrap sentinel, used before any configuration is known.
    pub fn uninitialized() -> Self {
        Self {
            version: UNINITIALIZED_VERSION,
            members: BTreeMap::new(),
            pending_change: None,
            last_change: None,
            routing: None,
            cluster_id: None,
        }
    }

    pub fn is_uninitialized(&self) -> bool {
        self.version == UNINITIALIZED_VERSION
    }

    /// The member responsible for serializing topology changes: the lowest member.
    pub fn coordinator(&self) -> Option<MemberId> {
        self.members.keys().next().copied()
    }

    /// The ID of the pending change, if any.
    pub fn pending_change_id(&self) -> Option<ChangeId> {
        self.pending_change.as_ref().map(|plan| plan.id)
    }

    pub fn has_pending_change(&self) -> bool {
        self.pending_change.is_some()
    }

    pub fn member(&self, id: MemberId) -> Option<&MemberState> {
        self.members.get(&id)
    }

    pub fn has_member(&self, id: MemberId) -> bool {
        self.members.contains_key(&id)
    }

    /// All partition numbers hosted in the cluster, in order.
    pub fn partitions(&self) -> BTreeSet<u32> {
        self.members.values().flat_map(|member| member.partitions.keys().copied()).collect()
    }

    /// The replicas of the given partition, in any state, with their state.
    pub fn replicas(&self, partition: u32) -> BTreeMap<MemberId, &PartitionState> {
        self.members
            .iter()
            .filter_map(|(id, member)| member.partitions.get(&partition).map(|state| (*id, state)))
            .collect()
    }

    /// Return a copy of this configuration with the given member added or replaced.
    pub fn with_member(&self, id: MemberId, state: MemberState) -> Self {
        let mut next = self.clone();
        next.members.insert(id, state);
        next
    }

    /// Return a copy of this configuration with the given member updated via `f`.
    ///
    /// Returns `None` if the member does not exist.
    pub fn update_member<F>(&self, id: MemberId, f: F) -> Option<Self>
    where
        F: FnOnce(&MemberState) -> MemberState,
    {
        let member = self.members.get(&id)?;
        Some(self.with_member(id, f(member)))
    }

    /// Return a copy of this configuration without the given member.
    pub fn without_member(&self, id: MemberId) -> Self {
        let mut next = self.clone();
        next.members.remove(&id);
        next
    }

    pub fn with_routing(&self, routing: Option<RoutingState>) -> Self {
        Self { routing, ..self.clone() }
    }

    /// Return a copy of this configuration with the given change pending.
    pub fn start_change(&self, plan: ClusterChangePlan) -> Self {
        Self {
            pending_change: Some(plan),
            ..self.clone()
        }
    }

    /// Return a copy of this configuration with the pending plan replaced.
    pub fn with_pending_change(&self, plan: ClusterChangePlan) -> Self {
        self.start_change(plan)
    }

    /// Return the configuration which results from completing the pending change.
    ///
    /// The version is bumped and the change is recorded as the last change.
    pub fn complete_change(&self) -> Self {
        let last_change = self.pending_change.as_ref().map(|plan| CompletedChange {
            id: plan.id,
            status: ChangeStatus::Completed,
            started_at: plan.started_at,
            completed_at: utils::now_millis(),
        });
        Self {
            version: self.version + 1,
            pending_change: None,
            last_change: last_change.or_else(|| self.last_change.clone()),
            ..self.clone()
        }
    }
}
