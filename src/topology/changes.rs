//! Topology change planning.
//!
//! A management request is converted into an ordered list of change operations. Each operation
//! moves the configuration through an intermediate state when started, and into its final state
//! when completed. Planning simulates the whole list against the current configuration, so an
//! invalid request is rejected before anything is applied.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::topology::api::{ErrorResponse, ManagementRequest, ScaleRequest};
use crate::topology::{
    ClusterConfiguration, ConfigurationChangeOperation, MemberId, MemberState, MemberStatus, PartitionDistributor, PartitionId, PartitionState,
    PartitionStatus,
};

type Op = ConfigurationChangeOperation;

/// The outcome of planning a change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedChange {
    /// The operations to apply, in order.
    pub operations: Vec<Op>,
    /// The configuration expected once every operation has been applied.
    pub expected: ClusterConfiguration,
}

impl ConfigurationChangeOperation {
    /// Apply the start step of this operation, yielding the intermediate configuration.
    pub fn start(&self, config: &ClusterConfiguration) -> Result<ClusterConfiguration, ErrorResponse> {
        match self {
            Self::MemberJoin { member } => {
                if config.has_member(*member) {
                    return Err(ErrorResponse::invalid_request(format!("member {} is already part of the cluster", member)));
                }
                Ok(config.with_member(*member, MemberState::new(MemberStatus::Joining, BTreeMap::new())))
            }
            Self::MemberLeave { member } => {
                let state = known_member(config, *member)?;
                if !state.partitions.is_empty() {
                    return Err(ErrorResponse::invalid_request(format!(
                        "member {} cannot leave while it still hosts partitions {:?}",
                        member,
                        state.partitions.keys().collect::<Vec<_>>()
                    )));
                }
                Ok(config.with_member(*member, state.with_state(MemberStatus::Leaving)))
            }
            Self::MemberRemove { member_to_remove, .. } => {
                let state = known_member(config, *member_to_remove)?;
                Ok(config.with_member(*member_to_remove, state.with_state(MemberStatus::Leaving)))
            }
            Self::PartitionJoin { member, partition, priority } => {
                let state = known_member(config, *member)?;
                if state.has_partition(*partition) {
                    return Err(ErrorResponse::invalid_request(format!("member {} already hosts partition {}", member, partition)));
                }
                // New replicas inherit the dynamic config of the existing ones.
                let replicas = config.replicas(*partition);
                let partition_config = match replicas.values().next() {
                    Some(replica) => replica.config.clone(),
                    None => return Err(ErrorResponse::invalid_request(format!("partition {} has no members", partition))),
                };
                Ok(config.with_member(*member, state.with_partition(*partition, PartitionState::joining(*priority, partition_config))))
            }
            Self::PartitionLeave { member, partition } => {
                let replica = hosted_replica(config, *member, *partition)?;
                let others = config
                    .replicas(*partition)
                    .into_iter()
                    .filter(|(id, state)| id != member && state.state != PartitionStatus::Leaving)
                    .count();
                if others == 0 {
                    return Err(ErrorResponse::invalid_request(format!(
                        "member {} cannot leave partition {} as it is the partition's last replica",
                        member, partition
                    )));
                }
                let leaving = replica.to_leaving();
                update_replica(config, *member, *partition, leaving)
            }
            Self::PartitionReconfigurePriority { member, partition, priority } => {
                let replica = hosted_replica(config, *member, *partition)?;
                let updated = replica.with_priority(*priority);
                update_replica(config, *member, *partition, updated)
            }
            Self::PartitionForceReconfigure { partition, members, .. } => {
                if members.is_empty() {
                    return Err(ErrorResponse::invalid_request(format!("partition {} cannot be reconfigured to zero members", partition)));
                }
                for member in members {
                    hosted_replica(config, *member, *partition)?;
                }
                Ok(config.clone())
            }
        }
    }

    /// Apply the complete step of this operation to a configuration on which it was started.
    pub fn complete(&self, config: &ClusterConfiguration) -> Result<ClusterConfiguration, ErrorResponse> {
        match self {
            Self::MemberJoin { member } => {
                let state = known_member(config, *member)?;
                Ok(config.with_member(*member, state.with_state(MemberStatus::Active)))
            }
            Self::MemberLeave { member } => {
                known_member(config, *member)?;
                Ok(config.without_member(*member))
            }
            Self::MemberRemove { member_to_remove, .. } => {
                known_member(config, *member_to_remove)?;
                Ok(config.without_member(*member_to_remove))
            }
            Self::PartitionJoin { member, partition, .. } => {
                let active = hosted_replica(config, *member, *partition)?.to_active();
                update_replica(config, *member, *partition, active)
            }
            Self::PartitionLeave { member, partition } => {
                let state = known_member(config, *member)?;
                Ok(config.with_member(*member, state.without_partition(*partition)))
            }
            Self::PartitionReconfigurePriority { member, partition, .. } => {
                hosted_replica(config, *member, *partition)?;
                Ok(config.clone())
            }
            Self::PartitionForceReconfigure { partition, members, .. } => {
                let mut next = config.clone();
                for (id, state) in config.members.iter() {
                    if state.has_partition(*partition) && !members.contains(id) {
                        next = next.with_member(*id, state.without_partition(*partition));
                    }
                }
                Ok(next)
            }
        }
    }
}

fn known_member(config: &ClusterConfiguration, member: MemberId) -> Result<&MemberState, ErrorResponse> {
    config
        .member(member)
        .ok_or_else(|| ErrorResponse::invalid_request(format!("member {} is not part of the cluster", member)))
}

fn hosted_replica(config: &ClusterConfiguration, member: MemberId, partition: u32) -> Result<&PartitionState, ErrorResponse> {
    known_member(config, member)?
        .partitions
        .get(&partition)
        .ok_or_else(|| ErrorResponse::invalid_request(format!("member {} does not host partition {}", member, partition)))
}

fn update_replica(config: &ClusterConfiguration, member: MemberId, partition: u32, replica: PartitionState) -> Result<ClusterConfiguration, ErrorResponse> {
    config
        .update_member(member, |state| state.with_partition(partition, replica))
        .ok_or_else(|| ErrorResponse::invalid_request(format!("member {} is not part of the cluster", member)))
}

/// Converts management requests into change operations.
#[derive(Clone)]
pub struct ChangePlanner {
    distributor: Arc<dyn PartitionDistributor>,
    group: String,
    replication_factor: u32,
}

impl ChangePlanner {
    pub fn new(distributor: Arc<dyn PartitionDistributor>, group: impl Into<String>, replication_factor: u32) -> Self {
        Self {
            distributor,
            group: group.into(),
            replication_factor,
        }
    }

    /// Compute the operations needed to fulfill the given request.
    ///
    /// The returned operations are validated against `current`; an empty list means that the
    /// cluster already satisfies the request.
    pub fn plan(&self, current: &ClusterConfiguration, request: &ManagementRequest) -> Result<PlannedChange, ErrorResponse> {
        let operations = match request {
            ManagementRequest::AddMembers(req) => req
                .members
                .iter()
                .filter(|member| !current.has_member(**member))
                .map(|member| Op::MemberJoin { member: *member })
                .collect(),
            ManagementRequest::RemoveMembers(req) => {
                let mut ops = Vec::with_capacity(req.members.len());
                for member in req.members.iter() {
                    known_member(current, *member)?;
                    ops.push(Op::MemberLeave { member: *member });
                }
                ops
            }
            ManagementRequest::JoinPartition(req) => vec![Op::PartitionJoin {
                member: req.member_id,
                partition: req.partition_id,
                priority: req.priority,
            }],
            ManagementRequest::LeavePartition(req) => vec![Op::PartitionLeave {
                member: req.member_id,
                partition: req.partition_id,
            }],
            ManagementRequest::ReassignPartitions(req) => {
                if req.members.is_empty() {
                    return Err(ErrorResponse::invalid_request("partitions cannot be reassigned to zero members"));
                }
                if let Some(unknown) = req.members.iter().find(|member| !current.has_member(**member)) {
                    return Err(ErrorResponse::invalid_request(format!("member {} is not part of the cluster", unknown)));
                }
                self.reassign(current, &req.members, self.replication_factor)
            }
            ManagementRequest::ScaleMembers(req) => self.scale(current, req)?,
            ManagementRequest::ForceScaleDown(req) => self.force_scale_down(current, &req.members)?,
            ManagementRequest::CancelChange(_) | ManagementRequest::GetTopology => {
                return Err(ErrorResponse::internal(format!("{} requests do not produce change operations", request.name())));
            }
        };
        let expected = self.simulate(current, &operations)?;
        Ok(PlannedChange { operations, expected })
    }

    /// Apply every operation in order, yielding the expected final configuration.
    pub fn simulate(&self, current: &ClusterConfiguration, operations: &[Op]) -> Result<ClusterConfiguration, ErrorResponse> {
        operations
            .iter()
            .try_fold(current.clone(), |config, op| op.start(&config).and_then(|started| op.complete(&started)))
    }

    fn scale(&self, current: &ClusterConfiguration, req: &ScaleRequest) -> Result<Vec<Op>, ErrorResponse> {
        if req.members.is_empty() {
            return Err(ErrorResponse::invalid_request("the cluster cannot be scaled to zero members"));
        }
        let replication_factor = req.new_replication_factor.unwrap_or(self.replication_factor);
        if replication_factor == 0 {
            return Err(ErrorResponse::invalid_request("the replication factor must be at least 1"));
        }
        let mut ops: Vec<Op> = req
            .members
            .iter()
            .filter(|member| !current.has_member(**member))
            .map(|member| Op::MemberJoin { member: *member })
            .collect();
        ops.extend(self.reassign(current, &req.members, replication_factor));
        ops.extend(
            current
                .members
                .keys()
                .filter(|member| !req.members.contains(member))
                .map(|member| Op::MemberLeave { member: *member }),
        );
        Ok(ops)
    }

    /// Plan the operations which move every partition to the distribution computed over `members`.
    ///
    /// Joins come first, then priority changes, then leaves, so that no partition loses a replica
    /// before its new replicas have been added.
    fn reassign(&self, current: &ClusterConfiguration, members: &BTreeSet<MemberId>, replication_factor: u32) -> Vec<Op> {
        let partitions: Vec<PartitionId> = current.partitions().into_iter().map(|number| PartitionId::new(self.group.as_str(), number)).collect();
        let target = self.distributor.distribute_partitions(members, &partitions, replication_factor);

        let (mut joins, mut reconfigures, mut leaves) = (vec![], vec![], vec![]);
        for metadata in target {
            let partition = metadata.id.number;
            let existing: BTreeMap<MemberId, u32> = current
                .replicas(partition)
                .into_iter()
                .map(|(member, state)| (member, state.priority))
                .collect();
            for (member, priority) in metadata.priorities.iter() {
                match existing.get(member) {
                    None => joins.push(Op::PartitionJoin {
                        member: *member,
                        partition,
                        priority: *priority,
                    }),
                    Some(current_priority) if current_priority != priority => reconfigures.push(Op::PartitionReconfigurePriority {
                        member: *member,
                        partition,
                        priority: *priority,
                    }),
                    Some(_) => (),
                }
            }
            leaves.extend(
                existing
                    .keys()
                    .filter(|member| !metadata.members.contains(member))
                    .map(|member| Op::PartitionLeave { member: *member, partition }),
            );
        }
        joins.into_iter().chain(reconfigures).chain(leaves).collect()
    }

    /// Plan the removal of every member not in `retained` without re-replicating its partitions.
    fn force_scale_down(&self, current: &ClusterConfiguration, retained: &BTreeSet<MemberId>) -> Result<Vec<Op>, ErrorResponse> {
        let coordinator = match retained.iter().next() {
            Some(member) => *member,
            None => return Err(ErrorResponse::invalid_request("force scale down requires at least one member to retain")),
        };
        if let Some(unknown) = retained.iter().find(|member| !current.has_member(**member)) {
            return Err(ErrorResponse::invalid_request(format!("member {} is not part of the cluster", unknown)));
        }

        let mut ops = vec![];
        for partition in current.partitions() {
            let replicas = current.replicas(partition);
            if replicas.keys().all(|member| retained.contains(member)) {
                continue;
            }
            let survivors: BTreeMap<MemberId, u32> = replicas
                .iter()
                .filter(|(member, _)| retained.contains(member))
                .map(|(member, state)| (*member, state.priority))
                .collect();
            // The highest priority survivor drives the reconfiguration, ties going to the lowest id.
            let executor = survivors
                .iter()
                .max_by(|(a_id, a_prio), (b_id, b_prio)| a_prio.cmp(b_prio).then_with(|| b_id.cmp(a_id)))
                .map(|(member, _)| *member)
                .ok_or_else(|| ErrorResponse::invalid_request(format!("partition {} has no members among the retained members", partition)))?;
            ops.push(Op::PartitionForceReconfigure {
                member: executor,
                partition,
                members: survivors.keys().copied().collect(),
            });
        }
        ops.extend(
            current
                .members
                .keys()
                .filter(|member| !retained.contains(member))
                .map(|member| Op::MemberRemove {
                    member: coordinator,
                    member_to_remove: *member,
                }),
        );
        Ok(ops)
    }
}
