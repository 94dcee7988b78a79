//! Persistence of cluster configurations.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use sled::Tree;

use crate::database::Database;
use crate::error::{StorageError, StorageResult};
use crate::models::proto::topology::{self as proto, operation_record::Kind};
use crate::storage::{ColumnFamily, ColumnFamilyName, DbValue, TransactionContext};
use crate::topology::{
    ChangeStatus, ClusterChangePlan, ClusterConfiguration, CompletedChange, CompletedOperation, ConfigurationChangeOperation, DynamicPartitionConfig,
    ExporterState, MemberId, MemberState, MemberStatus, PartitionState, PartitionStatus, RoutingState,
};
use crate::utils;

/// The key of the current configuration.
const KEY_CURRENT: u8 = b'c';
/// The key of the last stable configuration, present while a change is pending.
const KEY_LAST_STABLE: u8 = b's';

/// The persisted state of a member's view of the cluster topology.
#[derive(Clone)]
pub struct TopologyStore {
    ctx: TransactionContext,
    configurations: ColumnFamily<u8, ClusterConfiguration>,
}

/// Recovered topology state.
pub struct RecoveredTopology {
    pub current: Option<ClusterConfiguration>,
    pub last_stable: Option<ClusterConfiguration>,
}

impl TopologyStore {
    pub fn new(tree: Tree) -> Self {
        let ctx = TransactionContext::new(tree);
        let configurations = ColumnFamily::new(&ctx, ColumnFamilyName::Topology);
        Self { ctx, configurations }
    }

    /// Recover the persisted topology state.
    pub async fn recover(&self) -> Result<RecoveredTopology> {
        let configurations = self.configurations.clone();
        Database::spawn_blocking(move || -> Result<RecoveredTopology> {
            Ok(RecoveredTopology {
                current: configurations.get(&KEY_CURRENT).context("error reading current cluster configuration")?,
                last_stable: configurations.get(&KEY_LAST_STABLE).context("error reading last stable cluster configuration")?,
            })
        })
        .await?
    }

    /// Persist the given configuration along with the last stable configuration, if any.
    pub fn persist(&self, current: &ClusterConfiguration, last_stable: Option<&ClusterConfiguration>) -> StorageResult<()> {
        self.ctx.run_in_transaction(|| {
            self.configurations.upsert(&KEY_CURRENT, current)?;
            match last_stable {
                Some(stable) => self.configurations.upsert(&KEY_LAST_STABLE, stable),
                None => self.configurations.delete_if_exists(&KEY_LAST_STABLE).map(|_| ()),
            }
        })
    }
}

impl DbValue for ClusterConfiguration {
    fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        utils::encode_model(&proto::ClusterConfigurationRecord::from(self)).map_err(|err| StorageError::Decode(err.to_string()))
    }

    fn from_bytes(buf: &[u8]) -> StorageResult<Self> {
        let record: proto::ClusterConfigurationRecord = utils::decode_model(buf).map_err(|err| StorageError::Decode(err.to_string()))?;
        ClusterConfiguration::try_from(record).map_err(|err| StorageError::Decode(err.to_string()))
    }
}

impl From<&ClusterConfiguration> for proto::ClusterConfigurationRecord {
    fn from(config: &ClusterConfiguration) -> Self {
        Self {
            version: config.version,
            members: config.members.iter().map(|(id, member)| (id.0, member_to_record(member))).collect(),
            pending_change: config.pending_change.as_ref().map(plan_to_record),
            last_change: config.last_change.as_ref().map(|change| proto::CompletedChangeRecord {
                id: change.id,
                status: change_status_to_record(change.status) as i32,
                started_at: change.started_at,
                completed_at: change.completed_at,
            }),
            routing: config.routing.as_ref().map(|routing| proto::RoutingStateRecord {
                partition_count: routing.partition_count,
            }),
            cluster_id: config.cluster_id.clone(),
        }
    }
}

impl TryFrom<proto::ClusterConfigurationRecord> for ClusterConfiguration {
    type Error = anyhow::Error;

    fn try_from(record: proto::ClusterConfigurationRecord) -> Result<Self> {
        let members = record
            .members
            .into_iter()
            .map(|(id, member)| Ok((MemberId(id), member_from_record(member)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        let last_change = record
            .last_change
            .map(|change| -> Result<CompletedChange> {
                Ok(CompletedChange {
                    id: change.id,
                    status: change_status_from_record(change.status)?,
                    started_at: change.started_at,
                    completed_at: change.completed_at,
                })
            })
            .transpose()?;
        Ok(Self {
            version: record.version,
            members,
            pending_change: record.pending_change.map(plan_from_record).transpose()?,
            last_change,
            routing: record.routing.map(|routing| RoutingState {
                partition_count: routing.partition_count,
            }),
            cluster_id: record.cluster_id,
        })
    }
}

fn member_to_record(member: &MemberState) -> proto::MemberStateRecord {
    let state = match member.state {
        MemberStatus::Joining => proto::MemberStatusRecord::Joining,
        MemberStatus::Active => proto::MemberStatusRecord::Active,
        MemberStatus::Leaving => proto::MemberStatusRecord::Leaving,
    };
    let partitions = member
        .partitions
        .iter()
        .map(|(partition, replica)| {
            let state = match replica.state {
                PartitionStatus::Joining => proto::PartitionStatusRecord::Joining,
                PartitionStatus::Active => proto::PartitionStatusRecord::Active,
                PartitionStatus::Leaving => proto::PartitionStatusRecord::Leaving,
            };
            let exporters = replica
                .config
                .exporters
                .iter()
                .map(|(id, state)| {
                    let state = match state {
                        ExporterState::Enabled => proto::ExporterStateRecord::Enabled,
                        ExporterState::Disabled => proto::ExporterStateRecord::Disabled,
                    };
                    (id.clone(), state as i32)
                })
                .collect();
            let record = proto::PartitionStateRecord {
                state: state as i32,
                priority: replica.priority,
                exporters,
            };
            (*partition, record)
        })
        .collect();
    proto::MemberStateRecord { state: state as i32, partitions }
}

fn member_from_record(record: proto::MemberStateRecord) -> Result<MemberState> {
    let state = match proto::MemberStatusRecord::from_i32(record.state) {
        Some(proto::MemberStatusRecord::Joining) => MemberStatus::Joining,
        Some(proto::MemberStatusRecord::Active) => MemberStatus::Active,
        Some(proto::MemberStatusRecord::Leaving) => MemberStatus::Leaving,
        _ => anyhow::bail!("invalid member state {} in persisted configuration", record.state),
    };
    let mut partitions = BTreeMap::new();
    for (partition, replica) in record.partitions {
        let state = match proto::PartitionStatusRecord::from_i32(replica.state) {
            Some(proto::PartitionStatusRecord::Joining) => PartitionStatus::Joining,
            Some(proto::PartitionStatusRecord::Active) => PartitionStatus::Active,
            Some(proto::PartitionStatusRecord::Leaving) => PartitionStatus::Leaving,
            _ => anyhow::bail!("invalid state {} of partition {} in persisted configuration", replica.state, partition),
        };
        let mut exporters = BTreeMap::new();
        for (id, exporter_state) in replica.exporters {
            let exporter_state = match proto::ExporterStateRecord::from_i32(exporter_state) {
                Some(proto::ExporterStateRecord::Enabled) => ExporterState::Enabled,
                Some(proto::ExporterStateRecord::Disabled) => ExporterState::Disabled,
                _ => anyhow::bail!("invalid state {} of exporter {} in persisted configuration", exporter_state, id),
            };
            exporters.insert(id, exporter_state);
        }
        let config = DynamicPartitionConfig { exporters };
        partitions.insert(
            partition,
            PartitionState {
                state,
                priority: replica.priority,
                config,
            },
        );
    }
    Ok(MemberState::new(state, partitions))
}

fn change_status_to_record(status: ChangeStatus) -> proto::ChangeStatusRecord {
    match status {
        ChangeStatus::InProgress => proto::ChangeStatusRecord::InProgress,
        ChangeStatus::Completed => proto::ChangeStatusRecord::Completed,
        ChangeStatus::Failed => proto::ChangeStatusRecord::Failed,
        ChangeStatus::Cancelled => proto::ChangeStatusRecord::Cancelled,
    }
}

fn change_status_from_record(status: i32) -> Result<ChangeStatus> {
    Ok(match proto::ChangeStatusRecord::from_i32(status) {
        Some(proto::ChangeStatusRecord::InProgress) => ChangeStatus::InProgress,
        Some(proto::ChangeStatusRecord::Completed) => ChangeStatus::Completed,
        Some(proto::ChangeStatusRecord::Failed) => ChangeStatus::Failed,
        Some(proto::ChangeStatusRecord::Cancelled) => ChangeStatus::Cancelled,
        _ => anyhow::bail!("invalid change status {} in persisted configuration", status),
    })
}

fn plan_to_record(plan: &ClusterChangePlan) -> proto::ChangePlanRecord {
    proto::ChangePlanRecord {
        id: plan.id,
        coordinator: plan.coordinator.0,
        status: change_status_to_record(plan.status) as i32,
        started_at: plan.started_at,
        pending_operations: plan.pending_operations.iter().map(operation_to_record).collect(),
        completed_operations: plan
            .completed_operations
            .iter()
            .map(|completed| proto::CompletedOperationRecord {
                operation: Some(operation_to_record(&completed.operation)),
                completed_at: completed.completed_at,
            })
            .collect(),
    }
}

fn plan_from_record(record: proto::ChangePlanRecord) -> Result<ClusterChangePlan> {
    let completed_operations = record
        .completed_operations
        .into_iter()
        .map(|completed| -> Result<CompletedOperation> {
            let operation = completed.operation.context("completed change operation is missing its operation")?;
            Ok(CompletedOperation {
                operation: operation_from_record(operation)?,
                completed_at: completed.completed_at,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(ClusterChangePlan {
        id: record.id,
        coordinator: MemberId(record.coordinator),
        status: change_status_from_record(record.status)?,
        started_at: record.started_at,
        pending_operations: record.pending_operations.into_iter().map(operation_from_record).collect::<Result<Vec<_>>>()?,
        completed_operations,
    })
}

fn operation_to_record(operation: &ConfigurationChangeOperation) -> proto::OperationRecord {
    let kind = match operation {
        ConfigurationChangeOperation::MemberJoin { .. } => Kind::MemberJoin(proto::MemberJoinRecord {}),
        ConfigurationChangeOperation::MemberLeave { .. } => Kind::MemberLeave(proto::MemberLeaveRecord {}),
        ConfigurationChangeOperation::MemberRemove { member_to_remove, .. } => Kind::MemberRemove(proto::MemberRemoveRecord {
            member_to_remove: member_to_remove.0,
        }),
        ConfigurationChangeOperation::PartitionJoin { partition, priority, .. } => Kind::PartitionJoin(proto::PartitionJoinRecord {
            partition: *partition,
            priority: *priority,
        }),
        ConfigurationChangeOperation::PartitionLeave { partition, .. } => Kind::PartitionLeave(proto::PartitionLeaveRecord { partition: *partition }),
        ConfigurationChangeOperation::PartitionReconfigurePriority { partition, priority, .. } => {
            Kind::PartitionReconfigurePriority(proto::PartitionReconfigurePriorityRecord {
                partition: *partition,
                priority: *priority,
            })
        }
        ConfigurationChangeOperation::PartitionForceReconfigure { partition, members, .. } => {
            Kind::PartitionForceReconfigure(proto::PartitionForceReconfigureRecord {
                partition: *partition,
                members: members.iter().map(|member| member.0).collect(),
            })
        }
    };
    proto::OperationRecord {
        member: operation.member().0,
        kind: Some(kind),
    }
}

fn operation_from_record(record: proto::OperationRecord) -> Result<ConfigurationChangeOperation> {
    let member = MemberId(record.member);
    Ok(match record.kind.context("change operation record has no kind")? {
        Kind::MemberJoin(_) => ConfigurationChangeOperation::MemberJoin { member },
        Kind::MemberLeave(_) => ConfigurationChangeOperation::MemberLeave { member },
        Kind::MemberRemove(op) => ConfigurationChangeOperation::MemberRemove {
            member,
            member_to_remove: MemberId(op.member_to_remove),
        },
        Kind::PartitionJoin(op) => ConfigurationChangeOperation::PartitionJoin {
            member,
            partition: op.partition,
            priority: op.priority,
        },
        Kind::PartitionLeave(op) => ConfigurationChangeOperation::PartitionLeave { member, partition: op.partition },
        Kind::PartitionReconfigurePriority(op) => ConfigurationChangeOperation::PartitionReconfigurePriority {
            member,
            partition: op.partition,
            priority: op.priority,
        },
        Kind::PartitionForceReconfigure(op) => ConfigurationChangeOperation::PartitionForceReconfigure {
            member,
            partition: op.partition,
            members: op.members.into_iter().map(MemberId).collect(),
        },
    })
}
