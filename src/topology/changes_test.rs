use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;

use super::api::{AddMembersRequest, ErrorKind, JoinPartitionRequest, LeavePartitionRequest, ManagementRequest, ReassignPartitionsRequest, RemoveMembersRequest, ScaleRequest};
use super::*;
use crate::fixtures::{self, GROUP};

type Op = ConfigurationChangeOperation;

fn planner(replication_factor: u32) -> ChangePlanner {
    ChangePlanner::new(Arc::new(RoundRobinPartitionDistributor), GROUP, replication_factor)
}

fn scale(ids: &[u32], new_replication_factor: Option<u32>) -> ScaleRequest {
    ScaleRequest {
        members: fixtures::members(ids.iter().copied()),
        new_replication_factor,
        dry_run: false,
    }
}

fn replica_counts(config: &ClusterConfiguration) -> BTreeMap<u32, usize> {
    config.partitions().into_iter().map(|partition| (partition, config.replicas(partition).len())).collect()
}

#[test]
fn member_join_moves_through_joining_to_active() -> Result<()> {
    let config = fixtures::cluster_configuration(&[0, 1], 2, 2);
    let op = Op::MemberJoin { member: MemberId(5) };

    let started = op.start(&config)?;
    let joining = started.member(MemberId(5)).map(|member| member.state);
    assert!(joining == Some(MemberStatus::Joining), "expected joining member got {:?}", joining);

    let completed = op.complete(&started)?;
    let active = completed.member(MemberId(5)).map(|member| member.state);
    assert!(active == Some(MemberStatus::Active), "expected active member got {:?}", active);
    assert!(completed.version == config.version, "expected operations to leave the version untouched");

    Ok(())
}

#[test]
fn add_members_plans_joins_only_for_new_members() -> Result<()> {
    let config = fixtures::cluster_configuration(&[0, 1], 2, 2);
    let request = ManagementRequest::AddMembers(AddMembersRequest {
        members: fixtures::members([1, 2, 3]),
    });

    let planned = planner(2).plan(&config, &request)?;

    let expected_ops = vec![Op::MemberJoin { member: MemberId(2) }, Op::MemberJoin { member: MemberId(3) }];
    assert!(planned.operations == expected_ops, "expected ops {:?} got {:?}", expected_ops, planned.operations);
    for id in [2, 3] {
        let member = planned.expected.member(MemberId(id));
        assert!(
            member.map(|m| m.state == MemberStatus::Active && m.partitions.is_empty()).unwrap_or(false),
            "expected member {} to be active without partitions, got {:?}",
            id,
            member
        );
    }

    Ok(())
}

#[test]
fn remove_members_rejects_members_with_partitions() -> Result<()> {
    let config = fixtures::cluster_configuration(&[0, 1, 2], 3, 2);
    let request = ManagementRequest::RemoveMembers(RemoveMembersRequest {
        members: fixtures::members([2]),
    });

    let err = planner(2).plan(&config, &request).err();

    assert!(
        err.as_ref().map(|err| err.kind) == Some(ErrorKind::InvalidRequest),
        "expected invalid request error got {:?}",
        err
    );
    Ok(())
}

#[test]
fn remove_members_rejects_unknown_members() -> Result<()> {
    let config = fixtures::cluster_configuration(&[0, 1], 2, 2);
    let request = ManagementRequest::RemoveMembers(RemoveMembersRequest {
        members: fixtures::members([7]),
    });

    let err = planner(2).plan(&config, &request).err();

    assert!(err.map(|err| err.message.contains("member 7")).unwrap_or(false), "expected error naming member 7");
    Ok(())
}

#[test]
fn remove_members_without_partitions_removes_them() -> Result<()> {
    let config = fixtures::cluster_configuration(&[0, 1], 2, 2).with_member(MemberId(4), MemberState::new(MemberStatus::Active, BTreeMap::new()));
    let request = ManagementRequest::RemoveMembers(RemoveMembersRequest {
        members: fixtures::members([4]),
    });

    let planned = planner(2).plan(&config, &request)?;

    assert!(planned.operations == vec![Op::MemberLeave { member: MemberId(4) }], "unexpected ops {:?}", planned.operations);
    assert!(!planned.expected.has_member(MemberId(4)), "expected member 4 to be removed");
    Ok(())
}

#[test]
fn join_partition_inherits_config_and_activates_replica() -> Result<()> {
    let config = fixtures::cluster_configuration(&[0, 1], 2, 1).with_member(MemberId(3), MemberState::new(MemberStatus::Active, BTreeMap::new()));
    let request = ManagementRequest::JoinPartition(JoinPartitionRequest {
        member_id: MemberId(3),
        partition_id: 1,
        priority: 2,
    });

    let planned = planner(1).plan(&config, &request)?;

    let replica = planned.expected.member(MemberId(3)).and_then(|member| member.partitions.get(&1)).cloned();
    assert!(
        replica == Some(PartitionState::active(2, DynamicPartitionConfig::default())),
        "expected an active replica with priority 2 got {:?}",
        replica
    );
    Ok(())
}

#[test]
fn join_partition_rejects_partitions_without_members() -> Result<()> {
    let config = fixtures::cluster_configuration(&[0, 1], 2, 1);
    let request = ManagementRequest::JoinPartition(JoinPartitionRequest {
        member_id: MemberId(0),
        partition_id: 9,
        priority: 1,
    });

    let err = planner(1).plan(&config, &request).err();

    assert!(err.map(|err| err.message.contains("has no members")).unwrap_or(false), "expected partition without members error");
    Ok(())
}

#[test]
fn leave_partition_rejects_the_last_replica() -> Result<()> {
    let config = fixtures::cluster_configuration(&[0, 1], 2, 1);
    let request = ManagementRequest::LeavePartition(LeavePartitionRequest {
        member_id: MemberId(0),
        partition_id: 1,
    });

    let err = planner(1).plan(&config, &request).err();

    assert!(
        err.as_ref().map(|err| err.kind) == Some(ErrorKind::InvalidRequest),
        "expected invalid request error got {:?}",
        err
    );
    Ok(())
}

#[test]
fn leave_partition_marks_replica_leaving_before_removal() -> Result<()> {
    let config = fixtures::cluster_configuration(&[0, 1], 2, 2);
    let op = Op::PartitionLeave {
        member: MemberId(1),
        partition: 1,
    };

    let started = op.start(&config)?;
    let state = started.member(MemberId(1)).and_then(|member| member.partitions.get(&1)).map(|replica| replica.state);
    assert!(state == Some(PartitionStatus::Leaving), "expected leaving replica got {:?}", state);

    let completed = op.complete(&started)?;
    let hosted = completed.member(MemberId(1)).map(|member| member.has_partition(1)).unwrap_or(true);
    assert!(!hosted, "expected member 1 to no longer host partition 1");
    Ok(())
}

#[test]
fn reassign_orders_joins_before_leaves() -> Result<()> {
    let config = fixtures::cluster_configuration(&[0, 1], 2, 2).with_member(MemberId(2), MemberState::new(MemberStatus::Active, BTreeMap::new()));
    let request = ManagementRequest::ReassignPartitions(ReassignPartitionsRequest {
        members: fixtures::members([0, 1, 2]),
        dry_run: false,
    });

    let planned = planner(2).plan(&config, &request)?;

    let expected_ops = vec![
        Op::PartitionJoin {
            member: MemberId(2),
            partition: 2,
            priority: 1,
        },
        Op::PartitionLeave {
            member: MemberId(0),
            partition: 2,
        },
    ];
    assert!(planned.operations == expected_ops, "expected ops {:?} got {:?}", expected_ops, planned.operations);
    let target = fixtures::cluster_configuration(&[0, 1, 2], 2, 2);
    assert!(
        planned.expected.members == target.members,
        "expected topology {:?} got {:?}",
        target.members,
        planned.expected.members
    );
    Ok(())
}

#[test]
fn reassign_of_a_balanced_cluster_is_a_noop() -> Result<()> {
    let config = fixtures::cluster_configuration(&[0, 1, 2], 3, 2);
    let request = ManagementRequest::ReassignPartitions(ReassignPartitionsRequest {
        members: fixtures::members([0, 1, 2]),
        dry_run: true,
    });

    let planned = planner(2).plan(&config, &request)?;

    assert!(planned.operations.is_empty(), "expected no ops got {:?}", planned.operations);
    assert!(planned.expected == config, "expected the configuration to be unchanged");
    Ok(())
}

#[test]
fn reassign_rejects_unknown_members() -> Result<()> {
    let config = fixtures::cluster_configuration(&[0, 1], 2, 2);
    let request = ManagementRequest::ReassignPartitions(ReassignPartitionsRequest {
        members: fixtures::members([0, 1, 2]),
        dry_run: false,
    });

    let err = planner(2).plan(&config, &request).err();

    assert!(err.map(|err| err.kind == ErrorKind::InvalidRequest).unwrap_or(false), "expected invalid request error");
    Ok(())
}

#[test]
fn scale_down_moves_partitions_before_members_leave() -> Result<()> {
    let config = fixtures::cluster_configuration(&[0, 1, 2], 3, 2);
    let request = ManagementRequest::ScaleMembers(scale(&[0, 1], None));

    let planned = planner(2).plan(&config, &request)?;

    let last = planned.operations.last().cloned();
    assert!(last == Some(Op::MemberLeave { member: MemberId(2) }), "expected member 2 to leave last got {:?}", last);
    assert!(!planned.expected.has_member(MemberId(2)), "expected member 2 to be removed");
    let counts = replica_counts(&planned.expected);
    assert!(counts.len() == 3 && counts.values().all(|count| *count == 2), "expected 3 partitions with 2 replicas got {:?}", counts);
    Ok(())
}

#[test]
fn scale_up_joins_members_first() -> Result<()> {
    let config = fixtures::cluster_configuration(&[0, 1], 4, 2);
    let request = ManagementRequest::ScaleMembers(scale(&[0, 1, 2, 3], None));

    let planned = planner(2).plan(&config, &request)?;

    let first_two = &planned.operations[..2];
    let expected = [Op::MemberJoin { member: MemberId(2) }, Op::MemberJoin { member: MemberId(3) }];
    assert!(first_two == expected, "expected member joins first got {:?}", first_two);
    let target = fixtures::cluster_configuration(&[0, 1, 2, 3], 4, 2);
    assert!(planned.expected.members == target.members, "expected topology {:?} got {:?}", target.members, planned.expected.members);
    Ok(())
}

#[test]
fn scale_applies_new_replication_factor() -> Result<()> {
    let config = fixtures::cluster_configuration(&[0, 1, 2], 3, 2);
    let request = ManagementRequest::ScaleMembers(scale(&[0, 1, 2], Some(1)));

    let planned = planner(2).plan(&config, &request)?;

    let counts = replica_counts(&planned.expected);
    assert!(counts.values().all(|count| *count == 1), "expected a single replica per partition got {:?}", counts);
    Ok(())
}

#[test]
fn scale_rejects_invalid_requests() -> Result<()> {
    let config = fixtures::cluster_configuration(&[0, 1, 2], 3, 2);

    let empty = planner(2).plan(&config, &ManagementRequest::ScaleMembers(scale(&[], None))).err();
    let zero_rf = planner(2).plan(&config, &ManagementRequest::ScaleMembers(scale(&[0, 1], Some(0)))).err();

    assert!(empty.map(|err| err.kind == ErrorKind::InvalidRequest).unwrap_or(false), "expected empty scale to be rejected");
    assert!(zero_rf.map(|err| err.kind == ErrorKind::InvalidRequest).unwrap_or(false), "expected zero replication factor to be rejected");
    Ok(())
}

#[test]
fn force_scale_down_keeps_partitions_on_survivors() -> Result<()> {
    let config = fixtures::cluster_configuration(&[0, 1, 2], 3, 2);
    let request = ManagementRequest::ForceScaleDown(scale(&[0, 1], None));

    let planned = planner(2).plan(&config, &request)?;

    let expected_ops = vec![
        Op::PartitionForceReconfigure {
            member: MemberId(1),
            partition: 2,
            members: fixtures::members([1]),
        },
        Op::PartitionForceReconfigure {
            member: MemberId(0),
            partition: 3,
            members: fixtures::members([0]),
        },
        Op::MemberRemove {
            member: MemberId(0),
            member_to_remove: MemberId(2),
        },
    ];
    assert!(planned.operations == expected_ops, "expected ops {:?} got {:?}", expected_ops, planned.operations);
    let counts = replica_counts(&planned.expected);
    let expected_counts: BTreeMap<u32, usize> = [(1, 2), (2, 1), (3, 1)].into_iter().collect();
    assert!(counts == expected_counts, "expected replica counts {:?} got {:?}", expected_counts, counts);
    Ok(())
}

#[test]
fn force_scale_down_rejects_partitions_without_survivors() -> Result<()> {
    let config = fixtures::cluster_configuration(&[0, 1, 2], 3, 1);
    let request = ManagementRequest::ForceScaleDown(scale(&[0], None));

    let err = planner(1).plan(&config, &request).err();

    assert!(
        err.as_ref().map(|err| err.message.contains("partition 2")).unwrap_or(false),
        "expected error naming partition 2 got {:?}",
        err
    );
    Ok(())
}
