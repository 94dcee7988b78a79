use std::collections::BTreeSet;

use anyhow::Result;

use super::*;
use crate::config::Config;
use crate::database::Database;
use crate::fixtures;

#[tokio::test]
async fn recover_empty_store() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let store = TopologyStore::new(db.get_topology_tree().await?);

    let recovered = store.recover().await?;

    assert!(recovered.current.is_none(), "expected no current configuration got {:?}", recovered.current);
    assert!(recovered.last_stable.is_none(), "expected no last stable configuration got {:?}", recovered.last_stable);
    Ok(())
}

#[tokio::test]
async fn persist_and_recover_pending_change() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let store = TopologyStore::new(db.get_topology_tree().await?);

    let mut stable = fixtures::cluster_configuration(&[0, 1, 2], 3, 2);
    stable.cluster_id = Some("test-cluster".into());
    stable.routing = Some(RoutingState { partition_count: 3 });
    let stable = stable.update_member(MemberId(0), |member| {
        let mut config = DynamicPartitionConfig::default();
        config.exporters.insert("elastic".into(), ExporterState::Disabled);
        member.with_partition(1, PartitionState::active(2, config))
    });
    let stable = stable.unwrap_or_else(ClusterConfiguration::uninitialized);
    let plan = ClusterChangePlan::new(
        2,
        MemberId(0),
        vec![
            ConfigurationChangeOperation::PartitionForceReconfigure {
                member: MemberId(1),
                partition: 2,
                members: BTreeSet::from([MemberId(1)]),
            },
            ConfigurationChangeOperation::MemberRemove {
                member: MemberId(0),
                member_to_remove: MemberId(2),
            },
        ],
    );
    let current = stable.start_change(plan.advance());

    store.persist(&current, Some(&stable))?;
    let recovered = store.recover().await?;

    assert!(recovered.current.as_ref() == Some(&current), "expected current {:?} got {:?}", current, recovered.current);
    assert!(recovered.last_stable.as_ref() == Some(&stable), "expected last stable to be recovered");
    Ok(())
}

#[tokio::test]
async fn persist_without_stable_clears_it() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let store = TopologyStore::new(db.get_topology_tree().await?);
    let stable = fixtures::cluster_configuration(&[0, 1], 2, 2);
    let current = stable.start_change(ClusterChangePlan::new(2, MemberId(0), vec![]));

    store.persist(&current, Some(&stable))?;
    let completed = current.complete_change();
    store.persist(&completed, None)?;
    let recovered = store.recover().await?;

    assert!(recovered.current.as_ref() == Some(&completed), "expected completed configuration to be recovered");
    assert!(recovered.last_stable.is_none(), "expected last stable configuration to be cleared");
    Ok(())
}
