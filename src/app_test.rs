use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;

use crate::app::PartitionHost;
use crate::config::Config;
use crate::database::Database;
use crate::distribution::transport::{LocalPartitionTransport, PartitionTransport, PushError};
use crate::distribution::CommandDistributionRecord;
use crate::fixtures;

const ORIGIN: u32 = 9;

/// Push a fresh command to partition 1 from a remote origin.
async fn push_to_partition_one(transport: &LocalPartitionTransport, key: i64) -> Result<(), PushError> {
    let record = CommandDistributionRecord::new(key, 1, &fixtures::deployment_command());
    transport.push(ORIGIN, record).await
}

#[tokio::test]
async fn regained_partitions_are_routed_to_again() -> Result<()> {
    let (config, _tmpdir) = Config::new_test_member(0, vec![0, 1, 2])?;
    let db = Database::new(config.clone()).await?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let transport = LocalPartitionTransport::new();
    let mut host = PartitionHost::new(config, db, transport.clone(), shutdown_tx.clone());

    // Member 0 leads partition 1 when it is part of the cluster, member 1 leads it otherwise.
    let leading = fixtures::cluster_configuration(&[0, 1], 1, 2);
    let following = fixtures::cluster_configuration(&[1, 2], 1, 2);

    host.host_partitions(&leading).await;
    push_to_partition_one(&transport, 1).await.context("expected push to partition 1 to land while leading")?;

    host.host_partitions(&following).await;
    let res = push_to_partition_one(&transport, 2).await;
    assert!(
        matches!(res, Err(PushError::Unreachable(1))),
        "expected partition 1 to be unreachable after losing it, got {:?}",
        res
    );

    host.host_partitions(&leading).await;
    push_to_partition_one(&transport, 3).await.context("expected push to partition 1 to land after regaining it")?;
    let hosted = host.hosted_partitions();
    assert!(hosted == vec![1], "expected the partition 1 controller to be reused, got {:?}", hosted);

    let _ = shutdown_tx.send(());
    host.join().await;
    Ok(())
}

#[tokio::test]
async fn only_led_partitions_are_hosted() -> Result<()> {
    let (config, _tmpdir) = Config::new_test_member(0, vec![0, 1])?;
    let db = Database::new(config.clone()).await?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let transport = LocalPartitionTransport::new();
    let mut host = PartitionHost::new(config, db, transport.clone(), shutdown_tx.clone());

    // Round robin makes member 0 primary of partitions 1 & 3 and member 1 primary of partition 2.
    host.host_partitions(&fixtures::cluster_configuration(&[0, 1], 3, 2)).await;
    let hosted = host.hosted_partitions();
    if hosted != vec![1, 3] {
        bail!("expected partitions 1 & 3 to be hosted, got {:?}", hosted);
    }
    let record = CommandDistributionRecord::new(1, 2, &fixtures::deployment_command());
    let res = transport.push(ORIGIN, record).await;
    assert!(
        matches!(res, Err(PushError::Unreachable(2))),
        "expected partition 2 to be unreachable on this member, got {:?}",
        res
    );

    let _ = shutdown_tx.send(());
    host.join().await;
    Ok(())
}
