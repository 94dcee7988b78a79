use std::time::Duration;

use anyhow::Result;

use crate::config::*;
use crate::topology::MemberId;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("MEMBER_ID".into(), "1".into()),
        ("CLUSTER_MEMBERS".into(), "0,1,2".into()),
        ("CLUSTER_ID".into(), "prod".into()),
        ("PARTITION_COUNT".into(), "6".into()),
        ("REPLICATION_FACTOR".into(), "3".into()),
        ("PARTITION_GROUP".into(), "workflows".into()),
        ("PARTITION_SCALING_ENABLED".into(), "true".into()),
        ("STORAGE_DATA_PATH".into(), "/usr/local/hadron-cluster/data".into()),
        ("METRICS_PORT".into(), "9090".into()),
        ("REQUEST_TIMEOUT_MS".into(), "2500".into()),
        ("RETRY_INITIAL_INTERVAL_MS".into(), "50".into()),
        ("RETRY_MAX_INTERVAL_MS".into(), "5000".into()),
    ])?;
    config.validate()?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(config.member_id == 1, "unexpected value parsed for MEMBER_ID, got {}, expected {}", config.member_id, 1);
    assert!(
        config.cluster_members == vec![0, 1, 2],
        "unexpected value parsed for CLUSTER_MEMBERS, got {:?}, expected {:?}",
        config.cluster_members,
        vec![0, 1, 2]
    );
    assert!(
        config.cluster_id.as_deref() == Some("prod"),
        "unexpected value parsed for CLUSTER_ID, got {:?}, expected {:?}",
        config.cluster_id,
        Some("prod")
    );
    assert!(config.partition_count == 6, "unexpected value parsed for PARTITION_COUNT, got {}, expected {}", config.partition_count, 6);
    assert!(
        config.replication_factor == 3,
        "unexpected value parsed for REPLICATION_FACTOR, got {}, expected {}",
        config.replication_factor,
        3
    );
    assert!(
        config.partition_group == "workflows",
        "unexpected value parsed for PARTITION_GROUP, got {}, expected {}",
        config.partition_group,
        "workflows"
    );
    assert!(config.partition_scaling_enabled, "expected PARTITION_SCALING_ENABLED to be parsed as true");
    assert!(
        config.storage_data_path == "/usr/local/hadron-cluster/data",
        "unexpected value parsed for STORAGE_DATA_PATH, got {}, expected {}",
        config.storage_data_path,
        "/usr/local/hadron-cluster/data"
    );
    assert!(config.metrics_port == 9090, "unexpected value parsed for METRICS_PORT, got {}, expected {}", config.metrics_port, 9090);
    assert!(
        config.request_timeout() == Duration::from_millis(2500),
        "unexpected value parsed for REQUEST_TIMEOUT_MS, got {:?}, expected {:?}",
        config.request_timeout(),
        Duration::from_millis(2500)
    );
    assert!(
        config.retry_initial_interval_ms == 50 && config.retry_max_interval_ms == 5000,
        "unexpected retry intervals parsed, got {}/{}, expected 50/5000",
        config.retry_initial_interval_ms,
        config.retry_max_interval_ms
    );
    assert!(config.member() == MemberId(1), "unexpected member, got {}, expected {}", config.member(), MemberId(1));
    assert!(
        config.default_coordinator() == MemberId(0),
        "unexpected default coordinator, got {}, expected {}",
        config.default_coordinator(),
        MemberId(0)
    );

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("MEMBER_ID".into(), "0".into()),
        ("CLUSTER_MEMBERS".into(), "0".into()),
        ("PARTITION_COUNT".into(), "1".into()),
        ("REPLICATION_FACTOR".into(), "1".into()),
    ])?;
    config.validate()?;

    assert!(config.cluster_id.is_none(), "expected CLUSTER_ID to default to none, got {:?}", config.cluster_id);
    assert!(
        config.partition_group == DEFAULT_PARTITION_GROUP,
        "unexpected default for PARTITION_GROUP, got {}, expected {}",
        config.partition_group,
        DEFAULT_PARTITION_GROUP
    );
    assert!(!config.partition_scaling_enabled, "expected PARTITION_SCALING_ENABLED to default to false");
    assert!(
        config.storage_data_path == crate::database::DEFAULT_DATA_PATH,
        "unexpected default for STORAGE_DATA_PATH, got {}, expected {}",
        config.storage_data_path,
        crate::database::DEFAULT_DATA_PATH
    );
    assert!(
        config.request_timeout() == Duration::from_secs(10),
        "unexpected default request timeout, got {:?}, expected {:?}",
        config.request_timeout(),
        Duration::from_secs(10)
    );

    Ok(())
}

#[test]
fn config_validation_rejects_invalid_cluster_layouts() -> Result<()> {
    let (base, _tmpdir) = Config::new_test()?;

    let mut config = (*base).clone();
    config.replication_factor = 0;
    assert!(config.validate().is_err(), "expected a replication factor of 0 to be rejected");

    let mut config = (*base).clone();
    config.partition_count = 0;
    assert!(config.validate().is_err(), "expected a partition count of 0 to be rejected");

    let mut config = (*base).clone();
    config.member_id = 7;
    assert!(config.validate().is_err(), "expected a member outside of the cluster to be rejected");

    Ok(())
}
