//! Runtime configuration.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::topology::MemberId;

/// The default partition group name.
pub const DEFAULT_PARTITION_GROUP: &str = "raft-partition";

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,

    /// The ID of this cluster member.
    pub member_id: u32,
    /// The IDs of all members of the initial cluster, comma-separated in the environment.
    pub cluster_members: Vec<u32>,
    /// An optional ID of the cluster, carried along in the cluster configuration.
    #[serde(default)]
    pub cluster_id: Option<String>,

    /// The number of partitions of the initial cluster.
    pub partition_count: u32,
    /// The target number of replicas per partition.
    pub replication_factor: u32,
    /// The name of the partition group of this cluster.
    #[serde(default = "Config::default_partition_group")]
    pub partition_group: String,
    /// Track the partition count in the cluster configuration's routing state.
    #[serde(default)]
    pub partition_scaling_enabled: bool,

    /// The path to the database on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,
    /// The port used by the metrics server.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,

    /// The timeout applied to topology management requests, in milliseconds.
    #[serde(default = "Config::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// The initial interval between retries of failed pushes & operations, in milliseconds.
    #[serde(default = "Config::default_retry_initial_interval_ms")]
    pub retry_initial_interval_ms: u64,
    /// The maximum interval between retries of failed pushes & operations, in milliseconds.
    #[serde(default = "Config::default_retry_max_interval_ms")]
    pub retry_max_interval_ms: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// The config is built from the runtime environment and then validated.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Check the semantic constraints of this config.
    pub fn validate(&self) -> Result<()> {
        if self.replication_factor == 0 {
            bail!("REPLICATION_FACTOR must be at least 1");
        }
        if self.partition_count == 0 {
            bail!("PARTITION_COUNT must be at least 1");
        }
        if !self.cluster_members.contains(&self.member_id) {
            bail!("MEMBER_ID {} is not listed in CLUSTER_MEMBERS {:?}", self.member_id, self.cluster_members);
        }
        Ok(())
    }

    /// The ID of this member.
    pub fn member(&self) -> MemberId {
        MemberId(self.member_id)
    }

    /// The default coordinator of topology changes, the lowest member of the initial cluster.
    pub fn default_coordinator(&self) -> MemberId {
        MemberId(self.cluster_members.iter().copied().min().unwrap_or(self.member_id))
    }

    /// The timeout applied to topology management requests.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// The retry policy for failed pushes & change operations.
    pub fn retry_backoff(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoff {
            initial_interval: Duration::from_millis(self.retry_initial_interval_ms),
            current_interval: Duration::from_millis(self.retry_initial_interval_ms),
            max_interval: Duration::from_millis(self.retry_max_interval_ms),
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    fn default_partition_group() -> String {
        DEFAULT_PARTITION_GROUP.into()
    }

    fn default_metrics_port() -> u16 {
        7002
    }

    fn default_request_timeout_ms() -> u64 {
        10_000
    }

    fn default_retry_initial_interval_ms() -> u64 {
        100
    }

    fn default_retry_max_interval_ms() -> u64 {
        10_000
    }
}

#[cfg(test)]
impl Config {
    /// Create a config for a single-member test cluster backed by a temp dir.
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        Self::new_test_member(0, vec![0])
    }

    /// Create a config for the given member of a test cluster backed by a temp dir.
    pub fn new_test_member(member_id: u32, cluster_members: Vec<u32>) -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        Ok((
            std::sync::Arc::new(Self {
                rust_log: "".into(),
                member_id,
                cluster_members,
                cluster_id: Some("test-cluster".into()),
                partition_count: 3,
                replication_factor: 3,
                partition_group: Self::default_partition_group(),
                partition_scaling_enabled: false,
                storage_data_path: tmpdir.path().to_string_lossy().to_string(),
                metrics_port: 7002,
                request_timeout_ms: 1_000,
                retry_initial_interval_ms: 10,
                retry_max_interval_ms: 50,
            }),
            tmpdir,
        ))
    }
}
