use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use rand::prelude::*;

use crate::distribution::transport::{PartitionTransport, PushError};
use crate::distribution::{CommandDistributionRecord, DistributionState};
use crate::models::proto::distribution::{DistributedCommand, ValueType};
use crate::topology::manager::OperationExecutor;
use crate::topology::{
    from_distribution, ClusterConfiguration, ConfigurationChangeOperation, DynamicPartitionConfig, MemberId, PartitionDistributor, PartitionId,
    RoundRobinPartitionDistributor,
};

pub const GROUP: &str = "raft-partition";

/// Build a set of member IDs.
pub fn members(ids: impl IntoIterator<Item = u32>) -> BTreeSet<MemberId> {
    ids.into_iter().map(MemberId).collect()
}

/// Build a cluster configuration with the round robin distribution of the given partitions.
pub fn cluster_configuration(ids: &[u32], partition_count: u32, replication_factor: u32) -> ClusterConfiguration {
    let partitions: Vec<PartitionId> = (1..=partition_count).map(|number| PartitionId::new(GROUP, number)).collect();
    let distribution = RoundRobinPartitionDistributor.distribute_partitions(&members(ids.iter().copied()), &partitions, replication_factor);
    from_distribution(&distribution, &DynamicPartitionConfig::default(), None)
}

/// Build a deployment command with a random payload.
pub fn deployment_command() -> DistributedCommand {
    let mut payload = vec![0u8; rand::thread_rng().gen_range(1..64)];
    rand::thread_rng().fill(payload.as_mut_slice());
    DistributedCommand {
        value_type: ValueType::Deployment as i32,
        command_value: payload,
    }
}

/// Setup some pending distributions in the given state, returning the keys & targets written.
pub fn setup_pending_distributions(state: &DistributionState, targets: &[u32]) -> Result<BTreeMap<i64, BTreeSet<u32>>> {
    let mut written = BTreeMap::new();
    for key in 0..rand::thread_rng().gen_range(5..20) {
        let targets: BTreeSet<u32> = targets.iter().copied().collect();
        state.add_pending_distribution(key, key * 10, &deployment_command(), &targets)?;
        written.insert(key, targets);
    }
    Ok(written)
}

/// A transport recording every push, failing the first `failures` pushes of each target.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    failures: usize,
    pushes: Arc<Mutex<Vec<CommandDistributionRecord>>>,
}

impl RecordingTransport {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures,
            ..Default::default()
        }
    }

    pub fn pushes(&self) -> Vec<CommandDistributionRecord> {
        self.pushes.lock().map(|pushes| pushes.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl PartitionTransport for RecordingTransport {
    async fn push(&self, _origin: u32, record: CommandDistributionRecord) -> Result<(), PushError> {
        let target = record.partition_id;
        let mut pushes = self.pushes.lock().map_err(|_| PushError::Unreachable(target))?;
        let attempts = pushes.iter().filter(|push| push.partition_id == target).count();
        pushes.push(record);
        if attempts < self.failures {
            return Err(PushError::Unreachable(target));
        }
        Ok(())
    }
}

/// An operation executor failing the first `failures` executions.
#[derive(Clone, Default)]
pub struct FlakyExecutor {
    failures: usize,
    executed: Arc<Mutex<Vec<ConfigurationChangeOperation>>>,
}

impl FlakyExecutor {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures,
            ..Default::default()
        }
    }

    pub fn executed(&self) -> Vec<ConfigurationChangeOperation> {
        self.executed.lock().map(|executed| executed.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl OperationExecutor for FlakyExecutor {
    async fn execute(&self, operation: &ConfigurationChangeOperation) -> Result<()> {
        let mut executed = match self.executed.lock() {
            Ok(executed) => executed,
            Err(_) => bail!("executor lock poisoned"),
        };
        executed.push(operation.clone());
        if executed.len() <= self.failures {
            bail!("simulated failure executing {}", operation);
        }
        Ok(())
    }
}

/// An operation executor which never finishes.
pub struct StuckExecutor;

#[async_trait::async_trait]
impl OperationExecutor for StuckExecutor {
    async fn execute(&self, _operation: &ConfigurationChangeOperation) -> Result<()> {
        futures::future::pending::<()>().await;
        Ok(())
    }
}
