//! The persisted state of a partition's command distributions.

use std::collections::BTreeSet;

use crate::distribution::records::PersistedPendingDeployment;
use crate::error::{StorageError, StorageResult};
use crate::models::proto::distribution::DistributedCommand;
use crate::storage::{ColumnFamily, ColumnFamilyName, TransactionContext};
use crate::utils;

/// The outcome of acknowledging one leg of a distribution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Acknowledgement {
    /// The leg was not pending, either because it was already acknowledged or never existed.
    Unknown,
    /// The leg was acknowledged and other legs remain.
    Pending { remaining: i64 },
    /// The last leg was acknowledged; the deployment awaits completion.
    Completed(PersistedPendingDeployment),
}

/// Column families tracking the outstanding distributions of one partition.
#[derive(Clone)]
pub struct DistributionState {
    ctx: TransactionContext,
    pending_distributions: ColumnFamily<(i64, u32), ()>,
    pending_deployments: ColumnFamily<i64, PersistedPendingDeployment>,
    distribution_counts: ColumnFamily<i64, i64>,
    received_distributions: ColumnFamily<(u32, i64), ()>,
}

impl DistributionState {
    pub fn new(ctx: &TransactionContext) -> Self {
        Self {
            ctx: ctx.clone(),
            pending_distributions: ColumnFamily::new(ctx, ColumnFamilyName::PendingDistributions),
            pending_deployments: ColumnFamily::new(ctx, ColumnFamilyName::PendingDeployments),
            distribution_counts: ColumnFamily::new(ctx, ColumnFamilyName::DistributionCounts),
            received_distributions: ColumnFamily::new(ctx, ColumnFamilyName::ReceivedDistributions),
        }
    }

    /// Record a new distribution of the given command to the given targets.
    ///
    /// Fails with `KeyExists` if a distribution with this key is already pending.
    pub fn add_pending_distribution(&self, distribution_key: i64, source_position: i64, command: &DistributedCommand, targets: &BTreeSet<u32>) -> StorageResult<()> {
        let payload = utils::encode_model(command).map_err(|err| StorageError::Decode(err.to_string()))?;
        let deployment = PersistedPendingDeployment::new(source_position, payload);
        self.ctx.run_in_transaction(|| {
            self.pending_deployments.insert(&distribution_key, &deployment)?;
            self.distribution_counts.insert(&distribution_key, &(targets.len() as i64))?;
            for target in targets {
                self.pending_distributions.insert(&(distribution_key, *target), &())?;
            }
            Ok(())
        })
    }

    /// Acknowledge the leg of the given distribution which targets `partition`.
    ///
    /// Acknowledging a leg twice is a no-op. The deployment itself is kept until
    /// `complete_deployment` is called, so a crash before completion is recovered by replay.
    pub fn acknowledge(&self, distribution_key: i64, partition: u32) -> StorageResult<Acknowledgement> {
        self.ctx.run_in_transaction(|| {
            if !self.pending_distributions.delete_if_exists(&(distribution_key, partition))? {
                return Ok(Acknowledgement::Unknown);
            }
            let remaining = self
                .distribution_counts
                .get(&distribution_key)?
                .ok_or(StorageError::KeyNotFound(ColumnFamilyName::DistributionCounts.as_str()))?
                - 1;
            let has_pending = self.has_pending_distribution(distribution_key)?;
            if (remaining > 0) != has_pending {
                return Err(StorageError::Inconsistent(format!(
                    "distribution {} counts {} remaining legs but pending legs exist: {}",
                    distribution_key, remaining, has_pending
                )));
            }
            if remaining > 0 {
                self.distribution_counts.upsert(&distribution_key, &remaining)?;
                return Ok(Acknowledgement::Pending { remaining });
            }
            self.distribution_counts.delete_existing(&distribution_key)?;
            let deployment = self
                .pending_deployments
                .get(&distribution_key)?
                .ok_or(StorageError::KeyNotFound(ColumnFamilyName::PendingDeployments.as_str()))?;
            Ok(Acknowledgement::Completed(deployment))
        })
    }

    /// Delete the deployment of a fully acknowledged distribution.
    pub fn complete_deployment(&self, distribution_key: i64) -> StorageResult<()> {
        self.ctx.run_in_transaction(|| {
            self.distribution_counts.delete_if_exists(&distribution_key)?;
            self.pending_deployments.delete_existing(&distribution_key)
        })
    }

    /// Check if any leg of the given distribution is still pending.
    pub fn has_pending_distribution(&self, distribution_key: i64) -> StorageResult<bool> {
        let mut found = false;
        self.pending_distributions.while_equal_prefix(&distribution_key, |_, _| {
            found = true;
            false
        })?;
        Ok(found)
    }

    /// The target partitions of the given distribution which have not yet acknowledged it.
    pub fn pending_partitions(&self, distribution_key: i64) -> StorageResult<BTreeSet<u32>> {
        let mut partitions = BTreeSet::new();
        self.pending_distributions.while_equal_prefix(&distribution_key, |(_, partition), _| {
            partitions.insert(partition);
            true
        })?;
        Ok(partitions)
    }

    /// The pending deployment of the given distribution, if any.
    pub fn pending_deployment(&self, distribution_key: i64) -> StorageResult<Option<PersistedPendingDeployment>> {
        self.pending_deployments.get(&distribution_key)
    }

    /// The number of legs of the given distribution which remain to be acknowledged.
    pub fn distribution_count(&self, distribution_key: i64) -> StorageResult<Option<i64>> {
        self.distribution_counts.get(&distribution_key)
    }

    /// Visit every pending deployment in key order along with its unacknowledged targets.
    pub fn for_each_pending_deployment<F>(&self, mut visitor: F) -> StorageResult<()>
    where
        F: FnMut(i64, PersistedPendingDeployment, BTreeSet<u32>) -> StorageResult<()>,
    {
        let mut deployments = vec![];
        self.pending_deployments.for_each(|key, deployment| {
            deployments.push((key, deployment));
            Ok(())
        })?;
        for (key, deployment) in deployments {
            let partitions = self.pending_partitions(key)?;
            visitor(key, deployment, partitions)?;
        }
        Ok(())
    }

    /// Mark a distributed command as received from `origin`, returning false if it already was.
    pub fn mark_received(&self, origin: u32, distribution_key: i64) -> StorageResult<bool> {
        self.ctx.run_in_transaction(|| {
            if self.received_distributions.exists(&(origin, distribution_key))? {
                return Ok(false);
            }
            self.received_distributions.insert(&(origin, distribution_key), &())?;
            Ok(true)
        })
    }

    pub fn is_received(&self, origin: u32, distribution_key: i64) -> StorageResult<bool> {
        self.received_distributions.exists(&(origin, distribution_key))
    }
}
