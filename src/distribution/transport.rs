//! Transport of distributed commands between partitions & the partition log they land in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, oneshot};

use crate::distribution::records::CommandDistributionRecord;
use crate::distribution::DistributionCtlMsg;
use crate::error::{StorageError, StorageResult};
use crate::models::proto::distribution::LogEntry;
use crate::storage::{ColumnFamily, ColumnFamilyName, TransactionContext};

/// Errors from pushing a command to a target partition.
///
/// These are always retried by the origin partition.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("partition {0} is unreachable")]
    Unreachable(u32),
    #[error("partition {0} dropped the command before acknowledging it")]
    Dropped(u32),
    #[error("partition {0} can not accept the command right now")]
    Backpressure(u32),
    #[error("partition {0} failed to apply the command: {1}")]
    Rejected(u32, String),
}

/// Errors from appending to a partition's log.
#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    /// The log can not take new entries right now; the append should be retried.
    #[error("the partition log is full")]
    Full,
    #[error("the partition log is closed")]
    Closed,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Delivers distributed commands to their target partitions.
#[async_trait::async_trait]
pub trait PartitionTransport: Send + Sync + 'static {
    /// Push the given record from partition `origin` to its target partition, resolving once the
    /// target has acknowledged it.
    async fn push(&self, origin: u32, record: CommandDistributionRecord) -> Result<(), PushError>;
}

/// A partition's append-only log.
pub trait PartitionLog: Send + Sync + 'static {
    /// Append the given entry, returning its position.
    ///
    /// When called inside of a transaction on the partition's context, the entry is committed
    /// along with the rest of the transaction.
    fn try_append(&self, entry: &LogEntry) -> Result<u64, AppendError>;
}

/// A partition log stored in the partition's own DB tree.
pub struct SledPartitionLog {
    entries: ColumnFamily<u64, LogEntry>,
    /// The position of the next entry; appends rolled back with their transaction leave gaps.
    next_position: AtomicU64,
}

impl SledPartitionLog {
    /// Open the log of the partition owning the given context.
    pub fn open(ctx: &TransactionContext) -> StorageResult<Self> {
        let entries = ColumnFamily::new(ctx, ColumnFamilyName::Log);
        let mut last_position = 0;
        entries.for_each(|position, _| {
            last_position = position;
            Ok(())
        })?;
        Ok(Self {
            entries,
            next_position: AtomicU64::new(last_position + 1),
        })
    }

    /// All entries of this log, in order.
    pub fn entries(&self) -> StorageResult<Vec<(u64, LogEntry)>> {
        let mut entries = vec![];
        self.entries.for_each(|position, entry| {
            entries.push((position, entry));
            Ok(())
        })?;
        Ok(entries)
    }
}

impl PartitionLog for SledPartitionLog {
    fn try_append(&self, entry: &LogEntry) -> Result<u64, AppendError> {
        let position = self.next_position.fetch_add(1, Ordering::SeqCst);
        self.entries.insert(&position, entry)?;
        Ok(position)
    }
}

/// A mapping of partitions to the channels of their distribution controllers.
pub type PartitionsMap = HashMap<u32, mpsc::Sender<DistributionCtlMsg>>;

/// In-process transport between the distribution controllers of co-located partitions.
#[derive(Clone, Default)]
pub struct LocalPartitionTransport {
    partitions: Arc<ArcSwap<PartitionsMap>>,
}

impl LocalPartitionTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the channel of a partition's distribution controller.
    pub fn register(&self, partition: u32, tx: mpsc::Sender<DistributionCtlMsg>) {
        let mut updated = self.partitions.load().as_ref().clone();
        updated.insert(partition, tx);
        self.partitions.store(Arc::new(updated));
    }

    pub fn deregister(&self, partition: u32) {
        let mut updated = self.partitions.load().as_ref().clone();
        updated.remove(&partition);
        self.partitions.store(Arc::new(updated));
    }
}

#[async_trait::async_trait]
impl PartitionTransport for LocalPartitionTransport {
    async fn push(&self, origin: u32, record: CommandDistributionRecord) -> Result<(), PushError> {
        let target = record.partition_id;
        let partition_tx = self.partitions.load().get(&target).cloned().ok_or(PushError::Unreachable(target))?;
        let (tx, rx) = oneshot::channel();
        partition_tx
            .send(DistributionCtlMsg::Receive { origin, record, tx })
            .await
            .map_err(|_| PushError::Unreachable(target))?;
        rx.await.map_err(|_| PushError::Dropped(target))?
    }
}
