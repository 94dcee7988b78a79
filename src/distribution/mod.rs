//! Distribution controller.
//!
//! Some commands accepted by one partition must be applied on other partitions as well. The
//! origin partition persists the command along with one pending leg per target partition, pushes
//! it to every target until each one acknowledges it, and appends a completion event to its own
//! log once all legs are acknowledged. Pending legs are replayed on restart, so targets may see a
//! command more than once and apply it idempotently.

mod records;
mod state;
pub mod transport;


use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

pub use records::{CommandDistributionRecord, PersistedPendingDeployment};
pub use state::{Acknowledgement, DistributionState};

use crate::config::Config;
use crate::database::Database;
use crate::distribution::transport::{AppendError, PartitionLog, PartitionTransport, PushError, SledPartitionLog};
use crate::error::{ShutdownError, ShutdownResult, StorageResult};
use crate::models::proto::distribution::{DistributedCommand, LogEntry, LogEntryKind};
use crate::storage::TransactionContext;
use crate::utils;

/// The source position recorded on entries whose origin position is not known to the partition.
pub const UNKNOWN_POSITION: i64 = -1;

const METRIC_PUSHES: &str = "hadron_cluster_distribution_pushes";
const METRIC_PUSH_RETRIES: &str = "hadron_cluster_distribution_push_retries";
const METRIC_DISTRIBUTIONS_COMPLETED: &str = "hadron_cluster_distributions_completed";
const METRIC_COMMANDS_RECEIVED: &str = "hadron_cluster_distribution_commands_received";
const METRIC_PENDING_LEGS: &str = "hadron_cluster_distribution_pending_legs";

/// A message bound for a distribution controller.
pub enum DistributionCtlMsg {
    /// Distribute a command accepted on this partition to the given target partitions.
    Distribute {
        distribution_key: i64,
        source_position: i64,
        command: DistributedCommand,
        targets: BTreeSet<u32>,
        tx: oneshot::Sender<StorageResult<()>>,
    },
    /// Apply a command distributed by another partition, acknowledging it through `tx`.
    Receive {
        origin: u32,
        record: CommandDistributionRecord,
        tx: oneshot::Sender<Result<(), PushError>>,
    },
    /// The outcome of pushing a leg to its target.
    PushFinished {
        distribution_key: i64,
        partition: u32,
        result: Result<(), PushError>,
    },
    /// A timer fired to retry pushing a leg.
    RetryPush { distribution_key: i64, partition: u32 },
    /// A timer fired to retry completing a distribution.
    RetryCompletion { distribution_key: i64 },
}

/// The state of an unacknowledged leg.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LegPhase {
    /// A push is in flight.
    Pushing,
    /// The last push failed and a retry is scheduled.
    Retrying,
}

struct Leg {
    record: CommandDistributionRecord,
    phase: LegPhase,
    backoff: ExponentialBackoff,
}

/// A controller distributing commands from one partition & receiving commands for it.
pub struct DistributionCtl {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The partition of this controller.
    partition: u32,
    /// The transaction context of this partition's DB tree.
    ctx: TransactionContext,
    state: DistributionState,
    log: Arc<dyn PartitionLog>,
    transport: Arc<dyn PartitionTransport>,

    /// Unacknowledged legs, keyed by distribution key & target partition.
    legs: BTreeMap<(i64, u32), Leg>,
    /// Distributions whose completion event is awaiting space in the log.
    completions: BTreeMap<i64, (PersistedPendingDeployment, ExponentialBackoff)>,

    /// A channel of inbound messages.
    events_tx: mpsc::Sender<DistributionCtlMsg>,
    /// A channel of inbound messages.
    events_rx: ReceiverStream<DistributionCtlMsg>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
    /// A bool indicating that this controller has been descheduled and needs to shutdown.
    descheduled: bool,
}

impl DistributionCtl {
    /// Create a new instance.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        config: Arc<Config>, db: &Database, partition: u32, transport: Arc<dyn PartitionTransport>, shutdown_tx: broadcast::Sender<()>,
        events_tx: mpsc::Sender<DistributionCtlMsg>, events_rx: mpsc::Receiver<DistributionCtlMsg>,
    ) -> Result<Self> {
        metrics::register_counter!(METRIC_PUSHES, metrics::Unit::Count, "pushes of distributed commands to target partitions");
        metrics::register_counter!(METRIC_PUSH_RETRIES, metrics::Unit::Count, "retries of failed pushes of distributed commands");
        metrics::register_counter!(METRIC_DISTRIBUTIONS_COMPLETED, metrics::Unit::Count, "distributions acknowledged by all of their targets");
        metrics::register_counter!(METRIC_COMMANDS_RECEIVED, metrics::Unit::Count, "distributed commands applied on this member's partitions");
        metrics::register_gauge!(METRIC_PENDING_LEGS, metrics::Unit::Count, "unacknowledged legs of the distributions of this member's partitions");

        let tree = db.get_partition_tree(partition).await?;
        let ctx = TransactionContext::new(tree);
        let log_ctx = ctx.clone();
        let log = Database::spawn_blocking(move || SledPartitionLog::open(&log_ctx))
            .await?
            .with_context(|| format!("error opening log of partition {}", partition))?;
        Ok(Self {
            config,
            partition,
            state: DistributionState::new(&ctx),
            ctx,
            log: Arc::new(log),
            transport,
            legs: BTreeMap::new(),
            completions: BTreeMap::new(),
            events_tx,
            events_rx: ReceiverStream::new(events_rx),
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            descheduled: false,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(partition = self.partition, "distribution controller has started");

        // Replay pending distributions before accepting new work.
        if let Err(err) = self.replay_pending_distributions().await {
            tracing::error!(error = ?err, partition = self.partition, "error replaying pending distributions");
            let _ = self.shutdown_tx.send(());
            return Err(err.into());
        }

        loop {
            if self.descheduled {
                break;
            }
            tokio::select! {
                msg_opt = self.events_rx.next() => self.handle_distribution_msg(msg_opt).await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!(partition = self.partition, pending_legs = self.legs.len(), "distribution controller has shutdown");
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn replay_pending_distributions(&mut self) -> ShutdownResult<()> {
        let state = self.state.clone();
        let pending = Database::spawn_blocking(move || -> StorageResult<Vec<(i64, PersistedPendingDeployment, BTreeSet<u32>)>> {
            let mut pending = vec![];
            state.for_each_pending_deployment(|key, deployment, partitions| {
                pending.push((key, deployment, partitions));
                Ok(())
            })?;
            Ok(pending)
        })
        .await?
        .context("error reading pending distributions")
        .map_err(ShutdownError::from)?;

        for (key, deployment, partitions) in pending {
            let command: DistributedCommand = utils::decode_model(&deployment.payload)
                .with_context(|| format!("error decoding pending deployment {}", key))
                .map_err(ShutdownError::from)?;
            if partitions.is_empty() {
                tracing::debug!(distribution_key = key, "completing fully acknowledged distribution");
                self.complete_distribution(key, deployment, self.config.retry_backoff()).await?;
                continue;
            }
            tracing::debug!(distribution_key = key, ?partitions, "replaying pending distribution");
            for partition in partitions {
                self.start_push(CommandDistributionRecord::new(key, partition, &command));
            }
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, msg_opt))]
    async fn handle_distribution_msg(&mut self, msg_opt: Option<DistributionCtlMsg>) {
        let msg = match msg_opt {
            Some(msg) => msg,
            None => {
                self.descheduled = true;
                return;
            }
        };
        let res = match msg {
            DistributionCtlMsg::Distribute {
                distribution_key,
                source_position,
                command,
                targets,
                tx,
            } => self.handle_distribute(distribution_key, source_position, command, targets, tx).await,
            DistributionCtlMsg::Receive { origin, record, tx } => self.handle_receive(origin, record, tx).await,
            DistributionCtlMsg::PushFinished {
                distribution_key,
                partition,
                result,
            } => self.handle_push_finished(distribution_key, partition, result).await,
            DistributionCtlMsg::RetryPush { distribution_key, partition } => {
                self.handle_retry_push(distribution_key, partition);
                Ok(())
            }
            DistributionCtlMsg::RetryCompletion { distribution_key } => self.handle_retry_completion(distribution_key).await,
        };
        if let Err(err) = res {
            tracing::error!(error = ?err, partition = self.partition, "error handling distribution message, shutting down");
            let _ = self.shutdown_tx.send(());
            self.descheduled = true;
        }
    }

    #[tracing::instrument(level = "trace", skip(self, command, tx))]
    async fn handle_distribute(
        &mut self, distribution_key: i64, source_position: i64, command: DistributedCommand, targets: BTreeSet<u32>, tx: oneshot::Sender<StorageResult<()>>,
    ) -> ShutdownResult<()> {
        let (state, command_ref, targets_ref) = (self.state.clone(), command.clone(), targets.clone());
        let res = Database::spawn_blocking(move || state.add_pending_distribution(distribution_key, source_position, &command_ref, &targets_ref)).await?;
        if let Err(err) = res {
            tracing::debug!(error = ?err, distribution_key, "error recording new distribution");
            let _ = tx.send(Err(err));
            return Ok(());
        }
        let _ = tx.send(Ok(()));

        if targets.is_empty() {
            let deployment = PersistedPendingDeployment::new(
                source_position,
                utils::encode_model(&command).map_err(ShutdownError::from)?,
            );
            return self.complete_distribution(distribution_key, deployment, self.config.retry_backoff()).await;
        }
        for partition in targets {
            self.start_push(CommandDistributionRecord::new(distribution_key, partition, &command));
        }
        Ok(())
    }

    /// Push the given leg to its target in the background, reporting back to this controller.
    fn start_push(&mut self, record: CommandDistributionRecord) {
        let leg_key = (record.distribution_key, record.partition_id);
        let leg = self.legs.entry(leg_key).or_insert_with(|| Leg {
            record: record.clone(),
            phase: LegPhase::Pushing,
            backoff: self.config.retry_backoff(),
        });
        leg.phase = LegPhase::Pushing;
        metrics::increment_counter!(METRIC_PUSHES);
        metrics::gauge!(METRIC_PENDING_LEGS, self.legs.len() as f64);

        let (transport, events_tx, origin) = (self.transport.clone(), self.events_tx.clone(), self.partition);
        tokio::spawn(async move {
            let result = transport.push(origin, record).await;
            let _ = events_tx
                .send(DistributionCtlMsg::PushFinished {
                    distribution_key: leg_key.0,
                    partition: leg_key.1,
                    result,
                })
                .await;
        });
    }

    #[tracing::instrument(level = "trace", skip(self, result))]
    async fn handle_push_finished(&mut self, distribution_key: i64, partition: u32, result: Result<(), PushError>) -> ShutdownResult<()> {
        let leg = match self.legs.get_mut(&(distribution_key, partition)) {
            Some(leg) => leg,
            None => return Ok(()),
        };
        if let Err(err) = result {
            tracing::debug!(error = ?err, distribution_key, partition, "error pushing distributed command, will retry");
            metrics::increment_counter!(METRIC_PUSH_RETRIES);
            leg.phase = LegPhase::Retrying;
            let delay = leg.backoff.next_backoff().unwrap_or(leg.backoff.max_interval);
            let events_tx = self.events_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events_tx.send(DistributionCtlMsg::RetryPush { distribution_key, partition }).await;
            });
            return Ok(());
        }

        self.legs.remove(&(distribution_key, partition));
        metrics::gauge!(METRIC_PENDING_LEGS, self.legs.len() as f64);
        let state = self.state.clone();
        let ack = Database::spawn_blocking(move || state.acknowledge(distribution_key, partition))
            .await?
            .with_context(|| format!("error acknowledging distribution {} to partition {}", distribution_key, partition))
            .map_err(ShutdownError::from)?;
        match ack {
            Acknowledgement::Unknown => {
                tracing::debug!(distribution_key, partition, "ignoring acknowledgement of unknown distribution leg");
                Ok(())
            }
            Acknowledgement::Pending { remaining } => {
                tracing::trace!(distribution_key, partition, remaining, "distribution leg acknowledged");
                Ok(())
            }
            Acknowledgement::Completed(deployment) => self.complete_distribution(distribution_key, deployment, self.config.retry_backoff()).await,
        }
    }

    fn handle_retry_push(&mut self, distribution_key: i64, partition: u32) {
        let record = match self.legs.get(&(distribution_key, partition)) {
            Some(leg) if leg.phase == LegPhase::Retrying => leg.record.clone(),
            _ => return,
        };
        self.start_push(record);
    }

    /// Append the completion event of a fully acknowledged distribution & delete its deployment.
    ///
    /// If the log is full, the completion is retried after a backoff.
    async fn complete_distribution(&mut self, distribution_key: i64, deployment: PersistedPendingDeployment, mut backoff: ExponentialBackoff) -> ShutdownResult<()> {
        let entry = LogEntry {
            kind: LogEntryKind::Distributed as i32,
            distribution_key,
            source_position: deployment.source_position,
            origin_partition: self.partition,
            command: None,
        };
        let (ctx, state, log) = (self.ctx.clone(), self.state.clone(), self.log.clone());
        let res = Database::spawn_blocking(move || {
            ctx.run_in_transaction(|| -> Result<u64, AppendError> {
                let position = log.try_append(&entry)?;
                state.complete_deployment(distribution_key)?;
                Ok(position)
            })
        })
        .await?;

        match res {
            Ok(position) => {
                tracing::debug!(distribution_key, position, "distribution completed");
                metrics::increment_counter!(METRIC_DISTRIBUTIONS_COMPLETED);
                Ok(())
            }
            Err(AppendError::Full) => {
                tracing::debug!(distribution_key, "partition log is full, will retry completing distribution");
                let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                self.completions.insert(distribution_key, (deployment, backoff));
                let events_tx = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events_tx.send(DistributionCtlMsg::RetryCompletion { distribution_key }).await;
                });
                Ok(())
            }
            Err(err) => Err(ShutdownError(anyhow::Error::from(err).context(format!("error completing distribution {}", distribution_key)))),
        }
    }

    async fn handle_retry_completion(&mut self, distribution_key: i64) -> ShutdownResult<()> {
        match self.completions.remove(&distribution_key) {
            Some((deployment, backoff)) => self.complete_distribution(distribution_key, deployment, backoff).await,
            None => Ok(()),
        }
    }

    /// Apply a command distributed by another partition, at most once per distribution.
    #[tracing::instrument(level = "trace", skip(self, record, tx), fields(distribution_key = record.distribution_key))]
    async fn handle_receive(&mut self, origin: u32, record: CommandDistributionRecord, tx: oneshot::Sender<Result<(), PushError>>) -> ShutdownResult<()> {
        let entry = LogEntry {
            kind: LogEntryKind::Applied as i32,
            distribution_key: record.distribution_key,
            source_position: UNKNOWN_POSITION,
            origin_partition: origin,
            command: Some(record.command()),
        };
        let (ctx, state, log, key) = (self.ctx.clone(), self.state.clone(), self.log.clone(), record.distribution_key);
        let res = Database::spawn_blocking(move || {
            ctx.run_in_transaction(|| -> Result<Option<u64>, AppendError> {
                if !state.mark_received(origin, key)? {
                    return Ok(None);
                }
                Ok(Some(log.try_append(&entry)?))
            })
        })
        .await?;

        let reply = match res {
            Ok(Some(position)) => {
                tracing::debug!(origin, distribution_key = key, position, "applied distributed command");
                metrics::increment_counter!(METRIC_COMMANDS_RECEIVED);
                Ok(())
            }
            Ok(None) => {
                tracing::debug!(origin, distribution_key = key, "distributed command already applied");
                Ok(())
            }
            Err(AppendError::Full) => Err(PushError::Backpressure(self.partition)),
            Err(err) => {
                tracing::error!(error = ?err, origin, distribution_key = key, "error applying distributed command");
                Err(PushError::Rejected(self.partition, err.to_string()))
            }
        };
        let _ = tx.send(reply);
        Ok(())
    }
}
