//! Topology manager.
//!
//! Every member runs one topology manager, which owns the member's view of the cluster
//! configuration. The coordinator's manager additionally plans & drives topology changes, executing
//! their operations one at a time and publishing every transition to its peers.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::config::Config;
use crate::database::Database;
use crate::error::{ShutdownError, ShutdownResult};
use crate::topology::api::{ErrorKind, ErrorResponse, ManagementRequest, ManagementResponse, ManagementResult, TopologyChangeResponse};
use crate::topology::messaging::ClusterMessaging;
use crate::topology::{
    from_distribution, ChangeId, ChangePlanner, ChangeStatus, ClusterChangePlan, ClusterConfiguration, CompletedChange, ConfigurationChangeOperation,
    DynamicPartitionConfig, MemberId, MemberState, MemberStatus, PartitionDistributor, PartitionId, RoutingState, TopologyStore,
};
use crate::utils;

const METRIC_TOPOLOGY_VERSION: &str = "hadron_cluster_topology_version";
const METRIC_CHANGES_STARTED: &str = "hadron_cluster_topology_changes_started";
const METRIC_CHANGES_COMPLETED: &str = "hadron_cluster_topology_changes_completed";
const METRIC_CHANGES_CANCELLED: &str = "hadron_cluster_topology_changes_cancelled";
const METRIC_OPERATIONS_APPLIED: &str = "hadron_cluster_topology_operations_applied";
const METRIC_OPERATION_RETRIES: &str = "hadron_cluster_topology_operation_retries";

/// Executes the side effects of topology change operations, such as starting partition replicas.
#[async_trait::async_trait]
pub trait OperationExecutor: Send + Sync + 'static {
    /// Execute the given operation, resolving once it has taken effect.
    async fn execute(&self, operation: &ConfigurationChangeOperation) -> Result<()>;
}

/// An executor for members without a replication layer, where operations take effect immediately.
pub struct ImmediateOperationExecutor;

#[async_trait::async_trait]
impl OperationExecutor for ImmediateOperationExecutor {
    async fn execute(&self, operation: &ConfigurationChangeOperation) -> Result<()> {
        tracing::debug!(%operation, "applying topology change operation");
        Ok(())
    }
}

/// A message bound for a topology manager.
pub enum TopologyManagerMsg {
    /// A management request along with its response channel.
    Request {
        request: ManagementRequest,
        tx: oneshot::Sender<ManagementResult>,
    },
    /// A configuration published by another member.
    ConfigurationReceived { from: MemberId, configuration: ClusterConfiguration },
    /// The result of executing the current operation.
    OperationFinished { epoch: u64, result: Result<()> },
    /// A timer fired to retry the current operation.
    RetryOperation { epoch: u64 },
}

/// A controller owning a member's view of the cluster configuration.
pub struct TopologyManager {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The ID of this member.
    id: MemberId,
    /// The persisted topology state of this member.
    store: TopologyStore,
    planner: ChangePlanner,
    executor: Arc<dyn OperationExecutor>,
    messaging: Arc<dyn ClusterMessaging>,

    /// The current configuration.
    configuration: Arc<ClusterConfiguration>,
    /// The configuration in effect before the pending change started, if a change is pending.
    last_stable: Option<Arc<ClusterConfiguration>>,
    /// A signal of the current configuration.
    topology_tx: watch::Sender<Arc<ClusterConfiguration>>,

    /// A channel of inbound messages.
    events_tx: mpsc::Sender<TopologyManagerMsg>,
    /// A channel of inbound messages.
    events_rx: ReceiverStream<TopologyManagerMsg>,
    /// The epoch of the currently executing operation; results of older epochs are ignored.
    epoch: u64,
    /// The retry policy of failed operations.
    backoff: ExponentialBackoff,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
    /// A bool indicating that this controller has been descheduled and needs to shutdown.
    descheduled: bool,
}

impl TopologyManager {
    /// Create a new instance, recovering the member's configuration or bootstrapping a new one.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        config: Arc<Config>, db: &Database, distributor: Arc<dyn PartitionDistributor>, executor: Arc<dyn OperationExecutor>, messaging: Arc<dyn ClusterMessaging>,
        shutdown_tx: broadcast::Sender<()>, events_tx: mpsc::Sender<TopologyManagerMsg>, events_rx: mpsc::Receiver<TopologyManagerMsg>,
    ) -> Result<(Self, watch::Receiver<Arc<ClusterConfiguration>>)> {
        metrics::register_gauge!(METRIC_TOPOLOGY_VERSION, metrics::Unit::Count, "the version of this member's cluster configuration");
        metrics::register_counter!(METRIC_CHANGES_STARTED, metrics::Unit::Count, "topology changes started by this member");
        metrics::register_counter!(METRIC_CHANGES_COMPLETED, metrics::Unit::Count, "topology changes completed by this member");
        metrics::register_counter!(METRIC_CHANGES_CANCELLED, metrics::Unit::Count, "topology changes cancelled or failed on this member");
        metrics::register_counter!(METRIC_OPERATIONS_APPLIED, metrics::Unit::Count, "topology change operations applied by this member");
        metrics::register_counter!(METRIC_OPERATION_RETRIES, metrics::Unit::Count, "retries of failed topology change operations");

        let tree = db.get_topology_tree().await?;
        let store = TopologyStore::new(tree);
        let recovered = store.recover().await.context("error recovering cluster topology")?;
        let (configuration, last_stable, bootstrapped) = match recovered.current {
            Some(current) => (current, recovered.last_stable, false),
            None => (bootstrap_configuration(&config, distributor.as_ref()), None, true),
        };
        let planner = ChangePlanner::new(distributor, config.partition_group.as_str(), config.replication_factor);
        let configuration = Arc::new(configuration);
        let (topology_tx, topology_rx) = watch::channel(configuration.clone());

        let manager = Self {
            id: config.member(),
            backoff: config.retry_backoff(),
            config,
            store,
            planner,
            executor,
            messaging,
            configuration,
            last_stable: last_stable.map(Arc::new),
            topology_tx,
            events_tx,
            events_rx: ReceiverStream::new(events_rx),
            epoch: 0,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            descheduled: false,
        };
        if bootstrapped {
            manager.persist().await?;
        }
        Ok((manager, topology_rx))
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(
            member = %self.id,
            version = self.configuration.version,
            cluster_id = ?self.config.cluster_id,
            "topology manager has started"
        );
        let broadcaster = spawn_broadcaster(self.id, self.messaging.clone(), self.topology_tx.subscribe(), self.shutdown_tx.subscribe());
        self.publish();

        // Resume a change which this member was driving before it stopped.
        let resumable = self.configuration.pending_change.as_ref().map(|plan| plan.coordinator == self.id).unwrap_or(false);
        if resumable {
            tracing::info!(change_id = ?self.configuration.pending_change_id(), "resuming pending topology change");
            if let Err(err) = self.advance_change().await {
                tracing::error!(error = ?err, "error resuming pending topology change");
                let _ = self.shutdown_tx.send(());
                self.descheduled = true;
            }
        }

        loop {
            if self.descheduled {
                break;
            }
            tokio::select! {
                msg_opt = self.events_rx.next() => self.handle_msg(msg_opt).await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        broadcaster.abort();
        tracing::debug!(member = %self.id, version = self.configuration.version, "topology manager has shutdown");
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, msg_opt))]
    async fn handle_msg(&mut self, msg_opt: Option<TopologyManagerMsg>) {
        let msg = match msg_opt {
            Some(msg) => msg,
            None => {
                self.descheduled = true;
                return;
            }
        };
        let res = match msg {
            TopologyManagerMsg::Request { request, tx } => self.handle_request(request, tx).await,
            TopologyManagerMsg::ConfigurationReceived { from, configuration } => self.handle_configuration_received(from, configuration).await,
            TopologyManagerMsg::OperationFinished { epoch, result } => self.handle_operation_finished(epoch, result).await,
            TopologyManagerMsg::RetryOperation { epoch } => {
                self.handle_retry_operation(epoch);
                Ok(())
            }
        };
        if let Err(err) = res {
            tracing::error!(error = ?err, "error handling topology manager message, shutting down");
            let _ = self.shutdown_tx.send(());
            self.descheduled = true;
        }
    }

    #[tracing::instrument(level = "trace", skip(self, request, tx), fields(request = request.name()))]
    async fn handle_request(&mut self, request: ManagementRequest, tx: oneshot::Sender<ManagementResult>) -> ShutdownResult<()> {
        let result = match request {
            ManagementRequest::GetTopology => Ok(ManagementResponse::Topology(self.configuration.as_ref().clone())),
            ManagementRequest::CancelChange(req) => self.cancel_change(req.change_id).await?,
            request => self.start_change(request).await?,
        };
        if let Err(err) = &result {
            tracing::debug!(error = %err, "rejected topology management request");
        }
        let _ = tx.send(result);
        Ok(())
    }

    /// Plan the given request and start the resulting change, unless it is a dry run.
    async fn start_change(&mut self, request: ManagementRequest) -> ShutdownResult<ManagementResult> {
        let coordinator = match &request {
            ManagementRequest::ForceScaleDown(req) => req.members.iter().next().copied(),
            _ => self.configuration.coordinator(),
        };
        if coordinator != Some(self.id) {
            return Ok(Err(ErrorResponse::new(
                ErrorKind::NotCoordinator,
                format!("member {} cannot coordinate {} requests, the coordinator is {:?}", self.id, request.name(), coordinator),
            )));
        }
        if let Some(change_id) = self.configuration.pending_change_id() {
            return Ok(Err(ErrorResponse::new(
                ErrorKind::ConcurrentModification,
                format!("cannot start a new change while change {} is in progress", change_id),
            )));
        }

        let planned = match self.planner.plan(&self.configuration, &request) {
            Ok(planned) => planned,
            Err(err) => return Ok(Err(err)),
        };
        let change_id = self.next_change_id();
        let response = TopologyChangeResponse {
            change_id: if planned.operations.is_empty() { self.configuration.version } else { change_id },
            current_topology: self.configuration.members.clone(),
            expected_topology: planned.expected.members,
            planned_changes: planned.operations.clone(),
        };
        if request.is_dry_run() || planned.operations.is_empty() {
            return Ok(Ok(ManagementResponse::TopologyChange(response)));
        }

        tracing::info!(change_id, operations = planned.operations.len(), "starting topology change: {}", request.name());
        let plan = ClusterChangePlan::new(change_id, self.id, planned.operations);
        self.last_stable = Some(self.configuration.clone());
        self.configuration = Arc::new(self.configuration.start_change(plan));
        metrics::increment_counter!(METRIC_CHANGES_STARTED);
        self.backoff.reset();
        self.advance_change().await?;
        Ok(Ok(ManagementResponse::TopologyChange(response)))
    }

    /// The ID of the next change, which is never reused even when changes are cancelled.
    fn next_change_id(&self) -> ChangeId {
        let last_id = self.configuration.last_change.as_ref().map(|change| change.id).unwrap_or_default();
        self.configuration.version.max(last_id) + 1
    }

    /// Start the next operation of the pending change, or complete the change if none are left.
    async fn advance_change(&mut self) -> ShutdownResult<()> {
        let plan = match self.configuration.pending_change.clone() {
            Some(plan) => plan,
            None => return Ok(()),
        };
        let operation = match plan.next_operation() {
            Some(operation) => operation.clone(),
            None => return self.complete_change().await,
        };

        // An operation started before a restart is resumed from its intermediate state.
        let started = match operation.start(&self.configuration) {
            Ok(started) => started,
            Err(_) if operation.complete(&self.configuration).is_ok() => self.configuration.as_ref().clone(),
            Err(err) => {
                tracing::error!(error = %err, %operation, "topology change operation can not be applied, aborting change");
                return self.finish_change(ChangeStatus::Failed).await.map(|_| ());
            }
        };
        self.configuration = Arc::new(started);
        self.persist().await?;
        self.publish();
        self.dispatch_operation(operation);
        Ok(())
    }

    /// Execute the given operation in the background, reporting back to this controller.
    fn dispatch_operation(&mut self, operation: ConfigurationChangeOperation) {
        self.epoch += 1;
        let (epoch, executor, tx) = (self.epoch, self.executor.clone(), self.events_tx.clone());
        tokio::spawn(async move {
            let result = executor.execute(&operation).await;
            let _ = tx.send(TopologyManagerMsg::OperationFinished { epoch, result }).await;
        });
    }

    #[tracing::instrument(level = "trace", skip(self, result))]
    async fn handle_operation_finished(&mut self, epoch: u64, result: Result<()>) -> ShutdownResult<()> {
        if epoch != self.epoch {
            tracing::trace!(epoch, current = self.epoch, "ignoring result of stale topology change operation");
            return Ok(());
        }
        let plan = match self.configuration.pending_change.clone() {
            Some(plan) => plan,
            None => return Ok(()),
        };
        let operation = match plan.next_operation() {
            Some(operation) => operation.clone(),
            None => return Ok(()),
        };

        if let Err(err) = result {
            tracing::debug!(error = ?err, %operation, "error executing topology change operation, will retry");
            metrics::increment_counter!(METRIC_OPERATION_RETRIES);
            let delay = self.backoff.next_backoff().unwrap_or(self.backoff.max_interval);
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(TopologyManagerMsg::RetryOperation { epoch }).await;
            });
            return Ok(());
        }

        self.backoff.reset();
        let completed = match operation.complete(&self.configuration) {
            Ok(completed) => completed,
            Err(err) => {
                tracing::error!(error = %err, %operation, "topology change operation can not be completed, aborting change");
                return self.finish_change(ChangeStatus::Failed).await.map(|_| ());
            }
        };
        tracing::debug!(%operation, "topology change operation applied");
        metrics::increment_counter!(METRIC_OPERATIONS_APPLIED);
        self.configuration = Arc::new(completed.with_pending_change(plan.advance()));
        self.advance_change().await
    }

    fn handle_retry_operation(&mut self, epoch: u64) {
        if epoch != self.epoch {
            return;
        }
        let operation = match self.configuration.pending_change.as_ref().and_then(|plan| plan.next_operation()) {
            Some(operation) => operation.clone(),
            None => return,
        };
        tracing::debug!(%operation, "retrying topology change operation");
        self.dispatch_operation(operation);
    }

    async fn complete_change(&mut self) -> ShutdownResult<()> {
        self.configuration = Arc::new(self.configuration.complete_change());
        self.last_stable = None;
        self.epoch += 1;
        self.persist().await?;
        self.publish();
        metrics::increment_counter!(METRIC_CHANGES_COMPLETED);
        tracing::info!(version = self.configuration.version, "topology change completed");
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn cancel_change(&mut self, change_id: ChangeId) -> ShutdownResult<ManagementResult> {
        let plan = match self.configuration.pending_change.as_ref() {
            Some(plan) => plan,
            None => return Ok(Err(ErrorResponse::invalid_request(format!("change {} can not be cancelled, no change is in progress", change_id)))),
        };
        if plan.id != change_id {
            return Ok(Err(ErrorResponse::invalid_request(format!(
                "change {} can not be cancelled, the change in progress is {}",
                change_id, plan.id
            ))));
        }
        if plan.coordinator != self.id {
            return Ok(Err(ErrorResponse::new(
                ErrorKind::NotCoordinator,
                format!("change {} is coordinated by member {}", change_id, plan.coordinator),
            )));
        }

        let (current_topology, planned_changes) = (self.configuration.members.clone(), plan.pending_operations.clone());
        let restored = self.finish_change(ChangeStatus::Cancelled).await?;
        tracing::info!(change_id, version = restored.version, "topology change cancelled");
        Ok(Ok(ManagementResponse::TopologyChange(TopologyChangeResponse {
            change_id,
            current_topology,
            expected_topology: restored.members.clone(),
            planned_changes,
        })))
    }

    /// Abandon the pending change, returning to the last stable configuration.
    async fn finish_change(&mut self, status: ChangeStatus) -> ShutdownResult<Arc<ClusterConfiguration>> {
        let last_change = self.configuration.pending_change.as_ref().map(|plan| CompletedChange {
            id: plan.id,
            status,
            started_at: plan.started_at,
            completed_at: utils::now_millis(),
        });
        let mut restored = match self.last_stable.take() {
            Some(stable) => stable.as_ref().clone(),
            None => ClusterConfiguration {
                pending_change: None,
                ..self.configuration.as_ref().clone()
            },
        };
        restored.last_change = last_change.or(restored.last_change);
        self.configuration = Arc::new(restored);
        self.epoch += 1;
        self.persist().await?;
        self.publish();
        metrics::increment_counter!(METRIC_CHANGES_CANCELLED);
        Ok(self.configuration.clone())
    }

    /// Adopt a configuration published by another member if it supersedes this member's view.
    #[tracing::instrument(level = "trace", skip(self, configuration))]
    async fn handle_configuration_received(&mut self, from: MemberId, configuration: ClusterConfiguration) -> ShutdownResult<()> {
        if from == self.id || configuration == *self.configuration {
            return Ok(());
        }
        let newer = configuration.version > self.configuration.version;
        let from_coordinator = configuration.version == self.configuration.version && change_coordinator(&configuration) == Some(from);
        if !newer && !from_coordinator {
            tracing::trace!(%from, version = configuration.version, "ignoring outdated cluster configuration");
            return Ok(());
        }

        tracing::debug!(%from, version = configuration.version, "adopting cluster configuration");
        self.last_stable = match (&configuration.pending_change, &self.last_stable) {
            (None, _) => None,
            (Some(_), Some(stable)) => Some(stable.clone()),
            (Some(_), None) => Some(self.configuration.clone()),
        };
        self.configuration = Arc::new(configuration);
        self.epoch += 1;
        self.persist().await?;
        self.publish();
        Ok(())
    }

    /// Persist the current configuration along with the last stable configuration.
    async fn persist(&self) -> ShutdownResult<()> {
        let (store, current, stable) = (self.store.clone(), self.configuration.clone(), self.last_stable.clone());
        Database::spawn_blocking(move || store.persist(&current, stable.as_deref()))
            .await?
            .context("error persisting cluster configuration")
            .map_err(ShutdownError::from)
    }

    /// Publish the current configuration to this member's subscribers.
    fn publish(&self) {
        metrics::gauge!(METRIC_TOPOLOGY_VERSION, self.configuration.version as f64);
        let _ = self.topology_tx.send(self.configuration.clone());
    }
}

/// The member responsible for publishing the given configuration.
fn change_coordinator(configuration: &ClusterConfiguration) -> Option<MemberId> {
    configuration
        .pending_change
        .as_ref()
        .map(|plan| plan.coordinator)
        .or_else(|| configuration.coordinator())
}

/// Spawn a task which publishes the configurations coordinated by this member to all peers, in order.
fn spawn_broadcaster(
    id: MemberId, messaging: Arc<dyn ClusterMessaging>, mut topology_rx: watch::Receiver<Arc<ClusterConfiguration>>, shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let mut shutdown_rx = BroadcastStream::new(shutdown_rx);
    tokio::spawn(async move {
        // Peers removed by a change still need to learn about their removal.
        let mut previous_members: BTreeSet<MemberId> = BTreeSet::new();
        loop {
            tokio::select! {
                res = topology_rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
                _ = shutdown_rx.next() => break,
            }
            let configuration = topology_rx.borrow().clone();
            let members: BTreeSet<MemberId> = configuration.members.keys().copied().collect();
            if change_coordinator(&configuration) == Some(id) {
                for target in members.union(&previous_members).filter(|member| **member != id) {
                    if let Err(err) = messaging.publish_configuration(id, *target, configuration.as_ref().clone()).await {
                        tracing::debug!(error = ?err, %target, "error publishing cluster configuration");
                    }
                }
            }
            previous_members = members;
        }
    })
}

/// Build the initial configuration of a new cluster from the runtime config.
fn bootstrap_configuration(config: &Config, distributor: &dyn PartitionDistributor) -> ClusterConfiguration {
    let members: BTreeSet<MemberId> = config.cluster_members.iter().copied().map(MemberId).collect();
    let partitions: Vec<PartitionId> = (1..=config.partition_count)
        .map(|number| PartitionId::new(config.partition_group.as_str(), number))
        .collect();
    let distribution = distributor.distribute_partitions(&members, &partitions, config.replication_factor);
    let mut configuration = from_distribution(&distribution, &DynamicPartitionConfig::default(), config.cluster_id.clone());
    // Members without replicas are still part of the cluster.
    for member in members {
        if !configuration.has_member(member) {
            configuration = configuration.with_member(member, MemberState::new(MemberStatus::Active, Default::default()));
        }
    }
    if config.partition_scaling_enabled {
        configuration = configuration.with_routing(Some(RoutingState {
            partition_count: config.partition_count,
        }));
    }
    configuration
}
