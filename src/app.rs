use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::database::Database;
use crate::distribution::transport::LocalPartitionTransport;
use crate::distribution::{DistributionCtl, DistributionCtlMsg};
use crate::prom::spawn_prom_server;
use crate::topology::api::ClusterConfigurationManagementApi;
use crate::topology::manager::{ImmediateOperationExecutor, TopologyManager};
use crate::topology::messaging::LocalMessaging;
use crate::topology::{to_distribution, ClusterConfiguration, RoundRobinPartitionDistributor};

/// The application object for when a cluster member is running as a server.
pub struct App {
    /// The management API of this member's cluster.
    api: ClusterConfigurationManagementApi,
    /// This member's view of the cluster topology.
    topology_rx: watch::Receiver<Arc<ClusterConfiguration>>,
    /// The distribution controllers of the partitions this member leads.
    host: PartitionHost,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the topology manager.
    topology_handle: JoinHandle<Result<()>>,
    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(10);

        // Initialize this member's storage.
        let db = Database::new(config.clone()).await.context("error opening database")?;

        // Spawn the topology manager of this member.
        let messaging = LocalMessaging::new();
        let (topology_tx, topology_events_rx) = mpsc::channel(1000);
        let (manager, topology_rx) = TopologyManager::new(
            config.clone(),
            &db,
            Arc::new(RoundRobinPartitionDistributor),
            Arc::new(ImmediateOperationExecutor),
            Arc::new(messaging.clone()),
            shutdown_tx.clone(),
            topology_tx.clone(),
            topology_events_rx,
        )
        .await
        .context("error spawning topology manager")?;
        messaging.register(config.member(), topology_tx);
        let topology_handle = manager.spawn();
        let api = ClusterConfigurationManagementApi::new(Arc::new(messaging), config.default_coordinator(), config.request_timeout());

        let metrics_server = spawn_prom_server(&config, shutdown_tx.subscribe());
        let host = PartitionHost::new(config, db, LocalPartitionTransport::new(), shutdown_tx.clone());

        Ok(Self {
            api,
            topology_rx,
            host,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            topology_handle,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        match self.api.get_topology().await {
            Ok(topology) => tracing::info!(
                version = topology.version,
                members = topology.members.len(),
                partitions = topology.partitions().len(),
                "cluster topology loaded"
            ),
            Err(err) => tracing::error!(error = ?err, "error querying cluster topology"),
        }
        let topology = self.topology_rx.borrow().clone();
        self.host.host_partitions(&topology).await;

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                res = self.topology_rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                    let topology = self.topology_rx.borrow().clone();
                    self.host.host_partitions(&topology).await;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("cluster member is shutting down");
        let _ = self.shutdown_tx.send(());
        if let Err(err) = self.topology_handle.await.context("error joining topology manager handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down topology manager");
        }
        self.host.join().await;
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }

        tracing::debug!("cluster member shutdown complete");
        Ok(())
    }
}

/// The distribution controllers of the partitions hosted by this member.
pub(crate) struct PartitionHost {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The application's database system.
    db: Database,
    /// The transport between this member's distribution controllers.
    transport: LocalPartitionTransport,
    /// The channels & join handles of this member's distribution controllers, by partition.
    partitions: BTreeMap<u32, (mpsc::Sender<DistributionCtlMsg>, JoinHandle<Result<()>>)>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
}

impl PartitionHost {
    pub(crate) fn new(config: Arc<Config>, db: Database, transport: LocalPartitionTransport, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            config,
            db,
            transport,
            partitions: BTreeMap::new(),
            shutdown_tx,
        }
    }

    /// Route commands to the controllers of the partitions this member is now the primary of,
    /// spawning controllers as needed.
    ///
    /// Controllers of partitions this member no longer leads stop receiving commands but keep
    /// running until shutdown, so their pending distributions are still completed. They are routed
    /// to again if this member regains the partition.
    pub(crate) async fn host_partitions(&mut self, topology: &ClusterConfiguration) {
        let distribution = match to_distribution(topology, &self.config.partition_group) {
            Ok(distribution) => distribution,
            Err(err) => {
                tracing::debug!(error = ?err, version = topology.version, "no partition distribution to host");
                return;
            }
        };
        let member = self.config.member();
        for metadata in distribution {
            let partition = metadata.id.number;
            if metadata.primary != member {
                self.transport.deregister(partition);
                continue;
            }
            if let Some((events_tx, _)) = self.partitions.get(&partition) {
                self.transport.register(partition, events_tx.clone());
                continue;
            }

            let (events_tx, events_rx) = mpsc::channel(1000);
            let ctl = DistributionCtl::new(
                self.config.clone(),
                &self.db,
                partition,
                Arc::new(self.transport.clone()),
                self.shutdown_tx.clone(),
                events_tx.clone(),
                events_rx,
            )
            .await;
            match ctl {
                Ok(ctl) => {
                    tracing::info!(partition, version = topology.version, "hosting partition");
                    self.transport.register(partition, events_tx.clone());
                    self.partitions.insert(partition, (events_tx, ctl.spawn()));
                }
                Err(err) => {
                    tracing::error!(error = ?err, partition, "error spawning distribution controller");
                    let _ = self.shutdown_tx.send(());
                    return;
                }
            }
        }
        tracing::debug!(partitions = ?self.hosted_partitions(), version = topology.version, "hosted partitions updated");
    }

    /// The partitions which have a distribution controller on this member.
    pub(crate) fn hosted_partitions(&self) -> Vec<u32> {
        self.partitions.keys().copied().collect()
    }

    /// Join every distribution controller; shutdown must already have been signalled.
    pub(crate) async fn join(self) {
        for (partition, (_, handle)) in self.partitions {
            if let Err(err) = handle.await.context("error joining distribution controller handle").and_then(|res| res) {
                tracing::error!(error = ?err, partition, "error shutting down distribution controller");
            }
        }
    }
}
