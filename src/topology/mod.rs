//! Cluster topology: partition placement, configuration changes & their coordination.

pub mod api;
mod changes;
mod distributor;
pub mod manager;
pub mod messaging;
mod models;
mod store;
mod util;

#[cfg(test)]
mod api_test;
#[cfg(test)]
mod changes_test;
#[cfg(test)]
mod store_test;

pub use changes::{ChangePlanner, PlannedChange};
pub use distributor::{PartitionDistributor, RoundRobinPartitionDistributor};
pub use models::*;
pub use store::{RecoveredTopology, TopologyStore};
pub use util::{from_distribution, to_distribution, ConfigurationError};
