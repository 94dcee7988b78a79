//! Messaging between cluster members.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, oneshot};

use crate::topology::api::{ManagementRequest, ManagementResult};
use crate::topology::manager::TopologyManagerMsg;
use crate::topology::{ClusterConfiguration, MemberId};

/// Errors from sending a message to another member.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// No route to the member is known.
    #[error("member {0} is unreachable")]
    Unreachable(MemberId),
    /// The member dropped the message before responding.
    #[error("member {0} closed the connection before responding")]
    Closed(MemberId),
}

/// The transport used by members to exchange topology requests & configurations.
#[async_trait::async_trait]
pub trait ClusterMessaging: Send + Sync + 'static {
    /// Send a management request to the given member and await its response.
    async fn send_request(&self, target: MemberId, request: ManagementRequest) -> Result<ManagementResult, MessagingError>;

    /// Publish a configuration to the given member.
    async fn publish_configuration(&self, from: MemberId, target: MemberId, configuration: ClusterConfiguration) -> Result<(), MessagingError>;
}

/// A mapping of member IDs to the channels of their topology managers.
pub type MembersMap = HashMap<MemberId, mpsc::Sender<TopologyManagerMsg>>;

/// In-process messaging between the topology managers of co-located members.
#[derive(Clone, Default)]
pub struct LocalMessaging {
    members: Arc<ArcSwap<MembersMap>>,
}

impl LocalMessaging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the channel of a member's topology manager.
    pub fn register(&self, member: MemberId, tx: mpsc::Sender<TopologyManagerMsg>) {
        let mut updated = self.members.load().as_ref().clone();
        updated.insert(member, tx);
        self.members.store(Arc::new(updated));
    }

    /// Remove the route to the given member.
    pub fn deregister(&self, member: MemberId) {
        let mut updated = self.members.load().as_ref().clone();
        updated.remove(&member);
        self.members.store(Arc::new(updated));
    }

    fn route(&self, member: MemberId) -> Result<mpsc::Sender<TopologyManagerMsg>, MessagingError> {
        self.members.load().get(&member).cloned().ok_or(MessagingError::Unreachable(member))
    }
}

#[async_trait::async_trait]
impl ClusterMessaging for LocalMessaging {
    async fn send_request(&self, target: MemberId, request: ManagementRequest) -> Result<ManagementResult, MessagingError> {
        let member_tx = self.route(target)?;
        let (tx, rx) = oneshot::channel();
        member_tx
            .send(TopologyManagerMsg::Request { request, tx })
            .await
            .map_err(|_| MessagingError::Unreachable(target))?;
        rx.await.map_err(|_| MessagingError::Closed(target))
    }

    async fn publish_configuration(&self, from: MemberId, target: MemberId, configuration: ClusterConfiguration) -> Result<(), MessagingError> {
        let member_tx = self.route(target)?;
        member_tx
            .send(TopologyManagerMsg::ConfigurationReceived { from, configuration })
            .await
            .map_err(|_| MessagingError::Unreachable(target))
    }
}
