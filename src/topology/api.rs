//! The cluster configuration management API.
//!
//! Mutating requests are routed to a single coordinator member, which serializes all topology
//! changes. Every call is bounded by a timeout and yields an explicit `ErrorResponse` on failure.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::topology::messaging::ClusterMessaging;
use crate::topology::{ChangeId, ClusterConfiguration, ConfigurationChangeOperation, MemberId, MemberState};

/// Request to add new members to the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddMembersRequest {
    pub members: BTreeSet<MemberId>,
}

/// Request to remove members without partitions from the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoveMembersRequest {
    pub members: BTreeSet<MemberId>,
}

/// Request to start a new replica of a partition on a member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinPartitionRequest {
    pub member_id: MemberId,
    pub partition_id: u32,
    pub priority: u32,
}

/// Request to stop a replica of a partition on a member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeavePartitionRequest {
    pub member_id: MemberId,
    pub partition_id: u32,
}

/// Request to redistribute all partitions over the given members.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReassignPartitionsRequest {
    pub members: BTreeSet<MemberId>,
    pub dry_run: bool,
}

/// Request to scale the cluster to exactly the given members.
///
/// For force scale down, `members` are the members which are retained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScaleRequest {
    pub members: BTreeSet<MemberId>,
    /// The replication factor to use after scaling, defaulting to the configured one.
    pub new_replication_factor: Option<u32>,
    pub dry_run: bool,
}

/// Request to cancel the in-flight change with the given ID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CancelChangeRequest {
    pub change_id: ChangeId,
}

/// A topology management request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManagementRequest {
    AddMembers(AddMembersRequest),
    RemoveMembers(RemoveMembersRequest),
    JoinPartition(JoinPartitionRequest),
    LeavePartition(LeavePartitionRequest),
    ReassignPartitions(ReassignPartitionsRequest),
    ScaleMembers(ScaleRequest),
    ForceScaleDown(ScaleRequest),
    CancelChange(CancelChangeRequest),
    GetTopology,
}

impl ManagementRequest {
    /// The name of this request, used in errors & logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddMembers(_) => "add members",
            Self::RemoveMembers(_) => "remove members",
            Self::JoinPartition(_) => "join partition",
            Self::LeavePartition(_) => "leave partition",
            Self::ReassignPartitions(_) => "reassign partitions",
            Self::ScaleMembers(_) => "scale members",
            Self::ForceScaleDown(_) => "force scale down",
            Self::CancelChange(_) => "cancel topology change",
            Self::GetTopology => "get topology",
        }
    }

    /// Check if this request only plans a change without applying it.
    pub fn is_dry_run(&self) -> bool {
        match self {
            Self::ReassignPartitions(req) => req.dry_run,
            Self::ScaleMembers(req) | Self::ForceScaleDown(req) => req.dry_run,
            _ => false,
        }
    }
}

/// The response to an accepted topology change request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopologyChangeResponse {
    pub change_id: ChangeId,
    pub current_topology: BTreeMap<MemberId, MemberState>,
    pub expected_topology: BTreeMap<MemberId, MemberState>,
    pub planned_changes: Vec<ConfigurationChangeOperation>,
}

/// A successful response to a management request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManagementResponse {
    TopologyChange(TopologyChangeResponse),
    Topology(ClusterConfiguration),
}

/// The result of a management request.
pub type ManagementResult = Result<ManagementResponse, ErrorResponse>;

/// The kind of a failed management request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A precondition of the request failed.
    InvalidRequest,
    /// Another change is already in progress.
    ConcurrentModification,
    /// The receiving member is not the coordinator of the request.
    NotCoordinator,
    /// The coordinator did not respond in time.
    Timeout,
    /// The coordinator could not be reached.
    Unavailable,
    /// An unexpected failure on the coordinator.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidRequest => "invalid request",
            Self::ConcurrentModification => "concurrent modification",
            Self::NotCoordinator => "not coordinator",
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// A structured error describing why a management request failed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

/// A client of the cluster configuration management API.
#[derive(Clone)]
pub struct ClusterConfigurationManagementApi {
    messaging: Arc<dyn ClusterMessaging>,
    default_coordinator: MemberId,
    timeout: Duration,
}

impl ClusterConfigurationManagementApi {
    /// Create a new instance which routes requests to the given default coordinator.
    pub fn new(messaging: Arc<dyn ClusterMessaging>, default_coordinator: MemberId, timeout: Duration) -> Self {
        Self {
            messaging,
            default_coordinator,
            timeout,
        }
    }

    pub async fn add_members(&self, request: AddMembersRequest) -> Result<TopologyChangeResponse, ErrorResponse> {
        self.change(self.default_coordinator, ManagementRequest::AddMembers(request)).await
    }

    pub async fn remove_members(&self, request: RemoveMembersRequest) -> Result<TopologyChangeResponse, ErrorResponse> {
        self.change(self.default_coordinator, ManagementRequest::RemoveMembers(request)).await
    }

    pub async fn join_partition(&self, request: JoinPartitionRequest) -> Result<TopologyChangeResponse, ErrorResponse> {
        self.change(self.default_coordinator, ManagementRequest::JoinPartition(request)).await
    }

    pub async fn leave_partition(&self, request: LeavePartitionRequest) -> Result<TopologyChangeResponse, ErrorResponse> {
        self.change(self.default_coordinator, ManagementRequest::LeavePartition(request)).await
    }

    pub async fn reassign_partitions(&self, request: ReassignPartitionsRequest) -> Result<TopologyChangeResponse, ErrorResponse> {
        self.change(self.default_coordinator, ManagementRequest::ReassignPartitions(request)).await
    }

    pub async fn scale_members(&self, request: ScaleRequest) -> Result<TopologyChangeResponse, ErrorResponse> {
        self.change(self.default_coordinator, ManagementRequest::ScaleMembers(request)).await
    }

    /// Remove all members not listed in the request without re-replicating their partitions.
    ///
    /// The request is routed to the lowest retained member, as the default coordinator may be
    /// among the members being removed.
    pub async fn force_scale_down(&self, request: ScaleRequest) -> Result<TopologyChangeResponse, ErrorResponse> {
        let coordinator = request
            .members
            .iter()
            .next()
            .copied()
            .ok_or_else(|| ErrorResponse::invalid_request("force scale down requires at least one member to retain"))?;
        self.change(coordinator, ManagementRequest::ForceScaleDown(request)).await
    }

    pub async fn cancel_topology_change(&self, request: CancelChangeRequest) -> Result<TopologyChangeResponse, ErrorResponse> {
        self.change(self.default_coordinator, ManagementRequest::CancelChange(request)).await
    }

    pub async fn get_topology(&self) -> Result<ClusterConfiguration, ErrorResponse> {
        match self.send(self.default_coordinator, ManagementRequest::GetTopology).await? {
            ManagementResponse::Topology(topology) => Ok(topology),
            other => Err(ErrorResponse::internal(format!("unexpected response to get topology request: {:?}", other))),
        }
    }

    async fn change(&self, coordinator: MemberId, request: ManagementRequest) -> Result<TopologyChangeResponse, ErrorResponse> {
        let name = request.name();
        match self.send(coordinator, request).await? {
            ManagementResponse::TopologyChange(response) => Ok(response),
            other => Err(ErrorResponse::internal(format!("unexpected response to {} request: {:?}", name, other))),
        }
    }

    #[tracing::instrument(level = "trace", skip(self, request), fields(request = request.name()))]
    async fn send(&self, coordinator: MemberId, request: ManagementRequest) -> ManagementResult {
        let name = request.name();
        match tokio::time::timeout(self.timeout, self.messaging.send_request(coordinator, request)).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                tracing::debug!(error = ?err, %coordinator, "error sending {} request", name);
                Err(ErrorResponse::new(ErrorKind::Unavailable, format!("error sending {} request to member {}: {}", name, coordinator, err)))
            }
            Err(_) => Err(ErrorResponse::new(
                ErrorKind::Timeout,
                format!("{} request to member {} timed out after {:?}", name, coordinator, self.timeout),
            )),
        }
    }
}
