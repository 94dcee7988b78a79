use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use super::api::*;
use super::messaging::{ClusterMessaging, LocalMessaging, MessagingError};
use super::*;
use crate::fixtures;

/// Messaging which records request targets and answers with a canned result.
struct CannedMessaging {
    targets: Mutex<Vec<MemberId>>,
    delay: Option<Duration>,
    result: ManagementResult,
}

impl CannedMessaging {
    fn new(result: ManagementResult) -> Self {
        Self {
            targets: Mutex::new(vec![]),
            delay: None,
            result,
        }
    }

    fn targets(&self) -> Vec<MemberId> {
        self.targets.lock().map(|targets| targets.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ClusterMessaging for CannedMessaging {
    async fn send_request(&self, target: MemberId, _request: ManagementRequest) -> Result<ManagementResult, MessagingError> {
        if let Ok(mut targets) = self.targets.lock() {
            targets.push(target);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.result.clone())
    }

    async fn publish_configuration(&self, _from: MemberId, _target: MemberId, _configuration: ClusterConfiguration) -> Result<(), MessagingError> {
        Ok(())
    }
}

fn change_response() -> ManagementResult {
    Ok(ManagementResponse::TopologyChange(TopologyChangeResponse {
        change_id: 2,
        current_topology: Default::default(),
        expected_topology: Default::default(),
        planned_changes: vec![],
    }))
}

#[tokio::test]
async fn coordinator_timeout_returns_within_window() -> Result<()> {
    let messaging = Arc::new(CannedMessaging {
        delay: Some(Duration::from_secs(30)),
        ..CannedMessaging::new(change_response())
    });
    let api = ClusterConfigurationManagementApi::new(messaging, MemberId(0), Duration::from_millis(50));

    let start = Instant::now();
    let err = api.get_topology().await.err();
    let elapsed = start.elapsed();

    assert!(err.as_ref().map(|err| err.kind) == Some(ErrorKind::Timeout), "expected timeout error got {:?}", err);
    assert!(elapsed < Duration::from_secs(5), "expected the call to return promptly, took {:?}", elapsed);
    Ok(())
}

#[tokio::test]
async fn unreachable_coordinator_is_unavailable() -> Result<()> {
    let api = ClusterConfigurationManagementApi::new(Arc::new(LocalMessaging::new()), MemberId(0), Duration::from_millis(500));

    let err = api
        .add_members(AddMembersRequest {
            members: fixtures::members([3]),
        })
        .await
        .err();

    assert!(err.as_ref().map(|err| err.kind) == Some(ErrorKind::Unavailable), "expected unavailable error got {:?}", err);
    Ok(())
}

#[tokio::test]
async fn mutating_requests_go_to_default_coordinator() -> Result<()> {
    let messaging = Arc::new(CannedMessaging::new(change_response()));
    let api = ClusterConfigurationManagementApi::new(messaging.clone(), MemberId(1), Duration::from_secs(1));

    let response = api
        .reassign_partitions(ReassignPartitionsRequest {
            members: fixtures::members([1, 2]),
            dry_run: true,
        })
        .await?;

    assert!(response.change_id == 2, "expected change id 2 got {}", response.change_id);
    assert!(messaging.targets() == vec![MemberId(1)], "expected request sent to member 1 got {:?}", messaging.targets());
    Ok(())
}

#[tokio::test]
async fn force_scale_down_goes_to_lowest_retained_member() -> Result<()> {
    let messaging = Arc::new(CannedMessaging::new(change_response()));
    let api = ClusterConfigurationManagementApi::new(messaging.clone(), MemberId(0), Duration::from_secs(1));

    api.force_scale_down(ScaleRequest {
        members: fixtures::members([4, 2, 3]),
        new_replication_factor: None,
        dry_run: false,
    })
    .await?;
    let err = api
        .force_scale_down(ScaleRequest {
            members: BTreeSet::new(),
            new_replication_factor: None,
            dry_run: false,
        })
        .await
        .err();

    assert!(messaging.targets() == vec![MemberId(2)], "expected request sent to member 2 got {:?}", messaging.targets());
    assert!(err.map(|err| err.kind == ErrorKind::InvalidRequest).unwrap_or(false), "expected empty force scale down to be rejected");
    Ok(())
}

#[tokio::test]
async fn unexpected_response_is_internal_error() -> Result<()> {
    let messaging = Arc::new(CannedMessaging::new(Ok(ManagementResponse::Topology(ClusterConfiguration::uninitialized()))));
    let api = ClusterConfigurationManagementApi::new(messaging, MemberId(0), Duration::from_secs(1));

    let err = api.cancel_topology_change(CancelChangeRequest { change_id: 1 }).await.err();

    assert!(err.as_ref().map(|err| err.kind) == Some(ErrorKind::Internal), "expected internal error got {:?}", err);
    Ok(())
}

#[tokio::test]
async fn coordinator_errors_are_returned_unchanged() -> Result<()> {
    let expected = ErrorResponse::new(ErrorKind::ConcurrentModification, "change 4 is in progress");
    let messaging = Arc::new(CannedMessaging::new(Err(expected.clone())));
    let api = ClusterConfigurationManagementApi::new(messaging, MemberId(0), Duration::from_secs(1));

    let err = api
        .leave_partition(LeavePartitionRequest {
            member_id: MemberId(1),
            partition_id: 1,
        })
        .await
        .err();

    assert!(err.as_ref() == Some(&expected), "expected {:?} got {:?}", expected, err);
    Ok(())
}
