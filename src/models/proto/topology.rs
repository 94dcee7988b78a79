/// A persisted cluster configuration.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClusterConfigurationRecord {
    /// The version of the configuration.
    #[prost(int64, required, tag = "1")]
    pub version: i64,
    /// The members of the cluster, by member ID.
    #[prost(map = "uint32, message", tag = "2")]
    pub members: ::std::collections::HashMap<u32, MemberStateRecord>,
    /// The in-flight change, if any.
    #[prost(message, optional, tag = "3")]
    pub pending_change: ::core::option::Option<ChangePlanRecord>,
    /// The last finished change, if any.
    #[prost(message, optional, tag = "4")]
    pub last_change: ::core::option::Option<CompletedChangeRecord>,
    /// Routing information, present when partition scaling is enabled.
    #[prost(message, optional, tag = "5")]
    pub routing: ::core::option::Option<RoutingStateRecord>,
    /// The ID of the cluster, if any.
    #[prost(string, optional, tag = "6")]
    pub cluster_id: ::core::option::Option<::prost::alloc::string::String>,
}

/// A persisted member state.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MemberStateRecord {
    #[prost(enumeration = "MemberStatusRecord", required, tag = "1")]
    pub state: i32,
    /// The member's partition replicas, by partition number.
    #[prost(map = "uint32, message", tag = "2")]
    pub partitions: ::std::collections::HashMap<u32, PartitionStateRecord>,
}

/// A persisted partition replica state.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PartitionStateRecord {
    #[prost(enumeration = "PartitionStatusRecord", required, tag = "1")]
    pub state: i32,
    #[prost(uint32, required, tag = "2")]
    pub priority: u32,
    /// Exporter states, by exporter ID.
    #[prost(map = "string, enumeration(ExporterStateRecord)", tag = "3")]
    pub exporters: ::std::collections::HashMap<::prost::alloc::string::String, i32>,
}

/// Persisted routing information.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoutingStateRecord {
    #[prost(uint32, required, tag = "1")]
    pub partition_count: u32,
}

/// A persisted in-flight change.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChangePlanRecord {
    #[prost(int64, required, tag = "1")]
    pub id: i64,
    /// The member driving the change.
    #[prost(uint32, required, tag = "2")]
    pub coordinator: u32,
    #[prost(enumeration = "ChangeStatusRecord", required, tag = "3")]
    pub status: i32,
    #[prost(int64, required, tag = "4")]
    pub started_at: i64,
    #[prost(message, repeated, tag = "5")]
    pub pending_operations: ::prost::alloc::vec::Vec<OperationRecord>,
    #[prost(message, repeated, tag = "6")]
    pub completed_operations: ::prost::alloc::vec::Vec<CompletedOperationRecord>,
}

/// A persisted record of the last finished change.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompletedChangeRecord {
    #[prost(int64, required, tag = "1")]
    pub id: i64,
    #[prost(enumeration = "ChangeStatusRecord", required, tag = "2")]
    pub status: i32,
    #[prost(int64, required, tag = "3")]
    pub started_at: i64,
    #[prost(int64, required, tag = "4")]
    pub completed_at: i64,
}

/// A persisted applied change operation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompletedOperationRecord {
    #[prost(message, optional, tag = "1")]
    pub operation: ::core::option::Option<OperationRecord>,
    #[prost(int64, required, tag = "2")]
    pub completed_at: i64,
}

/// A persisted change operation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OperationRecord {
    /// The member executing the operation.
    #[prost(uint32, required, tag = "1")]
    pub member: u32,
    #[prost(oneof = "operation_record::Kind", tags = "2, 3, 4, 5, 6, 7, 8")]
    pub kind: ::core::option::Option<operation_record::Kind>,
}

/// Nested message and enum types in `OperationRecord`.
pub mod operation_record {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "2")]
        MemberJoin(super::MemberJoinRecord),
        #[prost(message, tag = "3")]
        MemberLeave(super::MemberLeaveRecord),
        #[prost(message, tag = "4")]
        MemberRemove(super::MemberRemoveRecord),
        #[prost(message, tag = "5")]
        PartitionJoin(super::PartitionJoinRecord),
        #[prost(message, tag = "6")]
        PartitionLeave(super::PartitionLeaveRecord),
        #[prost(message, tag = "7")]
        PartitionReconfigurePriority(super::PartitionReconfigurePriorityRecord),
        #[prost(message, tag = "8")]
        PartitionForceReconfigure(super::PartitionForceReconfigureRecord),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MemberJoinRecord {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MemberLeaveRecord {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MemberRemoveRecord {
    #[prost(uint32, required, tag = "1")]
    pub member_to_remove: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PartitionJoinRecord {
    #[prost(uint32, required, tag = "1")]
    pub partition: u32,
    #[prost(uint32, required, tag = "2")]
    pub priority: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PartitionLeaveRecord {
    #[prost(uint32, required, tag = "1")]
    pub partition: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PartitionReconfigurePriorityRecord {
    #[prost(uint32, required, tag = "1")]
    pub partition: u32,
    #[prost(uint32, required, tag = "2")]
    pub priority: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PartitionForceReconfigureRecord {
    #[prost(uint32, required, tag = "1")]
    pub partition: u32,
    /// The members which retain a replica of the partition.
    #[prost(uint32, repeated, tag = "2")]
    pub members: ::prost::alloc::vec::Vec<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MemberStatusRecord {
    Unknown = 0,
    Joining = 1,
    Active = 2,
    Leaving = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PartitionStatusRecord {
    Unknown = 0,
    Joining = 1,
    Active = 2,
    Leaving = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ExporterStateRecord {
    Unknown = 0,
    Enabled = 1,
    Disabled = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ChangeStatusRecord {
    Unknown = 0,
    InProgress = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}
