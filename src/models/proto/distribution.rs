/// A command which must be applied on every target partition.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DistributedCommand {
    /// The type of the command's value.
    #[prost(enumeration = "ValueType", required, tag = "1")]
    pub value_type: i32,
    /// The encoded value of the command.
    #[prost(bytes = "vec", required, tag = "2")]
    pub command_value: ::prost::alloc::vec::Vec<u8>,
}

/// An entry of a partition's log written by the distribution subsystem.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogEntry {
    #[prost(enumeration = "LogEntryKind", required, tag = "1")]
    pub kind: i32,
    /// The key of the distribution this entry belongs to.
    #[prost(int64, required, tag = "2")]
    pub distribution_key: i64,
    /// The position of the command on its origin partition's log.
    #[prost(int64, required, tag = "3")]
    pub source_position: i64,
    /// The partition on which the command was first accepted.
    #[prost(uint32, required, tag = "4")]
    pub origin_partition: u32,
    /// The distributed command, for applied entries.
    #[prost(message, optional, tag = "5")]
    pub command: ::core::option::Option<DistributedCommand>,
}

/// The type of value carried by a distributed command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ValueType {
    Unspecified = 0,
    Deployment = 1,
    ResourceDeletion = 2,
    Signal = 3,
    User = 4,
    Role = 5,
    Tenant = 6,
    Authorization = 7,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum LogEntryKind {
    Unspecified = 0,
    /// A distributed command was applied on this partition.
    Applied = 1,
    /// A command accepted on this partition has been distributed to all of its targets.
    Distributed = 2,
}
