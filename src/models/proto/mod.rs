//! Protobuf models used for persisted & distributed data.

pub mod distribution;
pub mod topology;
