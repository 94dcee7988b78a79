//! Persisted & transmitted records of the command distribution subsystem.

use crate::error::{StorageError, StorageResult};
use crate::models::proto::distribution::{DistributedCommand, LogEntry, ValueType};
use crate::storage::DbValue;
use crate::utils;

/// The size of the fixed header of an encoded pending deployment.
const DEPLOYMENT_HEADER_LEN: usize = 12;

/// A command awaiting distribution to its target partitions.
///
/// Encoded as `source_position: i64 | payload length: i32 | payload`, big-endian.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedPendingDeployment {
    /// The position of the command on the origin partition's log.
    pub source_position: i64,
    /// The encoded `DistributedCommand`.
    pub payload: Vec<u8>,
}

impl PersistedPendingDeployment {
    pub fn new(source_position: i64, payload: Vec<u8>) -> Self {
        Self { source_position, payload }
    }

    /// The length of this record once encoded.
    pub fn encoded_len(&self) -> usize {
        DEPLOYMENT_HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        let len = i32::try_from(self.payload.len()).map_err(|_| StorageError::Decode(format!("deployment payload of {} bytes is too large", self.payload.len())))?;
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.source_position.to_be_bytes());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> StorageResult<Self> {
        if buf.len() < DEPLOYMENT_HEADER_LEN {
            return Err(StorageError::Decode(format!("pending deployment of {} bytes is shorter than its header", buf.len())));
        }
        let (position, rest) = buf.split_at(8);
        let (len, payload) = rest.split_at(4);
        let mut position_bytes = [0u8; 8];
        position_bytes.copy_from_slice(position);
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(len);
        let len = i32::from_be_bytes(len_bytes);
        if len < 0 || len as usize != payload.len() {
            return Err(StorageError::Decode(format!(
                "pending deployment declares {} payload bytes but holds {}",
                len,
                payload.len()
            )));
        }
        Ok(Self {
            source_position: i64::from_be_bytes(position_bytes),
            payload: payload.to_vec(),
        })
    }
}

impl DbValue for PersistedPendingDeployment {
    fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        self.encode()
    }

    fn from_bytes(buf: &[u8]) -> StorageResult<Self> {
        Self::decode(buf)
    }
}

/// One leg of a distribution: a command pushed to a single target partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandDistributionRecord {
    pub distribution_key: i64,
    pub value_type: ValueType,
    /// The target partition of this leg.
    pub partition_id: u32,
    pub command_value: Vec<u8>,
}

impl CommandDistributionRecord {
    /// Build the record of the leg of the given command targeting `partition_id`.
    pub fn new(distribution_key: i64, partition_id: u32, command: &DistributedCommand) -> Self {
        Self {
            distribution_key,
            value_type: ValueType::from_i32(command.value_type).unwrap_or(ValueType::Unspecified),
            partition_id,
            command_value: command.command_value.clone(),
        }
    }

    /// The distributed command carried by this record.
    pub fn command(&self) -> DistributedCommand {
        DistributedCommand {
            value_type: self.value_type as i32,
            command_value: self.command_value.clone(),
        }
    }
}

impl DbValue for LogEntry {
    fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        utils::encode_model(self).map_err(|err| StorageError::Decode(err.to_string()))
    }

    fn from_bytes(buf: &[u8]) -> StorageResult<Self> {
        utils::decode_model(buf).map_err(|err| StorageError::Decode(err.to_string()))
    }
}
