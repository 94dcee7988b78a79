//! Typed column families over a transactional DB tree.
//!
//! Every column family lives in the same sled tree as its siblings, namespaced by a one byte
//! prefix. Keys are compared by their serialized bytes, so composite keys serialize their outer
//! component first and integers are encoded big-endian in an order preserving way.

mod transaction;


use std::marker::PhantomData;

pub use transaction::TransactionContext;

use crate::error::{StorageError, StorageResult};
use crate::utils;

/// The column families of a member's database.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnFamilyName {
    /// Outstanding distribution legs, keyed by `(distribution key, target partition)`.
    PendingDistributions,
    /// Commands awaiting distribution, keyed by distribution key.
    PendingDeployments,
    /// The number of outstanding legs per distribution key.
    DistributionCounts,
    /// Distributed commands which this partition has already applied.
    ReceivedDistributions,
    /// The partition's log entries, keyed by position.
    Log,
    /// The cluster configuration.
    Topology,
}

impl ColumnFamilyName {
    /// The key prefix of this column family.
    pub fn prefix(&self) -> u8 {
        match self {
            Self::PendingDistributions => 1,
            Self::PendingDeployments => 2,
            Self::DistributionCounts => 3,
            Self::ReceivedDistributions => 4,
            Self::Log => 5,
            Self::Topology => 6,
        }
    }

    /// The name of this column family.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingDistributions => "pending_distributions",
            Self::PendingDeployments => "pending_deployments",
            Self::DistributionCounts => "distribution_counts",
            Self::ReceivedDistributions => "received_distributions",
            Self::Log => "log",
            Self::Topology => "topology",
        }
    }
}

/// A type which can be used as a column family key.
pub trait DbKey: Sized {
    /// Append the encoded form of this key to the given buffer.
    fn write_key(&self, buf: &mut Vec<u8>);
    /// Decode a key from the front of the given buffer, returning the remaining bytes.
    fn read_key(buf: &[u8]) -> StorageResult<(Self, &[u8])>;
}

/// A type which can be used as a column family value.
pub trait DbValue: Sized {
    fn to_bytes(&self) -> StorageResult<Vec<u8>>;
    fn from_bytes(buf: &[u8]) -> StorageResult<Self>;
}

fn split_key(buf: &[u8], len: usize) -> StorageResult<(&[u8], &[u8])> {
    if buf.len() < len {
        return Err(StorageError::Decode(format!("key too short, need {} bytes got {}", len, buf.len())));
    }
    Ok(buf.split_at(len))
}

impl DbKey for () {
    fn write_key(&self, _: &mut Vec<u8>) {}

    fn read_key(buf: &[u8]) -> StorageResult<(Self, &[u8])> {
        Ok(((), buf))
    }
}

impl DbKey for u8 {
    fn write_key(&self, buf: &mut Vec<u8>) {
        buf.push(*self);
    }

    fn read_key(buf: &[u8]) -> StorageResult<(Self, &[u8])> {
        let (head, rest) = split_key(buf, 1)?;
        Ok((head[0], rest))
    }
}

impl DbKey for u32 {
    fn write_key(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&utils::encode_u32(*self));
    }

    fn read_key(buf: &[u8]) -> StorageResult<(Self, &[u8])> {
        let (head, rest) = split_key(buf, 4)?;
        let val = utils::decode_u32(head).map_err(|err| StorageError::Decode(err.to_string()))?;
        Ok((val, rest))
    }
}

impl DbKey for u64 {
    fn write_key(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&utils::encode_u64(*self));
    }

    fn read_key(buf: &[u8]) -> StorageResult<(Self, &[u8])> {
        let (head, rest) = split_key(buf, 8)?;
        let val = utils::decode_u64(head).map_err(|err| StorageError::Decode(err.to_string()))?;
        Ok((val, rest))
    }
}

impl DbKey for i64 {
    fn write_key(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&utils::encode_i64_ordered(*self));
    }

    fn read_key(buf: &[u8]) -> StorageResult<(Self, &[u8])> {
        let (head, rest) = split_key(buf, 8)?;
        let val = utils::decode_i64_ordered(head).map_err(|err| StorageError::Decode(err.to_string()))?;
        Ok((val, rest))
    }
}

impl<A: DbKey, B: DbKey> DbKey for (A, B) {
    fn write_key(&self, buf: &mut Vec<u8>) {
        self.0.write_key(buf);
        self.1.write_key(buf);
    }

    fn read_key(buf: &[u8]) -> StorageResult<(Self, &[u8])> {
        let (first, rest) = A::read_key(buf)?;
        let (second, rest) = B::read_key(rest)?;
        Ok(((first, second), rest))
    }
}

impl DbValue for () {
    fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        Ok(vec![])
    }

    fn from_bytes(_: &[u8]) -> StorageResult<Self> {
        Ok(())
    }
}

impl DbValue for i64 {
    fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        Ok(self.to_be_bytes().to_vec())
    }

    fn from_bytes(buf: &[u8]) -> StorageResult<Self> {
        utils::decode_u64(buf).map(|val| val as i64).map_err(|err| StorageError::Decode(err.to_string()))
    }
}

impl DbValue for Vec<u8> {
    fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        Ok(self.clone())
    }

    fn from_bytes(buf: &[u8]) -> StorageResult<Self> {
        Ok(buf.to_vec())
    }
}

/// A typed namespace of keys & values within a transactional DB tree.
pub struct ColumnFamily<K, V> {
    name: ColumnFamilyName,
    ctx: TransactionContext,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for ColumnFamily<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            ctx: self.ctx.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K: DbKey, V: DbValue> ColumnFamily<K, V> {
    /// Create a new column family handle bound to the given transaction context.
    pub fn new(ctx: &TransactionContext, name: ColumnFamilyName) -> Self {
        Self {
            name,
            ctx: ctx.clone(),
            _marker: PhantomData,
        }
    }

    fn encode_key<P: DbKey>(&self, key: &P) -> Vec<u8> {
        let mut buf = vec![self.name.prefix()];
        key.write_key(&mut buf);
        buf
    }

    fn decode_entry(&self, key: &[u8], val: &[u8]) -> StorageResult<(K, V)> {
        let (key, rest) = K::read_key(key.get(1..).unwrap_or_default())?;
        if !rest.is_empty() {
            return Err(StorageError::Decode(format!("{} trailing bytes after key in {}", rest.len(), self.name.as_str())));
        }
        Ok((key, V::from_bytes(val)?))
    }

    /// Insert a new entry, failing if the key already exists.
    pub fn insert(&self, key: &K, value: &V) -> StorageResult<()> {
        self.ctx.run_in_transaction(|| {
            let key = self.encode_key(key);
            if self.ctx.get(&key)?.is_some() {
                return Err(StorageError::KeyExists(self.name.as_str()));
            }
            self.ctx.put(key, value.to_bytes()?)
        })
    }

    /// Insert or overwrite an entry.
    pub fn upsert(&self, key: &K, value: &V) -> StorageResult<()> {
        self.ctx.run_in_transaction(|| self.ctx.put(self.encode_key(key), value.to_bytes()?))
    }

    /// Get the value of the given key, if it exists.
    pub fn get(&self, key: &K) -> StorageResult<Option<V>> {
        self.ctx.get(&self.encode_key(key))?.map(|val| V::from_bytes(&val)).transpose()
    }

    /// Check if the given key exists.
    pub fn exists(&self, key: &K) -> StorageResult<bool> {
        Ok(self.ctx.get(&self.encode_key(key))?.is_some())
    }

    /// Delete the given key, failing if it does not exist.
    ///
    /// A missing key here indicates a logic error in the caller.
    pub fn delete_existing(&self, key: &K) -> StorageResult<()> {
        self.ctx.run_in_transaction(|| {
            let key = self.encode_key(key);
            if self.ctx.get(&key)?.is_none() {
                return Err(StorageError::KeyNotFound(self.name.as_str()));
            }
            self.ctx.delete(key)
        })
    }

    /// Delete the given key if it exists, returning true if it did.
    pub fn delete_if_exists(&self, key: &K) -> StorageResult<bool> {
        self.ctx.run_in_transaction(|| {
            let key = self.encode_key(key);
            if self.ctx.get(&key)?.is_none() {
                return Ok(false);
            }
            self.ctx.delete(key)?;
            Ok(true)
        })
    }

    /// Check if this column family holds no entries.
    pub fn is_empty(&self) -> StorageResult<bool> {
        match self.ctx.scan_prefix(&[self.name.prefix()]).next() {
            None => Ok(true),
            Some(Ok(_)) => Ok(false),
            Some(Err(err)) => Err(err),
        }
    }

    /// Visit every entry in key order.
    pub fn for_each<F>(&self, mut visitor: F) -> StorageResult<()>
    where
        F: FnMut(K, V) -> StorageResult<()>,
    {
        for entry in self.ctx.scan_prefix(&[self.name.prefix()]) {
            let (key, val) = entry?;
            let (key, val) = self.decode_entry(&key, &val)?;
            visitor(key, val)?;
        }
        Ok(())
    }

    /// Visit entries in key order for as long as the visitor returns true.
    pub fn while_true<F>(&self, visitor: F) -> StorageResult<()>
    where
        F: FnMut(K, V) -> bool,
    {
        self.scan_while(&(), visitor)
    }

    /// Visit entries whose keys start with the given key prefix in key order, for as long as the
    /// visitor returns true.
    pub fn while_equal_prefix<P, F>(&self, prefix: &P, visitor: F) -> StorageResult<()>
    where
        P: DbKey,
        F: FnMut(K, V) -> bool,
    {
        self.scan_while(prefix, visitor)
    }

    fn scan_while<P, F>(&self, prefix: &P, mut visitor: F) -> StorageResult<()>
    where
        P: DbKey,
        F: FnMut(K, V) -> bool,
    {
        for entry in self.ctx.scan_prefix(&self.encode_key(prefix)) {
            let (key, val) = entry?;
            let (key, val) = self.decode_entry(&key, &val)?;
            if !visitor(key, val) {
                break;
            }
        }
        Ok(())
    }
}
