//! Error abstractions.

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;

/// Errors from the column-family storage layer.
///
/// These are recoverable: callers decide whether to retry the transaction.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// An insert targeted a key which already exists.
    #[error("key already exists in column family {0}")]
    KeyExists(&'static str),
    /// A delete or update targeted a key which does not exist.
    #[error("key does not exist in column family {0}")]
    KeyNotFound(&'static str),
    /// A stored key or value could not be decoded.
    #[error("error decoding stored data: {0}")]
    Decode(String),
    /// Stored entries which must agree with each other do not.
    #[error("inconsistent stored state: {0}")]
    Inconsistent(String),
    /// A mutation was attempted outside of a transaction.
    #[error("no transaction is open on this context")]
    NoTransaction,
    /// The underlying database returned an error.
    #[error("storage engine error: {0}")]
    Sled(#[from] sled::Error),
}

/// A result type where the error is a `StorageError`.
pub type StorageResult<T> = ::std::result::Result<T, StorageError>;
