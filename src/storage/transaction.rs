//! Transactions over a partition's DB tree.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sled::Tree;

use crate::error::{StorageError, StorageResult};

/// Writes buffered by an open transaction. A `None` value is a pending delete.
type PendingWrites = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// A handle to the transactional state of one DB tree.
///
/// Clones share the same underlying transaction. All column families built from the same context
/// take part in the same transaction, which is what makes multi-family updates atomic.
#[derive(Clone)]
pub struct TransactionContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    tree: Tree,
    writes: Mutex<Option<PendingWrites>>,
}

impl TransactionContext {
    /// Create a new context over the given tree.
    pub fn new(tree: Tree) -> Self {
        Self {
            inner: Arc::new(ContextInner { tree, writes: Mutex::new(None) }),
        }
    }

    /// Run the given operation inside of a transaction.
    ///
    /// If a transaction is already open on this context, the operation joins it and nothing is
    /// committed here. Otherwise a new transaction is opened, committed when the operation returns
    /// `Ok` and rolled back when it returns `Err` or unwinds.
    pub fn run_in_transaction<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<StorageError>,
    {
        if self.is_open() {
            return op();
        }
        let guard = TransactionGuard::begin(self);
        let output = op()?;
        guard.commit()?;
        Ok(output)
    }

    /// Check if a transaction is currently open on this context.
    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<PendingWrites>> {
        self.inner.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read a raw key, observing the open transaction's uncommitted writes.
    pub(super) fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        if let Some(pending) = self.lock().as_ref().and_then(|writes| writes.get(key)) {
            return Ok(pending.clone());
        }
        Ok(self.inner.tree.get(key)?.map(|val| val.to_vec()))
    }

    /// Buffer a write of the given raw key in the open transaction.
    pub(super) fn put(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        let mut writes = self.lock();
        let writes = writes.as_mut().ok_or(StorageError::NoTransaction)?;
        writes.insert(key, Some(value));
        Ok(())
    }

    /// Buffer a delete of the given raw key in the open transaction.
    pub(super) fn delete(&self, key: Vec<u8>) -> StorageResult<()> {
        let mut writes = self.lock();
        let writes = writes.as_mut().ok_or(StorageError::NoTransaction)?;
        writes.insert(key, None);
        Ok(())
    }

    /// Scan all raw keys sharing the given prefix in order, merging uncommitted writes over the
    /// committed state of the tree.
    pub(super) fn scan_prefix(&self, prefix: &[u8]) -> MergedScan {
        let overlay: Vec<(Vec<u8>, Option<Vec<u8>>)> = self
            .lock()
            .as_ref()
            .map(|writes| {
                writes
                    .range(prefix.to_vec()..)
                    .take_while(|(key, _)| key.starts_with(prefix))
                    .map(|(key, val)| (key.clone(), val.clone()))
                    .collect()
            })
            .unwrap_or_default();
        MergedScan {
            committed: self.inner.tree.scan_prefix(prefix).peekable(),
            overlay: overlay.into_iter().peekable(),
        }
    }

    /// Write the given batch of pending writes to disk.
    fn commit_writes(&self, writes: PendingWrites) -> StorageResult<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let mut batch = sled::Batch::default();
        for (key, val) in writes {
            match val {
                Some(val) => batch.insert(key, val),
                None => batch.remove(key),
            }
        }
        self.inner.tree.apply_batch(batch)?;
        self.inner.tree.flush()?;
        Ok(())
    }
}

/// A scoped transaction. Dropping the guard without committing rolls the transaction back.
struct TransactionGuard<'a> {
    ctx: &'a TransactionContext,
    done: bool,
}

impl<'a> TransactionGuard<'a> {
    fn begin(ctx: &'a TransactionContext) -> Self {
        *ctx.lock() = Some(PendingWrites::new());
        Self { ctx, done: false }
    }

    fn commit(mut self) -> StorageResult<()> {
        self.done = true;
        let writes = self.ctx.lock().take().unwrap_or_default();
        if let Err(err) = self.ctx.commit_writes(writes) {
            tracing::error!(error = ?err, "error committing transaction");
            return Err(err);
        }
        Ok(())
    }
}

impl<'a> Drop for TransactionGuard<'a> {
    fn drop(&mut self) {
        if !self.done {
            tracing::trace!("rolling back transaction");
            let _ = self.ctx.lock().take();
        }
    }
}

/// An ordered scan over the committed tree merged with a transaction's uncommitted writes.
pub(super) struct MergedScan {
    committed: Peekable<sled::Iter>,
    overlay: Peekable<std::vec::IntoIter<(Vec<u8>, Option<Vec<u8>>)>>,
}

impl Iterator for MergedScan {
    type Item = StorageResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let source = match (self.committed.peek(), self.overlay.peek()) {
                (None, None) => return None,
                (Some(Err(_)), _) | (Some(Ok(_)), None) => ScanSource::Committed,
                (None, Some(_)) => ScanSource::Overlay,
                (Some(Ok((committed_key, _))), Some((overlay_key, _))) => match overlay_key.as_slice().cmp(committed_key.as_ref()) {
                    Ordering::Less => ScanSource::Overlay,
                    Ordering::Equal => ScanSource::Shadowed,
                    Ordering::Greater => ScanSource::Committed,
                },
            };
            match source {
                ScanSource::Committed => {
                    return self
                        .committed
                        .next()
                        .map(|res| res.map(|(key, val)| (key.to_vec(), val.to_vec())).map_err(StorageError::from));
                }
                ScanSource::Shadowed => {
                    let _ = self.committed.next();
                }
                ScanSource::Overlay => {}
            }
            match self.overlay.next() {
                Some((key, Some(val))) => return Some(Ok((key, val))),
                Some((_, None)) => continue,
                None => return None,
            }
        }
    }
}

/// The side of a merged scan which yields the next entry.
enum ScanSource {
    Committed,
    Overlay,
    /// The overlay holds a write for the same key as the committed entry.
    Shadowed,
}
